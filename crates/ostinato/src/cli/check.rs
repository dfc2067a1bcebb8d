use anyhow::Result;
use clap::Args;
use ostinato::config::{Kinematics, MachineConfig};
use std::path::PathBuf;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the machine configuration (TOML or JSON).
    pub config: PathBuf,
}

impl CheckArgs {
    pub fn run(&self) -> Result<()> {
        let machine = MachineConfig::from_file(&self.config)?;
        machine.validate()?;

        let kind = match machine.kinematics {
            Kinematics::Cartesian => "cartesian",
            Kinematics::Delta => "delta",
        };
        println!(
            "{}: {} kinematics, {} drives, {} Hz step clock",
            self.config.display(),
            kind,
            machine.steps_per_mm.len(),
            machine.clock_hz
        );
        if let Some(delta) = &machine.delta {
            println!(
                "delta towers at radius {} mm, {} mm rods",
                delta.radius, delta.diagonal
            );
        }
        Ok(())
    }
}

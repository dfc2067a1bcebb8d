use anyhow::Result;
use clap::Args;
use ostinato::config::{MachineConfig, MoveSpec};
use ostinato::sim;
use std::path::PathBuf;

#[derive(Args)]
pub struct SimulateArgs {
    /// Path to the machine configuration (TOML or JSON).
    pub config: PathBuf,

    /// Path to the move description (TOML).
    pub r#move: PathBuf,

    /// Emit raw step rows (drive,step,clock,direction) as CSV instead of a
    /// summary.
    #[arg(long)]
    pub csv: bool,
}

impl SimulateArgs {
    pub fn run(&self) -> Result<()> {
        tracing_subscriber::fmt::init();

        let machine = MachineConfig::from_file(&self.config)?;
        let mv = MoveSpec::from_file(&self.r#move)?;
        tracing::info!(
            "simulating {} mm along {:?} at up to {} mm/s",
            mv.distance,
            mv.direction,
            mv.cruise_speed
        );

        let report = sim::simulate(&machine, &mv)?;

        if self.csv {
            println!("drive,step,clock,direction");
            for drive in &report.drives {
                for pulse in &drive.pulses {
                    println!(
                        "{},{},{},{}",
                        drive.letter,
                        pulse.step,
                        pulse.clock,
                        if pulse.forward { 'F' } else { 'B' }
                    );
                }
            }
            return Ok(());
        }

        println!(
            "move budget: {} clocks ({:.1} ms)",
            report.clocks_needed,
            report.clocks_needed as f64 / machine.clock_hz * 1000.0
        );
        for drive in &report.drives {
            let last = drive.pulses.last().map(|p| p.clock).unwrap_or(0);
            print!(
                "drive {}: {} steps (net {:+}), last at clock {}",
                drive.letter,
                drive.pulses.len(),
                drive.net_steps,
                last
            );
            if let Some(reverse) = drive.reverse_start_step {
                print!(", reverses at step {reverse}");
            }
            match &drive.fault {
                Some(fault) => println!(" -- ABORTED: {fault}"),
                None => println!(),
            }
        }
        Ok(())
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => args.run(),
        Command::Check(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "ostinato", about = "Step-pulse scheduling tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one move through the scheduler and print the step timelines.
    Simulate(cli::simulate::SimulateArgs),
    /// Validate a machine configuration file.
    Check(cli::check::CheckArgs),
}

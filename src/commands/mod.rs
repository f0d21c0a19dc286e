pub mod check;
pub mod create;
pub mod info;
pub mod snapshot;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "vhdutil", about = "Create, inspect, and validate VHD images")]
pub struct Cli {
    #[command(subcommand)]
    command: Subcommands,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    Create(create::Cli),
    Snapshot(snapshot::Cli),
    Info(info::Cli),
    Check(check::Cli),
}

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Subcommands::Create(args) => create::run(args),
        Subcommands::Snapshot(args) => snapshot::run(args),
        Subcommands::Info(args) => info::run(args),
        Subcommands::Check(args) => check::run(args),
    }
}

mod bat;
mod bitmap;
mod commands;
mod error;
mod finishers;
mod format;
mod pool;
mod router;
#[cfg(test)]
mod scenarios;
mod transaction;
mod util;
mod volume;

use std::process::{ExitCode, Termination};

fn main() -> ExitCode {
    env_logger::init();

    let cli = commands::Cli::parse_args();
    commands::dispatch(cli).report()
}

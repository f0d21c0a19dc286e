use anyhow::Result;
use clap::Parser;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::volume::Volume;

/// Create a differencing disk backed by an existing image.
#[derive(Parser, Debug)]
pub struct Cli {
    /// Parent image path
    parent: String,

    /// Path of the differencing disk to create
    child: String,
}

pub fn run(cli: Cli) -> Result<()> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
    Volume::snapshot(&cli.parent, &cli.child, now)?;
    println!("created {} as a snapshot of {}", cli.child, cli.parent);
    Ok(())
}

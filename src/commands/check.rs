use anyhow::Result;
use clap::Parser;

use crate::format::DISK_TYPE_DIFFERENCING;
use crate::volume::{OpenFlags, Volume};

/// Validate an image's footer/header/BAT and, for differencing disks, its
/// parent relationship.
#[derive(Parser, Debug)]
pub struct Cli {
    image: String,

    /// Parent image path to validate against (differencing disks only)
    #[arg(long)]
    parent: Option<String>,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut vol = Volume::open(&cli.image, OpenFlags { read_only: true })?;
    println!("{}: footer and header valid", cli.image);

    if vol.disk_type() == DISK_TYPE_DIFFERENCING {
        let parent = vol.get_parent_id()?;
        println!("parent locator: {parent}");

        let validate_against = cli.parent.unwrap_or(parent);
        vol.validate_parent(&validate_against)?;
        println!("parent validation: ok");
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::format::{DISK_TYPE_DIFFERENCING, DISK_TYPE_DYNAMIC, DISK_TYPE_FIXED};
use crate::util::parse_human_size;
use crate::volume::Volume;

/// Create a new VHD image.
#[derive(Parser, Debug)]
pub struct Cli {
    /// Disk type: fixed, dynamic, or differencing
    #[arg(long, default_value = "dynamic")]
    r#type: String,

    /// Virtual size, e.g. "2G" (ignored for differencing disks)
    #[arg(long)]
    size: Option<String>,

    /// Block size in bytes, e.g. "2M" (dynamic/differencing only)
    #[arg(long, default_value = "2M")]
    block_size: String,

    /// Parent image path (differencing disks only)
    #[arg(long)]
    parent: Option<String>,

    /// Path of the image to create
    image: String,
}

pub fn run(cli: Cli) -> Result<()> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
    let block_size = parse_human_size(&cli.block_size)? as u32;

    let disk_type = match cli.r#type.as_str() {
        "fixed" => DISK_TYPE_FIXED,
        "dynamic" => DISK_TYPE_DYNAMIC,
        "differencing" => DISK_TYPE_DIFFERENCING,
        other => anyhow::bail!("unknown disk type: {other}"),
    };

    if disk_type == DISK_TYPE_DIFFERENCING {
        let parent = cli.parent.context("--parent is required for differencing disks")?;
        Volume::snapshot(&parent, &cli.image, now)?;
    } else {
        let size = parse_human_size(
            cli.size.as_deref().context("--size is required")?,
        )?;
        Volume::create(&cli.image, size, disk_type, block_size, None, now)?;
    }

    println!("created {}", cli.image);
    Ok(())
}

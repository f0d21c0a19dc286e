use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use uuid::Uuid;

use crate::format::{DISK_TYPE_DIFFERENCING, DISK_TYPE_DYNAMIC, DISK_TYPE_FIXED};
use crate::util::fmt_bytes_human;
use crate::volume::{OpenFlags, Volume};

/// Print an image's footer and header fields.
#[derive(Parser, Debug)]
pub struct Cli {
    image: String,

    /// Emit machine-readable JSON instead of a human summary
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Info {
    path: String,
    disk_type: &'static str,
    size_bytes: u64,
    uuid: String,
    parent: Option<String>,
}

pub fn run(cli: Cli) -> Result<()> {
    let mut vol = Volume::open(&cli.image, OpenFlags::default())?;

    let disk_type = match vol.disk_type() {
        DISK_TYPE_FIXED => "fixed",
        DISK_TYPE_DYNAMIC => "dynamic",
        DISK_TYPE_DIFFERENCING => "differencing",
        _ => "unknown",
    };
    let parent = if vol.disk_type() == DISK_TYPE_DIFFERENCING {
        vol.get_parent_id().ok()
    } else {
        None
    };

    if cli.json {
        let info = Info {
            path: cli.image.clone(),
            disk_type,
            size_bytes: vol.size_bytes(),
            uuid: Uuid::from_bytes(vol.uuid()).to_string(),
            parent,
        };
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("path:      {}", cli.image);
        println!("type:      {disk_type}");
        println!("size:      {}", fmt_bytes_human(vol.size_bytes()));
        println!("uuid:      {}", Uuid::from_bytes(vol.uuid()));
        if let Some(p) = parent {
            println!("parent:    {p}");
        }
    }
    Ok(())
}

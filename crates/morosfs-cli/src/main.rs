#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use morosfs_core::{MorosImage, PathOps};
use morosfs_fuse::MountOptions;
use std::env;
use std::path::Path;
use tracing::info;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut image_path = None;
    let mut mountpoint = None;
    let mut allow_other = false;

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--allow-other" => allow_other = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            flag if flag.starts_with('-') => {
                print_usage();
                bail!("unknown flag: {flag}");
            }
            positional => {
                if image_path.is_none() {
                    image_path = Some(positional.to_owned());
                } else if mountpoint.is_none() {
                    mountpoint = Some(positional.to_owned());
                } else {
                    print_usage();
                    bail!("unexpected argument: {positional}");
                }
            }
        }
    }

    let (Some(image_path), Some(mountpoint)) = (image_path, mountpoint) else {
        print_usage();
        bail!("expected <image> and <mountpoint> arguments");
    };

    // Failure to open the backing image aborts startup.
    let image = MorosImage::open(&image_path)
        .with_context(|| format!("failed to open filesystem image: {image_path}"))?;
    info!(image = %image_path, mountpoint = %mountpoint, "mounting MOROS image read-only");

    let ops: Box<dyn PathOps> = Box::new(image);
    let options = MountOptions {
        allow_other,
        ..MountOptions::default()
    };
    morosfs_fuse::mount(ops, Path::new(&mountpoint), &options)
        .with_context(|| format!("FUSE mount failed at {mountpoint}"))?;

    Ok(())
}

fn print_usage() {
    println!("morosfs\n");
    println!("USAGE:");
    println!("  morosfs <image> <mountpoint> [--allow-other]");
    println!();
    println!("Mounts a MOROS filesystem image read-only in the foreground.");
}

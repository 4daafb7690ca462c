#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffx_harness::Ext2ImageBuilder;
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("generate-image") => generate_image(&args[1..]),
        Some("manifest") => {
            let builder = scenario(args.get(1).map_or("root-dir", String::as_str))?;
            println!("{}", serde_json::to_string_pretty(&builder.manifest())?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn scenario(name: &str) -> Result<Ext2ImageBuilder> {
    match name {
        "root-dir" => Ok(Ext2ImageBuilder::root_dir_scenario()),
        "empty" => Ok(Ext2ImageBuilder::one_group_1k()),
        "bad-magic" => Ok(Ext2ImageBuilder::root_dir_scenario().magic(0x1234)),
        other => bail!("unknown scenario: {other} (expected root-dir, empty, or bad-magic)"),
    }
}

fn generate_image(args: &[String]) -> Result<()> {
    let Some(out) = args.first() else {
        bail!("usage: ffx-harness generate-image <out> [root-dir|empty|bad-magic]");
    };
    let builder = scenario(args.get(1).map_or("root-dir", String::as_str))?;
    let image = builder.build().context("failed to lay out image")?;

    let out = Path::new(out);
    fs::write(out, &image).with_context(|| format!("failed to write {}", out.display()))?;
    println!("wrote {} ({} bytes)", out.display(), image.len());
    Ok(())
}

fn print_usage() {
    println!("ffx-harness\n");
    println!("USAGE:");
    println!("  ffx-harness generate-image <out> [root-dir|empty|bad-magic]");
    println!("  ffx-harness manifest [root-dir|empty|bad-magic]");
    println!("  ffx-harness help");
}

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ffx::sink::CsvStreams;
use ffx::{ExtractOptions, ExtractionReport, IndirectSource};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

/// Where and how an extraction run writes its records.
#[derive(Debug, Clone)]
struct OutputOptions {
    out_dir: PathBuf,
    json: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            json: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    magic: String,
    block_size: u32,
    frag_size: u32,
    inodes_count: u32,
    blocks_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    frags_per_group: u32,
    groups_count: u32,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "extract" => {
            let Some(path) = args.next() else {
                bail!("extract requires an image path");
            };
            let (options, output) = parse_extract_flags(args)?;
            extract(Path::new(&path), &options, &output)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires an image path");
            };
            let json = parse_inspect_flags(args)?;
            inspect(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn parse_extract_flags(
    mut args: impl Iterator<Item = String>,
) -> Result<(ExtractOptions, OutputOptions)> {
    let mut options = ExtractOptions::default();
    let mut output = OutputOptions::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--out-dir" => {
                let Some(dir) = args.next() else {
                    bail!("--out-dir requires a directory");
                };
                output.out_dir = PathBuf::from(dir);
            }
            "--json" => output.json = true,
            "--indirect-from-record" => options.indirect_source = IndirectSource::InodeRecord,
            other => bail!("unknown extract flag: {other}"),
        }
    }

    Ok((options, output))
}

/// Returns whether `--json` was given.
fn parse_inspect_flags(args: impl Iterator<Item = String>) -> Result<bool> {
    let mut json = false;
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            other => bail!("unknown inspect flag: {other}"),
        }
    }
    Ok(json)
}

fn print_usage() {
    println!("ffx-cli\n");
    println!("USAGE:");
    println!("  ffx-cli extract <image-path> [--out-dir DIR] [--json] [--indirect-from-record]");
    println!("  ffx-cli inspect <image-path> [--json]");
    println!("  ffx-cli help");
}

fn print_warnings(report: &ExtractionReport) {
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
}

fn extract(path: &Path, options: &ExtractOptions, output: &OutputOptions) -> Result<()> {
    let report = ffx::extract_path(path, options)
        .with_context(|| format!("failed to extract metadata from {}", path.display()))?;
    print_warnings(&report);

    if output.json {
        println!("{}", report.to_json().context("serialize report")?);
        return Ok(());
    }

    std::fs::create_dir_all(&output.out_dir)
        .with_context(|| format!("failed to create {}", output.out_dir.display()))?;
    let written = CsvStreams::write_to_dir(&output.out_dir, &report)
        .with_context(|| format!("failed to write streams to {}", output.out_dir.display()))?;
    for path in written {
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let geometry = ffx::inspect_path(path)
        .with_context(|| format!("failed to read ext2 superblock from {}", path.display()))?;
    let sb = &geometry.superblock;

    let output = InspectOutput {
        magic: format!("{:04x}", sb.magic),
        block_size: sb.block_size,
        frag_size: sb.frag_size,
        inodes_count: sb.inodes_count,
        blocks_count: sb.blocks_count,
        first_data_block: sb.first_data_block,
        blocks_per_group: sb.blocks_per_group,
        inodes_per_group: sb.inodes_per_group,
        frags_per_group: sb.frags_per_group,
        groups_count: geometry.groups_count,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("FrankenFX Inspector");
        println!("magic: {}", output.magic);
        println!("block_size: {}", output.block_size);
        println!("frag_size: {}", output.frag_size);
        println!("inodes_count: {}", output.inodes_count);
        println!("blocks_count: {}", output.blocks_count);
        println!("first_data_block: {}", output.first_data_block);
        println!("blocks_per_group: {}", output.blocks_per_group);
        println!("inodes_per_group: {}", output.inodes_per_group);
        println!("frags_per_group: {}", output.frags_per_group);
        println!("groups: {}", output.groups_count);
    }
    Ok(())
}

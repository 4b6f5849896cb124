#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ipd_harness::{RoundTripConfig, check_fixture_pair, run_round_trip_stress};
use std::env;
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
        Some("check-fixtures") => {
            let old = Path::new("crates/ipd-harness/fixtures/swap_old.json");
            let new = Path::new("crates/ipd-harness/fixtures/swap_new.json");
            let report = check_fixture_pair(old, new, &RoundTripConfig::default())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some("check-pair") => check_pair(&args[1..]),
        Some("round-trip") => round_trip(&args[1..]),
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

fn check_pair(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        bail!("usage: ipd-harness check-pair <old.json> <new.json> [--scratch N]");
    }
    let mut config = RoundTripConfig::default();
    let mut index = 2_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--scratch" => {
                let raw = args.get(index + 1).context("--scratch requires a value")?;
                config.scratch_blocks = raw.parse().context("invalid --scratch value")?;
                index += 2;
            }
            other => bail!("unknown check-pair option: {other}"),
        }
    }
    let report = check_fixture_pair(Path::new(&args[0]), Path::new(&args[1]), &config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn round_trip(args: &[String]) -> Result<()> {
    let mut config = RoundTripConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--iterations" => {
                let raw = args.get(index + 1).context("--iterations requires a value")?;
                config.iterations = raw.parse().context("invalid --iterations value")?;
                index += 2;
            }
            "--seed" => {
                let raw = args.get(index + 1).context("--seed requires a value")?;
                config.seed = raw.parse().context("invalid --seed value")?;
                index += 2;
            }
            "--blocks" => {
                let raw = args.get(index + 1).context("--blocks requires a value")?;
                let blocks: usize = raw.parse().context("invalid --blocks value")?;
                config.image.old_blocks = blocks;
                config.image.new_blocks = blocks;
                index += 2;
            }
            "--new-blocks" => {
                let raw = args.get(index + 1).context("--new-blocks requires a value")?;
                config.image.new_blocks = raw.parse().context("invalid --new-blocks value")?;
                index += 2;
            }
            "--scratch" => {
                let raw = args.get(index + 1).context("--scratch requires a value")?;
                config.scratch_blocks = raw.parse().context("invalid --scratch value")?;
                index += 2;
            }
            "--chunk-blocks" => {
                let raw = args.get(index + 1).context("--chunk-blocks requires a value")?;
                config.hard_chunk_blocks =
                    Some(raw.parse().context("invalid --chunk-blocks value")?);
                index += 2;
            }
            "--out" => {
                let raw = args.get(index + 1).context("--out requires a value")?;
                config.output_dir = Some(Path::new(raw).to_path_buf());
                index += 2;
            }
            other => {
                bail!("unknown round-trip option: {other}");
            }
        }
    }

    let report = run_round_trip_stress(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        bail!("round-trip stress reported a mismatch");
    }
    Ok(())
}

fn print_usage() {
    println!("ipd-harness: in-place payload verification");
    println!();
    println!("USAGE:");
    println!("  ipd-harness check-fixtures");
    println!("  ipd-harness check-pair <old.json> <new.json> [--scratch N]");
    println!(
        "  ipd-harness round-trip [--iterations N] [--seed S] [--blocks N] [--new-blocks N] [--scratch N] [--chunk-blocks N] [--out DIR]"
    );
    println!();
    println!("ROUND TRIP:");
    println!("  Builds seeded old/new image pairs full of block rotations and swaps,");
    println!("  generates in-place operations, applies them to the old image and");
    println!("  compares the result with the new image. Stops at the first mismatch.");
    println!("  Use --out DIR to keep the images of a failing case.");
    println!();
    println!("EXAMPLES:");
    println!("  ipd-harness round-trip --iterations 500 --seed 7");
    println!("  ipd-harness round-trip --scratch 0 --out artifacts/round_trip");
}

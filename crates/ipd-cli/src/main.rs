#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ipd::{
    BlobFileWriter, BlockDiffProducer, ByteDevice, FileByteDevice, IN_PLACE_PAYLOAD_VERSION,
    IpdError, OperationType, PartitionConfig, PayloadGenerationConfig,
    generate_operations_with_stats,
};
use ipd_extent::extents_to_string;
use ipd_harness::{PayloadManifest, apply_operations, blob_digest, check_operations};
use serde::Serialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── Logging and exit codes ──────────────────────────────────────────────────

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit code of the first [`IpdError`] in the chain, 1 for anything else.
fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<IpdError>())
        .map_or(1, IpdError::exit_code)
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(exit_code(&error));
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let verbose = args.iter().any(|arg| arg == "--verbose" || arg == "-v");
    let args: Vec<String> = args
        .into_iter()
        .filter(|arg| arg != "--verbose" && arg != "-v")
        .collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "generate" => {
            init_logging(verbose);
            generate(&args[1..])
        }
        "apply" => {
            init_logging(verbose);
            apply(&args[1..])
        }
        "inspect" => {
            let Some(path) = args.get(1) else {
                bail!("inspect requires a manifest path");
            };
            let json = args[2..].iter().any(|arg| arg == "--json");
            inspect(Path::new(path), json)
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

fn print_usage() {
    println!("ipd-cli: in-place delta payload generator\n");
    println!("USAGE:");
    println!(
        "  ipd-cli generate <old-image> <new-image> --blob <out> --manifest <out.json> [--name N] [--block-size B] [--partition-size P] [--config C] [--verbose]"
    );
    println!("  ipd-cli apply <image> --blob <blob> --manifest <manifest.json> [--verbose]");
    println!("  ipd-cli inspect <manifest.json> [--json]");
    println!();
    println!("LOGGING:");
    println!("  RUST_LOG overrides the default filter (info, or debug with --verbose).");
}

// ── generate ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GenerateArgs {
    old: Option<PathBuf>,
    new: Option<PathBuf>,
    blob: Option<PathBuf>,
    manifest: Option<PathBuf>,
    name: Option<String>,
    block_size: Option<u64>,
    partition_size: Option<u64>,
    config: Option<PathBuf>,
}

fn parse_generate_args(args: &[String]) -> Result<GenerateArgs> {
    let mut parsed = GenerateArgs::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--blob" => {
                let raw = args.get(index + 1).context("--blob requires a value")?;
                parsed.blob = Some(PathBuf::from(raw));
                index += 2;
            }
            "--manifest" => {
                let raw = args.get(index + 1).context("--manifest requires a value")?;
                parsed.manifest = Some(PathBuf::from(raw));
                index += 2;
            }
            "--name" => {
                let raw = args.get(index + 1).context("--name requires a value")?;
                parsed.name = Some(raw.clone());
                index += 2;
            }
            "--block-size" => {
                let raw = args.get(index + 1).context("--block-size requires a value")?;
                parsed.block_size = Some(raw.parse().context("invalid --block-size value")?);
                index += 2;
            }
            "--partition-size" => {
                let raw = args
                    .get(index + 1)
                    .context("--partition-size requires a value")?;
                parsed.partition_size =
                    Some(raw.parse().context("invalid --partition-size value")?);
                index += 2;
            }
            "--config" => {
                let raw = args.get(index + 1).context("--config requires a value")?;
                parsed.config = Some(PathBuf::from(raw));
                index += 2;
            }
            flag if flag.starts_with("--") => bail!("unknown generate option: {flag}"),
            positional => {
                if parsed.old.is_none() {
                    parsed.old = Some(PathBuf::from(positional));
                } else if parsed.new.is_none() {
                    parsed.new = Some(PathBuf::from(positional));
                } else {
                    bail!("unexpected argument: {positional}");
                }
                index += 1;
            }
        }
    }
    Ok(parsed)
}

fn load_config(args: &GenerateArgs) -> Result<PayloadGenerationConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            PayloadGenerationConfig::from_json(&text)
                .with_context(|| format!("config {}", path.display()))?
        }
        None => PayloadGenerationConfig::default(),
    };
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(partition_size) = args.partition_size {
        config.partition_size = Some(partition_size);
    }
    config.validate()?;
    Ok(config)
}

fn partition(name: &str, path: &Path) -> Result<PartitionConfig> {
    let size = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    Ok(PartitionConfig::new(name, path, size))
}

fn generate(args: &[String]) -> Result<()> {
    let parsed = parse_generate_args(args)?;
    let old = parsed.old.as_deref().context("generate requires <old-image>")?;
    let new = parsed.new.as_deref().context("generate requires <new-image>")?;
    let blob_path = parsed.blob.as_deref().context("generate requires --blob")?;
    let manifest_path = parsed
        .manifest
        .as_deref()
        .context("generate requires --manifest")?;
    let name = parsed.name.as_deref().unwrap_or("partition");
    let config = load_config(&parsed)?;

    let old_part = partition(name, old)?;
    let new_part = partition(name, new)?;
    let partition_size = config.effective_partition_size(old_part.size, new_part.size)?;

    let mut blob = BlobFileWriter::create(blob_path)
        .with_context(|| format!("failed to create blob {}", blob_path.display()))?;
    let (operations, stats) =
        generate_operations_with_stats(&config, &old_part, &new_part, &BlockDiffProducer, &mut blob)?;
    let blob_size = blob.total();
    blob.finish()?;

    let blob_bytes =
        fs::read(blob_path).with_context(|| format!("failed to read {}", blob_path.display()))?;
    let manifest = PayloadManifest {
        version: IN_PLACE_PAYLOAD_VERSION,
        partition_name: name.to_owned(),
        block_size: config.block_size,
        old_size: old_part.size,
        new_size: new_part.size,
        partition_size,
        blob_blake3: blob_digest(&blob_bytes),
        blob_size,
        stats,
        operations,
    };
    manifest.write_to(manifest_path)?;
    info!(
        manifest = %manifest_path.display(),
        blob = %blob_path.display(),
        blob_size,
        operations = manifest.operations.len(),
        "payload_written"
    );
    println!("{}", serde_json::to_string_pretty(&manifest.stats)?);
    Ok(())
}

// ── apply ───────────────────────────────────────────────────────────────────

fn apply(args: &[String]) -> Result<()> {
    let mut image = None;
    let mut blob_path = None;
    let mut manifest_path = None;
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--blob" => {
                let raw = args.get(index + 1).context("--blob requires a value")?;
                blob_path = Some(PathBuf::from(raw));
                index += 2;
            }
            "--manifest" => {
                let raw = args.get(index + 1).context("--manifest requires a value")?;
                manifest_path = Some(PathBuf::from(raw));
                index += 2;
            }
            flag if flag.starts_with("--") => bail!("unknown apply option: {flag}"),
            positional => {
                if image.is_some() {
                    bail!("unexpected argument: {positional}");
                }
                image = Some(PathBuf::from(positional));
                index += 1;
            }
        }
    }
    let image = image.context("apply requires <image>")?;
    let blob_path = blob_path.context("apply requires --blob")?;
    let manifest_path = manifest_path.context("apply requires --manifest")?;

    let manifest = PayloadManifest::read_from(&manifest_path)?;
    let blob =
        fs::read(&blob_path).with_context(|| format!("failed to read {}", blob_path.display()))?;
    manifest.verify_blob(&blob)?;

    let block_size = manifest.block_size()?;
    let device = FileByteDevice::open(&image)
        .with_context(|| format!("failed to open {}", image.display()))?;
    if device.len_bytes() < manifest.partition_size {
        bail!(
            "{} is {} bytes but the payload targets a {}-byte partition",
            image.display(),
            device.len_bytes(),
            manifest.partition_size
        );
    }
    check_operations(&manifest.operations, block_size.blocks_in(device.len_bytes()))?;
    let report = apply_operations(&device, &manifest.operations, &blob, block_size)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ── inspect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput<'a> {
    partition_name: &'a str,
    version: String,
    block_size: u64,
    old_size: u64,
    new_size: u64,
    partition_size: u64,
    blob_size: u64,
    blob_blake3: &'a str,
    operations: usize,
    moves: usize,
    replaces: usize,
    replace_bzs: usize,
    stats: ipd::GenerationStats,
}

fn count(manifest: &PayloadManifest, op_type: OperationType) -> usize {
    manifest
        .operations
        .iter()
        .filter(|aop| aop.op.op_type == op_type)
        .count()
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let manifest = PayloadManifest::read_from(path)?;
    let output = InspectOutput {
        partition_name: &manifest.partition_name,
        version: manifest.version.to_string(),
        block_size: manifest.block_size,
        old_size: manifest.old_size,
        new_size: manifest.new_size,
        partition_size: manifest.partition_size,
        blob_size: manifest.blob_size,
        blob_blake3: &manifest.blob_blake3,
        operations: manifest.operations.len(),
        moves: count(&manifest, OperationType::Move),
        replaces: count(&manifest, OperationType::Replace),
        replace_bzs: count(&manifest, OperationType::ReplaceBz),
        stats: manifest.stats,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }

    println!("In-place payload {}", output.version);
    println!("partition: {}", output.partition_name);
    println!("block_size: {}", output.block_size);
    println!(
        "sizes: old={} new={} partition={}",
        output.old_size, output.new_size, output.partition_size
    );
    println!("blob: {} bytes blake3={}", output.blob_size, output.blob_blake3);
    println!(
        "operations: {} (move={} replace={} replace_bz={})",
        output.operations, output.moves, output.replaces, output.replace_bzs
    );
    println!(
        "cuts: {} full_conversions: {} scratch_blocks: {}",
        output.stats.cuts, output.stats.full_conversions, output.stats.scratch_blocks
    );
    println!();
    for (index, aop) in manifest.operations.iter().enumerate() {
        println!(
            "{index:>6} {:<10} src={} dst={} {}",
            aop.op.op_type.as_str(),
            extents_to_string(&aop.op.src_extents),
            extents_to_string(&aop.op.dst_extents),
            aop.name
        );
    }
    Ok(())
}

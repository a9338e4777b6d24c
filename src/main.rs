//! dscex - extract standalone dylibs from a dyld shared cache.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dscex::{extract_all, validate_all, CacheView, ExtractorOptions, SkipModules};

/// Extracts standalone Mach-O dylibs from a dyld shared cache.
#[derive(Parser, Debug)]
#[command(name = "dscex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the primary cache file, e.g. dyld_shared_cache_arm64e.
    /// Sub-caches and the .symbols file are discovered next to it.
    cache_path: PathBuf,

    /// Output directory for the extracted images.
    #[arg(short, long, default_value = "extracted")]
    output_dir: PathBuf,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Run the pipeline but write no files.
    #[arg(short, long)]
    disable_output: bool,

    /// Validate every image instead of extracting.
    #[arg(long)]
    only_validate: bool,

    /// Skip pipeline modules, for development. Bitmask: 1=slide,
    /// 2=linkedit, 4=stubs, 8=objc, 16=metadata. Skipping modules
    /// produces non-loadable images.
    #[arg(short, long, default_value = "0")]
    skip_modules: u32,

    /// Embed this tool's version into the mach header's reserved field.
    /// Only supported for 64-bit images.
    #[arg(long)]
    imbed_version: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn run(cli: Cli) -> Result<bool> {
    let start = Instant::now();

    let cache = CacheView::open(&cli.cache_path)
        .with_context(|| format!("failed to open cache: {}", cli.cache_path.display()))?;

    info!(
        "opened {} ({}, {} images)",
        cli.cache_path.display(),
        cache.architecture(),
        cache.images.len()
    );

    if cli.only_validate {
        let report = validate_all(&cache)?;
        print!("{}", report.summary());
        return Ok(report.failed == 0);
    }

    let options = ExtractorOptions {
        skip: SkipModules::from_bitmask(cli.skip_modules),
        verbose: cli.verbose,
        imbed_version: cli.imbed_version,
        disable_output: cli.disable_output,
    };

    let progress = ProgressBar::new(cache.images.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let report = extract_all(&cache, &cli.output_dir, &options, |done, _total, path| {
        progress.set_position(done as u64);
        progress.set_message(
            path.rsplit('/')
                .next()
                .unwrap_or(path)
                .to_string(),
        );
    })?;
    progress.finish_and_clear();

    print!("{}", report.summary());
    if report.failed > 0 {
        warn!("{} images failed to extract", report.failed);
    }
    info!(
        "finished {} images in {:.2}s",
        report.images.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(true)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Keep help/version on stdout with success, everything else is
            // an argument error.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    setup_logging(cli.verbose);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

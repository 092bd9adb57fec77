use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;
use warpconfig::PipelineConfig;

use crate::cli::RunArgs;
use crate::defaults::resolve_config;
use crate::paths::AppPaths;
use crate::report::SimReport;
use crate::sim::{simulate, SimOptions};

pub fn run(args: RunArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let (config, source) = resolve_config(&paths, args.config.as_deref())?;
    tracing::debug!(
        config = %paths.config_dir().display(),
        data = %paths.data_dir().display(),
        source = ?source,
        "resolved warpsim paths"
    );

    let options = SimOptions::from(&args);
    tracing::info!(
        duration = ?options.duration,
        render_cost = ?options.render_cost,
        gpu_latency = ?options.gpu_latency,
        clock = ?options.clock,
        "starting simulation"
    );
    let outcome = simulate(config, &options)?;
    let report = SimReport::new(&outcome, source.as_ref());
    report.print_summary();

    if let Some(path) = &args.report {
        report.write(path)?;
        tracing::info!(path = %path.display(), "wrote report");
    }

    if let Some(fault) = &outcome.fault {
        bail!("pipeline stopped: {fault}");
    }
    Ok(())
}

pub fn check(path: &Path) -> Result<()> {
    let config = PipelineConfig::load(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    let table = config
        .distortion_table()
        .with_context(|| format!("invalid distortion table in {}", path.display()))?;
    println!("{}: ok", path.display());
    println!(
        "  pipeline: asynchronous={} front_buffer={} minimum_vsyncs={}",
        config.pipeline.asynchronous, config.pipeline.front_buffer, config.pipeline.minimum_vsyncs
    );
    println!(
        "  display:  {}x{} @ {}Hz",
        config.display.width, config.display.height, config.display.refresh_hz
    );
    println!(
        "  lens:     {} coefficients, tessellation {}x{}",
        table.coefficients.len(),
        table.tessellation[0],
        table.tessellation[1]
    );
    Ok(())
}

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

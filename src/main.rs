use anyhow::{Context, Result};
use clpipe::{
    device::{Backend, DeviceKind, DeviceRegistry},
    kernels::{cube_reference, CUBE_ENTRY, CUBE_SOURCE, DATA_SIZE},
    pipeline::{Pipeline, PipelineConfig},
};
use std::{fs, path::PathBuf, process::ExitCode, time::Duration};

/// Cubes random integers on an accelerator and checks them on the host.
#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// device backend, sim or opencl
    #[arg(long, env = "CLPIPE_BACKEND", default_value_t = Backend::Sim)]
    backend: Backend,
    /// device class, gpu, cpu, accelerator or all
    #[arg(long, default_value_t = DeviceKind::Gpu)]
    kind: DeviceKind,
    /// number of elements
    #[arg(long, default_value_t = DATA_SIZE)]
    count: usize,
    /// seed of the random input
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// explicit work-group size
    ///
    /// By default the device partitions the work.
    #[arg(long)]
    local_size: Option<usize>,
    /// queue transfers and the dispatch without blocking
    #[arg(long)]
    deferred: bool,
    /// fail if the device does not finish within this many milliseconds
    #[arg(long)]
    drain_timeout_ms: Option<u64>,
    /// kernel source file, defaults to the builtin cube kernel
    #[arg(long)]
    source: Option<PathBuf>,
    /// kernel entry point
    #[arg(long, default_value = CUBE_ENTRY)]
    entry: String,
    /// only print the summary
    #[arg(long, short)]
    quiet: bool,
}

/// Adds the stage of the error as context.
fn staged<T>(result: clpipe::result::Result<T>) -> Result<T> {
    result.map_err(|error| {
        let stage = error.stage();
        anyhow::Error::new(error).context(stage)
    })
}

fn run(cli: Cli) -> Result<()> {
    let source = match &cli.source {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => CUBE_SOURCE.to_string(),
    };
    let config = PipelineConfig::default()
        .with_backend(cli.backend)
        .with_kind(cli.kind)
        .with_source(source)
        .with_entry(cli.entry)
        .with_count(cli.count)
        .with_local_size(cli.local_size)
        .with_blocking(!cli.deferred)
        .with_drain_timeout(cli.drain_timeout_ms.map(Duration::from_millis));
    let input = config.random_input(cli.seed);
    let registry = staged(DeviceRegistry::new(config.backend()))?;
    let device = staged(registry.select_first(config.kind()))?;
    if !cli.quiet {
        println!("{}\n", registry.describe(&device));
    }
    let reference = cube_reference(&input);
    let report = staged(Pipeline::new(device, config).run(&input, &reference))?;
    if !cli.quiet {
        for (x, y) in input.iter().zip(report.output()) {
            println!("{x} -> {y}");
        }
    }
    println!("{}", report.summary());
    Ok(())
}

fn main() -> ExitCode {
    use clap::Parser;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    log::debug!("{cli:?}");
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

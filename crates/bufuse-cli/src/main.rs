use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::{Context, IntoDiagnostic};

use bufuse_fusion::{FusionConfig, FusionEngine};
use bufuse_graph::ComputeGraph;

/// bufuse — buffer fusion for accelerator compute graphs
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Input graph (JSON)
    graph: Option<PathBuf>,

    /// Fusion configuration (JSON); built-in defaults otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output path for the annotated graph (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// List registered passes and their patterns, then exit
    #[arg(long)]
    list_patterns: bool,

    /// Run the fusion passes without writing the annotated graph
    #[arg(long)]
    dry_run: bool,

    /// Log more (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .parse_default_env()
        .init();

    // 1. Configuration.
    let config = match &cli.config {
        Some(path) => FusionConfig::load(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => FusionConfig::default(),
    };
    let engine = FusionEngine::with_builtins(config);

    if cli.list_patterns {
        for (pass, pattern) in engine.registry().patterns() {
            println!("{pass}/{} (heads: {})", pattern.name(), pattern.heads().join(", "));
        }
        return Ok(());
    }

    // 2. Read and parse the graph.
    let path = cli
        .graph
        .as_ref()
        .ok_or_else(|| miette::miette!("no input graph given"))?;
    let text = std::fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let mut graph = ComputeGraph::from_json(&text)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to parse graph {}", path.display()))?;
    log::debug!("loaded graph:\n{}", bufuse_graph::dump_graph(&graph));

    // 3. Fuse.
    let report = engine
        .run(&mut graph)
        .into_diagnostic()
        .wrap_err("fusion failed")?;

    // 4. Summary on stderr, so stdout stays valid JSON.
    for scope in &report.scopes {
        eprintln!("{scope}");
    }
    eprintln!(
        "{} scope(s), {} deferred, {} rejected, {} abandoned",
        report.scopes.len(),
        report.deferred,
        report.rejected,
        report.abandoned
    );

    if cli.dry_run {
        return Ok(());
    }

    // 5. Write the annotated graph.
    let json = graph
        .to_json_pretty()
        .into_diagnostic()
        .wrap_err("failed to serialize graph")?;
    match &cli.output {
        Some(path) => std::fs::write(path, json)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {}", path.display()))?,
        None => println!("{json}"),
    }

    Ok(())
}

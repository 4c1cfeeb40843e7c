use std::fs;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use console::style;

use gridflow::utils::{as_overhead, init_logging};
use gridflow::{
    Backend, Blueprint, FsStore, GridError, GridSpec, LauncherBackend, LocalBackend, Settings,
    TaskGraph,
};

/// Expand a parameter grid and run its processing and evaluation jobs.
#[derive(Parser, Debug, Clone)]
#[clap(name = "gridflow", version)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Build the task graph and report which tasks are already complete.
    Plan {
        #[clap(flatten)]
        common: Common,
        /// Print the task graph as a Mermaid diagram.
        #[clap(long)]
        mermaid: bool,
    },
    /// Run every task that isn't complete yet.
    Run {
        #[clap(flatten)]
        common: Common,
        /// Number of jobs running at the same time.
        #[clap(short, long, default_value_t = 10)]
        workers: usize,
        /// Run jobs on this machine instead of through the launcher.
        #[clap(long)]
        local: bool,
        /// Launcher prefix, split on whitespace.
        #[clap(long, default_value = "run_lsf")]
        launcher: String,
        /// Only check the store, don't submit anything.
        #[clap(long)]
        dry_run: bool,
        /// Write a Mermaid diagram of the run, colored by task state.
        #[clap(long)]
        report: Option<Utf8PathBuf>,
    },
}

#[derive(Args, Debug, Clone)]
struct Common {
    /// Grid file (JSON).
    grid: Utf8PathBuf,
    /// Directory holding the experiment directories.
    #[clap(short, long, default_value = ".")]
    base_dir: Utf8PathBuf,
    /// Root directory of the completion store.
    #[clap(short, long)]
    store: Utf8PathBuf,
    /// CPUs requested per job, unless the grid file sets it.
    #[clap(long, default_value_t = 5)]
    cpus: u32,
}

fn build(common: &Common, workers: usize) -> anyhow::Result<TaskGraph> {
    let s = Instant::now();

    let spec = GridSpec::load(&common.grid)?;
    let settings = Settings {
        base_dir: common.base_dir.clone(),
        workers,
        cpus: common.cpus,
    };

    let graph = Blueprint::from_spec(&spec, settings).build(&spec)?;

    eprintln!(
        "Built {} evaluation and {} processing tasks {}",
        graph.evaluations().count(),
        graph.processing().count(),
        as_overhead(s)
    );

    Ok(graph)
}

fn main() -> anyhow::Result<ExitCode> {
    init_logging()?;

    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Plan { common, mermaid } => {
            let graph = build(common, 1)?;
            let store = FsStore::new(&common.store);

            if *mermaid {
                println!("{graph}");
            }

            graph.plan(&store).map(|report| {
                eprintln!("{}", report.summary());
                ExitCode::SUCCESS
            })
        }
        Command::Run {
            common,
            workers,
            local,
            launcher,
            dry_run,
            report,
        } => {
            let graph = build(common, *workers)?;
            let store = FsStore::new(&common.store);

            if *dry_run {
                graph.plan(&store).map(|report| {
                    eprintln!("{}", report.summary());
                    ExitCode::SUCCESS
                })
            } else {
                let backend: Box<dyn Backend> = if *local {
                    Box::new(LocalBackend)
                } else {
                    Box::new(LauncherBackend::new(
                        launcher.split_whitespace().map(String::from).collect(),
                    ))
                };

                graph.run(&store, backend.as_ref()).and_then(|outcome| {
                    if let Some(path) = report {
                        fs::write(path, outcome.render_mermaid(&graph))
                            .map_err(|e| GridError::Io(path.clone(), e))?;
                    }

                    let summary = outcome.summary();
                    if outcome.is_success() {
                        eprintln!("{}", style(summary).green());
                        Ok(ExitCode::SUCCESS)
                    } else {
                        eprintln!("{}", style(summary).red());
                        Ok(ExitCode::FAILURE)
                    }
                })
            }
        }
    };

    match result {
        Ok(code) => Ok(code),
        Err(e) if e.is_retryable() => {
            eprintln!("{}", style(&e).yellow());
            // EX_TEMPFAIL
            Ok(ExitCode::from(75))
        }
        Err(e) => Err(e).context("Grid run aborted"),
    }
}

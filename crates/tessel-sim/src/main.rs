//! tessel-sim — dry-run the Tessel system scheduler against a fixture.
//!
//! Loads a TOML cluster fixture into a state store (in memory, or a redb
//! file under `--data-dir`), evaluates every system job concurrently, and
//! prints the evaluation outcomes as JSON on stdout.
//!
//! # Usage
//!
//! ```text
//! tessel-sim run --fixture cluster.toml --drain node-03
//! tessel-sim validate --fixture cluster.toml
//! ```

mod fixture;
mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessel_state::StateStore;

use crate::fixture::ClusterFixture;

#[derive(Parser)]
#[command(name = "tessel-sim", about = "Tessel system scheduler simulator")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed a store from a fixture and evaluate every system job.
    Run {
        /// Cluster fixture (TOML).
        #[arg(long)]
        fixture: PathBuf,

        /// Persist state to a redb file in this directory instead of memory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Drain this node before evaluating. Repeatable.
        #[arg(long = "drain", value_name = "NODE")]
        drains: Vec<String>,
    },
    /// Parse and check a fixture without scheduling anything.
    Validate {
        #[arg(long)]
        fixture: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tessel=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Run {
            fixture,
            data_dir,
            drains,
        } => run(fixture, data_dir, drains).await,
        Command::Validate { fixture } => {
            let parsed = ClusterFixture::from_file(&fixture)?;
            info!(
                path = ?fixture,
                nodes = parsed.nodes.len(),
                jobs = parsed.jobs.len(),
                system_jobs = parsed.system_jobs().count(),
                "fixture is valid"
            );
            Ok(())
        }
    }
}

async fn run(fixture: PathBuf, data_dir: Option<PathBuf>, drains: Vec<String>) -> anyhow::Result<()> {
    let parsed = ClusterFixture::from_file(&fixture)?;
    info!(path = ?fixture, "fixture loaded");

    let store = match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let db_path = dir.join("tessel.redb");
            let store = StateStore::open(&db_path)?;
            info!(path = ?db_path, "state store opened");
            store
        }
        None => StateStore::open_in_memory()?,
    };

    let outcomes = runner::run_fixture(&parsed, store, &drains).await?;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    Ok(())
}

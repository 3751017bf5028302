//! Sparkhost: Main Entry Point
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  main                                                          │
//! │   1. logger (RUST_LOG, default "info")                         │
//! │   2. data directory ─▶ FileStorage ─▶ EngineConfig             │
//! │   3. Engine::spawn(config, TargetConnector, storage,           │
//! │                    LogEventSink, SystemClock)                  │
//! │   4. join: returns once the reconnect budget is spent          │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use env_logger::Env;
use log::info;

use sparkhost::adapters::log_sink::LogEventSink;
use sparkhost::adapters::storage::FileStorage;
use sparkhost::adapters::time::SystemClock;
use sparkhost::app::ports::ConfigPort;
use sparkhost::config::ConnectionTarget;
use sparkhost::rpc::transport::TargetConnector;
use sparkhost::Engine;

const DEFAULT_DATA_DIR: &str = "./sparkhost-data";

// ── Arguments ─────────────────────────────────────────────────

struct Args {
    data_dir: PathBuf,
    simulate: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        simulate: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--data-dir" => {
                args.data_dir = it
                    .next()
                    .map(PathBuf::from)
                    .context("--data-dir needs a path")?;
            }
            "--simulate" => args.simulate = true,
            "-h" | "--help" => {
                println!("usage: sparkhost [--data-dir <path>] [--simulate]");
                std::process::exit(0);
            }
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(args)
}

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Sparkhost v{}", env!("CARGO_PKG_VERSION"));

    let args = parse_args()?;
    let storage = FileStorage::open(&args.data_dir)
        .map_err(|e| anyhow!("data directory {}: {}", args.data_dir.display(), e))?;
    let mut config = storage
        .load()
        .map_err(|e| anyhow!("loading config: {}", e))?;
    if args.simulate {
        config.target = ConnectionTarget::Simulation;
    }
    info!("Config: target {:?}", config.target);

    let connector = TargetConnector::new(config.target.clone());
    let engine = Engine::spawn(config, connector, storage, LogEventSink::new(), SystemClock)
        .context("starting engine")?;
    engine.join().context("engine stopped")?;
    Ok(())
}

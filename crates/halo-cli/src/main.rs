use anyhow::Result;
use halo_core::config::EngineConfig;
use halo_core::manager::PresenceManager;
use halo_core::runtime::Runtime;
use halo_core::sync::TrustedLocalSync;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<EngineConfig> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut dev_mode = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next().map(PathBuf::from),
            "--dev" => dev_mode = true,
            other => warn!(arg = other, "ignoring unknown argument"),
        }
    }

    let mut config = match config_path {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::default(),
    };
    config.dev_mode = config.dev_mode || dev_mode;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    let runtime = Arc::new(Runtime::from_config(&config));
    if !runtime.load(true) {
        warn!("no browser available; web presences will stay disabled");
    }

    let manager = PresenceManager::new(config, Some(Arc::clone(&runtime)), Box::new(TrustedLocalSync));
    let found = manager.discover(false);
    info!(found, "discovery finished");
    manager.start_all();

    let stdin = std::io::stdin();
    print_help();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("list"), _) => {
                for spec in manager.workers() {
                    println!(
                        "{:<20} running={:<5} web={:<5} interval={}s runs={}",
                        spec.name,
                        spec.is_running(),
                        spec.web,
                        spec.interval_secs,
                        spec.runs
                    );
                }
            }
            (Some("status"), Some(name)) => match manager.worker(name) {
                Some(spec) => println!("{:?}", spec.last_activity()),
                None => println!("unknown presence {name}"),
            },
            (Some("start"), Some(name)) => {
                if let Err(err) = manager.start(name) {
                    println!("start failed: {err}");
                }
            }
            (Some("stop"), Some(name)) => {
                if let Err(err) = manager.stop(name) {
                    println!("stop failed: {err}");
                }
            }
            (Some("rescan"), _) => {
                let found = manager.discover(true);
                println!("{found} presences discovered");
            }
            (Some("quit"), _) | (Some("exit"), _) => break,
            (Some(other), _) => {
                println!("unknown command {other}");
                print_help();
            }
            (None, _) => {}
        }
    }

    manager.shutdown();
    runtime.stop();
    Ok(())
}

fn print_help() {
    println!("commands: list | status <name> | start <name> | stop <name> | rescan | quit");
}

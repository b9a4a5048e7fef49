mod presences;

use halo_core::plugin::PresenceRegistry;
use halo_core::worker::{run_worker, WorkerConfig};
use tracing_subscriber::EnvFilter;

fn main() {
    // Worker logs go to stderr; stdout belongs to the manager protocol.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("worker misconfigured: {err}");
            std::process::exit(2);
        }
    };

    let mut registry = PresenceRegistry::new();
    presences::register_builtins(&mut registry);

    std::process::exit(run_worker(config, &registry));
}

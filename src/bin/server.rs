//! Bramble server binary.

use bramble::config::Config;
use bramble::store::BtreeStore;
use bramble::{logging, signal, worker};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bramble-server")]
#[command(about = "Event-driven memcached-style cache server")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn run(config: Config) -> std::io::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal::listen_for_shutdown(&shutdown);

    let (store, pool) = BtreeStore::spawn(config.store.write_threads);
    let handles = worker::spawn_workers(&config, &store, &shutdown)?;

    for handle in handles {
        let _ = handle.join();
    }

    // Reactors are gone; dropping the last store handle lets the write
    // workers drain and exit.
    drop(store);
    pool.join();

    tracing::info!("shutdown complete");
    Ok(())
}

fn print_default_config() {
    let config = r#"# Bramble server configuration

[workers]
# Number of reactor threads (default: number of CPUs)
# threads = 4

[listener]
# Address to listen on
address = "127.0.0.1:11211"

# Listen backlog
backlog = 4096

[buffers]
# Receive buffer capacity per connection; a request plus its arguments
# must fit (powers of two recommended)
recv_buffer_size = 4096

# Capacity of each send chain link
send_link_size = 4096

[store]
# Number of write worker threads
write_threads = 2

[logging]
# Log level filter; RUST_LOG overrides this
level = "info"

# Output format: "pretty", "compact", or "json"
format = "pretty"

# Include timestamps
timestamps = true
"#;
    print!("{}", config);
}

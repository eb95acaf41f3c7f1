//! Runs a `nirstream` server against a directory of `{idx}.jpg` X-ray
//! images, exiting cleanly on Ctrl-C.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nirstream::{DirectoryImageProvider, Server, ServerConfig};

#[derive(Parser)]
#[command(about = "Stream the newest camera frame and serve a static X-ray catalog")]
struct Args {
    #[arg(long, default_value = "192.168.1.2")]
    ip: Ipv4Addr,

    #[arg(long, default_value_t = 27015)]
    port: u16,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[arg(long, default_value_t = 10)]
    max_clients: usize,

    /// Directory of `{idx}.jpg` files served by `GET XRAY`.
    #[arg(long, default_value = "../XRay")]
    xray_dir: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ServerConfig::new(args.ip, args.port, args.workers, args.max_clients);
    let catalog: Arc<dyn nirstream::StaticImageProvider> =
        Arc::new(DirectoryImageProvider::new(&args.xray_dir));

    let server = match Server::run(config, catalog) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to start nirstream server: {e}");
            std::process::exit(1);
        }
    };

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown_requested)) {
        eprintln!("failed to register SIGINT handler: {e}");
    }
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown_requested)) {
        eprintln!("failed to register SIGTERM handler: {e}");
    }

    while !shutdown_requested.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    if let Err(e) = server.close() {
        eprintln!("error while shutting down nirstream server: {e}");
    }
}

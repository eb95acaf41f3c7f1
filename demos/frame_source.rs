//! Stands in for the camera pipeline: starts a `nirstream` server and feeds
//! it synthetic frames at a fixed rate, for manual testing against a real
//! TCP client.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nirstream::{DirectoryImageProvider, Server, ServerConfig};

#[derive(Parser)]
#[command(about = "Publish synthetic frames to a nirstream server for manual testing")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    ip: Ipv4Addr,

    #[arg(long, default_value_t = 27015)]
    port: u16,

    #[arg(long, default_value_t = 2)]
    workers: usize,

    #[arg(long, default_value_t = 4096)]
    frame_bytes: usize,

    #[arg(long, default_value_t = 30)]
    fps: u64,

    #[arg(long, default_value = "../XRay")]
    xray_dir: std::path::PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = ServerConfig::new(args.ip, args.port, args.workers, 10);
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
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown_requested)).ok();

    let frame_interval = Duration::from_millis(1000 / args.fps.max(1));
    let mut frame = vec![0u8; args.frame_bytes];

    while !shutdown_requested.load(Ordering::Relaxed) {
        fastrand::fill(&mut frame);
        server.publish(&frame);
        std::thread::sleep(frame_interval);
    }

    server.close().ok();
}

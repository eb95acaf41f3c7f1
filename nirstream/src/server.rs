//! Server engine (spec §4.4, C4): wiring of listener, worker pool, and the
//! per-worker frame queues into one running service.
//!
//! Grounded in `HoloNetwork::RunServer`/`CloseServer`/`UpdateBuffer`: bind and
//! listen once, build one `LatestQueue` per worker thread (`TQueue<Package>`
//! in the source), spawn the fixed worker pool, and on `UpdateBuffer` fan the
//! newest frame out to every worker's queue as an independent deep copy.

use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::queue::ArrayQueue;
use nix::unistd;
use socket2::{Domain, Socket, Type};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::connection::ConnectionRecord;
use crate::error::{NirError, Result};
use crate::queue::LatestQueue;
use crate::reactor::{self, SharedReactor};
use crate::xray::StaticImageProvider;

pub struct Server {
    shared: Arc<SharedReactor>,
    workers: Vec<JoinHandle<()>>,
    shutdown_write: File,
    config: ServerConfig,
}

impl Server {
    /// Binds, listens, builds the worker pool, and starts servicing
    /// connections — the combined effect of `SetupServer` + `RunServer`.
    pub fn run(config: ServerConfig, catalog: Arc<dyn StaticImageProvider>) -> Result<Server> {
        bump_fd_limit(config.max_clients);

        let listener = setup_listener(&config)?;
        let epoll = reactor::create_epoll()?;

        let connections: Vec<Arc<ConnectionRecord>> = (0..config.max_clients)
            .map(|id| Arc::new(ConnectionRecord::new(id, config.request_max_bytes)))
            .collect();
        let free_list = ArrayQueue::new(config.max_clients);
        for id in 0..config.max_clients {
            free_list.push(id).ok();
        }

        let worker_queues: Vec<Arc<LatestQueue<Vec<u8>>>> = (0..config.workers)
            .map(|_| Arc::new(LatestQueue::new(config.frame_queue_capacity, |_: Vec<u8>| {})))
            .collect();

        let (shutdown_read, shutdown_write) =
            unistd::pipe().map_err(|e| NirError::Startup(e.into()))?;
        let shutdown_read = File::from(shutdown_read);
        let mut shutdown_write = File::from(shutdown_write);

        let shared = Arc::new(SharedReactor {
            epoll,
            listener,
            connections,
            free_list,
            pending_streams: Mutex::new(Vec::new()),
            worker_queues,
            catalog,
            shutdown: AtomicBool::new(false),
            shutdown_read,
        });
        shared.arm()?;

        let mut workers = Vec::with_capacity(config.workers);
        for idx in 0..config.workers {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("nirstream-worker-{idx}"))
                .spawn(move || reactor::run_worker(worker_shared, idx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.shutdown.store(true, Ordering::Release);
                    for _ in 0..workers.len() {
                        shutdown_write.write_all(&[0u8; 1]).ok();
                    }
                    for handle in workers {
                        handle.join().ok();
                    }
                    return Err(NirError::Startup(e));
                }
            }
        }

        info!(ip = %config.ip, port = config.port, workers = config.workers, "nirstream server listening");

        Ok(Server {
            shared,
            workers,
            shutdown_write,
            config,
        })
    }

    /// `UpdateBuffer`: copies `frame` into every worker's own `LatestQueue`
    /// so each worker observes the newest frame independent of the others.
    /// The frame source stays oblivious to backpressure or timestamping
    /// (spec §7): each queue stamps and ages the frame internally.
    pub fn publish(&self, frame: &[u8]) {
        for queue in &self.shared.worker_queues {
            queue.push(frame.to_vec());
        }
    }

    pub fn set_frame_tolerance(&self, tolerance: i64) {
        for queue in &self.shared.worker_queues {
            queue.set_tolerance(tolerance);
        }
    }

    /// Actual bound address, useful when `config.port == 0` asked the OS to
    /// pick a free ephemeral port (the common pattern in this crate's own
    /// integration tests).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared
            .listener
            .local_addr()
            .map_err(NirError::Startup)
            .and_then(|addr| addr.as_socket().ok_or(NirError::Startup(std::io::Error::from(
                std::io::ErrorKind::AddrNotAvailable,
            ))))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// `CloseServer`: post one shutdown token per worker, join them, then
    /// tear down the listener and connection table.
    pub fn close(mut self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            self.shutdown_write.write_all(&[0u8; 1]).ok();
        }
        for handle in self.workers.drain(..) {
            handle.join().ok();
        }
        warn!("nirstream server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown_inner().ok();
        }
    }
}

fn setup_listener(config: &ServerConfig) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(NirError::Startup)?;
    socket.set_reuse_address(true).map_err(NirError::Startup)?;
    socket.set_nonblocking(true).map_err(NirError::Startup)?;

    let addr = SocketAddr::V4(std::net::SocketAddrV4::new(config.ip, config.port));
    socket.bind(&addr.into()).map_err(NirError::Startup)?;
    socket
        .listen(config.max_clients as i32)
        .map_err(NirError::Startup)?;

    Ok(socket)
}

/// `RunServer` has no analogue for this on Windows, but a `max_clients`-sized
/// connection table needs at least that many file descriptors available;
/// bump the soft limit defensively the way long-running servers in this
/// ecosystem do at startup.
fn bump_fd_limit(max_clients: usize) {
    let wanted = (max_clients as u64 + 64).max(1024);
    if let Ok((_, hard)) = rlimit::getrlimit(rlimit::Resource::NOFILE) {
        let target = wanted.min(hard);
        let _ = rlimit::setrlimit(rlimit::Resource::NOFILE, target, hard);
    }
}

//! Server configuration.
//!
//! Replaces the source's global exposure/calibration state (see spec §9) with
//! a plain, engine-owned record. The defaults mirror `HoloNetwork`'s
//! zero-argument constructor.

use std::net::Ipv4Addr;

/// Requests larger than this, or that never resolve to a known keyword, are
/// classified `Invalid` (spec §6).
pub const DEFAULT_REQUEST_MAX_BYTES: usize = 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Number of worker threads draining the shared completion queue.
    pub workers: usize,
    /// Number of pre-created connection slots; also the `listen` backlog.
    pub max_clients: usize,
    /// Per-worker `LatestQueue` capacity for the current frame.
    pub frame_queue_capacity: usize,
    /// Upper bound on an unparsed request before it is classified `Invalid`.
    pub request_max_bytes: usize,
}

impl ServerConfig {
    pub fn new(ip: Ipv4Addr, port: u16, workers: usize, max_clients: usize) -> Self {
        ServerConfig {
            ip,
            port,
            workers: workers.max(1),
            max_clients: max_clients.max(1),
            frame_queue_capacity: 1,
            request_max_bytes: DEFAULT_REQUEST_MAX_BYTES,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig::new(Ipv4Addr::new(192, 168, 1, 2), 27015, 4, 10)
    }
}

//! Completion reactor and worker pool (spec §4.3, C3).
//!
//! `HoloNetwork::RunServer` associates one listener and every client socket
//! with a single IOCP handle, then lets `MaxWorkerThreadNum` threads all call
//! `GetQueuedCompletionStatus` on it. `epoll` has no notion of a completion
//! queue shared by multiple waiters the way IOCP does, but a single `Epoll`
//! instance is itself `Send + Sync` and safe to `epoll_wait` from many
//! threads concurrently — registering it once and spawning the same worker
//! loop on every thread reproduces the same "any worker may service any
//! ready connection" fan-out.
//!
//! `WorkerFunction`'s pattern — pop this worker's own `TQueue` once per loop
//! iteration, cache the result locally, then act on whatever completion woke
//! the thread — is kept verbatim; the queue is `LatestQueue<Vec<u8>>` here
//! instead of `TQueue<Package>`.

use std::fs::File;
use std::io::Read;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use socket2::Socket;

use crate::connection::{build_response, ConnectionRecord};
use crate::error::{NirError, Result};
use crate::queue::LatestQueue;
use crate::xray::StaticImageProvider;

/// `epoll_wait` is given a bounded timeout rather than -1 so a worker that
/// only ever gets woken by client I/O still notices a newly published frame
/// (for a parked `STREAM` connection) and the shutdown flag promptly.
fn poll_timeout() -> EpollTimeout {
    EpollTimeout::from(50u16)
}

const TOKEN_ACCEPT: u64 = 0;
const TOKEN_SHUTDOWN: u64 = 1;
const TOKEN_CONN_BASE: u64 = 2;

fn conn_token(id: usize) -> u64 {
    TOKEN_CONN_BASE + id as u64
}

fn token_to_conn(token: u64) -> Option<usize> {
    token.checked_sub(TOKEN_CONN_BASE).map(|v| v as usize)
}

/// Shared state every worker thread borrows. Built once by `Server::run` and
/// handed to each worker as an `Arc`.
pub struct SharedReactor {
    pub epoll: Epoll,
    pub listener: Socket,
    pub connections: Vec<Arc<ConnectionRecord>>,
    /// Indices into `connections` that currently hold no client and are free
    /// to be handed the next `accept()`.
    pub free_list: crossbeam::queue::ArrayQueue<usize>,
    /// Connections whose `STREAM` response is blocked on a fresh frame
    /// (spec §9: never busy-spin trying to resend an empty buffer).
    pub pending_streams: Mutex<Vec<usize>>,
    pub worker_queues: Vec<Arc<LatestQueue<Vec<u8>>>>,
    pub catalog: Arc<dyn StaticImageProvider>,
    pub shutdown: AtomicBool,
    pub shutdown_read: File,
}

impl SharedReactor {
    fn register_listener(&self) -> Result<()> {
        let event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLEXCLUSIVE, TOKEN_ACCEPT);
        self.epoll
            .add(&self.listener, event)
            .map_err(|e| NirError::Startup(e.into()))
    }

    fn register_shutdown_pipe(&self) -> Result<()> {
        let event = EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SHUTDOWN);
        self.epoll
            .add(&self.shutdown_read, event)
            .map_err(|e| NirError::Startup(e.into()))
    }

    pub fn arm(&self) -> Result<()> {
        self.register_listener()?;
        self.register_shutdown_pipe()
    }

    fn accept_one(&self) {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    let Some(idx) = self.free_list.pop() else {
                        // No free connection record; the source has the same
                        // limitation (a fixed `Connections` vector sized by
                        // `MaxClientNum`), so drop the extra client.
                        drop(socket);
                        continue;
                    };
                    if socket.set_nonblocking(true).is_err() {
                        self.free_list.push(idx).ok();
                        continue;
                    }
                    let peer = addr.as_socket().unwrap_or_else(|| {
                        std::net::SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
                    });
                    let record = &self.connections[idx];
                    record.complete_accept(socket, peer);
                    tracing::debug!(connection_id = idx, peer = %peer, "accepted connection");
                    if let Some(fd) = record.raw_fd() {
                        let event =
                            EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT, conn_token(idx));
                        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                        if self.epoll.add(borrowed, event).is_err() {
                            record.reset();
                            self.free_list.push(idx).ok();
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn reset_connection(&self, idx: usize) {
        let record = &self.connections[idx];
        if let Some(fd) = record.raw_fd() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            self.epoll.delete(borrowed).ok();
        }
        tracing::debug!(connection_id = idx, "resetting connection");
        record.reset();
        record.mark_idle();
        self.free_list.push(idx).ok();
    }

    fn dispatch(&self, idx: usize, local_frame: &[u8]) {
        let record = Arc::clone(&self.connections[idx]);
        match record.state() {
            crate::connection::ConnState::WaitReadRequest => match record.read_request() {
                Ok(Some(request)) => {
                    let response = build_response(request, &self.catalog, || local_frame.to_vec());
                    record.begin_send(response);
                    self.rearm(idx, EpollFlags::EPOLLOUT);
                    self.drive_send(idx, local_frame);
                }
                Ok(None) => self.rearm(idx, EpollFlags::EPOLLIN),
                Err(_) => self.reset_connection(idx),
            },
            crate::connection::ConnState::WaitSendData => self.drive_send(idx, local_frame),
            _ => {}
        }
    }

    fn drive_send(&self, idx: usize, local_frame: &[u8]) {
        let record = Arc::clone(&self.connections[idx]);
        match record.drive_send() {
            Ok(true) => {
                if record.is_streaming() {
                    if local_frame.is_empty() {
                        self.pending_streams.lock().unwrap().push(idx);
                    } else {
                        record.rearm_stream(local_frame.to_vec());
                        self.rearm(idx, EpollFlags::EPOLLOUT);
                    }
                } else {
                    self.reset_connection(idx);
                }
            }
            Ok(false) => self.rearm(idx, EpollFlags::EPOLLOUT),
            Err(_) => self.reset_connection(idx),
        }
    }

    /// Every connection fd is armed one-shot (spec §4.3: serialize a single
    /// connection's completions so no two workers ever act on it at once);
    /// each dispatch must explicitly rearm interest before returning.
    fn rearm(&self, idx: usize, flags: EpollFlags) {
        if let Some(fd) = self.connections[idx].raw_fd() {
            let mut event = EpollEvent::new(flags | EpollFlags::EPOLLONESHOT, conn_token(idx));
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            self.epoll.modify(borrowed, &mut event).ok();
        }
    }

    fn retry_pending_streams(&self, local_frame: &[u8]) {
        if local_frame.is_empty() {
            return;
        }
        let ready: Vec<usize> = std::mem::take(&mut *self.pending_streams.lock().unwrap());
        for idx in ready {
            let record = Arc::clone(&self.connections[idx]);
            if matches!(record.state(), crate::connection::ConnState::WaitSendData) && record.is_streaming() {
                record.rearm_stream(local_frame.to_vec());
                self.rearm(idx, EpollFlags::EPOLLOUT);
            }
        }
    }
}

/// One worker thread's loop body, equivalent to `HoloNetwork::WorkerFunction`.
pub fn run_worker(shared: Arc<SharedReactor>, worker_idx: usize) {
    let span = tracing::info_span!("nirstream_worker", worker_id = worker_idx);
    let _guard = span.enter();

    let queue = Arc::clone(&shared.worker_queues[worker_idx]);
    let mut local_frame: Vec<u8> = Vec::new();
    let mut events = [EpollEvent::empty(); 256];

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let fresh = queue.pop(Vec::new);
        if !fresh.is_empty() {
            local_frame = fresh;
            shared.retry_pending_streams(&local_frame);
        }

        let n = match shared.epoll.wait(&mut events, poll_timeout()) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        };

        for event in &events[..n] {
            let token = event.data();
            if token == TOKEN_SHUTDOWN {
                let mut byte = [0u8; 1];
                (&shared.shutdown_read).read(&mut byte).ok();
                shared.shutdown.store(true, Ordering::Release);
                continue;
            }
            if token == TOKEN_ACCEPT {
                shared.accept_one();
                continue;
            }
            if let Some(idx) = token_to_conn(token) {
                let peer = shared.connections[idx].peer().map(|p| p.to_string()).unwrap_or_default();
                let _conn_span =
                    tracing::debug_span!("connection", connection_id = idx, peer = %peer).entered();
                shared.dispatch(idx, &local_frame);
            }
        }
    }
}

pub fn create_epoll() -> Result<Epoll> {
    Epoll::new(EpollCreateFlags::empty()).map_err(|e| NirError::Startup(e.into()))
}

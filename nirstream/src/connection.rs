//! Per-connection state machine (spec §4.2, C2).
//!
//! Grounded in `Connection.h`/`Connection.cpp`: the same four states
//! (`WaitAccept`, `WaitReadRequest`, `WaitSendData`, `WaitReset`), the same
//! read-accumulate-then-parse loop, and the same "stream keeps re-sending,
//! everything else resets" completion logic. `AcceptEx`/`WSARecv`/`WSASend`/
//! `TransmitFile` are replaced by non-blocking `read`/`write` driven from
//! `EPOLLIN`/`EPOLLOUT` readiness, since there is no completion-style accept
//! or send on Linux; the state machine itself — which operation is legal in
//! which state, and what follows a completion — is unchanged.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use socket2::Socket;

use crate::error::{NirError, Result};
use crate::protocol::{self, ParseOutcome, Request};
use crate::xray::StaticImageProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    WaitAccept,
    WaitReadRequest,
    WaitSendData,
    WaitReset,
}

/// What the reactor should do with this connection's fd next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextOp {
    /// Keep waiting for readability.
    AwaitRead,
    /// Keep waiting for writability.
    AwaitWrite,
    /// The connection has been reset; the fd has been closed and the record
    /// index should return to the free-list.
    Released,
}

struct Inner {
    socket: Option<Socket>,
    state: ConnState,
    read_buf: Vec<u8>,
    /// Pending bytes still to be written for the current response.
    write_buf: Vec<u8>,
    write_offset: usize,
    request: Option<Request>,
    peer: Option<SocketAddr>,
}

/// One pre-allocated connection slot. `id` is stable for the process
/// lifetime; `socket`/`state` cycle as clients connect and disconnect,
/// mirroring the source's reuse of a single `Connection` object across
/// client lifetimes via `TransmitFile(..., TF_REUSE_SOCKET)`.
pub struct ConnectionRecord {
    pub id: usize,
    inner: Mutex<Inner>,
    request_max_bytes: usize,
}

impl ConnectionRecord {
    pub fn new(id: usize, request_max_bytes: usize) -> Self {
        ConnectionRecord {
            id,
            inner: Mutex::new(Inner {
                socket: None,
                state: ConnState::WaitAccept,
                read_buf: Vec::new(),
                write_buf: Vec::new(),
                write_offset: 0,
                request: None,
                peer: None,
            }),
            request_max_bytes,
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        use std::os::fd::AsRawFd;
        self.inner.lock().unwrap().socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Installs a freshly accepted socket and moves the record into
    /// `WaitReadRequest` — the Linux analogue of `CompleteAccept` followed
    /// immediately by `IssueReadRequest`, since `accept(2)` completes the
    /// handshake synchronously rather than needing a second completion.
    pub fn complete_accept(&self, socket: Socket, peer: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.socket = Some(socket);
        inner.peer = Some(peer);
        inner.state = ConnState::WaitReadRequest;
        inner.read_buf.clear();
        inner.write_buf.clear();
        inner.write_offset = 0;
        inner.request = None;
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().peer
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().unwrap().state
    }

    /// Drains readable bytes and tries to resolve a full request, matching
    /// `CompleteReadRequest`'s "append then parseHeader" loop. A `Request` is
    /// returned once resolved (`Invalid` included); `None` means keep reading.
    pub fn read_request(&self) -> Result<Option<Request>> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, ConnState::WaitReadRequest);

        let mut chunk = [0u8; 1024];
        loop {
            let socket = inner.socket.as_ref().ok_or(NirError::Transport(io::Error::from(
                io::ErrorKind::NotConnected,
            )))?;
            match (&*socket).read(&mut chunk) {
                Ok(0) => {
                    return Err(NirError::Transport(io::Error::from(io::ErrorKind::UnexpectedEof)));
                }
                Ok(n) => inner.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(NirError::Transport(e)),
            }
        }

        match protocol::try_parse(&inner.read_buf, self.request_max_bytes) {
            ParseOutcome::Need => Ok(None),
            ParseOutcome::Ready(request) => {
                inner.request = Some(request);
                Ok(Some(request))
            }
        }
    }

    /// Loads the response bytes for the resolved request and moves the
    /// record into `WaitSendData`, mirroring `IssueSendData`/`BuildResponseMsg`.
    pub fn begin_send(&self, response: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_buf = response;
        inner.write_offset = 0;
        inner.state = ConnState::WaitSendData;
    }

    /// Writes as much of the pending response as the socket accepts.
    /// Returns `true` once the whole buffer has been flushed.
    pub fn drive_send(&self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, ConnState::WaitSendData);

        loop {
            if inner.write_offset >= inner.write_buf.len() {
                return Ok(true);
            }
            let (offset, socket_result) = {
                let offset = inner.write_offset;
                let buf = &inner.write_buf[offset..];
                let socket = inner
                    .socket
                    .as_ref()
                    .ok_or(NirError::Transport(io::Error::from(io::ErrorKind::NotConnected)))?;
                (offset, (&*socket).write(buf))
            };
            match socket_result {
                Ok(0) => return Err(NirError::Transport(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => inner.write_offset = offset + n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(NirError::Transport(e)),
            }
        }
    }

    /// Is this record mid-`STREAM` (response flushed, command still
    /// `Request::Stream`)? If so the reactor re-arms a send of the latest
    /// frame instead of resetting, matching `CompleteSendData`'s check
    /// against `command == COMM_STREAM`.
    pub fn is_streaming(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        matches!(inner.request, Some(Request::Stream))
    }

    pub fn rearm_stream(&self, frame: Vec<u8>) {
        self.begin_send(frame);
    }

    /// `IssueReset`/`CompleteReset` collapsed into one step: Linux has no
    /// `TransmitFile(TF_REUSE_SOCKET)` equivalent, so the socket itself is
    /// closed and only the connection *record* (this struct, at `self.id`)
    /// returns to the free-list for a future `accept`.
    pub fn reset(&self) -> NextOp {
        let mut inner = self.inner.lock().unwrap();
        inner.socket = None;
        inner.state = ConnState::WaitReset;
        inner.read_buf.clear();
        inner.write_buf.clear();
        inner.write_offset = 0;
        inner.request = None;
        inner.peer = None;
        NextOp::Released
    }

    pub fn mark_idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ConnState::WaitAccept;
    }
}

/// Formats the response for a resolved request against the given catalog and
/// the caller-supplied latest frame (only consulted for `Request::Stream`).
pub fn build_response(
    request: Request,
    catalog: &Arc<dyn StaticImageProvider>,
    latest_frame: impl FnOnce() -> Vec<u8>,
) -> Vec<u8> {
    match request {
        Request::Stream => latest_frame(),
        Request::GetXrayTotal => protocol::encode_catalog_count(catalog.total()),
        Request::GetXray { index } => match catalog.read(index) {
            Ok(data) => protocol::encode_catalog_item(&data),
            Err(_) => protocol::encode_not_found(),
        },
        Request::Invalid => protocol::encode_invalid(),
    }
}

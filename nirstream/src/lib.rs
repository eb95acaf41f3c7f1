//! `nirstream`: a completion-driven TCP server that streams the newest
//! camera frame to any connected client while also serving a static,
//! numbered image catalog.
//!
//! The public surface is intentionally small: build a [`ServerConfig`],
//! implement or reuse [`StaticImageProvider`] for the catalog, call
//! [`Server::run`], then [`Server::publish`] each new frame as it arrives.

mod config;
mod connection;
mod error;
mod protocol;
mod queue;
mod reactor;
mod server;
mod xray;

pub use config::ServerConfig;
pub use error::{NirError, Result};
pub use protocol::Request;
pub use queue::LatestQueue;
pub use server::Server;
pub use xray::{DirectoryImageProvider, StaticImageProvider};

//! Core types for the procmesh cluster runtime.
//!
//! This crate holds the pieces of procmesh that do no I/O:
//!
//! - [`WorkerId`] / [`Rrid`]: process and remote-reference addressing
//! - [`PayloadCodec`]: pluggable user-payload serialization with a default
//!   [`JsonCodec`]
//! - [`WorkerConfig`], [`LaunchOptions`], [`Topology`], [`Cookie`]:
//!   cluster configuration
//!
//! The runtime itself (framing, dispatch, registries, supervision) lives in
//! `procmesh-cluster`, which re-exports everything here.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Worker and remote-reference identifiers.
pub mod id;

/// Pluggable payload serialization.
pub mod codec;

/// Cluster configuration: worker configs, topology, launch options, cookie.
pub mod config;

pub use codec::{CodecError, JsonCodec, PayloadCodec};
pub use config::{Cookie, LaunchOptions, Topology, WorkerConfig, COOKIE_LEN};
pub use id::{Rrid, WorkerId, CONTROLLER_ID, RRID_WIRE_LEN};

//! drpc Server
//!
//! This crate provides the service registry and the connection serving loop.
//!
//! A [`Server`] holds named [`Service`]s. Each connection starts with a
//! handshake that picks the codec and the per-request handle timeout; after
//! that every request frame is resolved to a [`MethodDescriptor`], decoded,
//! and handled in its own task. Responses are written under a per-connection
//! lock so frames never interleave.

pub mod server;
pub mod service;

pub use server::Server;
pub use service::{is_exported, MethodDescriptor, Service, ServiceBuilder};

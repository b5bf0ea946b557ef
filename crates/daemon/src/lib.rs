//! wgctl Daemon
//!
//! Keeps a WireGuard hub interface, its kernel routes and the resolver in
//! step with the peer store, and serves the control API.

pub mod alerts;
pub mod api;
pub mod auth;
pub(crate) mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod dns;
pub mod liveness;
pub mod permission;
pub mod pushbus;
pub mod reconciler;
pub mod routes;

#[cfg(test)]
pub(crate) mod testing;

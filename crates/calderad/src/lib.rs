//! Caldera Daemon - relay hub and fail-safe engine
//!
//! This crate provides the infrastructure of the relay daemon:
//! - `hub` - Actor owning connection state; routes frames and runs fail-safe handling
//! - `registry` - Live connections of actuators, sensors and observers
//! - `store` - Global state and the per-channel state cache
//! - `broadcast` - Snapshot and event fan-out to observers
//! - `server` - WebSocket server for client connections
//! - `monitor` - Periodic liveness probing
//! - `diagnostics` - Periodic status and resource logging
//! - `config` - Daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       calderad                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  RelayServer    │────▶│          HubActor           │    │
//! │  │  (WebSocket)    │     │  registry + state store     │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │                             │                   │
//! │           │ connections                 │ snapshots/events  │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ConnectionHandler│     │   ConnectionHandle queues   │    │
//! │  │  (per client)   │     │   (one writer per socket)   │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Production code in this crate does not use `.unwrap()`, `.expect()`
//! or `panic!()`. Channel operations handle closure gracefully.

pub mod broadcast;
pub mod config;
pub mod diagnostics;
pub mod hub;
pub mod monitor;
pub mod peer;
pub mod registry;
pub mod server;
pub mod store;

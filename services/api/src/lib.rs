//! VoiceRAG API Library Crate
//!
//! This library contains the HTTP side of the VoiceRAG service: configuration,
//! the shared application state, the `/realtime` handler, and routing for the
//! static front-end. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;

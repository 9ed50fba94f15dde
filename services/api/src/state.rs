//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the realtime middle
//! tier and the loaded configuration.

use crate::config::Config;
use std::sync::Arc;
use voicerag_core::realtime::QueryProcessor;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<dyn QueryProcessor>,
    pub config: Arc<Config>,
}

//! cartback HTTP API.
//!
//! Exposes the lead capture form endpoint, the payment provider's purchase
//! webhook and health probes. Everything past request parsing is delegated
//! to [`LifecycleEngine`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use cartback_core::Clock;
use cartback_recovery::LifecycleEngine;

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle engine owning the lead store and collaborators.
    pub engine: Arc<LifecycleEngine>,
    /// Clock used for probe timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Builds state around an engine, reusing the engine's clock.
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        let clock = engine.clock();
        Self { engine, clock }
    }
}

//! Upstream dispatch engine core: retry loop, smart-retry decider,
//! sticky-session cache, URL availability tracker, token provider, upstream
//! HTTP port, and the forward orchestrator that wires them together.
//!
//! Grounded on `gproxy-core`'s crate layout (`proxy_engine`, `classify`,
//! `auth`, `upstream_client`), reshaped around this engine's single
//! Antigravity provider family.

pub mod error;
pub mod journal;
pub mod orchestrator;
pub mod rate_limit;
pub mod retry_loop;
pub mod sticky_session;
pub mod token_provider;
pub mod upstream_client;
pub mod url_tracker;

pub use error::CoreError;
pub use orchestrator::{
    ForwardError, ForwardOrchestrator, ForwardRequest, OrchestratorConfig, StreamChunk, StreamResult, Surface,
};

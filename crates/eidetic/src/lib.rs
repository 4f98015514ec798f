//! Eidetic - weight-based memory engine
//!
//! Memories are never deleted. Each record carries a retrievability weight in
//! [0, 1] that rises on access, decays with time and is periodically
//! consolidated toward its composite importance. Recall fuses vector
//! similarity, text fallback and relationship-graph expansion, degrading
//! gracefully when optional backends are unavailable.

pub mod api;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod memory;
pub mod router;
pub mod storage;
pub mod testing;

pub use engine::Engine;
pub use error::{EideticError, Result};

//! `flowforge-core` — orchestrator foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, the engine error taxonomy, and the resolved
//! principal passed to every external collaborator.

pub mod error;
pub mod id;
pub mod principal;

pub use error::{EngineError, EngineResult};
pub use id::{ItemId, JobId, OrgId, UserId};
pub use principal::Principal;

//! HTTP API for the orchestrator: trigger ingress, job inspection and
//! control, approval callbacks, and inbox views.

pub mod app;

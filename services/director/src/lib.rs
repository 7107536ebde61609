//! # quay-director
//!
//! Scheduler for dynamic services on Docker Swarm.
//!
//! Each dynamic service is a sidecar + proxy pair of Swarm services; the
//! sidecar exposes an HTTP control API for container lifecycle, state
//! save/restore and port I/O. The director tracks desired vs. observed
//! state per service, reconciles on a periodic sweep, persists tracked
//! state in a Docker service label for crash recovery, and exposes a REST
//! surface with a long-running-task registry for the slow operations.
//!
//! Module map:
//!
//! - [`config`]: environment-driven settings and timeout tiers
//! - [`docker`]: Docker Engine seam, state mapping, high-level operations
//! - [`sidecar`]: typed client for the sidecar REST API
//! - [`scheduler`]: tracked-service store, observation cycle, sweep loop
//! - [`tasks`]: background task registry for slow operations
//! - [`api`]: axum REST boundary

pub mod api;
pub mod config;
pub mod docker;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod sidecar;
pub mod tasks;

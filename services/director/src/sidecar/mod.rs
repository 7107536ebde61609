//! HTTP client for the per-service sidecar API.

pub mod client;

pub use client::SidecarClient;

//! The scheduler: tracked-service store, per-service observation cycle,
//! and the orchestrating sweep loop.

pub mod core;
pub mod observer;
pub mod store;

pub use core::{AddServiceRequest, DynamicScheduler, Scheduler};
pub use observer::{ObservationOutcome, ProgressCallback};
pub use store::ServiceStore;

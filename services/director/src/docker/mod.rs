//! Docker control adapter.
//!
//! Split in three layers:
//!
//! - **`engine`**: the raw Docker Engine API seam (`DockerEngine` trait),
//!   its HTTP implementation, and a scriptable mock for tests.
//! - **`states`**: mapping of Swarm task states to [`ServiceState`].
//! - **`api`**: the operations the scheduler actually calls, built on the
//!   trait with idempotency and bounded retries baked in.
//!
//! [`ServiceState`]: crate::models::ServiceState

pub mod api;
pub mod engine;
pub mod states;

pub use engine::{
    DockerEngine, HttpDockerEngine, MockEngine, NetworkInspect, NetworkSpec, ServiceInspect,
    ServiceSpec, TaskInspect, TaskStatus,
};

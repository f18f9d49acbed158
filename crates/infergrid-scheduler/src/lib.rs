//! infergrid-scheduler: admission control, node selection and routing.
//!
//! The request path never waits on I/O while holding a lock: admission
//! reads one map entry, selection ranks a registry snapshot.
//!
//! # Architecture
//!
//! ```text
//! Router
//!   ├── CapacityAllocator (tenant → reserved tokens/s, Mutex<HashMap>)
//!   ├── Scheduler
//!   │     ├── NodeRegistry snapshot (Healthy, model, region)
//!   │     └── LoadTracker (per-node in-flight atomics)
//!   ├── Fallback (degraded response on NoHealthyNodes)
//!   └── StateStore (hourly usage buckets)
//! ```

pub mod allocator;
pub mod error;
pub mod load_balancer;
pub mod router;
pub mod scheduler;

pub use allocator::CapacityAllocator;
pub use error::{SchedulerError, SchedulerResult};
pub use load_balancer::{LoadGuard, LoadTracker};
pub use router::{AdmissionDenial, DegradedFallback, Fallback, RouteOutcome, RouteResponse, Router, cost_micros};
pub use scheduler::{Scheduler, select_from};

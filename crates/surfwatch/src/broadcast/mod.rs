//! Broadcasting of job events for dashboards and other observers.

pub mod job_events;
pub mod job_store;

pub use job_events::{JobEvent, JobEventBroadcaster};
pub use job_store::{JobListResponse, JobQueryParams, JobStore};

//! Queue consumers.
//!
//! The [`JobQueue`](crate::traits::JobQueue) trait is the transport; this
//! module runs handlers against it with bounded concurrency.

pub mod worker;

pub use worker::{JobFailure, JobHandler, WorkerPool};

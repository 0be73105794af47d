//! Job lease coordination and fleet lifecycle management for batch
//! aggregation workers.
//!
//! Workers claim jobs through [`job_client::JobClient`], which cross-checks
//! every queue message against the durable [`job::JobMetadata`] record and
//! moves it through `RECEIVED -> IN_PROGRESS -> FINISHED` with
//! compare-and-swap writes. The [`fleet`] module keeps a managed instance
//! group consistent with the per-instance [`asg_instance::AsgInstance`]
//! records while instances drain.

extern crate self as aggwork;

pub mod asg_instance;
pub mod clock;
pub mod cloud;
pub mod factory;
pub mod fleet;
pub mod job;
pub mod job_client;
pub mod keys;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod settings;
pub mod storage;
pub mod store;
pub mod trace;
pub mod worker;

pub use aggwork_macros::test;

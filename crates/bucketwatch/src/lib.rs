#![warn(missing_docs)]

//! Bucketwatch: routes object-created events of a bucket to client listeners
//! through a consolidated set of notification topics.

pub mod api;
pub mod bucket_config;
pub mod config;
pub mod consolidate;
pub mod coverage;
pub mod engine;
pub mod entity;
pub mod error;
pub mod grouping;
pub mod kvstore;
pub mod lock;
pub mod protocol;
pub mod saga;
pub mod split;
pub mod store;
pub mod telemetry;
pub mod topic;
pub mod types;

pub use engine::NotificationEngine;
pub use error::{EngineError, Result};
pub use split::RemovalOutcome;

//! # rams-coordinator
//!
//! Submission and live tracking of AI-generated risk assessment and method
//! statement (RAMS) documents.
//!
//! A generation job is a row in a hosted database. The coordinator creates
//! the row, subscribes to its updates, triggers the remote generator, and
//! folds every pushed update into a local [`JobSnapshot`] until the job
//! completes or fails.
//!
//! ## Features
//!
//! - Subscribe-before-trigger, so a fast worker can't finish unobserved
//! - Stale and late updates rejected by job id and phase
//! - Terminal states latch; side effects fire exactly once
//! - Best-effort flagging of a linked job pack after success
//! - Snapshot stream (`tokio::sync::watch`) and notifications (`broadcast`)
//! - In-memory backend for tests, REST + realtime backend for production
//!
//! ## Quick Start
//!
//! 1. Pick a [`Backend`]: [`MemoryBackend`] or [`RemoteBackend`]
//! 2. Create a [`RamsCoordinator`] with a [`CoordinatorConfig`]
//! 3. Call [`RamsCoordinator::submit()`] with a [`SubmitRequest`]
//! 4. Watch [`RamsCoordinator::subscribe()`] until the phase is terminal
//!
//! See the `demos/` directory for complete usage examples.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod memory;
pub mod remote;
pub mod types;

pub use backend::{Backend, RowEvent, Subscription, SubscriptionHandle};
pub use config::{CoordinatorConfig, CoordinatorConfigBuilder, RemoteConfig};
pub use coordinator::RamsCoordinator;
pub use error::{BackendError, CoordinatorError, Result};
pub use events::Notification;
pub use memory::MemoryBackend;
pub use remote::RemoteBackend;
pub use types::{
    GenerationJob, JobScale, JobSnapshot, JobStatus, Phase, PpeItem, ProjectInfo, RamsResult,
    RiskItem, RiskLevel, SubmitRequest,
};

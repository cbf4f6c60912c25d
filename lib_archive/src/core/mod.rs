//! # Core Engine Module
//!
//! The archive engine itself, independent of any concrete database, broker or
//! host process.
//!
//! ## Core Components:
//!
//! - **`engine_model`**: the orchestrator. Owns the registries, the lifecycle
//!   state machine and the write scheduler, and exposes the operator surface
//!   (`read_config`, `start`, `stop`, `request_stop`, ...).
//!
//! - **`group`** / **`channel`**: the configured cohorts and the per-variable
//!   subscriptions with their bounded sample buffers.
//!
//! - **`write_scheduler`**: the single recurring task that drains channel
//!   buffers round-robin and persists them in capped batches.
//!
//! - **`services`**: the collaborator contracts (configuration store, sample
//!   sink, audit sink, value source) the engine is built with.

#![forbid(unsafe_code)]

/// Per-channel subscription, filtering and buffering.
pub mod channel;
/// The engine orchestrator and its operator surface.
pub mod engine_model;
/// Error types of the engine and its collaborators.
pub mod error;
/// Named cohorts of channels.
pub mod group;
/// Name-indexed, registration-ordered object registry.
pub mod registry;
/// Sample value types.
pub mod sample;
/// Bounded FIFO between ingestion and drain.
pub mod sample_buffer;
/// Monitor, delta and scan filtering.
pub mod sample_mode;
/// Collaborator contracts and descriptors.
pub mod services;
/// Engine tunables.
pub mod settings;
/// Lifecycle states and the transition guard.
pub mod state;
/// Periodic batched persistence.
pub mod write_scheduler;

// --- Public API Re-exports ---
pub use channel::{ArchiveChannel, ChannelCounters, ChannelDiagnostics, IngestOutcome};
pub use engine_model::{EngineModel, EngineServices, EngineStatus};
pub use error::{
    AuditError, ChannelError, ConfigError, ConfigErrorKind, EngineError, SinkError, SourceError,
    StoreError,
};
pub use group::{ArchiveGroup, GroupRunReport};
pub use registry::{Named, Registry};
pub use sample::{ArchiveSample, Sample, SampleValue};
pub use sample_buffer::SampleBuffer;
pub use sample_mode::SampleMode;
pub use services::{
    AuditSink, ChannelConfigStore, ChannelDescriptor, EngineDescriptor, Enablement,
    GroupDescriptor, MgmtEventKind, SampleListener, SampleSink, ValueSource,
};
pub use settings::EngineSettings;
pub use state::{EngineState, StateCell, Transition};
pub use write_scheduler::{CycleReport, WriteScheduler, WriteStats};

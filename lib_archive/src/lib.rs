//! # lib_archive
//!
//! Building blocks of the archive engine: the engine core, the collaborator
//! implementations it is usually deployed with, and the logging setup of the
//! engine binaries.

pub mod connections;
pub mod core;
#[cfg(feature = "loggers")]
pub mod loggers;

pub use crate::core::{EngineError, EngineModel, EngineServices, EngineSettings, EngineState};

//! ---
//! mpipe_section: "01-core-functionality"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Shared primitives and utilities for the pipeline runtime."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
//! Core shared primitives for the M-PIPE workspace.
//! This crate exposes configuration loading, logging initialisation, and
//! time helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{AppConfig, LoadedAppConfig, LoggingConfig, ProcessorConfig};
pub use logging::{init_tracing, LogFormat};

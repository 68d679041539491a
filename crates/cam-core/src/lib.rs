//! Core orchestration engine: the Task Lifecycle, Dispatcher, Pipeline
//! Expander, Worker Registry, Event Bus, Recovery Loop, and External
//! Adapters described in SPEC_FULL.md.
//!
//! This crate owns no HTTP surface and spawns no agent processes; `cam-cli`
//! is the only caller.

pub mod adapters;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod pipeline;
pub mod recovery;
pub mod worker;

pub use error::{CamError, Result};
pub use events::EventBus;

//! Tier orchestration
//!
//! [`Engine`] sequences the repositories for each operation. Background
//! writes run on the [`TaskPool`] and their failures land in the
//! [`TraceLog`].

mod engine;
mod pool;
mod trace;

pub use engine::{Background, Engine, EngineBuilder};
pub use pool::TaskPool;
pub use trace::{TraceLog, TraceRecord};

#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod cancellation;
pub mod constants;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod ingress;
pub mod kernel;
pub mod logging;
pub mod main_helper;
pub mod narration;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod session;
pub mod store;
pub mod str_utils;
pub mod transport;
pub mod types;

pub use types::*;

pub use engine::{DelveEngine, EngineConfig, EngineEvent, EngineHandle};
pub use main_helper::Args;

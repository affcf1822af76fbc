#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod archive;
pub mod backend;
pub mod citations;
pub mod config;
pub mod consumer;
pub mod db;
pub mod hardening;
pub mod health;
pub mod layout;
pub mod logging;
pub mod redaction;
pub mod relay;
pub mod routes;
pub mod session;
pub mod specs;
pub mod sse;
pub mod store;
pub mod str_utils;
pub mod trace_layer;
pub mod tree;
pub mod types;
pub mod vendors;

pub use types::*;

pub use config::{AppState, Args};

//! Core domain + application logic for teledigest.
//!
//! Framework-agnostic: Telegram and the LLM backend live behind ports (traits)
//! implemented in adapter crates.

pub mod commands;
pub mod config;
pub mod cron;
pub mod digest;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod llm;
pub mod logging;
pub mod messaging;
pub mod scheduler;
pub mod security;
pub mod storage;

pub use errors::{Error, Result};

//! # docflow
//!
//! CLI and HTTP boundary of the docflow document engine. The binary in
//! `main.rs` is a thin wrapper; everything testable lives here.

pub mod api;
pub mod cli;
pub mod config;

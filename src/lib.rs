//! Library crate for portwatch-rs exposing reusable modules.
pub mod config;
pub mod error;
pub mod inspector;
pub mod osprobe;
pub mod ports;
pub mod prober;
pub mod resolver;
pub mod scanner;
pub mod server;
pub mod types;

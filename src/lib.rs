//! Flag Rush server library
//!
//! Authoritative simulation for team vehicle capture-the-flag, plus the
//! client-side snapshot reconciler that consumes its output.

pub mod app;
pub mod client;
pub mod config;
pub mod game;
pub mod http;
pub mod util;
pub mod ws;

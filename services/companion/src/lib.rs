//! Companion Service Library Crate
//!
//! Wires the session core to the real backend and to terminal-backed speech,
//! behavior and mood capabilities. The `companion` binary is a thin wrapper
//! around this library.

pub mod backend;
pub mod config;
pub mod console;
pub mod state;

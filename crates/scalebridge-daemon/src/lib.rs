//! # scalebridge-daemon
//!
//! Command-line front end for scalebridge.
//!
//! This library holds the pieces the `scalebridge` binary wires together:
//! backend selection, the command runners, JSON-line event output and
//! logging setup.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod backend;
pub mod commands;
pub mod events;
pub mod logging;

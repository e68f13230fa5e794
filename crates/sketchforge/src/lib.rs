//! SketchForge command-line front end
//!
//! Wires the orchestration library to `arduino-cli`, the GitHub library
//! mirror and an OpenAI-compatible repair endpoint.

pub mod cli;
pub mod commands;
pub mod repair_client;

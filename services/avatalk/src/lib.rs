//! Avatalk Service Library Crate
//!
//! Native adapters for the session coordinator in `avatalk-core`: configuration,
//! the `cpal` microphone, the agent WebSocket, the signed-URL client and the
//! renderer bridge. The `avatalk` binary wires them together.

pub mod config;
pub mod microphone;
pub mod renderer_bridge;
pub mod signed_url;
pub mod socket;

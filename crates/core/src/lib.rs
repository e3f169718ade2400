//! Avatalk Core
//!
//! Runtime-agnostic logic for a live voice conversation with a remote agent whose
//! speech is mirrored into an avatar renderer. Platform audio, sockets, HTTP and
//! the renderer itself sit behind the traits defined here; the `avatalk-service`
//! crate provides the native implementations.

pub mod capture;
pub mod codec;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod renderer;
pub mod signaling;

#[cfg(test)]
mod test_support;

pub use coordinator::{
    Collaborators, Command, CoordinatorConfig, CoordinatorState, SessionCoordinator,
    SessionNotice,
};
pub use error::SessionError;

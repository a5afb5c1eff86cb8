//! Coordinator control-channel session: transport, protocol decoding, and
//! the enable/keep-alive/disable state machine (spec.md §4.5, §4.6).

pub mod controller;
pub mod protocol;
pub mod state_machine;

use thiserror::Error;

pub use controller::SessionController;
pub use protocol::ControlEvent;
pub use state_machine::{EnableStateMachine, SessionState};

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed control message: {0}")]
    Protocol(String),
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}

pub type SessionResult<T> = Result<T, SessionError>;

//! Dual NMDC/ADC wire codec: parsing and encoding only, no I/O and no
//! protocol-state semantics (those live in `tigerhub-fsm`). Both dialects
//! decode into variants of one closed [`message::Message`] enum.
#![warn(missing_docs)]

pub mod adc;
pub mod escape;
pub mod message;
pub mod nmdc;

pub use message::{decode, encode, Dialect, Message};

/// A malformed or unrecognized wire message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtoError {
    /// The frame didn't match the expected grammar for its command.
    #[error("malformed protocol message: {0}")]
    Malformed(String),
}

//! Core library for the Wizard's Toolkit authenticated file-encryption
//! system: a self-describing cipher-packet envelope, a streaming
//! encrypt-then-MAC pipeline, a persistent random reservoir, and an
//! independent digest/authenticate utility.
//!
//! The crate is organised around the nine components the pipelines compose:
//! byte streams ([`stream`]), entropy compression ([`entropy`]), the random
//! reservoir ([`reservoir`]), key authentication ([`auth`]), block-cipher
//! chaining ([`cipher`]), the cipher-packet envelope ([`packet`]), and the
//! three top-level pipelines ([`encipher`], [`decipher`], [`digest`]).

pub mod auth;
pub mod cipher;
pub mod config;
pub mod decipher;
pub mod digest;
pub mod encipher;
pub mod entropy;
pub mod error;
pub mod packet;
pub mod reservoir;
pub mod security;
pub mod stream;
pub mod xml;

pub use auth::AuthenticateInfo;
pub use config::WiztkConfig;
pub use decipher::{decipher, DecipherOptions};
pub use digest::{authenticate as digest_authenticate, generate as digest_generate, DigestAlg};
pub use encipher::{encipher, EncipherOptions};
pub use error::{ExceptionAggregator, Result, ToolkitError, ToolkitWarning};
pub use packet::ContentDescriptor;
pub use reservoir::RandomReservoir;

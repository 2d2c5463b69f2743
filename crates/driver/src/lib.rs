//! Key generation and threshold signing engines for the frostnode
//! validator.
//!
//! The engines are pure protocol logic: they own their session maps,
//! never perform I/O and surface everything the orchestrator must
//! publish as explicit return values.
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod error;
pub mod keygen;
pub mod math;
pub mod nonces;
pub mod signing;

pub use error::{Error, ErrorClass, Result};
pub use keygen::{
    KeyGenEngine, KeyGenOutcome, KeyGenPublication, KeyMaterial,
    SecretSharePublication,
};
pub use nonces::CHUNK_SIZE;
pub use signing::{
    NonceReveal, SignatureSharePublication, SigningEngine,
};

pub use k256;

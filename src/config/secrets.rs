//! Secret handling utilities.
//!
//! Re-exports the secrecy types used by [`super::Config`], so callers can
//! expose the database URL without depending on secrecy directly.

pub use secrecy::{ExposeSecret, SecretString};

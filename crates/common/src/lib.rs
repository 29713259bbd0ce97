//! Common types shared by the credential governance crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;

//! Shared fixtures for relay runtime tests.
//!
//! Nothing here depends on the runtime itself, so both its unit tests and
//! its integration tests can use it.

mod fixtures;
mod nip11;

pub use self::fixtures::{Author, tampered};
pub use self::nip11::{CapturedRequest, Nip11Stub, spawn_nip11_stub};

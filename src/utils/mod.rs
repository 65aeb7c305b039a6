//! The `utils` module provides shared pieces used across the `mmw` crate,
//! such as the error taxonomy and process-wide logging setup.

pub mod error;
pub mod logging;

//! Structural checks run once over a [`crate::types::ProcessGraph`] before
//! it is handed to the scheduler. Grounded on the teacher's
//! `compiler/verifier.rs`, adapted from its petgraph IR to this crate's
//! `ProcessGraph`.

pub mod verifier;

pub use verifier::{verify, VerifyError};

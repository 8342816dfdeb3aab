//! Operator commands run by the binary.

pub mod commands;
pub mod error;

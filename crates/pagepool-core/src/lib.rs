//! Core config and errors for pagepool.

pub mod config;
pub mod error;

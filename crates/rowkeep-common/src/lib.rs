//! Rowkeep Common - Shared types and utilities
//!
//! This crate provides the field value model, error definitions, status
//! codes and configuration used across all Rowkeep components.

pub mod checksum;
pub mod config;
pub mod errcode;
pub mod error;
pub mod types;

pub use config::NodeConfig;
pub use errcode::ErrorCode;
pub use error::{Error, Result};
pub use types::*;

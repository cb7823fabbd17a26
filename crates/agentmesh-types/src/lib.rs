//! Core types for the agentmesh peer-to-peer transport.
//!
//! This crate defines the error taxonomy and configuration shared by the wire
//! crate and the node daemon. It contains no protocol logic.

pub mod config;
pub mod error;

pub use config::MeshConfig;
pub use error::{MeshError, MeshResult};

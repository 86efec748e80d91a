//! Vigil library interface
//!
//! Exposes core modules for use by binaries and tests.

pub mod alerts;
pub mod collector;
pub mod config;
pub mod engine;
pub mod intel;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod response;
pub mod state;
pub mod utils;

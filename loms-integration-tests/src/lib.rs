//! Integration tests for LOMS
//!
//! This crate contains integration tests that drive the core services
//! (`loms`) end to end against the in-memory backend (`loms-memory`).

// This is a test-only crate
#![cfg(test)]

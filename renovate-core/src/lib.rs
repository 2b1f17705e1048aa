//! Renovate Core
//!
//! Core types and pure logic for the Renovate operator.
//!
//! This crate contains:
//! - Domain types: renovate jobs (tenants), project status records, workloads
//! - The project status state machine
//! - Parsers for run logs and discovery output
//!
//! Nothing in here performs I/O; the operator crate wires these pieces to
//! the remote store.

pub mod domain;
pub mod naming;
pub mod parser;
pub mod status;

//! The client connection orchestrator for the SSH protocol: banner
//! exchange, host-key verification against a persisted trust store,
//! authentication, and the steady-state multiplexing of session I/O,
//! port forwardings, and control messages over a single connection.
//!
//! See `DESIGN.md` for the grounding ledger (which module is built on
//! which teacher/example source) and `SPEC_FULL.md` for the full set of
//! requirements this crate implements.

pub mod auth;
pub mod banner;
pub mod channel;
pub mod cli;
pub mod dial;
pub mod error;
pub mod handler;
pub mod hostkey_verify;
pub mod identity;
pub mod logging;
pub mod options;
pub mod privilege;
pub mod sensitive;
pub mod session;
pub mod trust_store;

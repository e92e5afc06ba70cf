//! A protocol-aware proxy for the CQL native protocol (v3/v4).
//!
//! The proxy intercepts cluster-topology discovery (`system.local`,
//! `system.peers`) and session keyspace selection (`USE <ks>`), answering
//! them itself so clients see a single-node cluster, while every other
//! request is forwarded to the backend cluster as a raw frame.

pub mod backend;
pub mod constant;
pub mod error;
pub mod lex;
pub mod opts;
pub mod parse;
pub mod prepared;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod synth;

pub use error::{Error, Result};
pub use opts::Opts;

//! kv-broker - Local Key Vault message broker core
//!
//! This crate provides the connection core of a small loopback HTTP/1.1
//! broker: incremental message assembly over raw byte streams, a
//! per-connection read/write driver, and a parser for RFC 7235-style
//! authentication challenge headers.

pub mod auth;
pub mod http;

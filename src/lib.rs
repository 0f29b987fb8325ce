//! ktls-bench library
//!
//! Encrypted bulk-transfer benchmark: TLS sessions over blocking TCP, optional
//! kernel TLS transmit offload, four interchangeable send strategies and a
//! digest check of every received copy.

pub mod channel;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod harness;
pub mod ktls;
pub mod net;
pub mod strategy;
pub mod tls;

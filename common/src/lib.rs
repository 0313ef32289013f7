//! Shared building blocks for the stager tools
//!
//! This crate holds the pieces every stager role needs: the durable
//! handshake record codecs (control / receipt / thank-you), the streaming
//! MD5 checksum used by both ends of a transfer, filesystem helpers for
//! directory scanning and disk accounting, and the typed per-stream
//! configuration with its re-read support.

pub mod checksum;
pub mod config;
pub mod fsutil;
pub mod records;
pub mod status;

//! Unattended batch file staging daemon
//!
//! `stagerd` moves transfer units (files or zipped directories) from local
//! stream directories to remote sites over pluggable transport commands,
//! with a durable three-record handshake (control / receipt / thank-you)
//! providing delivery confirmation and integrity verification. Every role
//! runs as an independent long-lived task coordinating with the others only
//! through the filesystem:
//!
//! - [`controller`] scans one stream directory and feeds stable units to
//!   the transfer engine
//! - [`engine`] drives one unit through the handshake state machine
//! - [`arrival`] validates inbound units on the receiving side and emits
//!   receipts
//! - [`governor`] watches each filesystem's free space and throttles or
//!   evicts work under pressure
//! - [`supervisor`] owns worker lifecycle and rescans for new streams

pub mod arrival;
pub mod controller;
pub mod engine;
pub mod governor;
pub mod supervisor;
pub mod unit;

/// Sleep that observes cancellation; returns whether we were cancelled.
///
/// Checked immediately before and after the sleep so a stop request never
/// waits out a full poll interval.
pub async fn sleep_cancellable(
    cancel: &tokio_util::sync::CancellationToken,
    period: std::time::Duration,
) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(period) => cancel.is_cancelled(),
    }
}

//! Run termination
//!
//! Signal listeners are installed before anything is loaded, so a SIGINT or
//! SIGTERM that arrives while the program is still being verified is queued
//! instead of killing the process, and the run still ends with a report.

use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use log::info;
use tokio::{
    signal::unix::{signal, Signal, SignalKind},
    time::sleep,
};

/// Why collection stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Interrupted,
    Terminated,
}

/// SIGINT and SIGTERM listeners
pub struct StopSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl StopSignals {
    /// Replace the default handlers. Signals received from here on are kept
    /// until [`StopSignals::recv`] observes them.
    pub fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?,
        })
    }

    /// Wait for the next stop signal
    pub async fn recv(&mut self) -> StopReason {
        tokio::select! {
            _ = self.interrupt.recv() => StopReason::Interrupted,
            _ = self.terminate.recv() => StopReason::Terminated,
        }
    }

    /// A stop signal already delivered, without waiting
    pub async fn pending(&mut self) -> Option<StopReason> {
        // Lets the driver read deliveries made while this task was busy
        tokio::task::yield_now().await;
        tokio::select! {
            biased;
            reason = self.recv() => Some(reason),
            _ = std::future::ready(()) => None,
        }
    }
}

/// Resolve on `signals`, or once `duration` has elapsed
pub async fn wait_for_stop<F>(signals: F, duration: Option<Duration>) -> StopReason
where
    F: Future<Output = StopReason>,
{
    let timer = async {
        match duration {
            Some(d) => sleep(d).await,
            None => std::future::pending().await,
        }
    };

    let reason = tokio::select! {
        _ = timer => StopReason::DurationElapsed,
        reason = signals => reason,
    };

    match reason {
        StopReason::DurationElapsed => info!("Duration reached, shutting down..."),
        StopReason::Interrupted => info!("Interrupted, shutting down..."),
        StopReason::Terminated => info!("Terminated, shutting down..."),
    }
    reason
}

//! Wallet balance monitor.
//!
//! Balance polling itself is a host concern — an RPC call against the chain
//! the wallet lives on. The core consumes it as a single boolean: when the
//! wallet is empty the router substitutes the free-tier model. The monitor
//! task polls an injected probe on a fixed cadence and publishes the flag;
//! a probe returning `None` (poll failed) leaves the previous value alone.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

/// Shared wallet-empty flag, read by the router on every request.
#[derive(Clone, Default)]
pub struct WalletEmptyFlag(Arc<AtomicBool>);

impl WalletEmptyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, empty: bool) {
        self.0.store(empty, Ordering::Relaxed);
    }
}

/// Spawn the polling task. Owned by the proxy; stops when `cancel` fires.
pub fn spawn_monitor<P, Fut>(
    flag: WalletEmptyFlag,
    interval: Duration,
    cancel: CancellationToken,
    probe: P,
) -> tokio::task::JoinHandle<()>
where
    P: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Option<bool>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match probe().await {
                Some(empty) => {
                    if empty != flag.is_empty() {
                        tracing::info!(empty, "wallet balance state changed");
                    }
                    flag.set(empty);
                }
                None => {
                    tracing::debug!("balance poll failed — keeping previous state");
                }
            }
        }
    })
}

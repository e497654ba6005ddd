use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::settings::FlushSettings;

/// Requests a flush outside the regular schedule.
#[derive(Clone, Default)]
pub struct FlushTrigger {
    notify: Arc<Notify>,
}

impl FlushTrigger {
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    /// Resolves once the trigger has been fired.
    #[cfg(test)]
    pub(crate) async fn fired(&self) {
        self.notify.notified().await;
    }
}

/// Runs flushes once shortly after startup, on a fixed interval, and on
/// demand. Each run is spawned so a slow upload never delays the schedule;
/// the flush itself drops runs that overlap.
#[derive(Default)]
pub struct FlushScheduler {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    trigger: FlushTrigger,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) -> FlushTrigger {
        self.trigger.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start<F, Fut>(&mut self, settings: &FlushSettings, flush: F) -> Result<FlushTrigger>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.handle.is_some() {
            bail!("flush scheduler already running");
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(schedule_loop(
            settings.clone(),
            self.trigger.clone(),
            cancel_token.clone(),
            flush,
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(self.trigger.clone())
    }

    /// Cancels the schedule and any flush still running, then waits for the
    /// loop to exit.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle.await.context("flush scheduler task failed to join")
        } else {
            Ok(())
        }
    }
}

async fn schedule_loop<F, Fut>(
    settings: FlushSettings,
    trigger: FlushTrigger,
    cancel_token: CancellationToken,
    flush: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let startup = time::sleep(settings.startup_delay());
    tokio::pin!(startup);
    let mut startup_pending = true;

    let interval = settings.interval();
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut flights = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut startup, if startup_pending => {
                startup_pending = false;
                flights.spawn(flush());
            }
            _ = ticker.tick() => {
                flights.spawn(flush());
            }
            _ = trigger.notify.notified() => {
                flights.spawn(flush());
            }
            Some(_) = flights.join_next(), if !flights.is_empty() => {}
            _ = cancel_token.cancelled() => {
                info!("flush scheduler shutting down");
                break;
            }
        }
    }

    flights.shutdown().await;
}

//! Named periodic tasks. Each cycle runs to completion before the next tick
//! (missed ticks are delayed, never burst); an error or panic in one cycle
//! is logged and the next cycle still runs.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Default)]
pub struct Cadences {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Cadences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, body: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(cadence = name, period_ms = period.as_millis() as u64, "cadence started");

            loop {
                ticker.tick().await;
                // run the body as its own task so a panic stays contained
                match tokio::spawn(body()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(cadence = name, "cycle failed: {e:#}"),
                    Err(e) if e.is_panic() => error!(cadence = name, "cycle panicked"),
                    Err(_) => break,
                }
            }
        });
        self.tasks.push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    pub fn shutdown(&mut self) {
        for (name, handle) in self.tasks.drain(..) {
            handle.abort();
            info!(cadence = name, "cadence stopped");
        }
    }
}

impl Drop for Cadences {
    fn drop(&mut self) {
        for (_, handle) in &self.tasks {
            handle.abort();
        }
    }
}

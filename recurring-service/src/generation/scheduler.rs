//! Periodic trigger for generation runs.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::generation::controller::RecurringEngine;

/// Invokes [`RecurringEngine::run_generation`] on a fixed interval until cancelled.
///
/// A run already in progress is allowed to finish before the loop exits.
pub struct GenerationScheduler {
    engine: RecurringEngine,
    interval: Duration,
    run_on_startup: bool,
    shutdown_token: CancellationToken,
}

impl GenerationScheduler {
    pub fn new(engine: RecurringEngine, interval: Duration, run_on_startup: bool) -> Self {
        Self {
            engine,
            interval,
            run_on_startup,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick completes immediately
        if !self.run_on_startup {
            ticker.tick().await;
        }

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            run_on_startup = self.run_on_startup,
            "Generation scheduler started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Generation scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.engine.run_generation().await {
                        Ok(summary) => tracing::info!(
                            generated = summary.generated,
                            skipped = summary.skipped,
                            "Scheduled generation run finished"
                        ),
                        Err(e) => tracing::error!(error = %e, "Scheduled generation run failed"),
                    }
                }
            }
        }
    }
}

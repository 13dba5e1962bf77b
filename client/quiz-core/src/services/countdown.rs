use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::models::timer::{TimeExpired, TimerEvent, TimerTick};

/// Background timer emitting one `timer-tick` per interval and a final
/// `time-expired` once the limit is reached. Untimed countdowns tick forever.
///
/// The task is aborted by [`Countdown::stop`] and when the countdown is dropped.
#[derive(Debug)]
pub struct Countdown {
    handle: Option<JoinHandle<()>>,
    events: mpsc::Receiver<TimerEvent>,
}

impl Countdown {
    pub fn start(
        quiz_id: impl Into<String>,
        limit_seconds: Option<u32>,
        tick_interval: Duration,
    ) -> Self {
        let quiz_id = quiz_id.into();
        let (tx, events) = mpsc::channel(16);
        let total = limit_seconds.unwrap_or(0);

        tracing::info!(
            "Starting countdown: quiz={}, limit={:?}s, tick_interval={:?}",
            quiz_id,
            limit_seconds,
            tick_interval
        );

        let handle = tokio::spawn(async move {
            let mut elapsed = 0u32;
            loop {
                sleep(tick_interval).await;
                elapsed = elapsed.saturating_add(1);

                let tick = TimerEvent::TimerTick(TimerTick {
                    quiz_id: quiz_id.clone(),
                    remaining_seconds: total.saturating_sub(elapsed),
                    elapsed_seconds: elapsed,
                    total_seconds: total,
                    timestamp: Utc::now(),
                });
                if tx.send(tick).await.is_err() {
                    return;
                }

                if limit_seconds.is_some_and(|limit| elapsed >= limit) {
                    tracing::info!("Timer expired: quiz={}", quiz_id);
                    let expired = TimerEvent::TimeExpired(TimeExpired {
                        quiz_id: quiz_id.clone(),
                        timestamp: Utc::now(),
                    });
                    let _ = tx.send(expired).await;
                    return;
                }
            }
        });

        Self {
            handle: Some(handle),
            events,
        }
    }

    /// Next event, or `None` once stopped or expired and drained.
    pub async fn next_event(&mut self) -> Option<TimerEvent> {
        self.events.recv().await
    }

    /// Already emitted event, if any, without waiting.
    pub fn try_next(&mut self) -> Option<TimerEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels the timer and discards pending events.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!("Countdown stopped");
        }
        self.events.close();
        while self.events.try_recv().is_ok() {}
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

//! Timer management.
//!
//! Each timer is a tokio task that sleeps for the configured duration and
//! then feeds the corresponding event back into the event channel.

use forgeline_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Forge => Event::ForgeTick,
        TimerId::PoolSweep => Event::PoolSweepTimer,
    }
}

/// Manages timers for the runner.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self { timers: HashMap::new(), event_tx }
    }

    /// Set a timer, cancelling any previous one with the same id.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = event_tx.send(timer_event(id)).await;
        });
        self.timers.insert(id, handle);
        trace!(?id, ?duration, "Timer set");
    }

    /// Cancel a timer. A no-op if it does not exist or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            trace!(?id, "Timer cancelled");
        }
    }

    /// Cancel everything. Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            debug!(?id, "Timer cancelled (shutdown)");
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires_the_mapped_event() {
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let mut manager = TimerManager::new(event_tx);
        manager.set_timer(TimerId::Forge, Duration::from_millis(5));

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timer did not fire")
            .expect("channel closed");
        assert!(matches!(event, Event::ForgeTick));
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let mut manager = TimerManager::new(event_tx);
        manager.set_timer(TimerId::PoolSweep, Duration::from_millis(10));
        manager.cancel_timer(TimerId::PoolSweep);

        let result = tokio::time::timeout(Duration::from_millis(50), event_rx.recv()).await;
        assert!(result.is_err(), "cancelled timer fired anyway");
    }

    #[tokio::test]
    async fn setting_twice_keeps_one_timer() {
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let mut manager = TimerManager::new(event_tx);
        manager.set_timer(TimerId::Forge, Duration::from_millis(5));
        manager.set_timer(TimerId::Forge, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let mut fired = 0;
        while event_rx.try_recv().is_ok() {
            fired += 1;
        }
        assert_eq!(fired, 1);
    }
}

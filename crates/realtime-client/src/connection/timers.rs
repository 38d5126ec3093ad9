use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

use super::Input;
use crate::transport::TransportId;

/// Everything the engine can have a one-shot timer running for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    /// Per-attempt timeout for `connecting` and `closing`.
    Transition,
    /// Long-horizon give-up while disconnected.
    Suspend,
    Retry,
    Preference,
    UpgradeSync,
    AutoReconnect,
    Reauth,
    Viability(TransportId),
    Ping(String),
    ChannelState(String),
    ChannelRetry(String),
}

/// At most one live timer per key. Expiries come back to the engine as
/// [`Input::Timer`]; a generation number lets the engine ignore an expiry
/// that raced with a cancel or restart.
pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<Input>,
    live: HashMap<TimerKey, (u64, AbortHandle)>,
    next_generation: u64,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            tx,
            live: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Starts `key`, replacing any timer already running under it.
    pub fn start(&mut self, key: TimerKey, delay: Duration) {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let fired = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Input::Timer {
                key: fired,
                generation,
            });
        })
        .abort_handle();
        trace!(target: "realtime::engine", ?key, delay_ms = delay.as_millis() as u64, "timer started");
        self.live.insert(key, (generation, handle));
    }

    pub fn start_if_idle(&mut self, key: TimerKey, delay: Duration) {
        if !self.is_running(&key) {
            self.start(key, delay);
        }
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.live.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, key: &TimerKey) -> bool {
        self.live.contains_key(key)
    }

    /// Claims an expiry. Returns false for a stale one.
    pub fn fire(&mut self, key: &TimerKey, generation: u64) -> bool {
        match self.live.get(key) {
            Some((live, _)) if *live == generation => {
                self.live.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.live.drain() {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn restart_makes_earlier_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.start(TimerKey::Retry, Duration::from_millis(10));
        let Some((first, _)) = timers.live.get(&TimerKey::Retry).map(|(g, h)| (*g, h.clone())) else {
            panic!("timer not registered");
        };
        timers.start(TimerKey::Retry, Duration::from_millis(20));
        assert!(!timers.fire(&TimerKey::Retry, first));

        match rx.recv().await {
            Some(Input::Timer { key, generation }) => {
                assert_eq!(key, TimerKey::Retry);
                assert!(timers.fire(&key, generation));
                assert!(!timers.is_running(&TimerKey::Retry));
            }
            _ => panic!("expected a timer expiry"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.start(TimerKey::Suspend, Duration::from_millis(5));
        assert!(timers.cancel(&TimerKey::Suspend));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn start_if_idle_keeps_running_timer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(tx);
        timers.start(TimerKey::Suspend, Duration::from_secs(120));
        let before = timers.live.get(&TimerKey::Suspend).map(|(g, _)| *g);
        timers.start_if_idle(TimerKey::Suspend, Duration::from_secs(1));
        let after = timers.live.get(&TimerKey::Suspend).map(|(g, _)| *g);
        assert_eq!(before, after);
    }
}

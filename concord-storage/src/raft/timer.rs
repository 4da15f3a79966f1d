use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::driver::Event;

/// Uniformly random duration in `[min, max]`, millisecond resolution.
pub fn random_timeout(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

/// Randomized election timeout delivered as an event on the node's queue.
///
/// Each `reset` starts a new generation; a timeout from an older generation
/// that was already queued when the timer was reset is recognized with
/// [`ElectionTimer::fire`] and ignored.
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
    generation: u64,
    sleeper: Option<JoinHandle<()>>,
    events: mpsc::Sender<Event>,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration, events: mpsc::Sender<Event>) -> Self {
        Self {
            min,
            max,
            generation: 0,
            sleeper: None,
            events,
        }
    }

    /// Re-arms with a fresh random duration. Must run inside a tokio runtime.
    pub fn reset(&mut self) {
        self.cancel();
        self.generation += 1;

        let generation = self.generation;
        let timeout = random_timeout(self.min, self.max);
        let events = self.events.clone();
        self.sleeper = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(Event::ElectionTimeout { generation }).await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(sleeper) = self.sleeper.take() {
            sleeper.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.sleeper.is_some()
    }

    /// Consumes a delivered timeout. True if it belongs to the armed
    /// generation; the timer is then disarmed.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.sleeper.is_none() || generation != self.generation {
            return false;
        }
        self.sleeper = None;
        true
    }
}

impl Drop for ElectionTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

//! Cancellable, keyed timers stored as absolute expiry timestamps.
//!
//! Starting a timer for a key that already has one replaces it. Each start
//! bumps a generation number and the sleeping task only fires if its entry is
//! still the current generation, so a replaced or cancelled timer can never
//! fire even if its task was already past the sleep.

use crate::utils::get_timestamp;
use dashmap::DashMap;
use log::debug;
use shared::{TournamentId, UserId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    RoomCountdown(String),
    TournamentStart(TournamentId),
    RoundCountdown { tournament: TournamentId, round: u32 },
    Forfeit { tournament: TournamentId, user: UserId },
    /// Releases a finished tournament's partition.
    TournamentLinger(TournamentId),
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKey::RoomCountdown(code) => write!(f, "room:{}:countdown", code),
            TimerKey::TournamentStart(id) => write!(f, "tournament:{}:start", id),
            TimerKey::RoundCountdown { tournament, round } => {
                write!(f, "tournament:{}:round:{}", tournament, round)
            }
            TimerKey::Forfeit { tournament, user } => {
                write!(f, "tournament:{}:forfeit:{}", tournament, user)
            }
            TimerKey::TournamentLinger(id) => write!(f, "tournament:{}:linger", id),
        }
    }
}

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    expires_at_ms: u64,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    timers: DashMap<TimerKey, TimerEntry>,
    next_generation: AtomicU64,
    fired: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct TimerScheduler {
    inner: Arc<SchedulerInner>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) `key` to fire after `duration`. Returns the absolute expiry.
    pub fn start_timer<F>(&self, key: TimerKey, duration: Duration, on_elapsed: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let expires_at_ms = get_timestamp() + duration.as_millis() as u64;
        self.start_timer_at(key, expires_at_ms, on_elapsed);
        expires_at_ms
    }

    /// Starts (or restarts) `key` to fire at `expires_at_ms` (Unix millis).
    pub fn start_timer_at<F>(&self, key: TimerKey, expires_at_ms: u64, on_elapsed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = TimerEntry {
            generation,
            expires_at_ms,
            handle: None,
        };
        if let Some(old) = self.inner.timers.insert(key.clone(), entry) {
            debug!("Timer {} restarted", key);
            if let Some(handle) = old.handle {
                handle.abort();
            }
        }

        let delay = Duration::from_millis(expires_at_ms.saturating_sub(get_timestamp()));
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = inner
                .timers
                .remove_if(&task_key, |_, entry| entry.generation == generation);
            if current.is_some() {
                inner.fired.fetch_add(1, Ordering::SeqCst);
                debug!("Timer {} elapsed", task_key);
                on_elapsed();
            }
        });

        match self.inner.timers.get_mut(&key) {
            Some(mut entry) if entry.generation == generation => entry.handle = Some(handle),
            _ => handle.abort(),
        }
    }

    /// Cancels `key`. Safe on absent or already elapsed keys.
    pub fn cancel_timer(&self, key: &TimerKey) -> bool {
        match self.inner.timers.remove(key) {
            Some((_, entry)) => {
                if let Some(handle) = entry.handle {
                    handle.abort();
                }
                debug!("Timer {} cancelled", key);
                true
            }
            None => false,
        }
    }

    pub fn expires_at(&self, key: &TimerKey) -> Option<u64> {
        self.inner.timers.get(key).map(|entry| entry.expires_at_ms)
    }

    pub fn is_active(&self, key: &TimerKey) -> bool {
        self.inner.timers.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.inner.timers.len()
    }

    /// Number of timers that have fired since creation.
    pub fn fired_count(&self) -> u64 {
        self.inner.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_timer_fires_once() {
        let scheduler = TimerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let key = TimerKey::RoomCountdown("ABCDEF".to_string());

        scheduler.start_timer(key.clone(), Duration::from_millis(100), counter_callback(&counter));
        scheduler.start_timer(key.clone(), Duration::from_millis(100), counter_callback(&counter));
        scheduler.start_timer(key.clone(), Duration::from_millis(100), counter_callback(&counter));
        assert_eq!(scheduler.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.fired_count(), 1);
        assert!(!scheduler.is_active(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let scheduler = TimerScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let key = TimerKey::TournamentStart(3);

        scheduler.start_timer(key.clone(), Duration::from_millis(50), counter_callback(&counter));
        assert!(scheduler.cancel_timer(&key));
        assert!(!scheduler.cancel_timer(&key));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_absolute() {
        let scheduler = TimerScheduler::new();
        let key = TimerKey::Forfeit {
            tournament: 1,
            user: 2,
        };
        let expires = scheduler.start_timer(key.clone(), Duration::from_secs(10), || {});
        assert_eq!(scheduler.expires_at(&key), Some(expires));
        assert!(expires >= get_timestamp());
    }

    #[test]
    fn test_keys_render_as_countdown_names() {
        assert_eq!(
            TimerKey::RoundCountdown {
                tournament: 4,
                round: 2
            }
            .to_string(),
            "tournament:4:round:2"
        );
    }
}

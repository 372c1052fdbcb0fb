//! Alert de-duplication across scan cycles.
//!
//! Remembers when each `(subject, kind)` pair last fired and suppresses
//! repeats inside the cool-down window. Entries are forgotten once the window
//! has passed, so the map only holds pairs that are currently cooling down.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::model::AlertKind;

/// Default cool-down between two alerts of the same kind for one subject.
pub const DEFAULT_COOLDOWN_MINUTES: i64 = 60;

type DedupKey = (Uuid, AlertKind);

/// Expiring map of recently fired alerts.
///
/// Subjects are trip ids for trip-derived alerts and user ids otherwise.
#[derive(Debug)]
pub struct DedupGuard {
    cooldown: Duration,
    fired: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_COOLDOWN_MINUTES))
    }
}

impl DedupGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether an alert for `(subject, kind)` fired less than one cool-down ago.
    pub fn should_suppress(&self, subject: Uuid, kind: AlertKind, now: DateTime<Utc>) -> bool {
        let mut fired = self.fired.lock();
        match fired.get(&(subject, kind)) {
            Some(&last) if now - last < self.cooldown => true,
            Some(_) => {
                fired.remove(&(subject, kind));
                false
            }
            None => false,
        }
    }

    pub fn mark_fired(&self, subject: Uuid, kind: AlertKind, now: DateTime<Utc>) {
        self.fired.lock().insert((subject, kind), now);
    }

    /// Check and mark in one critical section.
    ///
    /// Returns `true` when the caller may raise the alert; the pair is then
    /// marked so a concurrent caller gets `false`.
    pub fn try_acquire(&self, subject: Uuid, kind: AlertKind, now: DateTime<Utc>) -> bool {
        let mut fired = self.fired.lock();
        if let Some(&last) = fired.get(&(subject, kind)) {
            if now - last < self.cooldown {
                return false;
            }
        }
        fired.insert((subject, kind), now);
        true
    }

    /// Forget a mark taken by [`try_acquire`](Self::try_acquire) whose alert
    /// was never recorded.
    pub fn release(&self, subject: Uuid, kind: AlertKind) {
        self.fired.lock().remove(&(subject, kind));
    }

    /// Drop every entry whose cool-down has elapsed. Returns how many went.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut fired = self.fired.lock();
        let before = fired.len();
        let cooldown = self.cooldown;
        fired.retain(|_, last| now - *last < cooldown);
        before - fired.len()
    }

    pub fn len(&self) -> usize {
        self.fired.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fired.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_suppresses_within_cooldown() {
        let guard = DedupGuard::default();
        let subject = Uuid::new_v4();
        let t0 = Utc::now();

        assert!(!guard.should_suppress(subject, AlertKind::Deviation, t0));
        guard.mark_fired(subject, AlertKind::Deviation, t0);
        assert!(guard.should_suppress(subject, AlertKind::Deviation, t0 + Duration::minutes(59)));
        assert!(!guard.should_suppress(subject, AlertKind::Deviation, t0 + Duration::minutes(60)));
        // The expired entry was forgotten on the way.
        assert!(guard.is_empty());
    }

    #[test]
    fn test_kinds_cool_down_independently() {
        let guard = DedupGuard::default();
        let subject = Uuid::new_v4();
        let t0 = Utc::now();

        assert!(guard.try_acquire(subject, AlertKind::Inactivity, t0));
        assert!(guard.try_acquire(subject, AlertKind::Deviation, t0 + Duration::minutes(5)));
        assert!(!guard.try_acquire(subject, AlertKind::Inactivity, t0 + Duration::minutes(5)));
    }

    #[test]
    fn test_release_allows_retry() {
        let guard = DedupGuard::default();
        let subject = Uuid::new_v4();
        let t0 = Utc::now();

        assert!(guard.try_acquire(subject, AlertKind::TripOverdue, t0));
        guard.release(subject, AlertKind::TripOverdue);
        assert!(guard.try_acquire(subject, AlertKind::TripOverdue, t0));
    }

    #[test]
    fn test_purge_expired() {
        let guard = DedupGuard::new(Duration::minutes(10));
        let t0 = Utc::now();
        guard.mark_fired(Uuid::new_v4(), AlertKind::Manual, t0);
        guard.mark_fired(Uuid::new_v4(), AlertKind::Manual, t0 + Duration::minutes(8));

        assert_eq!(guard.purge_expired(t0 + Duration::minutes(12)), 1);
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn test_concurrent_acquire_admits_one() {
        let guard = Arc::new(DedupGuard::default());
        let subject = Uuid::new_v4();
        let now = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.try_acquire(subject, AlertKind::Deviation, now))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}

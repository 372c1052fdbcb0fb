//! Monitoring scheduler.
//!
//! Runs the periodic scans that turn trip and safe-zone state into alerts:
//!
//! - **Trips**: every trip in `scheduled`, `active` or `alert_triggered` goes
//!   through [`TripStateMachine`]; resulting conditions raise alerts.
//! - **Safe zone**: every auto-SOS user goes through [`SafeZoneEvaluator`].
//! - **High risk**: both checks again, restricted to users with a recent
//!   unresolved alert, on a shorter period. Can be toggled at runtime.
//! - **Maintenance**: retention purge of old alerts and finished trips.
//!
//! Each scope has an in-progress flag; a tick that finds its scope busy is
//! skipped rather than queued. Candidates within a cycle are processed
//! concurrently and in isolation: a failure is counted and logged, and the
//! rest of the cycle carries on. Only a failure to load the candidate list
//! aborts a cycle, and that shows up in [`MonitorStatus::last_load_error`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::dedup::DedupGuard;
use crate::error::MonitorError;
use crate::fanout::NotificationFanout;
use crate::geo::GeoPoint;
use crate::model::{Alert, AlertKind, MonitoredUserSnapshot, Trip, User};
use crate::safe_zone::SafeZoneEvaluator;
use crate::store::Store;
use crate::trip_state::TripStateMachine;

/// Which candidate set a cycle scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanScope {
    Trips,
    SafeZone,
    HighRisk,
    /// Trips and safe zone together; used for manual runs.
    All,
}

impl fmt::Display for ScanScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanScope::Trips => "trips",
            ScanScope::SafeZone => "safe_zone",
            ScanScope::HighRisk => "high_risk",
            ScanScope::All => "all",
        };
        f.write_str(name)
    }
}

/// Counts for one finished cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub scope: ScanScope,
    pub started_at: DateTime<Utc>,
    pub scanned: usize,
    pub triggered: usize,
    /// Contacts successfully reached.
    pub notified: usize,
    /// Conditions held back by the dedup cool-down.
    pub suppressed: usize,
    /// Trip saves rejected by a concurrent write; retried next cycle.
    pub conflicts: usize,
    pub errors: usize,
    pub duration_ms: u64,
    /// Set when the candidate list itself could not be loaded.
    pub load_error: Option<String>,
}

impl CycleSummary {
    fn new(scope: ScanScope, started_at: DateTime<Utc>) -> Self {
        Self {
            scope,
            started_at,
            scanned: 0,
            triggered: 0,
            notified: 0,
            suppressed: 0,
            conflicts: 0,
            errors: 0,
            duration_ms: 0,
            load_error: None,
        }
    }

    fn absorb(&mut self, outcome: CandidateOutcome) {
        self.scanned += 1;
        self.triggered += outcome.triggered;
        self.notified += outcome.notified;
        self.suppressed += outcome.suppressed;
        self.conflicts += usize::from(outcome.conflict);
        self.errors += outcome.errors;
    }
}

/// Result of a retention pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub purged_alerts: u64,
    pub archived_trips: u64,
    pub expired_dedup_entries: usize,
}

/// Snapshot for the monitoring control surface.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub high_risk_enabled: bool,
    pub trips_in_progress: bool,
    pub safe_zone_in_progress: bool,
    pub high_risk_in_progress: bool,
    pub cycles_completed: u64,
    pub last_cycle: Option<CycleSummary>,
    pub last_load_error: Option<String>,
    pub dedup_entries: usize,
    pub channels: Vec<&'static str>,
}

/// Timer and batching knobs, taken from [`MonitorConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub trip_interval: Duration,
    pub safe_zone_interval: Duration,
    pub high_risk_interval: Duration,
    pub high_risk_lookback: chrono::Duration,
    pub candidate_concurrency: usize,
    pub retention: chrono::Duration,
    pub maintenance_interval: Duration,
}

impl From<&MonitorConfig> for SchedulerSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            trip_interval: config.trip_interval,
            safe_zone_interval: config.safe_zone_interval,
            high_risk_interval: config.high_risk_interval,
            high_risk_lookback: config.high_risk_lookback(),
            candidate_concurrency: config.candidate_concurrency.max(1),
            retention: config.retention(),
            maintenance_interval: config.maintenance_interval,
        }
    }
}

#[derive(Debug, Default)]
struct CycleStats {
    cycles_completed: u64,
    last_cycle: Option<CycleSummary>,
    last_load_error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CandidateOutcome {
    triggered: usize,
    notified: usize,
    suppressed: usize,
    conflict: bool,
    errors: usize,
}

impl CandidateOutcome {
    fn failed() -> Self {
        Self {
            errors: 1,
            ..Self::default()
        }
    }
}

/// Holds a scope's in-progress flag; clears it on drop.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MonitoringScheduler {
    store: Arc<dyn Store>,
    fanout: Arc<NotificationFanout>,
    dedup: Arc<DedupGuard>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,

    trips_busy: AtomicBool,
    safe_zone_busy: AtomicBool,
    high_risk_busy: AtomicBool,
    high_risk_enabled: AtomicBool,
    live_loops: AtomicUsize,
    stats: Mutex<CycleStats>,
}

impl MonitoringScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        fanout: Arc<NotificationFanout>,
        dedup: Arc<DedupGuard>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
        high_risk_enabled: bool,
    ) -> Self {
        Self {
            store,
            fanout,
            dedup,
            clock,
            settings,
            trips_busy: AtomicBool::new(false),
            safe_zone_busy: AtomicBool::new(false),
            high_risk_busy: AtomicBool::new(false),
            high_risk_enabled: AtomicBool::new(high_risk_enabled),
            live_loops: AtomicUsize::new(0),
            stats: Mutex::new(CycleStats::default()),
        }
    }

    // ========================================================================
    // Control surface
    // ========================================================================

    pub fn set_high_risk(&self, enabled: bool) {
        let previous = self.high_risk_enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(enabled, "High-risk monitoring toggled");
        }
    }

    pub fn high_risk_enabled(&self) -> bool {
        self.high_risk_enabled.load(Ordering::Acquire)
    }

    pub fn status(&self) -> MonitorStatus {
        let stats = self.stats.lock();
        MonitorStatus {
            running: self.live_loops.load(Ordering::Acquire) > 0,
            high_risk_enabled: self.high_risk_enabled(),
            trips_in_progress: self.trips_busy.load(Ordering::Acquire),
            safe_zone_in_progress: self.safe_zone_busy.load(Ordering::Acquire),
            high_risk_in_progress: self.high_risk_busy.load(Ordering::Acquire),
            cycles_completed: stats.cycles_completed,
            last_cycle: stats.last_cycle.clone(),
            last_load_error: stats.last_load_error.clone(),
            dedup_entries: self.dedup.len(),
            channels: self.fanout.channel_names(),
        }
    }

    // ========================================================================
    // Cycles
    // ========================================================================

    /// Run one cycle for `scope`, or return `None` when that scope is busy.
    pub async fn tick(&self, scope: ScanScope) -> Option<CycleSummary> {
        let _guards = match self.acquire(scope) {
            Some(guards) => guards,
            None => {
                info!(scope = %scope, "Previous cycle still running, skipping tick");
                return None;
            }
        };

        let started = Instant::now();
        let now = self.clock.now();
        let mut summary = CycleSummary::new(scope, now);

        let loaded = match scope {
            ScanScope::Trips => self.scan_trips(now, None, &mut summary).await,
            ScanScope::SafeZone => self.scan_safe_zone(now, &mut summary).await,
            ScanScope::HighRisk => self.scan_high_risk(now, &mut summary).await,
            ScanScope::All => match self.scan_safe_zone(now, &mut summary).await {
                Ok(()) => self.scan_trips(now, None, &mut summary).await,
                Err(e) => Err(e),
            },
        };

        if let Err(e) = loaded {
            error!(scope = %scope, error = %e, "Failed to load monitoring candidates, cycle aborted");
            summary.load_error = Some(e.to_string());
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            scope = %scope,
            scanned = summary.scanned,
            triggered = summary.triggered,
            notified = summary.notified,
            suppressed = summary.suppressed,
            conflicts = summary.conflicts,
            errors = summary.errors,
            duration_ms = summary.duration_ms,
            "Monitoring cycle complete"
        );

        let mut stats = self.stats.lock();
        stats.cycles_completed += 1;
        stats.last_load_error = summary.load_error.clone();
        stats.last_cycle = Some(summary.clone());
        drop(stats);

        Some(summary)
    }

    fn acquire(&self, scope: ScanScope) -> Option<Vec<BusyGuard<'_>>> {
        let flags = match scope {
            ScanScope::Trips => vec![&self.trips_busy],
            ScanScope::SafeZone => vec![&self.safe_zone_busy],
            ScanScope::HighRisk => vec![&self.high_risk_busy],
            ScanScope::All => vec![&self.trips_busy, &self.safe_zone_busy],
        };
        // Guards taken before a busy flag is hit drop here and release.
        flags.into_iter().map(BusyGuard::try_acquire).collect()
    }

    async fn scan_trips(
        &self,
        now: DateTime<Utc>,
        only_users: Option<&HashSet<Uuid>>,
        summary: &mut CycleSummary,
    ) -> Result<(), MonitorError> {
        let mut trips = self.store.find_monitorable_trips().await?;
        if let Some(users) = only_users {
            trips.retain(|t| users.contains(&t.user_id));
        }
        debug!(count = trips.len(), "Scanning trips");

        let outcomes: Vec<CandidateOutcome> = stream::iter(trips)
            .map(|trip| self.process_trip(trip, now))
            .buffer_unordered(self.settings.candidate_concurrency)
            .collect()
            .await;
        outcomes.into_iter().for_each(|o| summary.absorb(o));
        Ok(())
    }

    async fn scan_safe_zone(
        &self,
        now: DateTime<Utc>,
        summary: &mut CycleSummary,
    ) -> Result<(), MonitorError> {
        let users = self.store.list_auto_sos_enabled_users().await?;
        self.scan_users(users, now, summary).await;
        Ok(())
    }

    async fn scan_high_risk(
        &self,
        now: DateTime<Utc>,
        summary: &mut CycleSummary,
    ) -> Result<(), MonitorError> {
        let since = now - self.settings.high_risk_lookback;
        let users = self.store.list_high_risk_users(since).await?;
        if users.is_empty() {
            return Ok(());
        }
        let ids: HashSet<Uuid> = users.iter().map(|u| u.id).collect();
        let safe_zone_users: Vec<User> =
            users.into_iter().filter(|u| u.auto_sos_enabled).collect();
        self.scan_users(safe_zone_users, now, summary).await;
        self.scan_trips(now, Some(&ids), summary).await
    }

    async fn scan_users(&self, users: Vec<User>, now: DateTime<Utc>, summary: &mut CycleSummary) {
        debug!(count = users.len(), "Scanning safe zones");
        let outcomes: Vec<CandidateOutcome> = stream::iter(users)
            .map(|user| self.process_user(user, now))
            .buffer_unordered(self.settings.candidate_concurrency)
            .collect()
            .await;
        outcomes.into_iter().for_each(|o| summary.absorb(o));
    }

    // ========================================================================
    // Candidates
    // ========================================================================

    async fn process_user(&self, user: User, now: DateTime<Utc>) -> CandidateOutcome {
        let decision = SafeZoneEvaluator::evaluate(&MonitoredUserSnapshot::from(&user), now);
        let Some(kind) = decision.reason.alert_kind().filter(|_| decision.trigger) else {
            return CandidateOutcome::default();
        };

        if !self.dedup.try_acquire(user.id, kind, now) {
            debug!(user_id = %user.id, kind = %kind, "Safe-zone alert suppressed by cool-down");
            return CandidateOutcome {
                suppressed: 1,
                ..CandidateOutcome::default()
            };
        }

        match self
            .record_alert(user.id, None, kind, user.last_known_location, decision.detail, now)
            .await
        {
            Ok(alert) => CandidateOutcome {
                triggered: 1,
                notified: self.dispatch(&alert, &user.name).await,
                ..CandidateOutcome::default()
            },
            Err(e) => {
                warn!(user_id = %user.id, kind = %kind, error = %e, "Failed to raise safe-zone alert");
                CandidateOutcome::failed()
            }
        }
    }

    async fn process_trip(&self, trip: Trip, now: DateTime<Utc>) -> CandidateOutcome {
        let eval = match TripStateMachine::evaluate(&trip, now) {
            Ok(eval) => eval,
            Err(e) => {
                warn!(trip_id = %trip.id, error = %e, "Skipping trip");
                return CandidateOutcome::failed();
            }
        };
        if eval.is_noop() {
            return CandidateOutcome::default();
        }

        let mut outcome = CandidateOutcome::default();
        let mut fired = Vec::new();
        for condition in &eval.conditions {
            if self.dedup.try_acquire(trip.id, condition.alert_kind(), now) {
                fired.push(*condition);
            } else {
                outcome.suppressed += 1;
            }
        }

        let mut updated = trip.clone();
        if TripStateMachine::apply(&mut updated, &eval, &fired, now) {
            if !fired.is_empty() {
                updated.emergency_contacts_notified = true;
            }
            match self.store.save_trip(&updated).await {
                Ok(version) => updated.sync_version = version,
                Err(e) => {
                    for condition in &fired {
                        self.dedup.release(trip.id, condition.alert_kind());
                    }
                    if matches!(e, MonitorError::ConcurrencyConflict { .. }) {
                        info!(trip_id = %trip.id, "Trip changed during scan, retrying next cycle");
                        outcome.conflict = true;
                    } else {
                        warn!(trip_id = %trip.id, error = %e, "Failed to save trip");
                        outcome.errors += 1;
                    }
                    return outcome;
                }
            }
            if eval.status_changed() {
                info!(trip_id = %trip.id, from = %eval.from, to = %eval.next, "Trip status changed");
            }
        }

        if fired.is_empty() {
            return outcome;
        }

        let name = match self.store.get_user(trip.user_id).await {
            Ok(Some(user)) => user.name,
            Ok(None) => {
                warn!(trip_id = %trip.id, user_id = %trip.user_id, "Trip owner not found");
                "A traveller".to_string()
            }
            Err(e) => {
                warn!(trip_id = %trip.id, error = %e, "Failed to load trip owner");
                "A traveller".to_string()
            }
        };

        let mut unrecorded = Vec::new();
        for condition in &fired {
            let kind = condition.alert_kind();
            let alert = match self
                .record_alert(
                    trip.user_id,
                    Some(trip.id),
                    kind,
                    updated.current_location,
                    condition.describe(&updated),
                    now,
                )
                .await
            {
                Ok(alert) => alert,
                Err(e) => {
                    warn!(trip_id = %trip.id, kind = %kind, error = %e, "Failed to record trip alert");
                    outcome.errors += 1;
                    unrecorded.push(*condition);
                    continue;
                }
            };
            outcome.triggered += 1;
            outcome.notified += self.dispatch(&alert, &name).await;
        }

        if !unrecorded.is_empty() {
            for condition in &unrecorded {
                TripStateMachine::record_alert_failure(&mut updated, condition, now);
            }
            if unrecorded.len() == fired.len() {
                updated.emergency_contacts_notified = trip.emergency_contacts_notified;
            }
            if let Err(e) = self.store.save_trip(&updated).await {
                warn!(trip_id = %trip.id, error = %e, "Failed to note unrecorded alerts on trip");
            }
        }

        outcome
    }

    /// Store a new alert. The dedup mark is released when it could not be
    /// stored, so the next cycle tries again.
    async fn record_alert(
        &self,
        subject_user_id: Uuid,
        trip_id: Option<Uuid>,
        kind: AlertKind,
        location: Option<GeoPoint>,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<Alert, MonitorError> {
        let alert = Alert::new(subject_user_id, trip_id, kind, location, message, now);
        if let Err(e) = self.store.insert_alert(&alert).await {
            self.dedup.release(alert.dedup_subject(), kind);
            return Err(e);
        }
        info!(alert_id = %alert.id, user_id = %subject_user_id, kind = %kind, "Alert raised");
        Ok(alert)
    }

    /// Fan a stored alert out. Returns how many contacts were reached.
    async fn dispatch(&self, alert: &Alert, subject_name: &str) -> usize {
        match self
            .fanout
            .notify_subject(self.store.as_ref(), alert, subject_name)
            .await
        {
            Ok(reports) => reports.iter().filter(|r| r.succeeded()).count(),
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "Alert stored but not fanned out");
                0
            }
        }
    }

    // ========================================================================
    // Startup and maintenance
    // ========================================================================

    /// Seed the dedup guard from unresolved alerts still inside the cool-down,
    /// so a restart does not re-alert for conditions already reported.
    pub async fn warm_dedup(&self) -> Result<usize, MonitorError> {
        let now = self.clock.now();
        let alerts = self
            .store
            .recent_unresolved_alerts(now - self.dedup.cooldown())
            .await?;

        let mut seeded = 0;
        for alert in alerts.iter().filter(|a| a.kind != AlertKind::Manual) {
            self.dedup
                .mark_fired(alert.dedup_subject(), alert.kind, alert.created_at);
            seeded += 1;
        }
        info!(seeded, "Dedup guard warmed from recent alerts");
        Ok(seeded)
    }

    /// Drop resolved alerts and finished trips past the retention window.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, MonitorError> {
        let now = self.clock.now();
        let cutoff = now - self.settings.retention;

        let report = MaintenanceReport {
            purged_alerts: self.store.purge_resolved_alerts(cutoff).await?,
            archived_trips: self.store.archive_finished_trips(cutoff).await?,
            expired_dedup_entries: self.dedup.purge_expired(now),
        };
        info!(
            purged_alerts = report.purged_alerts,
            archived_trips = report.archived_trips,
            expired_dedup_entries = report.expired_dedup_entries,
            "Maintenance complete"
        );
        Ok(report)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Start one timer loop per scope plus the maintenance loop.
    ///
    /// Loops check `shutdown` only between cycles, so a cycle that is running
    /// when shutdown is signalled finishes its writes first.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let settings = &self.settings;
        let handles = vec![
            self.spawn_scope(ScanScope::Trips, settings.trip_interval, shutdown.clone()),
            self.spawn_scope(ScanScope::SafeZone, settings.safe_zone_interval, shutdown.clone()),
            self.spawn_scope(ScanScope::HighRisk, settings.high_risk_interval, shutdown.clone()),
            self.spawn_maintenance(settings.maintenance_interval, shutdown),
        ];
        info!(
            trip_secs = settings.trip_interval.as_secs(),
            safe_zone_secs = settings.safe_zone_interval.as_secs(),
            high_risk_secs = settings.high_risk_interval.as_secs(),
            high_risk_enabled = self.high_risk_enabled(),
            "Monitoring scheduler started"
        );
        handles
    }

    fn spawn_scope(
        self: &Arc<Self>,
        scope: ScanScope,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        this.live_loops.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if scope == ScanScope::HighRisk && !this.high_risk_enabled() {
                            continue;
                        }
                        this.tick(scope).await;
                    }
                }
            }

            this.live_loops.fetch_sub(1, Ordering::AcqRel);
            info!(scope = %scope, "Monitoring loop stopped");
        })
    }

    fn spawn_maintenance(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = this.run_maintenance().await {
                            warn!(error = %e, "Maintenance pass failed");
                        }
                    }
                }
            }

            info!("Maintenance loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{CreateTripRequest, Destination, TravelMode, TripStatus};
    use crate::storage::Storage;
    use crate::store::{AlertStore, TripStore, UserStore};
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    async fn scheduler() -> (Arc<Storage>, Arc<ManualClock>, MonitoringScheduler) {
        let storage = Arc::new(Storage::new("sqlite::memory:").await.unwrap());
        let clock = Arc::new(ManualClock::new(at()));
        let fanout = Arc::new(NotificationFanout::new(
            storage.clone(),
            Vec::new(),
            4,
            clock.clone(),
        ));
        let scheduler = MonitoringScheduler::new(
            storage.clone(),
            fanout,
            Arc::new(DedupGuard::default()),
            clock.clone(),
            SchedulerSettings::from(&MonitorConfig::default()),
            false,
        );
        (storage, clock, scheduler)
    }

    async fn active_trip(storage: &Storage, user: &User) -> Trip {
        let request = CreateTripRequest {
            user_id: user.id,
            title: "Commute".into(),
            start_time: at() - chrono::Duration::hours(2),
            end_time: at() - chrono::Duration::minutes(40),
            destination: Destination {
                lat: 40.7128,
                lon: -74.006,
                address: None,
                name: None,
            },
            notes: None,
            travel_mode: TravelMode::Driving,
            alert_thresholds: None,
        };
        let mut trip = Trip::from_request(request, at() - chrono::Duration::hours(3)).unwrap();
        trip.status = TripStatus::Active;
        trip.last_location_update = Some(at() - chrono::Duration::minutes(45));
        storage.insert_trip(&trip).await.unwrap();
        trip
    }

    #[test]
    fn test_busy_guard_releases_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = BusyGuard::try_acquire(&flag).unwrap();
        assert!(BusyGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(BusyGuard::try_acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let (_storage, _clock, scheduler) = scheduler().await;
        let _held = BusyGuard::try_acquire(&scheduler.trips_busy).unwrap();

        assert!(scheduler.tick(ScanScope::Trips).await.is_none());
        assert!(scheduler.tick(ScanScope::All).await.is_none());
        assert!(scheduler.tick(ScanScope::SafeZone).await.is_some());
    }

    #[tokio::test]
    async fn test_overdue_trip_raises_one_alert() {
        let (storage, _clock, scheduler) = scheduler().await;
        let user = User::new("Alex", at());
        storage.upsert_user(&user).await.unwrap();
        let trip = active_trip(&storage, &user).await;

        let summary = scheduler.tick(ScanScope::Trips).await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.errors, 0);

        let saved = storage.get_trip(trip.id).await.unwrap().unwrap();
        assert_eq!(saved.status, TripStatus::AlertTriggered);
        assert!(saved.emergency_contacts_notified);
        assert_eq!(saved.sync_version, trip.sync_version + 1);

        let alerts = storage.list_alerts_for_user(user.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::TripOverdue);
        assert_eq!(alerts[0].trip_id, Some(trip.id));
    }

    #[tokio::test]
    async fn test_warm_dedup_skips_manual_alerts() {
        let (storage, _clock, scheduler) = scheduler().await;
        let user = User::new("Alex", at());
        storage.upsert_user(&user).await.unwrap();
        let earlier = at() - chrono::Duration::minutes(10);
        storage
            .insert_alert(&Alert::new(user.id, None, AlertKind::Inactivity, None, "idle", earlier))
            .await
            .unwrap();
        storage
            .insert_alert(&Alert::new(user.id, None, AlertKind::Manual, None, "sos", earlier))
            .await
            .unwrap();

        assert_eq!(scheduler.warm_dedup().await.unwrap(), 1);
        assert!(scheduler.dedup.should_suppress(user.id, AlertKind::Inactivity, at()));
    }

    #[tokio::test]
    async fn test_status_and_high_risk_toggle() {
        let (_storage, _clock, scheduler) = scheduler().await;
        let status = scheduler.status();
        assert!(!status.running);
        assert!(!status.high_risk_enabled);
        assert!(status.last_cycle.is_none());

        scheduler.set_high_risk(true);
        scheduler.tick(ScanScope::HighRisk).await.unwrap();

        let status = scheduler.status();
        assert!(status.high_risk_enabled);
        assert_eq!(status.cycles_completed, 1);
        assert_eq!(status.last_cycle.unwrap().scope, ScanScope::HighRisk);
    }

    #[tokio::test]
    async fn test_loops_stop_on_shutdown() {
        let (_storage, _clock, scheduler) = scheduler().await;
        let scheduler = Arc::new(scheduler);
        let (tx, rx) = watch::channel(false);

        let handles = scheduler.spawn(rx);
        assert!(scheduler.status().running);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(!scheduler.status().running);
    }
}

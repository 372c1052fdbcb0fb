//! Trip lifecycle state machine.
//!
//! [`TripStateMachine::evaluate`] is a pure function of a trip snapshot and
//! "now": it decides the next status and which alert conditions hold, without
//! touching the trip. [`TripStateMachine::apply`] then writes the decision
//! into the trip's status and history log. Keeping the two apart lets the
//! scheduler consult the dedup guard between deciding and recording.
//!
//! Transition rules per scan tick:
//!
//! - `scheduled -> active` when `start <= now <= end`
//! - `scheduled -> missed` when `now > end`
//! - `active -> alert_triggered` on location timeout (silence measured from the
//!   last ping, or from `start` when there has been none)
//! - `active | alert_triggered -> alert_triggered` when overdue (`now > end`),
//!   adding a destination mismatch when the last known location is outside
//!   the tolerance radius
//! - `active | alert_triggered -> completed` when `now > end` and the last known
//!   location is inside the tolerance radius

use chrono::{DateTime, Utc};

use crate::error::MonitorError;
use crate::geo::haversine_meters;
use crate::model::{AlertHistoryEntry, AlertKind, Trip, TripEventKind, TripStatus};

/// An alert-worthy condition detected on a trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripCondition {
    LocationTimeout { silent_minutes: i64 },
    Overdue { overdue_minutes: i64 },
    DestinationMismatch { distance_meters: f64 },
}

impl TripCondition {
    pub fn alert_kind(&self) -> AlertKind {
        match self {
            TripCondition::LocationTimeout { .. } => AlertKind::TripLocationTimeout,
            TripCondition::Overdue { .. } => AlertKind::TripOverdue,
            TripCondition::DestinationMismatch { .. } => AlertKind::TripDestinationMismatch,
        }
    }

    fn event_kind(&self) -> TripEventKind {
        match self {
            TripCondition::LocationTimeout { .. } => TripEventKind::LocationTimeout,
            TripCondition::Overdue { .. } => TripEventKind::Overdue,
            TripCondition::DestinationMismatch { .. } => TripEventKind::DestinationMismatch,
        }
    }

    /// Text used both in the trip history and in the alert message.
    pub fn describe(&self, trip: &Trip) -> String {
        match self {
            TripCondition::LocationTimeout { silent_minutes } => format!(
                "No location update for {} minutes on trip '{}' (limit {} minutes)",
                silent_minutes, trip.title, trip.alert_thresholds.location_timeout_minutes
            ),
            TripCondition::Overdue { overdue_minutes } => format!(
                "Trip '{}' to {} is overdue by {} minutes",
                trip.title,
                trip.destination.label(),
                overdue_minutes
            ),
            TripCondition::DestinationMismatch { distance_meters } => format!(
                "Last known location is {}m from the destination of trip '{}' (tolerance {}m)",
                distance_meters.round() as i64,
                trip.title,
                trip.alert_thresholds.destination_tolerance_meters
            ),
        }
    }
}

/// The outcome of evaluating one trip at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TripEvaluation {
    pub from: TripStatus,
    pub next: TripStatus,
    /// Set for status changes that are not driven by an alert condition.
    pub transition: Option<TripEventKind>,
    pub conditions: Vec<TripCondition>,
}

impl TripEvaluation {
    fn unchanged(status: TripStatus) -> Self {
        Self {
            from: status,
            next: status,
            transition: None,
            conditions: Vec::new(),
        }
    }

    pub fn status_changed(&self) -> bool {
        self.from != self.next
    }

    /// True when applying this evaluation would not modify the trip.
    pub fn is_noop(&self) -> bool {
        !self.status_changed() && self.conditions.is_empty()
    }
}

/// Decides and records trip lifecycle transitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TripStateMachine;

impl TripStateMachine {
    /// Decide what should happen to `trip` at `now`.
    ///
    /// Returns [`MonitorError::DataIntegrity`] for a trip whose window is
    /// empty or inverted; such trips can only come from corrupted storage.
    pub fn evaluate(trip: &Trip, now: DateTime<Utc>) -> Result<TripEvaluation, MonitorError> {
        if trip.end_time <= trip.start_time {
            return Err(MonitorError::DataIntegrity(format!(
                "trip {} ends at {} which is not after its start {}",
                trip.id, trip.end_time, trip.start_time
            )));
        }

        let from = trip.status;
        let mut eval = TripEvaluation::unchanged(from);

        let effective = match from {
            TripStatus::Completed | TripStatus::Cancelled | TripStatus::Missed => return Ok(eval),
            TripStatus::Scheduled => {
                if now < trip.start_time {
                    return Ok(eval);
                }
                if now > trip.end_time {
                    eval.next = TripStatus::Missed;
                    eval.transition = Some(TripEventKind::Missed);
                    return Ok(eval);
                }
                eval.next = TripStatus::Active;
                eval.transition = Some(TripEventKind::Activated);
                TripStatus::Active
            }
            status => status,
        };

        let tolerance = f64::from(trip.alert_thresholds.destination_tolerance_meters);
        let distance = trip
            .current_location
            .map(|p| haversine_meters(&p, &trip.destination.point()));

        if now > trip.end_time {
            if distance.is_some_and(|d| d <= tolerance) {
                eval.next = TripStatus::Completed;
                eval.transition = Some(TripEventKind::Arrived);
                return Ok(eval);
            }

            eval.next = TripStatus::AlertTriggered;
            eval.transition = None;
            eval.conditions.push(TripCondition::Overdue {
                overdue_minutes: (now - trip.end_time).num_minutes(),
            });
            if let Some(d) = distance {
                eval.conditions
                    .push(TripCondition::DestinationMismatch { distance_meters: d });
            }
            return Ok(eval);
        }

        if effective == TripStatus::Active {
            let reference = trip.last_location_update.unwrap_or(trip.start_time);
            let silent = now - reference;
            let limit = chrono::Duration::minutes(i64::from(
                trip.alert_thresholds.location_timeout_minutes,
            ));
            if silent > limit {
                eval.next = TripStatus::AlertTriggered;
                eval.conditions.push(TripCondition::LocationTimeout {
                    silent_minutes: silent.num_minutes(),
                });
            }
        }

        Ok(eval)
    }

    /// Record `eval` on `trip`. Returns whether the trip was modified.
    ///
    /// `fired` is the subset of `eval.conditions` that produced an alert; each
    /// gets its own history entry. A status change with no fired condition is
    /// logged once with its transition reason (or the first held condition).
    pub fn apply(
        trip: &mut Trip,
        eval: &TripEvaluation,
        fired: &[TripCondition],
        now: DateTime<Utc>,
    ) -> bool {
        let before = trip.alert_history.len();
        let mut from = eval.from;

        if let Some(kind) = eval.transition {
            let to = if eval.conditions.is_empty() {
                eval.next
            } else {
                TripStatus::Active
            };
            trip.alert_history.push(AlertHistoryEntry {
                kind,
                from_status: from,
                to_status: to,
                message: transition_message(kind, trip),
                timestamp: now,
            });
            from = to;
        }

        if fired.is_empty() {
            if let Some(condition) = eval.conditions.first().filter(|_| from != eval.next) {
                trip.alert_history.push(AlertHistoryEntry {
                    kind: condition.event_kind(),
                    from_status: from,
                    to_status: eval.next,
                    message: condition.describe(trip),
                    timestamp: now,
                });
            }
        } else {
            for condition in fired {
                trip.alert_history.push(AlertHistoryEntry {
                    kind: condition.event_kind(),
                    from_status: from,
                    to_status: eval.next,
                    message: condition.describe(trip),
                    timestamp: now,
                });
                from = eval.next;
            }
        }

        if trip.alert_history.len() == before {
            return false;
        }
        trip.status = eval.next;
        trip.updated_at = now;
        true
    }

    /// Follow up an entry written by [`apply`](Self::apply) whose alert could
    /// not be stored. The status is left as is.
    pub fn record_alert_failure(trip: &mut Trip, condition: &TripCondition, now: DateTime<Utc>) {
        trip.alert_history.push(AlertHistoryEntry {
            kind: TripEventKind::AlertNotRecorded,
            from_status: trip.status,
            to_status: trip.status,
            message: format!(
                "Alert {} could not be recorded, retrying next cycle",
                condition.alert_kind()
            ),
            timestamp: now,
        });
        trip.updated_at = now;
    }

    /// User-initiated cancellation.
    pub fn cancel(trip: &mut Trip, reason: Option<&str>, now: DateTime<Utc>) -> Result<(), MonitorError> {
        Self::user_transition(trip, TripStatus::Cancelled, TripEventKind::Cancelled, reason, now)
    }

    /// User-initiated completion.
    pub fn complete(trip: &mut Trip, reason: Option<&str>, now: DateTime<Utc>) -> Result<(), MonitorError> {
        Self::user_transition(trip, TripStatus::Completed, TripEventKind::Completed, reason, now)
    }

    fn user_transition(
        trip: &mut Trip,
        to: TripStatus,
        kind: TripEventKind,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), MonitorError> {
        if trip.status.is_terminal() {
            return Err(MonitorError::InvalidTransition(format!(
                "trip {} is already {}",
                trip.id, trip.status
            )));
        }

        let message = match reason {
            Some(r) if !r.trim().is_empty() => format!("{} by user: {}", to, r.trim()),
            _ => format!("{} by user", to),
        };
        trip.alert_history.push(AlertHistoryEntry {
            kind,
            from_status: trip.status,
            to_status: to,
            message,
            timestamp: now,
        });
        trip.status = to;
        trip.updated_at = now;
        Ok(())
    }
}

fn transition_message(kind: TripEventKind, trip: &Trip) -> String {
    match kind {
        TripEventKind::Activated => format!("Trip '{}' started", trip.title),
        TripEventKind::Missed => format!("Trip '{}' ended without ever starting", trip.title),
        TripEventKind::Arrived => {
            format!("Arrived at {} for trip '{}'", trip.destination.label(), trip.title)
        }
        other => format!("Trip '{}': {:?}", trip.title, other),
    }
}

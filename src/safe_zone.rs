//! Safe-zone evaluation for users with automatic SOS enabled.
//!
//! A decision needs both the configured safe point and a last known location.
//! Inactivity is checked before deviation: a stale location from an inactive
//! user says nothing about where they are now.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::geo::haversine_meters;
use crate::model::{AlertKind, MonitoredUserSnapshot};

/// Why a safe-zone check fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeZoneReason {
    Inactivity,
    LocationDeviation,
    None,
}

impl SafeZoneReason {
    pub fn alert_kind(&self) -> Option<AlertKind> {
        match self {
            SafeZoneReason::Inactivity => Some(AlertKind::Inactivity),
            SafeZoneReason::LocationDeviation => Some(AlertKind::Deviation),
            SafeZoneReason::None => None,
        }
    }
}

/// Result of one safe-zone check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafeZoneDecision {
    pub trigger: bool,
    pub reason: SafeZoneReason,
    pub detail: String,
    /// Distance from the safe point, when both locations were known.
    pub distance_meters: Option<f64>,
}

impl SafeZoneDecision {
    fn none(detail: impl Into<String>) -> Self {
        Self {
            trigger: false,
            reason: SafeZoneReason::None,
            detail: detail.into(),
            distance_meters: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SafeZoneEvaluator;

impl SafeZoneEvaluator {
    pub fn evaluate(snapshot: &MonitoredUserSnapshot, now: DateTime<Utc>) -> SafeZoneDecision {
        if !snapshot.auto_sos_enabled {
            return SafeZoneDecision::none("automatic SOS disabled");
        }

        let (Some(safe), Some(last)) = (snapshot.default_location, snapshot.last_known_location)
        else {
            return SafeZoneDecision::none("safe location or last known location not set");
        };

        let distance = haversine_meters(&safe, &last);

        if let Some(last_active) = snapshot.last_active_at {
            let idle = now - last_active;
            let limit = Duration::minutes(i64::from(snapshot.inactivity_threshold_minutes));
            if idle > limit {
                return SafeZoneDecision {
                    trigger: true,
                    reason: SafeZoneReason::Inactivity,
                    detail: format!(
                        "{} has been inactive for {} minutes (threshold {} minutes)",
                        snapshot.name,
                        idle.num_minutes(),
                        snapshot.inactivity_threshold_minutes
                    ),
                    distance_meters: Some(distance),
                };
            }
        }

        if distance > f64::from(snapshot.deviation_threshold_meters) {
            return SafeZoneDecision {
                trigger: true,
                reason: SafeZoneReason::LocationDeviation,
                detail: format!(
                    "{} is {}m away from their safe location (threshold {}m)",
                    snapshot.name,
                    distance.round() as i64,
                    snapshot.deviation_threshold_meters
                ),
                distance_meters: Some(distance),
            };
        }

        SafeZoneDecision {
            trigger: false,
            reason: SafeZoneReason::None,
            detail: "within safe zone".into(),
            distance_meters: Some(distance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use uuid::Uuid;

    fn snapshot(now: DateTime<Utc>) -> MonitoredUserSnapshot {
        MonitoredUserSnapshot {
            user_id: Uuid::new_v4(),
            name: "Dana".into(),
            auto_sos_enabled: true,
            deviation_threshold_meters: 5000,
            inactivity_threshold_minutes: 60,
            default_location: Some(GeoPoint::new(40.7128, -74.0060)),
            last_known_location: Some(GeoPoint::new(40.7128, -74.0060)),
            last_active_at: Some(now - Duration::minutes(5)),
        }
    }

    #[test]
    fn test_disabled_never_triggers() {
        let now = Utc::now();
        let mut s = snapshot(now);
        s.auto_sos_enabled = false;
        s.last_active_at = Some(now - Duration::days(3));
        assert!(!SafeZoneEvaluator::evaluate(&s, now).trigger);
    }

    #[test]
    fn test_missing_locations_never_trigger() {
        let now = Utc::now();
        let mut s = snapshot(now);
        s.last_active_at = Some(now - Duration::days(3));
        s.default_location = None;
        let d = SafeZoneEvaluator::evaluate(&s, now);
        assert!(!d.trigger);
        assert_eq!(d.reason, SafeZoneReason::None);

        let mut s = snapshot(now);
        s.last_known_location = None;
        s.last_active_at = None;
        assert!(!SafeZoneEvaluator::evaluate(&s, now).trigger);
    }

    #[test]
    fn test_deviation_detail_includes_distance() {
        let now = Utc::now();
        let mut s = snapshot(now);
        s.last_known_location = Some(GeoPoint::new(40.7128, -73.9000));
        let d = SafeZoneEvaluator::evaluate(&s, now);
        assert!(d.trigger);
        assert_eq!(d.reason, SafeZoneReason::LocationDeviation);
        assert!(d.distance_meters.unwrap() > 5000.0);
        assert!(d.detail.contains("m away"));
        assert_eq!(d.reason.alert_kind(), Some(AlertKind::Deviation));
    }

    #[test]
    fn test_inactivity_takes_precedence() {
        let now = Utc::now();
        let mut s = snapshot(now);
        s.last_known_location = Some(GeoPoint::new(40.7128, -73.9000));
        s.last_active_at = Some(now - Duration::minutes(61));
        let d = SafeZoneEvaluator::evaluate(&s, now);
        assert!(d.trigger);
        assert_eq!(d.reason, SafeZoneReason::Inactivity);
    }

    #[test]
    fn test_inside_zone_and_active() {
        let now = Utc::now();
        let d = SafeZoneEvaluator::evaluate(&snapshot(now), now);
        assert!(!d.trigger);
        assert_eq!(d.distance_meters, Some(0.0));
    }
}

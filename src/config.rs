//! Runtime configuration.
//!
//! Everything is read from `TRIPGUARD_*` environment variables. Missing or
//! unparsable values fall back to the defaults below.

use std::env;
use std::time::Duration;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_PATH: &str = "sqlite:tripguard.db?mode=rwc";

/// Upper bounds for the calendar settings. Larger values fall back to the default.
pub const MAX_LOOKBACK_HOURS: i64 = 24 * 365;
pub const MAX_COOLDOWN_MINUTES: i64 = 60 * 24 * 30;
pub const MAX_RETENTION_DAYS: i64 = 3650;

/// Which outbound medium a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Sms,
    Push,
    Email,
}

impl ChannelKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sms" => Some(ChannelKind::Sms),
            "push" => Some(ChannelKind::Push),
            "email" => Some(ChannelKind::Email),
            _ => None,
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            ChannelKind::Sms => "TRIPGUARD_SMS",
            ChannelKind::Push => "TRIPGUARD_PUSH",
            ChannelKind::Email => "TRIPGUARD_EMAIL",
        }
    }
}

/// Provider endpoint for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub base_url: String,
    pub api_token: Option<String>,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub port: u16,
    pub database_url: String,

    /// Period of the trip scan.
    pub trip_interval: Duration,
    /// Period of the safe-zone scan.
    pub safe_zone_interval: Duration,
    /// Period of the narrowed high-risk scan.
    pub high_risk_interval: Duration,
    pub high_risk_enabled: bool,
    /// How far back an unresolved alert makes a user "high risk".
    pub high_risk_lookback_hours: i64,

    pub dedup_cooldown_minutes: i64,

    /// Upper bound on simultaneous outbound channel calls.
    pub max_concurrent_sends: usize,
    /// Candidates evaluated in parallel within one cycle.
    pub candidate_concurrency: usize,

    pub retention_days: i64,
    pub maintenance_interval: Duration,

    /// Channels in attempt order.
    pub channels: Vec<ChannelConfig>,
    pub email_from: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_PATH.to_string(),
            trip_interval: Duration::from_secs(300),
            safe_zone_interval: Duration::from_secs(600),
            high_risk_interval: Duration::from_secs(120),
            high_risk_enabled: false,
            high_risk_lookback_hours: 24,
            dedup_cooldown_minutes: 60,
            max_concurrent_sends: 20,
            candidate_concurrency: 8,
            retention_days: 30,
            maintenance_interval: Duration::from_secs(86_400),
            channels: Vec::new(),
            email_from: "alerts@tripguard.local".to_string(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let bounded = |key: &str, max: i64, fallback: i64| {
            parse(key)
                .and_then(|v| i64::try_from(v).ok())
                .filter(|v| (1..=max).contains(v))
                .unwrap_or(fallback)
        };
        let secs = |key: &str, fallback: Duration| {
            parse(key)
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        let channels = lookup("TRIPGUARD_CHANNELS")
            .map(|list| parse_channels(&list, &lookup))
            .unwrap_or_default();

        Self {
            port: lookup("TRIPGUARD_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            database_url: lookup("TRIPGUARD_DATABASE_URL").unwrap_or(defaults.database_url),
            trip_interval: secs("TRIPGUARD_TRIP_INTERVAL_SECS", defaults.trip_interval),
            safe_zone_interval: secs("TRIPGUARD_SAFE_ZONE_INTERVAL_SECS", defaults.safe_zone_interval),
            high_risk_interval: secs("TRIPGUARD_HIGH_RISK_INTERVAL_SECS", defaults.high_risk_interval),
            high_risk_enabled: lookup("TRIPGUARD_HIGH_RISK_ENABLED")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.high_risk_enabled),
            high_risk_lookback_hours: bounded(
                "TRIPGUARD_HIGH_RISK_LOOKBACK_HOURS",
                MAX_LOOKBACK_HOURS,
                defaults.high_risk_lookback_hours,
            ),
            dedup_cooldown_minutes: bounded(
                "TRIPGUARD_DEDUP_COOLDOWN_MINUTES",
                MAX_COOLDOWN_MINUTES,
                defaults.dedup_cooldown_minutes,
            ),
            max_concurrent_sends: parse("TRIPGUARD_MAX_CONCURRENT_SENDS")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.max_concurrent_sends),
            candidate_concurrency: parse("TRIPGUARD_CANDIDATE_CONCURRENCY")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.candidate_concurrency),
            retention_days: bounded(
                "TRIPGUARD_RETENTION_DAYS",
                MAX_RETENTION_DAYS,
                defaults.retention_days,
            ),
            maintenance_interval: secs(
                "TRIPGUARD_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval,
            ),
            channels,
            email_from: lookup("TRIPGUARD_EMAIL_FROM").unwrap_or(defaults.email_from),
        }
    }

    /// How far back an unresolved alert marks its user as high-risk.
    pub fn high_risk_lookback(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.high_risk_lookback_hours)
            .unwrap_or_else(|| chrono::Duration::hours(24))
    }

    /// Cool-down between two alerts of the same kind for one subject.
    pub fn dedup_cooldown(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.dedup_cooldown_minutes)
            .unwrap_or_else(|| chrono::Duration::minutes(60))
    }

    /// Age after which resolved alerts and finished trips are cleaned up.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::try_days(self.retention_days).unwrap_or_else(|| chrono::Duration::days(30))
    }
}

fn parse_channels(list: &str, lookup: &impl Fn(&str) -> Option<String>) -> Vec<ChannelConfig> {
    let mut channels = Vec::new();

    for name in list.split(',').filter(|n| !n.trim().is_empty()) {
        let Some(kind) = ChannelKind::parse(name) else {
            tracing::warn!(channel = %name.trim(), "Unknown alert channel, ignoring");
            continue;
        };
        if channels.iter().any(|c: &ChannelConfig| c.kind == kind) {
            continue;
        }

        let prefix = kind.env_prefix();
        match lookup(&format!("{prefix}_URL")).filter(|u| !u.trim().is_empty()) {
            Some(base_url) => channels.push(ChannelConfig {
                kind,
                base_url: base_url.trim_end_matches('/').to_string(),
                api_token: lookup(&format!("{prefix}_TOKEN")),
            }),
            None => {
                tracing::warn!(channel = ?kind, "Alert channel listed without a provider URL, skipping");
            }
        }
    }

    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::from_lookup(|_| None);
        assert_eq!(config.port, 3000);
        assert_eq!(config.trip_interval, Duration::from_secs(300));
        assert_eq!(config.dedup_cooldown_minutes, 60);
        assert!(!config.high_risk_enabled);
        assert!(config.channels.is_empty());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = MonitorConfig::from_lookup(lookup_from(&[
            ("TRIPGUARD_PORT", "8080"),
            ("TRIPGUARD_TRIP_INTERVAL_SECS", "not-a-number"),
            ("TRIPGUARD_HIGH_RISK_ENABLED", "true"),
            ("TRIPGUARD_MAX_CONCURRENT_SENDS", "0"),
        ]));
        assert_eq!(config.port, 8080);
        assert_eq!(config.trip_interval, Duration::from_secs(300));
        assert!(config.high_risk_enabled);
        assert_eq!(config.max_concurrent_sends, 20);
    }

    #[test]
    fn test_calendar_settings_out_of_range() {
        let config = MonitorConfig::from_lookup(lookup_from(&[
            ("TRIPGUARD_RETENTION_DAYS", "18446744073709551615"),
            ("TRIPGUARD_HIGH_RISK_LOOKBACK_HOURS", "9999999999999999"),
            ("TRIPGUARD_DEDUP_COOLDOWN_MINUTES", "0"),
        ]));
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.high_risk_lookback_hours, 24);
        assert_eq!(config.dedup_cooldown_minutes, 60);
        assert_eq!(config.retention(), chrono::Duration::days(30));
        assert_eq!(config.high_risk_lookback(), chrono::Duration::hours(24));

        let config = MonitorConfig::from_lookup(lookup_from(&[
            ("TRIPGUARD_RETENTION_DAYS", "3650"),
            ("TRIPGUARD_HIGH_RISK_LOOKBACK_HOURS", "8761"),
            ("TRIPGUARD_DEDUP_COOLDOWN_MINUTES", "15"),
        ]));
        assert_eq!(config.retention_days, 3650);
        assert_eq!(config.high_risk_lookback_hours, 24);
        assert_eq!(config.dedup_cooldown(), chrono::Duration::minutes(15));
    }

    #[test]
    fn test_channel_list_order_and_skips() {
        let config = MonitorConfig::from_lookup(lookup_from(&[
            ("TRIPGUARD_CHANNELS", "push, sms,fax,email,sms"),
            ("TRIPGUARD_PUSH_URL", "https://push.example/"),
            ("TRIPGUARD_PUSH_TOKEN", "secret"),
            ("TRIPGUARD_SMS_URL", "https://sms.example"),
        ]));

        let kinds: Vec<_> = config.channels.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChannelKind::Push, ChannelKind::Sms]);
        assert_eq!(config.channels[0].base_url, "https://push.example");
        assert_eq!(config.channels[0].api_token.as_deref(), Some("secret"));
        assert_eq!(config.channels[1].api_token, None);
    }
}

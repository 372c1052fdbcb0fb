//! Tripguard - trip monitoring and SOS alerting.
//!
//! # Overview
//!
//! Tripguard watches two kinds of risk and tells a user's emergency contacts
//! when something looks wrong:
//!
//! - **Trips**: time-boxed journeys to a destination. A trip that runs past
//!   its end time, stops reporting location, or ends away from its
//!   destination raises an alert.
//! - **Safe zones**: users with automatic SOS enabled are alerted on when they
//!   go quiet for too long or stray too far from their safe location.
//!
//! Alerts are de-duplicated per subject and condition, recorded, and fanned
//! out to every emergency contact over the configured channels (SMS, push,
//! email), with a per-contact delivery ledger.
//!
//! # Modules
//!
//! - [`geo`]: Haversine distance and map links
//! - [`clock`]: Injectable time source
//! - [`error`]: Error taxonomy
//! - [`config`]: Environment configuration
//! - [`model`]: Trips, users, alerts, delivery ledger, request bodies
//! - [`trip_state`]: Trip lifecycle state machine
//! - [`safe_zone`]: Inactivity and deviation checks
//! - [`dedup`]: Alert cool-down guard
//! - [`store`]: Persistence traits
//! - [`storage`]: SQLite storage layer
//! - [`channels`]: Outbound SMS, push and email
//! - [`fanout`]: Per-contact notification fanout
//! - [`scheduler`]: Periodic monitoring cycles
//! - [`trips`]: Trip lifecycle operations
//! - [`alerts`]: Manual SOS and alert resolution
//! - [`api`]: HTTP API handlers

pub mod alerts;
pub mod api;
pub mod channels;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fanout;
pub mod geo;
pub mod model;
pub mod safe_zone;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod trip_state;
pub mod trips;

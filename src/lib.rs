//! # capability-arbiter
//!
//! Mediates access from untrusted plugins to shared hardware capabilities
//! (valves, pumps, sensors) across zones.
//!
//! Plugins register a signed manifest, request permission-scoped and time-boxed
//! grants on `(device, capability)` pairs, and route commands through those grants.
//! Concurrent claims on the same resource are settled by a configurable conflict
//! strategy, and every decision lands in a hash-chained audit log.

pub mod arbiter;
pub mod capability;
pub mod config;
pub mod conflict;
pub mod constraint;
pub mod error;
pub mod grant;
pub mod jobs;
pub mod logging;
pub mod manifest;
pub mod permission;
pub mod security;
pub mod sinks;

pub use arbiter::{Arbiter, ArbiterBuilder, CapabilityRequest, CommandOutcome, MaintenanceReport};
pub use capability::{CapabilitySpec, HealthBucket};
pub use config::{ArbiterConfig, ConfigLoader};
pub use conflict::{ConflictStrategy, Decision};
pub use error::{Error, ManifestError, Result};
pub use grant::{AccessGrant, GrantId, LockType};
pub use jobs::MaintenanceJob;
pub use manifest::PluginManifest;
pub use permission::{CommandKind, PermissionLevel};
pub use security::{AuditEntry, AuditEventKind, AuditQuery};
pub use sinks::{Command, CommandResult, CommandSink, EventSink};

//! Security primitives shared by the arbiter: request/command rate limiting
//! and the tamper-evident audit log.

pub mod audit_log;
pub mod rate_limiter;

pub use audit_log::{
    AuditEntry, AuditEvent, AuditEventKind, AuditLog, AuditQuery, AuditStatistics, ChainBreak,
};
pub use rate_limiter::{RateLimiter, WindowStatus};

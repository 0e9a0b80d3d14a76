//! Audit log entries: the append-only, totally ordered record of every
//! state-changing action.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Ingest,
    Redact,
    AttributeUpdate,
    Finding,
    RuleRegistered,
    Compact,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ingest => "INGEST",
            Self::Redact => "REDACT",
            Self::AttributeUpdate => "ATTRIBUTE_UPDATE",
            Self::Finding => "FINDING",
            Self::RuleRegistered => "RULE_REGISTERED",
            Self::Compact => "COMPACT",
        };
        f.write_str(label)
    }
}

/// One sequenced audit entry. Sequences are strictly increasing and gap-free
/// per store; entries are never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sequence: u64,
    /// Unix seconds, UTC, stamped when the consumer sequenced the entry.
    pub timestamp: i64,
    pub action: AuditAction,
    pub entity_uid: String,
    pub details: String,
}

//! Public types exposed by the `radvault-core` crate.

pub mod attrs;
pub mod audit;
pub mod catalog;
pub mod entities;
pub mod options;

pub use attrs::{AttrValue, AttributeKey, ParseTagError, Tag};
pub use audit::{AuditAction, AuditLogEntry};
pub use catalog::{Catalog, Header};
pub use entities::{
    InstanceDraft, InstanceRecord, MachineRule, PatientRecord, PayloadEncoding, PayloadRef,
    PhiFinding, PhiRemediation, RedactionZone, RemediationAction, SeriesRecord, StudyRecord,
};
pub use options::{
    CompactReport, InstanceQuery, LoadReport, QuarantineReason, SaveReport, StoreOptions,
    StoreStats, StoreWarning,
};

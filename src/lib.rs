//! Report Templates
//!
//! Versioned storage of report templates, content-addressed template
//! snapshots, and the schema-driven transform between flat field submissions
//! and the tab/section/field shape a template defines.
//!
//! ## Features
//!
//! - **Append-only Versions**: Templates are published with semver versions and only ever deprecated
//! - **Single Latest Pointer**: One head record per template, moved by compare-and-set
//! - **Snapshot Deduplication**: Identical template bundles share one snapshot, keyed by SHA256
//! - **Flat ↔ Hierarchical**: Groups, dynamic tables and unmapped fields are all placed, never dropped
//! - **Change Analysis**: Field-level diffs deciding whether records can be migrated automatically
//!
//! ## Layout
//!
//! ```text
//! {
//!   "<tab>": {
//!     "<section>": {
//!       "<field>": "value",
//!       "<group>": { "<sub field>": "value" },
//!       "<table field>": { "$table": "<table field>" }
//!     }
//!   },
//!   "tables":     { "<table field>": { "columns": [...], "rows": [...] } },
//!   "_common_":   { "<common field>": "value" },
//!   "_unmapped_": { "<unknown field>": "value" }
//! }
//! ```

pub mod checksum;
pub mod compatibility;
pub mod config;
pub mod error;
pub mod locate;
pub mod registry;
pub mod schema;
pub mod service;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod table;
pub mod transform;
pub mod version;

pub use checksum::Checksum;
pub use compatibility::{ChangeAnalyzer, ChangeReport, ChangeType, FieldChange};
pub use config::ServiceConfig;
pub use error::{Result, TemplateError};
pub use locate::{FieldLocation, FieldLocator};
pub use registry::{TemplateVersionStore, VersionFilter};
pub use schema::{Field, FieldKind, Section, Tab, TemplateDefinition};
pub use service::{Structured, TemplateService};
pub use snapshot::{SnapshotStore, TemplateSnapshot};
pub use source::{SchemaSource, StaticSource, VersionStoreSource};
pub use store::{DocumentStore, Filter, MemoryDocumentStore, StoreError, Update};
pub use table::{TableDefinition, TableMatch, TableRules};
pub use transform::Transformer;
pub use version::{Bump, TemplateVersion};

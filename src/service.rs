//! Template service
//!
//! The surface offered to the report-management layer: version lookups and
//! publishing, snapshot capture, and structuring of flat submissions.

use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::compatibility::{ChangeAnalyzer, ChangeReport};
use crate::config::ServiceConfig;
use crate::error::{Result, TemplateError};
use crate::locate::FieldLocator;
use crate::registry::TemplateVersionStore;
use crate::schema::TemplateDefinition;
use crate::snapshot::{SnapshotStore, TemplateSnapshot};
use crate::source::{SchemaSource, VersionStoreSource};
use crate::store::DocumentStore;
use crate::transform::Transformer;
use crate::version::{Bump, TemplateVersion};

/// Version given to the first publish of a template through [`TemplateService::publish_next`]
pub const INITIAL_VERSION: Version = Version::new(1, 0, 0);

/// Hierarchical data produced for one flat submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Structured {
    pub data: Map<String, Value>,
    /// True when the template could not be fetched and only common fields were placed
    pub degraded: bool,
}

pub struct TemplateService {
    versions: Arc<TemplateVersionStore>,
    snapshots: SnapshotStore,
    source: Arc<dyn SchemaSource>,
    transformer: Transformer,
    analyzer: ChangeAnalyzer,
    common_fields: Vec<String>,
    fetch_timeout: Duration,
    max_retries: u32,
}

impl TemplateService {
    /// Open the service over `store`, fetching schemas from its own version store
    pub async fn open(store: Arc<dyn DocumentStore>, config: &ServiceConfig) -> Result<Self> {
        let max_retries = config.versions.max_publish_retries;
        let versions = Arc::new(TemplateVersionStore::open(Arc::clone(&store), max_retries).await?);
        let snapshots = SnapshotStore::open(store, Arc::clone(&versions)).await?;
        let source: Arc<dyn SchemaSource> = Arc::new(VersionStoreSource::new(Arc::clone(&versions)));

        Ok(Self {
            versions,
            snapshots,
            source,
            transformer: Transformer::new(config.transform.to_rules()),
            analyzer: ChangeAnalyzer::new(),
            common_fields: config.transform.common_fields.clone(),
            fetch_timeout: config.source.fetch_timeout(),
            max_retries,
        })
    }

    /// Fetch schemas for structuring from `source` instead
    pub fn with_source(mut self, source: Arc<dyn SchemaSource>) -> Self {
        self.source = source;
        self
    }

    pub fn versions(&self) -> &TemplateVersionStore {
        &self.versions
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub async fn get_latest_version(&self, template_id: &str) -> Result<Version> {
        Ok(self.versions.get_latest(template_id).await?.version)
    }

    async fn current_latest(&self, template_id: &str) -> Result<Option<TemplateVersion>> {
        match self.versions.get_latest(template_id).await {
            Ok(latest) => Ok(Some(latest)),
            Err(TemplateError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Publish `definition` as `version`, recording its changes from the current latest
    pub async fn publish(
        &self,
        template_id: &str,
        version: Version,
        definition: TemplateDefinition,
    ) -> Result<TemplateVersion> {
        let changeset = self.current_latest(template_id).await?.map(|latest| {
            self.analyzer.diff(
                template_id,
                (&latest.version, &latest.definition),
                (&version, &definition),
            )
        });
        self.versions
            .create_version(template_id, version, definition, changeset)
            .await
    }

    /// Publish `definition` under the smallest version bump its changes allow.
    ///
    /// When another publisher takes the computed version first, the latest is
    /// re-read and the bump recomputed, up to the configured retry budget.
    pub async fn publish_next(&self, template_id: &str, definition: TemplateDefinition) -> Result<TemplateVersion> {
        for attempt in 0..=self.max_retries {
            let highest = self.versions.highest_version(template_id).await?;
            let (version, changeset) = match self.current_latest(template_id).await? {
                None => match highest {
                    Some(highest) => (Bump::Major.apply(&highest), None),
                    None => (INITIAL_VERSION, None),
                },
                Some(latest) => {
                    let mut report = self.analyzer.diff(
                        template_id,
                        (&latest.version, &latest.definition),
                        (&latest.version, &definition),
                    );
                    // Deprecated or abandoned versions above the latest still count.
                    let base = highest.map_or(latest.version.clone(), |h| h.max(latest.version.clone()));
                    let next = Bump::for_changes(&report).apply(&base);
                    report.to_version = next.clone();
                    (next, Some(report))
                }
            };

            match self
                .versions
                .create_version(template_id, version, definition.clone(), changeset)
                .await
            {
                Err(TemplateError::AlreadyExists { .. }) | Err(TemplateError::InvalidVersion(_)) => {
                    tracing::debug!(template_id = %template_id, attempt, "version taken concurrently; recomputing");
                }
                other => return other,
            }
        }

        Err(TemplateError::Conflict(format!(
            "could not publish next version of {} after {} attempts",
            template_id,
            self.max_retries + 1
        )))
    }

    pub async fn deprecate_version(&self, template_id: &str, version: &Version) -> Result<()> {
        self.versions.deprecate(template_id, version).await
    }

    pub async fn capture_snapshot<S: AsRef<str>>(&self, template_ids: &[S]) -> Result<String> {
        self.snapshots.capture(template_ids).await
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<TemplateSnapshot> {
        self.snapshots.get(snapshot_id).await
    }

    pub async fn add_report_reference(&self, snapshot_id: &str, report_id: &str) {
        self.snapshots.add_report_reference(snapshot_id, report_id).await
    }

    pub async fn remove_report_reference(&self, snapshot_id: &str, report_id: &str) {
        self.snapshots.remove_report_reference(snapshot_id, report_id).await
    }

    /// Structure a flat submission by the bank's current template.
    ///
    /// A schema source that is unreachable or slower than the fetch timeout
    /// yields a degraded structuring instead of an error. Unknown templates
    /// and malformed definitions are still errors.
    pub async fn transform_to_hierarchical(
        &self,
        flat: &Map<String, Value>,
        bank_code: &str,
        template_id: &str,
    ) -> Result<Structured> {
        let fetched = tokio::time::timeout(self.fetch_timeout, self.source.fetch(bank_code, template_id)).await;

        let (locator, degraded) = match fetched {
            Ok(Ok(definition)) => (FieldLocator::build(&definition, &self.common_fields), false),
            Ok(Err(e)) if e.is_transient() => {
                tracing::warn!(
                    bank_code = %bank_code,
                    template_id = %template_id,
                    error = %e,
                    "schema fetch failed; structuring with common fields only"
                );
                (FieldLocator::degraded(&self.common_fields), true)
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::warn!(
                    bank_code = %bank_code,
                    template_id = %template_id,
                    timeout_ms = self.fetch_timeout.as_millis() as u64,
                    "schema fetch timed out; structuring with common fields only"
                );
                (FieldLocator::degraded(&self.common_fields), true)
            }
        };

        Ok(Structured {
            data: self.transformer.forward(flat, &locator),
            degraded,
        })
    }

    /// Structure a flat submission by the templates frozen in a snapshot
    pub async fn transform_with_snapshot(
        &self,
        flat: &Map<String, Value>,
        snapshot_id: &str,
    ) -> Result<Structured> {
        let definition = self.snapshots.get(snapshot_id).await?.merged_definition()?;
        let locator = FieldLocator::build(&definition, &self.common_fields);
        Ok(Structured {
            data: self.transformer.forward(flat, &locator),
            degraded: false,
        })
    }

    pub fn flatten_hierarchical(&self, hierarchical: &Map<String, Value>) -> Map<String, Value> {
        Transformer::reverse(hierarchical)
    }

    /// Compare two stored versions of a template
    pub async fn compare_versions(&self, template_id: &str, from: &Version, to: &Version) -> Result<ChangeReport> {
        let from = self.versions.get_by_version(template_id, from).await?;
        let to = self.versions.get_by_version(template_id, to).await?;
        self.analyzer.compare(&from, &to)
    }
}

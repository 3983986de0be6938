//! Template Snapshot Store
//!
//! A snapshot freezes the definitions of a set of templates as they were
//! when a report was created, so the report stays interpretable after the
//! templates evolve. Snapshots are content-addressed: identical bundles share
//! one stored snapshot, found by the hash of their sorted definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksum::Checksum;
use crate::error::{Result, TemplateError};
use crate::registry::TemplateVersionStore;
use crate::schema::{bundle_json, TemplateDefinition};
use crate::store::{DocumentStore, Filter, StoreError, Update, ID_FIELD};

/// Collection of snapshots, unique on contentHash
pub const SNAPSHOTS_COLLECTION: &str = "template_snapshots";

const HASH_FIELD: &str = "contentHash";
const REFERENCES_FIELD: &str = "referencedByReports";

/// An immutable bundle of template definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSnapshot {
    #[serde(rename = "_id")]
    pub id: String,
    pub content_hash: Checksum,
    pub template_ids: Vec<String>,
    /// Version of each template at capture time
    pub versions: BTreeMap<String, Version>,
    pub definitions: BTreeMap<String, TemplateDefinition>,
    /// The only part of a snapshot that changes after creation
    #[serde(default)]
    pub referenced_by_reports: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl TemplateSnapshot {
    /// Recompute the content hash over the stored definitions
    pub fn verify(&self) -> bool {
        bundle_json(&self.definitions)
            .is_ok_and(|bundle| Checksum::of_bundle(&bundle) == self.content_hash)
    }

    /// All definitions merged into one, for structuring records
    pub fn merged_definition(&self) -> Result<TemplateDefinition> {
        TemplateDefinition::merge(self.definitions.values())
    }
}

fn snapshot_id(doc: &Value) -> Result<String> {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| TemplateError::Transient(format!("snapshot document without {}", ID_FIELD)))
}

/// Deduplicating snapshot storage over a [`DocumentStore`]
pub struct SnapshotStore {
    store: Arc<dyn DocumentStore>,
    versions: Arc<TemplateVersionStore>,
}

impl SnapshotStore {
    /// Open the store, creating the unique index on the content hash
    pub async fn open(store: Arc<dyn DocumentStore>, versions: Arc<TemplateVersionStore>) -> Result<Self> {
        store
            .ensure_unique_index(SNAPSHOTS_COLLECTION, &[HASH_FIELD])
            .await?;
        Ok(Self { store, versions })
    }

    async fn find_by_hash(&self, hash: &Checksum) -> Result<Option<Value>> {
        Ok(self
            .store
            .find_one(SNAPSHOTS_COLLECTION, &Filter::new().eq(HASH_FIELD, hash.as_str()))
            .await?)
    }

    /// Snapshot the latest active definitions of `template_ids`.
    ///
    /// Returns the id of the existing snapshot when an identical bundle was
    /// captured before, including by a concurrent caller.
    pub async fn capture<S: AsRef<str>>(&self, template_ids: &[S]) -> Result<String> {
        let ids: BTreeSet<&str> = template_ids.iter().map(AsRef::as_ref).collect();
        if ids.is_empty() {
            return Err(TemplateError::InvalidRequest(
                "a snapshot needs at least one template".to_string(),
            ));
        }

        let mut versions = BTreeMap::new();
        let mut definitions = BTreeMap::new();
        for id in &ids {
            let latest = self.versions.get_latest(id).await?;
            versions.insert(id.to_string(), latest.version);
            definitions.insert(id.to_string(), latest.definition);
        }
        let content_hash = Checksum::of_bundle(&bundle_json(&definitions)?);

        if let Some(existing) = self.find_by_hash(&content_hash).await? {
            tracing::debug!(content_hash = %content_hash, "reusing existing snapshot");
            return snapshot_id(&existing);
        }

        let snapshot = TemplateSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            content_hash: content_hash.clone(),
            template_ids: ids.iter().map(|id| id.to_string()).collect(),
            versions,
            definitions,
            referenced_by_reports: BTreeSet::new(),
            created_at: Utc::now(),
        };

        match self
            .store
            .insert_one(SNAPSHOTS_COLLECTION, serde_json::to_value(&snapshot)?)
            .await
        {
            Ok(id) => {
                tracing::info!(snapshot_id = %id, content_hash = %content_hash, "captured template snapshot");
                Ok(id)
            }
            Err(StoreError::DuplicateKey { .. }) => {
                // Lost the race to an identical bundle; hand back the winner.
                let winner = self.find_by_hash(&content_hash).await?.ok_or_else(|| {
                    TemplateError::Transient(format!(
                        "snapshot {} reported duplicate but was not found",
                        content_hash
                    ))
                })?;
                snapshot_id(&winner)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, snapshot_id: &str) -> Result<TemplateSnapshot> {
        let doc = self
            .store
            .find_one(SNAPSHOTS_COLLECTION, &Filter::new().eq(ID_FIELD, snapshot_id))
            .await?
            .ok_or_else(|| TemplateError::not_found("snapshot", snapshot_id))?;
        Ok(serde_json::from_value(doc)?)
    }

    /// Record that a report uses a snapshot. Failures are logged, not returned.
    pub async fn add_report_reference(&self, snapshot_id: &str, report_id: &str) {
        let update = Update::new().add_to_set(REFERENCES_FIELD, report_id);
        self.update_references(snapshot_id, report_id, update, "add").await;
    }

    /// Record that a report no longer uses a snapshot. Failures are logged, not returned.
    pub async fn remove_report_reference(&self, snapshot_id: &str, report_id: &str) {
        let update = Update::new().pull(REFERENCES_FIELD, report_id);
        self.update_references(snapshot_id, report_id, update, "remove").await;
    }

    async fn update_references(&self, snapshot_id: &str, report_id: &str, update: Update, action: &str) {
        let filter = Filter::new().eq(ID_FIELD, snapshot_id);
        match self.store.update_one(SNAPSHOTS_COLLECTION, &filter, &update).await {
            Ok(0) => tracing::warn!(
                snapshot_id = %snapshot_id,
                report_id = %report_id,
                action,
                "snapshot not found for reference update"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(
                snapshot_id = %snapshot_id,
                report_id = %report_id,
                action,
                error = %e,
                "failed to update snapshot references"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use serde_json::json;

    fn definition(template_id: &str, field: &str) -> TemplateDefinition {
        TemplateDefinition::from_json(&json!({
            "templateId": template_id,
            "tabs": [{ "id": template_id, "fields": [ { "id": field } ] }]
        }))
        .unwrap()
    }

    async fn stores() -> (Arc<TemplateVersionStore>, SnapshotStore) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let versions = Arc::new(TemplateVersionStore::open(Arc::clone(&store), 5).await.unwrap());
        versions
            .create_version("valuation", Version::new(1, 0, 0), definition("valuation", "f1"), None)
            .await
            .unwrap();
        versions
            .create_version("legal", Version::new(1, 0, 0), definition("legal", "g1"), None)
            .await
            .unwrap();
        let snapshots = SnapshotStore::open(store, Arc::clone(&versions)).await.unwrap();
        (versions, snapshots)
    }

    #[tokio::test]
    async fn test_capture_is_idempotent_and_order_independent() {
        let (_, snapshots) = stores().await;
        let first = snapshots.capture(&["valuation", "legal"]).await.unwrap();
        let second = snapshots.capture(&["legal", "valuation", "legal"]).await.unwrap();
        assert_eq!(first, second);

        let snapshot = snapshots.get(&first).await.unwrap();
        assert_eq!(snapshot.template_ids, vec!["legal", "valuation"]);
        assert_eq!(snapshot.versions["valuation"], Version::new(1, 0, 0));
        assert!(snapshot.referenced_by_reports.is_empty());
        assert!(snapshot.verify());
    }

    #[tokio::test]
    async fn test_new_version_yields_new_snapshot() {
        let (versions, snapshots) = stores().await;
        let before = snapshots.capture(&["valuation"]).await.unwrap();

        versions
            .create_version("valuation", Version::new(1, 1, 0), definition("valuation", "f2"), None)
            .await
            .unwrap();
        let after = snapshots.capture(&["valuation"]).await.unwrap();
        assert_ne!(before, after);

        // The old snapshot still describes the old definition.
        let old = snapshots.get(&before).await.unwrap();
        assert_eq!(old.definitions["valuation"].field_ids(), vec!["f1"]);
    }

    #[tokio::test]
    async fn test_missing_template_and_snapshot() {
        let (_, snapshots) = stores().await;
        let err = snapshots.capture(&["valuation", "nope"]).await.unwrap_err();
        assert!(matches!(err, TemplateError::NotFound { .. }));

        let err = snapshots.get("no-such-snapshot").await.unwrap_err();
        assert!(err.to_string().contains("no-such-snapshot"));

        let empty: [&str; 0] = [];
        assert!(matches!(
            snapshots.capture(&empty).await,
            Err(TemplateError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_report_references_are_set_operations() {
        let (_, snapshots) = stores().await;
        let id = snapshots.capture(&["valuation"]).await.unwrap();

        snapshots.add_report_reference(&id, "r1").await;
        snapshots.add_report_reference(&id, "r1").await;
        snapshots.add_report_reference(&id, "r2").await;
        snapshots.remove_report_reference(&id, "r2").await;
        snapshots.remove_report_reference(&id, "r2").await;
        // Unknown snapshots are tolerated.
        snapshots.add_report_reference("missing", "r1").await;

        let snapshot = snapshots.get(&id).await.unwrap();
        let refs: Vec<&str> = snapshot.referenced_by_reports.iter().map(String::as_str).collect();
        assert_eq!(refs, vec!["r1"]);
        assert!(snapshot.verify());
    }

    #[tokio::test]
    async fn test_merged_definition() {
        let (_, snapshots) = stores().await;
        let id = snapshots.capture(&["valuation", "legal"]).await.unwrap();
        let merged = snapshots.get(&id).await.unwrap().merged_definition().unwrap();
        assert_eq!(merged.field_ids(), vec!["g1", "f1"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_capture_stores_one_snapshot() {
        let (_, snapshots) = stores().await;
        let snapshots = Arc::new(snapshots);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let snapshots = Arc::clone(&snapshots);
            handles.push(tokio::spawn(async move {
                snapshots.capture(&["valuation", "legal"]).await
            }));
        }
        let mut ids = BTreeSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }
        assert_eq!(ids.len(), 1);

        let stored = snapshots
            .store
            .find_many(SNAPSHOTS_COLLECTION, &Filter::new())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }
}

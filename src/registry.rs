//! Template Version Store
//!
//! Append-only storage of template versions. Versions are never deleted,
//! only deprecated. The latest version of each template is named by a single
//! head record, advanced by compare-and-set on its revision, so concurrent
//! publishers can never leave two versions marked latest.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compatibility::ChangeReport;
use crate::error::{Result, TemplateError};
use crate::schema::TemplateDefinition;
use crate::store::{DocumentStore, Filter, StoreError, Update};
use crate::version::TemplateVersion;

/// Collection of version documents, unique on (template_id, version)
pub const VERSIONS_COLLECTION: &str = "template_versions";
/// Collection of latest pointers, unique on template_id
pub const HEADS_COLLECTION: &str = "template_heads";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRecord {
    template_id: String,
    version: Version,
    is_active: bool,
    definition: TemplateDefinition,
    changeset: Option<ChangeReport>,
    previous_version: Option<Version>,
    created_at: DateTime<Utc>,
}

impl VersionRecord {
    fn into_version(self, latest: Option<&Version>) -> TemplateVersion {
        TemplateVersion {
            is_latest: latest == Some(&self.version),
            template_id: self.template_id,
            version: self.version,
            is_active: self.is_active,
            definition: self.definition,
            changeset: self.changeset,
            previous_version: self.previous_version,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeadRecord {
    template_id: String,
    latest_version: Option<Version>,
    /// Highest version ever claimed, deprecated or not
    #[serde(default)]
    highest_version: Option<Version>,
    revision: i64,
}

impl HeadRecord {
    fn highest(&self) -> Option<Version> {
        self.highest_version
            .iter()
            .chain(self.latest_version.iter())
            .max()
            .cloned()
    }
}

fn not_newer(template_id: &str, version: &Version, highest: &Version) -> TemplateError {
    if version == highest {
        TemplateError::AlreadyExists {
            template_id: template_id.to_string(),
            version: version.to_string(),
        }
    } else {
        TemplateError::InvalidVersion(format!(
            "{} is not newer than {} of {}",
            version, highest, template_id
        ))
    }
}

/// Selection for [`TemplateVersionStore::list_active`]
#[derive(Debug, Clone, Default)]
pub struct VersionFilter {
    pub template_id: Option<String>,
    pub latest_only: bool,
}

impl VersionFilter {
    pub fn template(template_id: impl Into<String>) -> Self {
        Self {
            template_id: Some(template_id.into()),
            latest_only: false,
        }
    }

    pub fn latest_only(mut self) -> Self {
        self.latest_only = true;
        self
    }
}

fn decode<T: DeserializeOwned>(doc: Value) -> Result<T> {
    Ok(serde_json::from_value(doc)?)
}

/// Versioned template storage over a [`DocumentStore`]
pub struct TemplateVersionStore {
    store: Arc<dyn DocumentStore>,
    max_retries: u32,
}

impl TemplateVersionStore {
    /// Open the store, creating its unique indexes
    pub async fn open(store: Arc<dyn DocumentStore>, max_retries: u32) -> Result<Self> {
        store
            .ensure_unique_index(VERSIONS_COLLECTION, &["template_id", "version"])
            .await?;
        store
            .ensure_unique_index(HEADS_COLLECTION, &["template_id"])
            .await?;
        Ok(Self { store, max_retries })
    }

    async fn head(&self, template_id: &str) -> Result<Option<HeadRecord>> {
        let doc = self
            .store
            .find_one(HEADS_COLLECTION, &Filter::new().eq("template_id", template_id))
            .await?;
        doc.map(decode).transpose()
    }

    async fn record(&self, template_id: &str, version: &Version) -> Result<Option<VersionRecord>> {
        let doc = self
            .store
            .find_one(
                VERSIONS_COLLECTION,
                &Filter::new()
                    .eq("template_id", template_id)
                    .eq("version", version.to_string()),
            )
            .await?;
        doc.map(decode).transpose()
    }

    /// The latest active version of a template
    pub async fn get_latest(&self, template_id: &str) -> Result<TemplateVersion> {
        let latest = self
            .head(template_id)
            .await?
            .and_then(|head| head.latest_version)
            .ok_or_else(|| TemplateError::not_found("template", template_id))?;

        match self.record(template_id, &latest).await? {
            Some(record) if record.is_active => Ok(record.into_version(Some(&latest))),
            _ => Err(TemplateError::not_found("template", template_id)),
        }
    }

    /// Highest version ever claimed for a template, deprecated ones included
    pub async fn highest_version(&self, template_id: &str) -> Result<Option<Version>> {
        Ok(self.head(template_id).await?.and_then(|head| head.highest()))
    }

    /// A specific version of a template, active or deprecated
    pub async fn get_by_version(&self, template_id: &str, version: &Version) -> Result<TemplateVersion> {
        let record = self.record(template_id, version).await?.ok_or_else(|| {
            TemplateError::not_found("template version", format!("{}@{}", template_id, version))
        })?;
        let latest = self.head(template_id).await?.and_then(|h| h.latest_version);
        Ok(record.into_version(latest.as_ref()))
    }

    /// Publish a new version and make it the latest.
    ///
    /// The version must be newer than every version ever published for the
    /// template, deprecated ones included. It is claimed on the head record
    /// before anything is written, so a publisher overtaken by a newer
    /// version fails instead of storing an older one.
    pub async fn create_version(
        &self,
        template_id: &str,
        version: Version,
        definition: TemplateDefinition,
        changeset: Option<ChangeReport>,
    ) -> Result<TemplateVersion> {
        let previous = self.claim(template_id, &version).await?;

        // A newer version claimed since ours leaves ours behind; store nothing.
        if let Some(highest) = self.head(template_id).await?.and_then(|h| h.highest()) {
            if highest != version {
                return Err(not_newer(template_id, &version, &highest));
            }
        }

        let record = VersionRecord {
            template_id: template_id.to_string(),
            version: version.clone(),
            is_active: true,
            definition,
            changeset,
            previous_version: previous,
            created_at: Utc::now(),
        };
        match self
            .store
            .insert_one(VERSIONS_COLLECTION, serde_json::to_value(&record)?)
            .await
        {
            Ok(_) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                return Err(TemplateError::AlreadyExists {
                    template_id: template_id.to_string(),
                    version: version.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        let latest = self.advance_head(template_id, &version).await?;
        tracing::info!(
            template_id = %template_id,
            version = %version,
            is_latest = latest.as_ref() == Some(&version),
            "published template version"
        );
        Ok(record.into_version(latest.as_ref()))
    }

    /// Record `version` as the highest claimed version of the template.
    ///
    /// Returns the latest version at the moment of the claim.
    async fn claim(&self, template_id: &str, version: &Version) -> Result<Option<Version>> {
        for attempt in 0..=self.max_retries {
            match self.head(template_id).await? {
                None => {
                    let head = HeadRecord {
                        template_id: template_id.to_string(),
                        latest_version: None,
                        highest_version: Some(version.clone()),
                        revision: 1,
                    };
                    match self
                        .store
                        .insert_one(HEADS_COLLECTION, serde_json::to_value(&head)?)
                        .await
                    {
                        Ok(_) => return Ok(None),
                        Err(StoreError::DuplicateKey { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(head) => {
                    if let Some(highest) = head.highest() {
                        if highest >= *version {
                            return Err(not_newer(template_id, version, &highest));
                        }
                    }
                    let guarded = Filter::new()
                        .eq("template_id", template_id)
                        .eq("revision", head.revision);
                    let update = Update::new()
                        .set("highest_version", version.to_string())
                        .inc("revision", 1);
                    if self.store.update_one(HEADS_COLLECTION, &guarded, &update).await? == 1 {
                        return Ok(head.latest_version);
                    }
                }
            }
            tracing::debug!(template_id = %template_id, attempt, "head moved while claiming; retrying");
        }

        Err(TemplateError::Conflict(format!(
            "could not claim version {} of {} after {} attempts",
            version,
            template_id,
            self.max_retries + 1
        )))
    }

    /// Point the head at `target` unless a newer version already holds it.
    ///
    /// Returns the version the head names afterwards.
    async fn advance_head(&self, template_id: &str, target: &Version) -> Result<Option<Version>> {
        for attempt in 0..=self.max_retries {
            let head = self.head(template_id).await?.ok_or_else(|| {
                TemplateError::Transient(format!("head of {} missing after claim", template_id))
            })?;
            if head.latest_version.as_ref().is_some_and(|current| current >= target) {
                return Ok(head.latest_version);
            }
            let guarded = Filter::new()
                .eq("template_id", template_id)
                .eq("revision", head.revision);
            let update = Update::new()
                .set("latest_version", target.to_string())
                .inc("revision", 1);
            if self.store.update_one(HEADS_COLLECTION, &guarded, &update).await? == 1 {
                return Ok(Some(target.clone()));
            }
            tracing::debug!(template_id = %template_id, attempt, "latest pointer moved; retrying");
        }

        Err(TemplateError::Conflict(format!(
            "could not advance latest version of {} after {} attempts",
            template_id,
            self.max_retries + 1
        )))
    }

    /// Deprecate a version. A deprecated latest hands the pointer to the
    /// highest remaining active version.
    pub async fn deprecate(&self, template_id: &str, version: &Version) -> Result<()> {
        let matched = self
            .store
            .update_one(
                VERSIONS_COLLECTION,
                &Filter::new()
                    .eq("template_id", template_id)
                    .eq("version", version.to_string()),
                &Update::new().set("is_active", false),
            )
            .await?;
        if matched == 0 {
            return Err(TemplateError::not_found(
                "template version",
                format!("{}@{}", template_id, version),
            ));
        }

        for _ in 0..=self.max_retries {
            let Some(head) = self.head(template_id).await? else {
                return Ok(());
            };
            if head.latest_version.as_ref() != Some(version) {
                return Ok(());
            }

            let fallback = self
                .list_active(&VersionFilter::template(template_id))
                .await?
                .into_iter()
                .map(|v| v.version)
                .max();
            let guarded = Filter::new()
                .eq("template_id", template_id)
                .eq("revision", head.revision);
            let update = Update::new()
                .set("latest_version", serde_json::to_value(&fallback)?)
                .inc("revision", 1);
            if self.store.update_one(HEADS_COLLECTION, &guarded, &update).await? == 1 {
                tracing::info!(
                    template_id = %template_id,
                    deprecated = %version,
                    latest = ?fallback.map(|v| v.to_string()),
                    "deprecated latest template version"
                );
                return Ok(());
            }
        }

        Err(TemplateError::Conflict(format!(
            "could not move latest version of {} off deprecated {}",
            template_id, version
        )))
    }

    async fn heads(&self, template_id: Option<&str>) -> Result<HashMap<String, Version>> {
        let filter = match template_id {
            Some(id) => Filter::new().eq("template_id", id),
            None => Filter::new(),
        };
        let mut latest = HashMap::new();
        for doc in self.store.find_many(HEADS_COLLECTION, &filter).await? {
            let head: HeadRecord = decode(doc)?;
            if let Some(version) = head.latest_version {
                latest.insert(head.template_id, version);
            }
        }
        Ok(latest)
    }

    async fn list(&self, filter: Filter, template_id: Option<&str>) -> Result<Vec<TemplateVersion>> {
        let heads = self.heads(template_id).await?;
        let mut versions = self
            .store
            .find_many(VERSIONS_COLLECTION, &filter)
            .await?
            .into_iter()
            .map(|doc| {
                let record: VersionRecord = decode(doc)?;
                let latest = heads.get(&record.template_id);
                Ok(record.into_version(latest))
            })
            .collect::<Result<Vec<_>>>()?;
        versions.sort();
        Ok(versions)
    }

    /// Active versions, sorted by template id then version
    pub async fn list_active(&self, filter: &VersionFilter) -> Result<Vec<TemplateVersion>> {
        let mut query = Filter::new().eq("is_active", true);
        if let Some(id) = &filter.template_id {
            query = query.eq("template_id", id.as_str());
        }
        let mut versions = self.list(query, filter.template_id.as_deref()).await?;
        if filter.latest_only {
            versions.retain(|v| v.is_latest);
        }
        Ok(versions)
    }

    /// Every version of a template, deprecated ones included
    pub async fn list_versions(&self, template_id: &str) -> Result<Vec<TemplateVersion>> {
        self.list(Filter::new().eq("template_id", template_id), Some(template_id))
            .await
    }
}

//! Schema sources consulted when structuring a record

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, TemplateError};
use crate::registry::TemplateVersionStore;
use crate::schema::TemplateDefinition;

/// Where the transformer gets the definition for a record.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Fetch the definition in force for a bank's template.
    ///
    /// `NotFound` and `Structural` errors are surfaced to the caller; transient
    /// errors send the transform down the degraded path.
    async fn fetch(&self, bank_code: &str, template_id: &str) -> Result<TemplateDefinition>;
}

/// Serves the latest active version from a [`TemplateVersionStore`]
pub struct VersionStoreSource {
    versions: Arc<TemplateVersionStore>,
}

impl VersionStoreSource {
    pub fn new(versions: Arc<TemplateVersionStore>) -> Self {
        Self { versions }
    }
}

#[async_trait]
impl SchemaSource for VersionStoreSource {
    async fn fetch(&self, bank_code: &str, template_id: &str) -> Result<TemplateDefinition> {
        tracing::debug!(bank_code = %bank_code, template_id = %template_id, "fetching latest template");
        Ok(self.versions.get_latest(template_id).await?.definition)
    }
}

/// Fixed definitions, registered per bank or for every bank
#[derive(Default)]
pub struct StaticSource {
    by_bank: HashMap<(String, String), TemplateDefinition>,
    shared: HashMap<String, TemplateDefinition>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `definition` for `template_id` regardless of bank
    pub fn with_template(mut self, template_id: impl Into<String>, definition: TemplateDefinition) -> Self {
        self.shared.insert(template_id.into(), definition);
        self
    }

    /// Serve `definition` for `template_id` of one bank only
    pub fn with_bank_template(
        mut self,
        bank_code: impl Into<String>,
        template_id: impl Into<String>,
        definition: TemplateDefinition,
    ) -> Self {
        self.by_bank
            .insert((bank_code.into(), template_id.into()), definition);
        self
    }
}

#[async_trait]
impl SchemaSource for StaticSource {
    async fn fetch(&self, bank_code: &str, template_id: &str) -> Result<TemplateDefinition> {
        self.by_bank
            .get(&(bank_code.to_string(), template_id.to_string()))
            .or_else(|| self.shared.get(template_id))
            .cloned()
            .ok_or_else(|| TemplateError::not_found("template", format!("{}/{}", bank_code, template_id)))
    }
}

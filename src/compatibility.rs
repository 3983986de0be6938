//! Template change analysis
//!
//! Diffs two template versions field by field and decides whether records
//! captured under the old version can be migrated automatically.

use std::collections::{BTreeMap, BTreeSet};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TemplateError};
use crate::locate::{FieldLocation, FieldLocator};
use crate::schema::{Field, FieldKind, TemplateDefinition};
use crate::version::TemplateVersion;

/// Type of field change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// A new field was added
    FieldAdded,
    /// A field was removed
    FieldRemoved,
    /// A field's definition changed
    FieldModified,
    /// A field moved to another tab, section or group
    FieldMoved,
}

impl ChangeType {
    /// Check if this change type breaks records captured under the old version
    pub fn is_breaking(&self) -> bool {
        !matches!(self, ChangeType::FieldAdded)
    }
}

/// A detected change of one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub change_type: ChangeType,
    pub field_id: String,
    /// Human-readable description
    pub description: String,
}

/// Result of comparing two versions of one template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReport {
    pub template_id: String,
    pub from_version: Version,
    pub to_version: Version,
    pub fields_added: Vec<String>,
    pub fields_removed: Vec<String>,
    pub fields_modified: Vec<String>,
    pub has_breaking_changes: bool,
    pub can_auto_migrate: bool,
    pub changes: Vec<FieldChange>,
    pub summary: String,
}

impl ChangeReport {
    /// A report with no changes
    pub fn empty(template_id: impl Into<String>, from_version: Version, to_version: Version) -> Self {
        Self {
            template_id: template_id.into(),
            from_version,
            to_version,
            fields_added: Vec::new(),
            fields_removed: Vec::new(),
            fields_modified: Vec::new(),
            has_breaking_changes: false,
            can_auto_migrate: true,
            changes: Vec::new(),
            summary: "No changes detected".to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// A field's own attributes, without the members of a group.
///
/// Members are compared as fields in their own right, so a group only
/// changes when its label, type, requiredness or kind does.
#[derive(Debug, PartialEq)]
struct FieldAttributes<'a> {
    label: Option<&'a str>,
    field_type: &'a str,
    required: bool,
    kind: &'static str,
}

impl<'a> From<&'a Field> for FieldAttributes<'a> {
    fn from(field: &'a Field) -> Self {
        Self {
            label: field.label.as_deref(),
            field_type: &field.field_type,
            required: field.required,
            kind: match field.kind {
                FieldKind::Plain => "plain",
                FieldKind::Group { .. } => "group",
                FieldKind::Table => "table",
            },
        }
    }
}

/// A field as seen by the analyzer: its attributes plus where it lives
#[derive(Debug, PartialEq)]
struct FieldShape<'a> {
    attributes: FieldAttributes<'a>,
    location: Option<&'a FieldLocation>,
}

fn field_shapes<'a>(
    definition: &'a TemplateDefinition,
    locator: &'a FieldLocator,
) -> BTreeMap<&'a str, FieldShape<'a>> {
    let mut shapes = BTreeMap::new();
    let all_fields = definition.tabs.iter().flat_map(|tab| {
        tab.fields
            .iter()
            .chain(tab.sections.iter().flat_map(|s| s.fields.iter()))
    });
    for field in all_fields {
        for f in std::iter::once(field).chain(field.sub_fields()) {
            shapes.insert(
                f.id.as_str(),
                FieldShape {
                    attributes: FieldAttributes::from(f),
                    location: locator.locate(&f.id),
                },
            );
        }
    }
    shapes
}

/// Field-level change analyzer
pub struct ChangeAnalyzer {
    /// Strict mode - added fields count as breaking too
    strict_mode: bool,
}

impl ChangeAnalyzer {
    pub fn new() -> Self {
        Self { strict_mode: false }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict_mode = true;
        self
    }

    /// Compare two stored versions of the same template
    pub fn compare(&self, from: &TemplateVersion, to: &TemplateVersion) -> Result<ChangeReport> {
        if from.template_id != to.template_id {
            return Err(TemplateError::Conflict(format!(
                "cannot compare versions of different templates ({} and {})",
                from.template_id, to.template_id
            )));
        }
        Ok(self.diff(
            &from.template_id,
            (&from.version, &from.definition),
            (&to.version, &to.definition),
        ))
    }

    /// Compare two definitions directly
    pub fn diff(
        &self,
        template_id: &str,
        (from_version, old): (&Version, &TemplateDefinition),
        (to_version, new): (&Version, &TemplateDefinition),
    ) -> ChangeReport {
        let old_locator = FieldLocator::build(old, &[]);
        let new_locator = FieldLocator::build(new, &[]);
        let old_shapes = field_shapes(old, &old_locator);
        let new_shapes = field_shapes(new, &new_locator);

        let old_ids: BTreeSet<&str> = old_shapes.keys().copied().collect();
        let new_ids: BTreeSet<&str> = new_shapes.keys().copied().collect();

        let mut report = ChangeReport::empty(template_id, from_version.clone(), to_version.clone());

        for id in new_ids.difference(&old_ids) {
            report.fields_added.push(id.to_string());
            report.changes.push(FieldChange {
                change_type: ChangeType::FieldAdded,
                field_id: id.to_string(),
                description: format!("Field '{}' was added", id),
            });
        }

        for id in old_ids.difference(&new_ids) {
            report.fields_removed.push(id.to_string());
            report.changes.push(FieldChange {
                change_type: ChangeType::FieldRemoved,
                field_id: id.to_string(),
                description: format!("Field '{}' was removed", id),
            });
        }

        for id in old_ids.intersection(&new_ids) {
            let (before, after) = (&old_shapes[id], &new_shapes[id]);
            if before == after {
                continue;
            }
            report.fields_modified.push(id.to_string());
            let change_type = if before.attributes == after.attributes {
                ChangeType::FieldMoved
            } else {
                ChangeType::FieldModified
            };
            let description = match change_type {
                ChangeType::FieldMoved => format!(
                    "Field '{}' moved from {} to {}",
                    id,
                    describe(before.location),
                    describe(after.location)
                ),
                _ => format!("Field '{}' definition changed", id),
            };
            report.changes.push(FieldChange {
                change_type,
                field_id: id.to_string(),
                description,
            });
        }

        let breaking = report.changes.iter().filter(|c| c.change_type.is_breaking()).count();
        report.has_breaking_changes = if self.strict_mode {
            !report.changes.is_empty()
        } else {
            !report.fields_removed.is_empty() || !report.fields_modified.is_empty()
        };
        report.can_auto_migrate =
            report.fields_removed.is_empty() && report.fields_modified.is_empty();
        report.summary = if report.changes.is_empty() {
            "No changes detected".to_string()
        } else if breaking > 0 {
            format!("{} changes detected, {} breaking", report.changes.len(), breaking)
        } else {
            format!("{} compatible changes detected", report.changes.len())
        };

        report
    }
}

fn describe(location: Option<&FieldLocation>) -> String {
    match location {
        Some(at) => {
            let mut parts = vec![at.tab.as_str()];
            parts.extend(at.section.as_deref());
            parts.extend(at.parent_group.as_deref());
            parts.join("/")
        }
        None => "nowhere".to_string(),
    }
}

impl Default for ChangeAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(fields: serde_json::Value) -> TemplateDefinition {
        TemplateDefinition::from_json(&json!({
            "tabs": [{ "id": "Main", "sections": [ { "id": "s", "fields": fields } ] }]
        }))
        .unwrap()
    }

    fn diff(old: &TemplateDefinition, new: &TemplateDefinition) -> ChangeReport {
        ChangeAnalyzer::new().diff(
            "valuation",
            (&Version::new(1, 0, 0), old),
            (&Version::new(2, 0, 0), new),
        )
    }

    #[test]
    fn test_added_and_removed_fields() {
        let a = definition(json!([{ "id": "f1" }, { "id": "f2" }]));
        let b = definition(json!([{ "id": "f2" }, { "id": "f3" }]));
        let report = diff(&a, &b);

        assert_eq!(report.fields_added, vec!["f3"]);
        assert_eq!(report.fields_removed, vec!["f1"]);
        assert!(report.fields_modified.is_empty());
        assert!(report.has_breaking_changes);
        assert!(!report.can_auto_migrate);
    }

    #[test]
    fn test_addition_only_can_auto_migrate() {
        let a = definition(json!([{ "id": "f1" }]));
        let b = definition(json!([{ "id": "f1" }, { "id": "f2", "type": "number" }]));
        let report = diff(&a, &b);

        assert_eq!(report.fields_added, vec!["f2"]);
        assert!(!report.has_breaking_changes);
        assert!(report.can_auto_migrate);

        let strict = ChangeAnalyzer::new().strict().diff(
            "valuation",
            (&Version::new(1, 0, 0), &a),
            (&Version::new(1, 1, 0), &b),
        );
        assert!(strict.has_breaking_changes);
        assert!(strict.can_auto_migrate);
    }

    #[test]
    fn test_type_change_is_modification() {
        let a = definition(json!([{ "id": "f1", "type": "text" }]));
        let b = definition(json!([{ "id": "f1", "type": "number" }]));
        let report = diff(&a, &b);

        assert_eq!(report.fields_modified, vec!["f1"]);
        assert_eq!(report.changes[0].change_type, ChangeType::FieldModified);
        assert!(!report.can_auto_migrate);
    }

    #[test]
    fn test_group_sub_fields_are_expanded() {
        let a = definition(json!([
            { "id": "coordinates", "type": "group", "subFields": [ { "id": "longitude" } ] }
        ]));
        let b = definition(json!([
            { "id": "coordinates", "type": "group",
              "subFields": [ { "id": "longitude" }, { "id": "latitude" } ] }
        ]));
        let report = diff(&a, &b);

        assert_eq!(report.fields_added, vec!["latitude"]);
        assert!(report.fields_modified.is_empty());
        assert!(!report.has_breaking_changes);
        assert!(report.can_auto_migrate);
    }

    #[test]
    fn test_group_own_attributes_are_compared() {
        let a = definition(json!([
            { "id": "coordinates", "type": "group", "label": "Coordinates",
              "subFields": [ { "id": "longitude" } ] }
        ]));
        let b = definition(json!([
            { "id": "coordinates", "type": "group", "label": "GPS",
              "subFields": [ { "id": "longitude" } ] }
        ]));
        let report = diff(&a, &b);

        assert_eq!(report.fields_modified, vec!["coordinates"]);
        assert_eq!(report.changes[0].change_type, ChangeType::FieldModified);
        assert!(!report.can_auto_migrate);
    }

    #[test]
    fn test_member_moved_between_groups() {
        let a = definition(json!([
            { "id": "gps", "type": "group", "subFields": [ { "id": "longitude" } ] },
            { "id": "grid", "type": "group", "subFields": [ { "id": "easting" } ] }
        ]));
        let b = definition(json!([
            { "id": "gps", "type": "group", "subFields": [ { "id": "easting" } ] },
            { "id": "grid", "type": "group", "subFields": [ { "id": "longitude" } ] }
        ]));
        let report = diff(&a, &b);

        assert_eq!(report.fields_modified, vec!["easting", "longitude"]);
        assert!(report
            .changes
            .iter()
            .all(|c| c.change_type == ChangeType::FieldMoved));
    }

    #[test]
    fn test_moved_field() {
        let a = definition(json!([{ "id": "f1" }]));
        let b = TemplateDefinition::from_json(&json!({
            "tabs": [{ "id": "Main", "sections": [ { "id": "other", "fields": [ { "id": "f1" } ] } ] }]
        }))
        .unwrap();
        let report = diff(&a, &b);

        assert_eq!(report.fields_modified, vec!["f1"]);
        assert_eq!(report.changes[0].change_type, ChangeType::FieldMoved);
        assert!(report.changes[0].description.contains("Main/s"));
    }

    #[test]
    fn test_identical_definitions() {
        let a = definition(json!([{ "id": "f1" }]));
        let report = diff(&a, &a.clone());
        assert!(report.is_empty());
        assert!(report.can_auto_migrate);
        assert_eq!(report.summary, "No changes detected");
    }
}

//! Template definition types
//!
//! Templates arrive as loosely-shaped JSON documents. They are decoded once
//! into a validated tree and rejected early as [`TemplateError::Structural`]
//! when malformed, so later stages never need optional-key lookups.
//!
//! ```text
//! { "templateId": "valuation",
//!   "tabs": [ { "id": "Property Details",
//!               "fields": [ ...tab-level fields... ],
//!               "sections": [ { "id": "part_b",
//!                               "fields": [ { "id": "location", "type": "group",
//!                                             "subFields": [ { "id": "plot_no" } ] } ] } ] } ] }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checksum::Checksum;
use crate::error::{Result, TemplateError};

/// Bucket holding detected dynamic tables
pub const TABLES_KEY: &str = "tables";
/// Bucket holding fields no template location claims
pub const UNMAPPED_KEY: &str = "_unmapped_";
/// Bucket holding template-independent fields
pub const COMMON_KEY: &str = "_common_";

/// Top-level keys of hierarchical data that are never tab ids
pub const RESERVED_KEYS: [&str; 3] = [TABLES_KEY, UNMAPPED_KEY, COMMON_KEY];

/// Kind of a template field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// A single leaf value
    Plain,
    /// A composite bundling leaf subfields under one label
    Group { sub_fields: Vec<Field> },
    /// Declared as a dynamic table
    Table,
}

/// A single field of a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub id: String,
    pub label: Option<String>,
    /// Declared input type (e.g. "text", "number", "group")
    pub field_type: String,
    pub required: bool,
    pub kind: FieldKind,
}

impl Field {
    pub fn plain(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            field_type: "text".to_string(),
            required: false,
            kind: FieldKind::Plain,
        }
    }

    pub fn group(id: impl Into<String>, sub_fields: Vec<Field>) -> Self {
        Self {
            id: id.into(),
            label: None,
            field_type: "group".to_string(),
            required: false,
            kind: FieldKind::Group { sub_fields },
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, FieldKind::Group { .. })
    }

    pub fn sub_fields(&self) -> &[Field] {
        match &self.kind {
            FieldKind::Group { sub_fields } => sub_fields,
            _ => &[],
        }
    }
}

/// A section of a tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Unique within its tab only
    pub id: String,
    pub label: Option<String>,
    pub fields: Vec<Field>,
}

/// A tab of a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub id: String,
    pub label: Option<String>,
    pub sections: Vec<Section>,
    /// Fields attached to the tab directly, outside any section
    pub fields: Vec<Field>,
}

/// A validated template definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawDefinition")]
pub struct TemplateDefinition {
    pub template_id: Option<String>,
    pub title: Option<String>,
    pub tabs: Vec<Tab>,
}

impl TemplateDefinition {
    /// Decode and validate a template document
    pub fn from_json(value: &Value) -> Result<Self> {
        let raw: RawDefinition = serde_json::from_value(value.clone())
            .map_err(|e| TemplateError::Structural(e.to_string()))?;
        Self::try_from(raw)
    }

    /// Encode back into the document shape `from_json` accepts
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(RawDefinition::try_from(self.clone())?)?)
    }

    /// Content checksum of this definition
    pub fn checksum(&self) -> Result<Checksum> {
        Ok(Checksum::from_json(&self.to_json()?))
    }

    /// Every field id, group members included, in document order
    pub fn field_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        for tab in &self.tabs {
            let fields = tab
                .fields
                .iter()
                .chain(tab.sections.iter().flat_map(|s| s.fields.iter()));
            for field in fields {
                ids.push(field.id.as_str());
                ids.extend(field.sub_fields().iter().map(|f| f.id.as_str()));
            }
        }
        ids
    }

    /// Combine several definitions into one.
    ///
    /// Tabs sharing an id are merged, as are sections sharing an id within
    /// such a tab. Field ids must stay unique across the whole result.
    pub fn merge<'a>(definitions: impl IntoIterator<Item = &'a TemplateDefinition>) -> Result<Self> {
        let mut tabs: Vec<RawTab> = Vec::new();
        let mut template_ids = Vec::new();

        for definition in definitions {
            if let Some(id) = &definition.template_id {
                template_ids.push(id.clone());
            }
            let raw = RawDefinition::try_from(definition.clone())?;
            for tab in raw.tabs {
                match tabs.iter_mut().find(|t| t.id == tab.id) {
                    Some(existing) => existing.absorb(tab),
                    None => tabs.push(tab),
                }
            }
        }

        let template_id = match template_ids.len() {
            0 => None,
            _ => Some(template_ids.join("+")),
        };
        Self::try_from(RawDefinition {
            template_id,
            title: None,
            tabs,
        })
    }
}

impl Serialize for TemplateDefinition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        RawDefinition::try_from(self.clone())
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

// ── Raw document shape ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default)]
    tabs: Vec<RawTab>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawTab {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sections: Vec<RawSection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fields: Vec<RawField>,
}

impl RawTab {
    fn absorb(&mut self, other: RawTab) {
        self.fields.extend(other.fields);
        for section in other.sections {
            match self.sections.iter_mut().find(|s| s.id == section.id) {
                Some(existing) => existing.fields.extend(section.fields),
                None => self.sections.push(section),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawSection {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawField {
    #[serde(alias = "fieldId")]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    field_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    required: bool,
    #[serde(default, alias = "sub_fields", skip_serializing_if = "Option::is_none")]
    sub_fields: Option<Value>,
}

const GROUP_TYPE: &str = "group";
const TABLE_TYPES: [&str; 2] = ["table", "dynamic_table"];

impl RawField {
    fn into_field(self, allow_group: bool) -> Result<Field> {
        if self.id.trim().is_empty() {
            return Err(TemplateError::Structural("field with empty id".to_string()));
        }

        let declared = self.field_type.as_deref().map(str::to_ascii_lowercase);
        let is_group = match (&declared, &self.sub_fields) {
            (Some(t), _) if t == GROUP_TYPE => true,
            (None, Some(_)) => true,
            (Some(t), Some(_)) => {
                return Err(TemplateError::Structural(format!(
                    "field '{}' of type '{}' carries subFields",
                    self.id, t
                )))
            }
            _ => false,
        };

        let kind = if is_group {
            if !allow_group {
                return Err(TemplateError::Structural(format!(
                    "group '{}' is nested inside another group",
                    self.id
                )));
            }
            let members = match self.sub_fields {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(TemplateError::Structural(format!(
                        "group '{}' has subFields that is not a list: {}",
                        self.id, other
                    )))
                }
                None => {
                    return Err(TemplateError::Structural(format!(
                        "group '{}' has no subFields list",
                        self.id
                    )))
                }
            };
            let sub_fields = members
                .into_iter()
                .map(|item| {
                    let raw: RawField = serde_json::from_value(item).map_err(|e| {
                        TemplateError::Structural(format!("group '{}': {}", self.id, e))
                    })?;
                    raw.into_field(false)
                })
                .collect::<Result<Vec<_>>>()?;
            FieldKind::Group { sub_fields }
        } else if declared
            .as_deref()
            .is_some_and(|t| TABLE_TYPES.contains(&t))
        {
            FieldKind::Table
        } else {
            FieldKind::Plain
        };

        let field_type = match &kind {
            FieldKind::Group { .. } => GROUP_TYPE.to_string(),
            _ => declared.unwrap_or_else(|| "text".to_string()),
        };

        Ok(Field {
            id: self.id,
            label: self.label,
            field_type,
            required: self.required,
            kind,
        })
    }
}

impl TryFrom<Field> for RawField {
    type Error = TemplateError;

    fn try_from(field: Field) -> Result<Self> {
        let sub_fields = match field.kind {
            FieldKind::Group { sub_fields } => Some(Value::Array(
                sub_fields
                    .into_iter()
                    .map(|f| -> Result<Value> { Ok(serde_json::to_value(RawField::try_from(f)?)?) })
                    .collect::<Result<Vec<_>>>()?,
            )),
            _ => None,
        };
        Ok(Self {
            id: field.id,
            label: field.label,
            field_type: Some(field.field_type),
            required: field.required,
            sub_fields,
        })
    }
}

/// Tracks where each field id was first declared
struct Declarations {
    seen: HashMap<String, String>,
}

impl Declarations {
    fn declare(&mut self, id: &str, place: String) -> Result<()> {
        if let Some(previous) = self.seen.get(id) {
            return Err(TemplateError::Structural(format!(
                "field id '{}' declared twice ({} and {})",
                id, previous, place
            )));
        }
        self.seen.insert(id.to_string(), place);
        Ok(())
    }

    fn declare_field(&mut self, field: &Field, place: &str) -> Result<()> {
        self.declare(&field.id, place.to_string())?;
        for sub in field.sub_fields() {
            self.declare(&sub.id, format!("{}/{}", place, field.id))?;
        }
        Ok(())
    }
}

impl TryFrom<RawDefinition> for TemplateDefinition {
    type Error = TemplateError;

    fn try_from(raw: RawDefinition) -> Result<Self> {
        let mut declarations = Declarations {
            seen: HashMap::new(),
        };
        let mut tab_ids = HashSet::new();
        let mut tabs = Vec::with_capacity(raw.tabs.len());

        for raw_tab in raw.tabs {
            if raw_tab.id.trim().is_empty() {
                return Err(TemplateError::Structural("tab with empty id".to_string()));
            }
            if RESERVED_KEYS.contains(&raw_tab.id.as_str()) {
                return Err(TemplateError::Structural(format!(
                    "tab id '{}' is reserved",
                    raw_tab.id
                )));
            }
            if !tab_ids.insert(raw_tab.id.clone()) {
                return Err(TemplateError::Structural(format!(
                    "tab '{}' declared twice",
                    raw_tab.id
                )));
            }

            let mut section_ids = HashSet::new();
            let mut sections = Vec::with_capacity(raw_tab.sections.len());
            for raw_section in raw_tab.sections {
                if raw_section.id.trim().is_empty() {
                    return Err(TemplateError::Structural(format!(
                        "section with empty id in tab '{}'",
                        raw_tab.id
                    )));
                }
                if !section_ids.insert(raw_section.id.clone()) {
                    return Err(TemplateError::Structural(format!(
                        "section '{}' declared twice in tab '{}'",
                        raw_section.id, raw_tab.id
                    )));
                }
                let place = format!("{}/{}", raw_tab.id, raw_section.id);
                let fields = raw_section
                    .fields
                    .into_iter()
                    .map(|f| f.into_field(true))
                    .collect::<Result<Vec<_>>>()?;
                for field in &fields {
                    declarations.declare_field(field, &place)?;
                }
                sections.push(Section {
                    id: raw_section.id,
                    label: raw_section.label,
                    fields,
                });
            }

            let fields = raw_tab
                .fields
                .into_iter()
                .map(|f| f.into_field(true))
                .collect::<Result<Vec<_>>>()?;
            for field in &fields {
                if section_ids.contains(&field.id) {
                    return Err(TemplateError::Structural(format!(
                        "field '{}' shares its id with a section of tab '{}'",
                        field.id, raw_tab.id
                    )));
                }
                declarations.declare_field(field, &raw_tab.id)?;
            }

            tabs.push(Tab {
                id: raw_tab.id,
                label: raw_tab.label,
                sections,
                fields,
            });
        }

        Ok(Self {
            template_id: raw.template_id,
            title: raw.title,
            tabs,
        })
    }
}

fn raw_fields(fields: Vec<Field>) -> Result<Vec<RawField>> {
    fields.into_iter().map(RawField::try_from).collect()
}

impl TryFrom<TemplateDefinition> for RawDefinition {
    type Error = TemplateError;

    fn try_from(definition: TemplateDefinition) -> Result<Self> {
        let mut tabs = Vec::with_capacity(definition.tabs.len());
        for tab in definition.tabs {
            let sections = tab
                .sections
                .into_iter()
                .map(|section| -> Result<RawSection> {
                    Ok(RawSection {
                        id: section.id,
                        label: section.label,
                        fields: raw_fields(section.fields)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            tabs.push(RawTab {
                id: tab.id,
                label: tab.label,
                sections,
                fields: raw_fields(tab.fields)?,
            });
        }

        Ok(Self {
            template_id: definition.template_id,
            title: definition.title,
            tabs,
        })
    }
}

/// Definitions keyed by template id, in canonical JSON form
pub fn bundle_json(definitions: &BTreeMap<String, TemplateDefinition>) -> Result<BTreeMap<String, Value>> {
    definitions
        .iter()
        .map(|(id, definition)| Ok((id.clone(), definition.to_json()?)))
        .collect()
}

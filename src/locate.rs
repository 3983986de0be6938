//! Field location resolution
//!
//! Compiles one (possibly merged) template definition into a lookup from
//! field id to the tab, section and group that field lives under. The map is
//! derived on demand and never persisted.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::schema::{Field, FieldKind, TemplateDefinition, COMMON_KEY};

/// Where a field is placed in hierarchical data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldLocation {
    pub tab: String,
    pub section: Option<String>,
    pub parent_group: Option<String>,
}

impl FieldLocation {
    pub fn new(tab: impl Into<String>, section: Option<&str>) -> Self {
        Self {
            tab: tab.into(),
            section: section.map(String::from),
            parent_group: None,
        }
    }

    /// Pseudo-location of template-independent fields
    pub fn common() -> Self {
        Self::new(COMMON_KEY, None)
    }

    pub fn is_common(&self) -> bool {
        self.tab == COMMON_KEY && self.section.is_none() && self.parent_group.is_none()
    }

    fn in_group(&self, group_id: &str) -> Self {
        Self {
            parent_group: Some(group_id.to_string()),
            ..self.clone()
        }
    }
}

/// Compiled field-id lookup for one definition
#[derive(Debug, Clone, Default)]
pub struct FieldLocator {
    locations: HashMap<String, FieldLocation>,
    groups: HashMap<String, Vec<String>>,
    declared_tables: HashSet<String>,
}

impl FieldLocator {
    /// Walk tabs, sections and fields of `definition`.
    ///
    /// Common fields resolve to the common pseudo-location unless the
    /// template places them itself.
    pub fn build(definition: &TemplateDefinition, common_fields: &[String]) -> Self {
        let mut locator = Self::degraded(common_fields);

        for tab in &definition.tabs {
            for section in &tab.sections {
                let at = FieldLocation::new(&tab.id, Some(&section.id));
                for field in &section.fields {
                    locator.record(field, &at);
                }
            }
            let at = FieldLocation::new(&tab.id, None);
            for field in &tab.fields {
                locator.record(field, &at);
            }
        }

        locator
    }

    /// A locator knowing only the common fields
    pub fn degraded(common_fields: &[String]) -> Self {
        let mut locator = Self::default();
        for id in common_fields {
            locator.locations.insert(id.clone(), FieldLocation::common());
        }
        locator
    }

    fn record(&mut self, field: &Field, at: &FieldLocation) {
        self.locations.insert(field.id.clone(), at.clone());
        match &field.kind {
            FieldKind::Group { sub_fields } => {
                let members = self.groups.entry(field.id.clone()).or_default();
                for sub in sub_fields {
                    members.push(sub.id.clone());
                }
                for sub in sub_fields {
                    self.locations.insert(sub.id.clone(), at.in_group(&field.id));
                }
            }
            FieldKind::Table => {
                self.declared_tables.insert(field.id.clone());
            }
            FieldKind::Plain => {}
        }
    }

    pub fn locate(&self, field_id: &str) -> Option<&FieldLocation> {
        self.locations.get(field_id)
    }

    /// Member field ids of a group, in declaration order
    pub fn group_members(&self, group_id: &str) -> Option<&[String]> {
        self.groups.get(group_id).map(Vec::as_slice)
    }

    pub fn is_group(&self, field_id: &str) -> bool {
        self.groups.contains_key(field_id)
    }

    /// Whether the template declares `field_id` as a table
    pub fn is_declared_table(&self, field_id: &str) -> bool {
        self.declared_tables.contains(field_id)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> TemplateDefinition {
        TemplateDefinition::from_json(&json!({
            "tabs": [
                {
                    "id": "Property Details",
                    "sections": [
                        { "id": "part_a", "fields": [ { "id": "agreement_to_sell" } ] },
                        { "id": "part_b", "fields": [
                            { "id": "location", "type": "group",
                              "subFields": [ { "id": "plot_no" }, { "id": "door_no" } ] }
                        ] }
                    ],
                    "fields": [ { "id": "remarks" } ]
                },
                {
                    "id": "Valuation",
                    "sections": [ { "id": "part_a", "fields": [
                        { "id": "market_value" },
                        { "id": "comparables", "type": "table" }
                    ] } ]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_plain_field_location() {
        let locator = FieldLocator::build(&definition(), &[]);
        assert_eq!(
            locator.locate("agreement_to_sell"),
            Some(&FieldLocation::new("Property Details", Some("part_a")))
        );
    }

    #[test]
    fn test_group_members_nest_under_group() {
        let locator = FieldLocator::build(&definition(), &[]);

        assert_eq!(
            locator.locate("location"),
            Some(&FieldLocation::new("Property Details", Some("part_b")))
        );
        let plot = locator.locate("plot_no").unwrap();
        assert_eq!(plot.section.as_deref(), Some("part_b"));
        assert_eq!(plot.parent_group.as_deref(), Some("location"));
        assert_eq!(
            locator.group_members("location").unwrap(),
            &["plot_no".to_string(), "door_no".to_string()]
        );
        assert!(locator.is_group("location"));
        assert!(!locator.is_group("plot_no"));
    }

    #[test]
    fn test_tab_level_field_has_no_section() {
        let locator = FieldLocator::build(&definition(), &[]);
        assert_eq!(
            locator.locate("remarks"),
            Some(&FieldLocation::new("Property Details", None))
        );
    }

    #[test]
    fn test_sections_scoped_per_tab() {
        let locator = FieldLocator::build(&definition(), &[]);
        assert_eq!(locator.locate("market_value").unwrap().tab, "Valuation");
        assert_eq!(
            locator.locate("market_value").unwrap().section.as_deref(),
            Some("part_a")
        );
        assert!(locator.is_declared_table("comparables"));
    }

    #[test]
    fn test_common_fields_and_unknown_ids() {
        let common = vec!["bank_code".to_string(), "remarks".to_string()];
        let locator = FieldLocator::build(&definition(), &common);

        assert!(locator.locate("bank_code").unwrap().is_common());
        // The template's own placement takes precedence.
        assert!(!locator.locate("remarks").unwrap().is_common());
        assert!(locator.locate("unknown_x").is_none());

        let degraded = FieldLocator::degraded(&common);
        assert_eq!(degraded.len(), 2);
        assert!(degraded.locate("agreement_to_sell").is_none());
    }
}

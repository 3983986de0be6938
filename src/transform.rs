//! Flat ↔ hierarchical record transformation
//!
//! `forward` places every present value of a flat submission under the
//! tab → section → (group →) field path its template assigns, detects
//! dynamic tables into the `tables` bucket and keeps anything unplaceable in
//! `_unmapped_`. `reverse` undoes it without needing the template.
//!
//! Both directions are pure: no shared state, no I/O.

use serde_json::{json, Map, Value};

use crate::locate::FieldLocator;
use crate::schema::{COMMON_KEY, TABLES_KEY, UNMAPPED_KEY};
use crate::table::{TableDefinition, TableRules};

/// Key of the placeholder left at a table field's normal location
pub const TABLE_POINTER_KEY: &str = "$table";
/// Key wrapping object values of plain fields inside the tab tree
pub const VALUE_WRAPPER_KEY: &str = "$value";

/// Whether `value` counts as absent for placement purposes
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn single_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(key),
        _ => None,
    }
}

fn is_table_pointer(value: &Value) -> bool {
    single_key(value, TABLE_POINTER_KEY).is_some()
}

/// Whether `value` is a placed leaf rather than a container
fn is_leaf_marker(value: &Value) -> bool {
    is_table_pointer(value) || single_key(value, VALUE_WRAPPER_KEY).is_some()
}

/// Walk `path` from `root`, creating containers as needed.
///
/// Returns `None` when a value already occupies the path.
fn container<'a>(
    root: &'a mut Map<String, Value>,
    path: &[&str],
) -> Option<&'a mut Map<String, Value>> {
    let mut node = root;
    for key in path {
        let slot = node
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if is_leaf_marker(slot) {
            return None;
        }
        node = slot.as_object_mut()?;
    }
    Some(node)
}

/// Insert `value` at `field_id` under `path` unless the slot is taken
fn place(root: &mut Map<String, Value>, path: &[&str], field_id: &str, value: Value) -> bool {
    match container(root, path) {
        Some(node) if !node.contains_key(field_id) => {
            node.insert(field_id.to_string(), value);
            true
        }
        _ => false,
    }
}

/// Schema-driven flat ↔ hierarchical transformer
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    rules: TableRules,
}

impl Transformer {
    pub fn new(rules: TableRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &TableRules {
        &self.rules
    }

    /// Structure a flat submission according to `locator`.
    ///
    /// Never fails: values without a location land in `_unmapped_`.
    pub fn forward(&self, flat: &Map<String, Value>, locator: &FieldLocator) -> Map<String, Value> {
        let mut out = Map::new();
        let mut tables = Map::new();
        let mut common = Map::new();
        let mut unmapped = Map::new();

        for (field_id, value) in flat {
            if is_empty_value(value) {
                continue;
            }
            let location = locator.locate(field_id);

            if let Some(detected_by) =
                self.rules
                    .classify(field_id, value, locator.is_declared_table(field_id))
            {
                let table = match TableDefinition::build(value, detected_by).to_value() {
                    Ok(table) => table,
                    Err(e) => {
                        tracing::warn!(field_id = %field_id, error = %e, "table not encodable; kept as unmapped");
                        unmapped.insert(field_id.clone(), value.clone());
                        continue;
                    }
                };
                tables.insert(field_id.clone(), table);
                // Group slots hold members, so a group's table lives in the bucket only.
                if let Some(at) = location.filter(|at| !at.is_common() && !locator.is_group(field_id)) {
                    let path = path_of(&at.tab, at.section.as_deref(), at.parent_group.as_deref());
                    if !place(&mut out, &path, field_id, json!({ TABLE_POINTER_KEY: field_id })) {
                        tracing::warn!(field_id = %field_id, "location occupied; table kept in the tables bucket only");
                    }
                }
                continue;
            }

            let at = match location {
                Some(at) if at.is_common() => {
                    common.insert(field_id.clone(), value.clone());
                    continue;
                }
                // A group is a container, not a value slot.
                Some(_) if locator.is_group(field_id) => None,
                other => other,
            };
            let Some(at) = at else {
                unmapped.insert(field_id.clone(), value.clone());
                continue;
            };

            let placed = if value.is_object() {
                json!({ VALUE_WRAPPER_KEY: value })
            } else {
                value.clone()
            };
            let path = path_of(&at.tab, at.section.as_deref(), at.parent_group.as_deref());
            if !place(&mut out, &path, field_id, placed) {
                tracing::warn!(field_id = %field_id, "location occupied; keeping field unmapped");
                unmapped.insert(field_id.clone(), value.clone());
            }
        }

        for (key, bucket) in [
            (TABLES_KEY, tables),
            (COMMON_KEY, common),
            (UNMAPPED_KEY, unmapped),
        ] {
            if !bucket.is_empty() {
                out.insert(key.to_string(), Value::Object(bucket));
            }
        }
        out
    }

    /// Flatten hierarchical data back into field id → value.
    ///
    /// Group containers expand to their members; table pointers are skipped
    /// in favour of the tables bucket.
    pub fn reverse(hierarchical: &Map<String, Value>) -> Map<String, Value> {
        let mut flat = Map::new();

        for (key, value) in hierarchical {
            match key.as_str() {
                UNMAPPED_KEY | COMMON_KEY => {
                    if let Some(bucket) = value.as_object() {
                        flat.extend(bucket.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
                TABLES_KEY => {
                    if let Some(bucket) = value.as_object() {
                        for (field_id, entry) in bucket {
                            flat.insert(field_id.clone(), table_value(entry));
                        }
                    }
                }
                _ => collect_leaves(key, value, &mut flat),
            }
        }
        flat
    }
}

fn path_of<'a>(tab: &'a str, section: Option<&'a str>, group: Option<&'a str>) -> Vec<&'a str> {
    std::iter::once(tab).chain(section).chain(group).collect()
}

fn table_value(entry: &Value) -> Value {
    match serde_json::from_value::<TableDefinition>(entry.clone()) {
        Ok(table) => table.submitted_value(),
        Err(_) => entry.get("rows").cloned().unwrap_or_else(|| entry.clone()),
    }
}

fn collect_leaves(key: &str, value: &Value, flat: &mut Map<String, Value>) {
    if is_table_pointer(value) {
        return;
    }
    if let Some(inner) = single_key(value, VALUE_WRAPPER_KEY) {
        flat.insert(key.to_string(), inner.clone());
        return;
    }
    match value {
        Value::Object(children) => {
            for (child_key, child) in children {
                collect_leaves(child_key, child, flat);
            }
        }
        leaf => {
            flat.insert(key.to_string(), leaf.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TemplateDefinition;

    fn locator() -> FieldLocator {
        let definition = TemplateDefinition::from_json(&json!({
            "tabs": [
                {
                    "id": "Property Details",
                    "sections": [
                        { "id": "part_a", "fields": [ { "id": "agreement_to_sell" } ] },
                        { "id": "part_b", "fields": [
                            { "id": "location", "type": "group",
                              "subFields": [ { "id": "plot_no" }, { "id": "door_no" } ] }
                        ] }
                    ]
                },
                {
                    "id": "Site",
                    "sections": [ { "id": "geo", "fields": [
                        { "id": "coordinates", "type": "group",
                          "subFields": [ { "id": "longitude" }, { "id": "latitude" } ] },
                        { "id": "boundaries" },
                        { "id": "owner_rows" },
                        { "id": "zone", "type": "group",
                          "subFields": [ { "id": "a_no" }, { "id": "b_no" } ] }
                    ] } ],
                    "fields": [ { "id": "site_remarks" } ]
                }
            ]
        }))
        .unwrap();
        FieldLocator::build(&definition, &["bank_code".to_string()])
    }

    fn flat(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_end_to_end_placement() {
        let input = flat(json!({
            "agreement_to_sell": "Available",
            "plot_no": "12",
            "door_no": "4A",
            "unknown_x": "z"
        }));
        let out = Transformer::default().forward(&input, &locator());

        assert_eq!(
            Value::Object(out),
            json!({
                "Property Details": {
                    "part_a": { "agreement_to_sell": "Available" },
                    "part_b": { "location": { "plot_no": "12", "door_no": "4A" } }
                },
                "_unmapped_": { "unknown_x": "z" }
            })
        );
    }

    #[test]
    fn test_group_nesting() {
        let input = flat(json!({ "longitude": "77.1", "latitude": "28.5" }));
        let out = Transformer::default().forward(&input, &locator());
        assert_eq!(
            out["Site"]["geo"],
            json!({ "coordinates": { "longitude": "77.1", "latitude": "28.5" } })
        );
    }

    #[test]
    fn test_tab_level_field_and_common_bucket() {
        let input = flat(json!({ "site_remarks": "ok", "bank_code": "SBI" }));
        let out = Transformer::default().forward(&input, &locator());
        assert_eq!(out["Site"], json!({ "site_remarks": "ok" }));
        assert_eq!(out[COMMON_KEY], json!({ "bank_code": "SBI" }));
    }

    #[test]
    fn test_table_detection() {
        let input = flat(json!({ "rows_table": [{"a": 1, "b": 2}, {"a": 3, "b": 4}] }));
        let out = Transformer::default().forward(&input, &locator());

        let entry = &out[TABLES_KEY]["rows_table"];
        assert_eq!(entry["columns"].as_array().unwrap().len(), 2);
        assert_eq!(entry["rows"].as_array().unwrap().len(), 2);
        assert!(!out.contains_key(UNMAPPED_KEY));

        let plain = Transformer::default().forward(&flat(json!({ "x": "hello" })), &locator());
        assert!(!plain.contains_key(TABLES_KEY));
    }

    #[test]
    fn test_located_table_leaves_pointer() {
        let input = flat(json!({ "owner_rows": [{"name": "A"}, {"name": "B"}] }));
        let out = Transformer::default().forward(&input, &locator());
        assert_eq!(
            out["Site"]["geo"]["owner_rows"],
            json!({ TABLE_POINTER_KEY: "owner_rows" })
        );
        assert!(out[TABLES_KEY].get("owner_rows").is_some());
        assert_eq!(Transformer::reverse(&out), input);
    }

    #[test]
    fn test_unmapped_preserved_and_empty_dropped() {
        let input = flat(json!({
            "mystery": 7,
            "blank": "  ",
            "nothing": null,
            "no_items": []
        }));
        let out = Transformer::default().forward(&input, &locator());
        assert_eq!(Value::Object(out), json!({ "_unmapped_": { "mystery": 7 } }));
    }

    #[test]
    fn test_group_id_as_flat_key_stays_unmapped() {
        let input = flat(json!({ "location": "somewhere" }));
        let out = Transformer::default().forward(&input, &locator());
        assert_eq!(out[UNMAPPED_KEY], json!({ "location": "somewhere" }));
        assert_eq!(Transformer::reverse(&out), input);
    }

    #[test]
    fn test_group_id_with_table_value_keeps_members() {
        // Group id sorting after its members.
        let input = flat(json!({ "a_no": "1", "zone": [{"x": 1}, {"x": 2}] }));
        let out = Transformer::default().forward(&input, &locator());
        assert_eq!(out["Site"]["geo"]["zone"], json!({ "a_no": "1" }));
        assert!(out[TABLES_KEY].get("zone").is_some());
        assert_eq!(Transformer::reverse(&out), input);

        // Group id sorting before its members, explicit table shape.
        let input = flat(json!({ "location": { "rows": [{"x": 1}] }, "plot_no": "12" }));
        let out = Transformer::default().forward(&input, &locator());
        assert_eq!(out["Property Details"]["part_b"]["location"], json!({ "plot_no": "12" }));
        assert!(out[TABLES_KEY].get("location").is_some());
        assert_eq!(Transformer::reverse(&out), input);
    }

    #[test]
    fn test_placed_leaves_are_not_containers() {
        let mut root = flat(json!({
            "T": { "s": { "t": { "$table": "t" }, "v": { "$value": { "a": 1 } } } }
        }));
        assert!(container(&mut root, &["T", "s", "t"]).is_none());
        assert!(container(&mut root, &["T", "s", "v"]).is_none());
        assert!(!place(&mut root, &["T", "s"], "t", json!("x")));
        assert!(place(&mut root, &["T", "s"], "u", json!("x")));
        assert_eq!(root["T"]["s"]["t"], json!({ "$table": "t" }));
    }

    #[test]
    fn test_round_trip() {
        let input = flat(json!({
            "agreement_to_sell": "Available",
            "plot_no": "12",
            "door_no": "4A",
            "longitude": 77.1,
            "boundaries": { "north": "road", "south": "plot 14" },
            "site_remarks": true,
            "bank_code": "SBI",
            "owner_rows": [{"name": "A", "share": "50%"}, {"name": "B", "share": "50%"}],
            "explicit": { "columns": ["a"], "rows": [] },
            "tags": ["x", "y"],
            "unknown_x": "z"
        }));
        let transformer = Transformer::default();
        let out = transformer.forward(&input, &locator());

        assert_eq!(
            out["Site"]["geo"]["boundaries"],
            json!({ VALUE_WRAPPER_KEY: { "north": "road", "south": "plot 14" } })
        );
        assert_eq!(Transformer::reverse(&out), input);
    }

    #[test]
    fn test_degraded_locator_sends_everything_unmapped() {
        let degraded = FieldLocator::degraded(&["bank_code".to_string()]);
        let input = flat(json!({ "bank_code": "SBI", "plot_no": "12" }));
        let out = Transformer::default().forward(&input, &degraded);

        assert_eq!(
            Value::Object(out.clone()),
            json!({ "_common_": { "bank_code": "SBI" }, "_unmapped_": { "plot_no": "12" } })
        );
        assert_eq!(Transformer::reverse(&out), input);
    }

    #[test]
    fn test_empty_value_rules() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!("")));
        assert!(is_empty_value(&json!({})));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
    }
}

//! Dynamic table detection
//!
//! Tables are not declared by most templates; they are recognised from the
//! shape of a submitted value. The classifier is a pure function so its
//! thresholds stay pinned by tests.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys that mark a map value as an explicit table
pub const EXPLICIT_TABLE_KEYS: [&str; 3] = ["rows", "columns", "tableData"];

/// Thresholds for recognising tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRules {
    /// Substrings of a field id that suggest a table
    pub keywords: Vec<String>,
    /// Average share of the first record's keys the sampled records must carry
    pub homogeneity_threshold: f64,
    /// How many records after the first are sampled
    pub homogeneity_sample: usize,
}

impl Default for TableRules {
    fn default() -> Self {
        Self {
            keywords: ["table", "list", "items", "rows", "entries"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            homogeneity_threshold: 0.70,
            homogeneity_sample: 5,
        }
    }
}

/// Why a value was recognised as a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableMatch {
    /// The template declares the field as a table
    Declared,
    /// The field id contains a table keyword
    Keyword,
    /// Records share the first record's keys
    Homogeneous,
    /// A map exposing rows/columns/tableData
    Explicit,
}

fn as_records(value: &Value) -> Option<Vec<&Map<String, Value>>> {
    let items = value.as_array()?;
    if items.is_empty() {
        return None;
    }
    items.iter().map(Value::as_object).collect()
}

impl TableRules {
    fn has_keyword(&self, field_id: &str) -> bool {
        let id = field_id.to_ascii_lowercase();
        self.keywords.iter().any(|k| id.contains(k.as_str()))
    }

    fn is_homogeneous(&self, records: &[&Map<String, Value>]) -> bool {
        let Some((first, rest)) = records.split_first() else {
            return false;
        };
        if first.is_empty() || rest.is_empty() {
            return false;
        }

        let sample: Vec<_> = rest.iter().take(self.homogeneity_sample.max(1)).collect();
        let total: f64 = sample
            .iter()
            .map(|record| {
                let shared = first.keys().filter(|k| record.contains_key(*k)).count();
                shared as f64 / first.len() as f64
            })
            .sum();
        total / sample.len() as f64 >= self.homogeneity_threshold
    }

    /// Decide whether `value` submitted for `field_id` is a dynamic table
    pub fn classify(&self, field_id: &str, value: &Value, declared: bool) -> Option<TableMatch> {
        if let Some(map) = value.as_object() {
            return EXPLICIT_TABLE_KEYS
                .iter()
                .any(|k| map.contains_key(*k))
                .then_some(TableMatch::Explicit);
        }

        let records = as_records(value)?;
        if declared {
            Some(TableMatch::Declared)
        } else if self.has_keyword(field_id) {
            Some(TableMatch::Keyword)
        } else if self.is_homogeneous(&records) {
            Some(TableMatch::Homogeneous)
        } else {
            None
        }
    }
}

/// Sniffed type of a table column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Boolean,
    Number,
    Decimal,
    Currency,
    Text,
}

fn currency_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(?:(?:[$€£₹¥]|rs\.?|inr|usd|eur)\s*-?\d[\d,]*(?:\.\d+)?|-?\d[\d,]*(?:\.\d+)?\s*(?:[$€£₹¥]|rs\.?|inr|usd|eur))\s*$",
        )
        .expect("currency pattern is valid")
    })
}

impl CellType {
    pub fn sniff(value: &Value) -> Self {
        match value {
            Value::Bool(_) => CellType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => CellType::Number,
            Value::Number(_) => CellType::Decimal,
            Value::String(s) => Self::sniff_str(s.trim()),
            _ => CellType::Text,
        }
    }

    fn sniff_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false") {
            CellType::Boolean
        } else if currency_pattern().is_match(s) {
            CellType::Currency
        } else if s.parse::<i64>().is_ok() {
            CellType::Number
        } else if s.parse::<f64>().is_ok_and(f64::is_finite) {
            CellType::Decimal
        } else {
            CellType::Text
        }
    }
}

/// A column inferred from the first record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub key: String,
    pub label: String,
    pub column_type: CellType,
}

impl Column {
    fn new(key: &str, column_type: CellType) -> Self {
        Self {
            key: key.to_string(),
            label: humanize(key),
            column_type,
        }
    }
}

fn humanize(key: &str) -> String {
    key.split(|c: char| c == '_' || c == '-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// What an editor may do to a detected table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditCapabilities {
    pub can_add_rows: bool,
    pub can_delete_rows: bool,
    pub can_add_columns: bool,
    pub can_delete_columns: bool,
}

impl Default for EditCapabilities {
    fn default() -> Self {
        Self {
            can_add_rows: true,
            can_delete_rows: true,
            can_add_columns: true,
            can_delete_columns: false,
        }
    }
}

/// Entry of the tables bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    pub columns: Vec<Column>,
    /// Submitted rows, verbatim
    pub rows: Vec<Value>,
    pub capabilities: EditCapabilities,
    pub detected_by: TableMatch,
    /// The submitted map, kept when it was an explicit table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
}

impl TableDefinition {
    pub fn build(value: &Value, detected_by: TableMatch) -> Self {
        match value {
            Value::Object(map) => Self::from_explicit(map, detected_by),
            Value::Array(rows) => Self {
                columns: infer_columns(rows),
                rows: rows.clone(),
                capabilities: EditCapabilities::default(),
                detected_by,
                source: None,
            },
            other => Self {
                columns: Vec::new(),
                rows: vec![other.clone()],
                capabilities: EditCapabilities::default(),
                detected_by,
                source: Some(other.clone()),
            },
        }
    }

    fn from_explicit(map: &Map<String, Value>, detected_by: TableMatch) -> Self {
        let rows = ["rows", "tableData"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .cloned()
            .unwrap_or_default();

        let mut columns = infer_columns(&rows);
        if columns.is_empty() {
            if let Some(declared) = map.get("columns").and_then(Value::as_array) {
                columns = declared
                    .iter()
                    .filter_map(|c| match c {
                        Value::String(key) => Some(key.as_str()),
                        Value::Object(o) => o
                            .get("key")
                            .or_else(|| o.get("id"))
                            .and_then(Value::as_str),
                        _ => None,
                    })
                    .map(|key| Column::new(key, CellType::Text))
                    .collect();
            }
        }

        Self {
            columns,
            rows,
            capabilities: EditCapabilities::default(),
            detected_by,
            source: Some(Value::Object(map.clone())),
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// The value originally submitted for this table
    pub fn submitted_value(&self) -> Value {
        match &self.source {
            Some(source) => source.clone(),
            None => Value::Array(self.rows.clone()),
        }
    }
}

fn infer_columns(rows: &[Value]) -> Vec<Column> {
    rows.first()
        .and_then(Value::as_object)
        .map(|first| {
            first
                .iter()
                .map(|(key, cell)| Column::new(key, CellType::sniff(cell)))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> TableRules {
        TableRules::default()
    }

    #[test]
    fn test_keyword_with_records_is_table() {
        let value = json!([{"a": 1, "b": 2}, {"a": 3, "b": 4}]);
        assert_eq!(
            rules().classify("rows_table", &value, false),
            Some(TableMatch::Keyword)
        );
        // A single record qualifies through the keyword alone.
        assert_eq!(
            rules().classify("owner_list", &json!([{"name": "x"}]), false),
            Some(TableMatch::Keyword)
        );
    }

    #[test]
    fn test_keyword_requires_records() {
        assert_eq!(rules().classify("rows_table", &json!([]), false), None);
        assert_eq!(rules().classify("rows_table", &json!(["a", "b"]), false), None);
        assert_eq!(rules().classify("item_list", &json!("x"), false), None);
    }

    #[test]
    fn test_scalars_are_never_tables() {
        assert_eq!(rules().classify("x", &json!("hello"), false), None);
        assert_eq!(rules().classify("x", &json!(42), false), None);
    }

    #[test]
    fn test_homogeneity_threshold() {
        // Second record carries 3 of 4 keys (0.75), third carries all of them.
        let value = json!([
            {"a": 1, "b": 2, "c": 3, "d": 4},
            {"a": 1, "b": 2, "c": 3},
            {"a": 1, "b": 2, "c": 3, "d": 4}
        ]);
        assert_eq!(
            rules().classify("owners", &value, false),
            Some(TableMatch::Homogeneous)
        );

        // Average overlap 0.5 stays below 0.70.
        let sparse = json!([
            {"a": 1, "b": 2, "c": 3, "d": 4},
            {"a": 1, "b": 2, "x": 0},
            {"c": 1, "d": 2}
        ]);
        assert_eq!(rules().classify("owners", &sparse, false), None);
    }

    #[test]
    fn test_homogeneity_exactly_at_threshold() {
        // 7 of 10 keys shared.
        let first: Map<String, Value> = (0..10).map(|i| (format!("k{i}"), json!(i))).collect();
        let second: Map<String, Value> = (0..7).map(|i| (format!("k{i}"), json!(i))).collect();
        let value = Value::Array(vec![Value::Object(first), Value::Object(second)]);
        assert_eq!(
            rules().classify("owners", &value, false),
            Some(TableMatch::Homogeneous)
        );
    }

    #[test]
    fn test_single_record_without_keyword_is_not_table() {
        assert_eq!(rules().classify("owner", &json!([{"a": 1}]), false), None);
    }

    #[test]
    fn test_sample_is_bounded() {
        let mut items = vec![json!({"a": 1, "b": 2})];
        items.extend((0..5).map(|_| json!({"a": 1, "b": 2})));
        items.extend((0..20).map(|_| json!({"z": 1})));
        assert_eq!(
            rules().classify("owners", &Value::Array(items), false),
            Some(TableMatch::Homogeneous)
        );
    }

    #[test]
    fn test_explicit_and_declared_tables() {
        let explicit = json!({"columns": ["a"], "rows": [{"a": 1}]});
        assert_eq!(
            rules().classify("anything", &explicit, false),
            Some(TableMatch::Explicit)
        );
        assert_eq!(rules().classify("anything", &json!({"a": 1}), false), None);
        assert_eq!(
            rules().classify("anything", &json!([{"a": 1}]), true),
            Some(TableMatch::Declared)
        );
    }

    #[test]
    fn test_cell_type_sniffing() {
        assert_eq!(CellType::sniff(&json!(true)), CellType::Boolean);
        assert_eq!(CellType::sniff(&json!("False")), CellType::Boolean);
        assert_eq!(CellType::sniff(&json!(12)), CellType::Number);
        assert_eq!(CellType::sniff(&json!("12")), CellType::Number);
        assert_eq!(CellType::sniff(&json!(1.5)), CellType::Decimal);
        assert_eq!(CellType::sniff(&json!("1.5")), CellType::Decimal);
        assert_eq!(CellType::sniff(&json!("₹ 1,20,000")), CellType::Currency);
        assert_eq!(CellType::sniff(&json!("$12.50")), CellType::Currency);
        assert_eq!(CellType::sniff(&json!("4500 INR")), CellType::Currency);
        assert_eq!(CellType::sniff(&json!("Plot 12")), CellType::Text);
        assert_eq!(CellType::sniff(&json!(null)), CellType::Text);
    }

    #[test]
    fn test_build_from_records() {
        let value = json!([{"a": 1, "b": "x"}, {"a": 3, "b": "y"}]);
        let table = TableDefinition::build(&value, TableMatch::Keyword);

        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns[0].key, "a");
        assert_eq!(table.columns[0].column_type, CellType::Number);
        assert_eq!(table.columns[1].column_type, CellType::Text);
        assert_eq!(table.rows.len(), 2);
        assert!(table.capabilities.can_add_columns);
        assert!(!table.capabilities.can_delete_columns);
        assert_eq!(table.submitted_value(), value);
    }

    #[test]
    fn test_table_encodes_for_tables_bucket() {
        let value = json!([{"direction": "North", "length_m": 12.5}]);
        let table = TableDefinition::build(&value, TableMatch::Declared);

        let encoded = table.to_value().unwrap();
        assert_eq!(encoded["rows"], value);
        assert_eq!(encoded["detectedBy"], json!("declared"));
        assert!(encoded.get("source").is_none());
        assert_eq!(serde_json::from_value::<TableDefinition>(encoded).unwrap(), table);
    }

    #[test]
    fn test_build_from_explicit_map() {
        let value = json!({"columns": ["owner_name"], "tableData": []});
        let table = TableDefinition::build(&value, TableMatch::Explicit);
        assert_eq!(table.columns.len(), 1);
        assert_eq!(table.columns[0].label, "Owner Name");
        assert!(table.rows.is_empty());
        assert_eq!(table.submitted_value(), value);
    }
}

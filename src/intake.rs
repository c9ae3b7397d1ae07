//! Intake-ESM catalogue synthesis (esmcat 0.1.0).
//!
//! The catalogue is a single JSON document: a header describing the columns
//! and the aggregation rules, plus `catalog_dict` with one flattened row per
//! search document. Grouping happens client-side in intake-esm; this module
//! only declares the contract: rows group on the DRS key set and concatenate
//! along `time`.

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::flavour::{Flavour, FACET_FIELDS};
use crate::search::UniqKey;

/// The esmcat version this gateway emits.
pub const ESMCAT_VERSION: &str = "0.1.0";

/// Attribute set a group is keyed on; files within one group concatenate on
/// the time dimension.
pub const GROUPBY_ATTRS: &[&str] = &[
    "project",
    "product",
    "institute",
    "model",
    "experiment",
    "time_frequency",
    "realm",
    "variable",
    "ensemble",
    "cmor_table",
    "fs_type",
    "grid_label",
];

/// Flatten a document row: single-element arrays become scalars, keys are
/// translated to the flavour vocabulary.
fn flatten_row(flavour: &Flavour, doc: &Map<String, Value>) -> Map<String, Value> {
    doc.iter()
        .map(|(k, v)| {
            let value = match v {
                Value::Array(a) if a.len() == 1 => a[0].clone(),
                other => other.clone(),
            };
            (flavour.key_out(k).to_string(), value)
        })
        .collect()
}

/// Assemble the catalogue document for a result set.
pub fn catalogue(flavour: &Flavour, uniq_key: UniqKey, docs: &[Map<String, Value>]) -> Value {
    let attributes: Vec<Value> = FACET_FIELDS
        .iter()
        .map(|f| {
            json!({
                "column_name": flavour.key_out(f),
                "vocabulary": "",
            })
        })
        .collect();

    let groupby: Vec<&str> = GROUPBY_ATTRS.iter().map(|f| flavour.key_out(f)).collect();
    let variable_col = flavour.key_out("variable");
    let time_col = flavour.key_out("time");

    json!({
        "esmcat_version": ESMCAT_VERSION,
        "id": flavour.name(),
        "description": "Catalogue from freva-databrowser",
        "title": "freva-databrowser catalogue",
        "last_updated": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "attributes": attributes,
        "assets": {
            "column_name": uniq_key.field(),
            "format_column_name": flavour.key_out("format"),
        },
        "aggregation_control": {
            "variable_column_name": variable_col,
            "groupby_attrs": groupby,
            "aggregations": [
                { "type": "union", "attribute_name": variable_col },
                {
                    "type": "join_existing",
                    "attribute_name": time_col,
                    "options": { "dim": "time" }
                }
            ]
        },
        "catalog_dict": docs.iter().map(|d| Value::Object(flatten_row(flavour, d))).collect::<Vec<_>>(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavour::BuiltInFlavour;

    fn sample_docs() -> Vec<Map<String, Value>> {
        vec![serde_json::from_value(json!({
            "project": ["observations"],
            "variable": ["pr"],
            "model": ["cp4"],
            "file": "/arch/pr_cp4_2016.nc",
            "format": ["nc"],
        }))
        .unwrap()]
    }

    #[test]
    fn header_matches_the_esmcat_contract() {
        let flavour = Flavour::BuiltIn(BuiltInFlavour::Freva);
        let cat = catalogue(&flavour, UniqKey::File, &sample_docs());
        assert_eq!(cat["esmcat_version"], "0.1.0");
        assert_eq!(cat["id"], "freva");
        assert_eq!(cat["assets"]["column_name"], "file");
        assert_eq!(cat["assets"]["format_column_name"], "format");
        assert_eq!(
            cat["aggregation_control"]["groupby_attrs"]
                .as_array()
                .unwrap()
                .len(),
            GROUPBY_ATTRS.len()
        );
        assert_eq!(
            cat["aggregation_control"]["aggregations"][1]["options"]["dim"],
            "time"
        );
    }

    #[test]
    fn rows_are_flattened_and_translated() {
        let flavour = Flavour::BuiltIn(BuiltInFlavour::Cmip6);
        let cat = catalogue(&flavour, UniqKey::File, &sample_docs());
        let row = &cat["catalog_dict"][0];
        // Single-element arrays collapse to scalars, keys wear cmip6 names.
        assert_eq!(row["variable_id"], "pr");
        assert_eq!(row["source_id"], "cp4");
        assert_eq!(row["file"], "/arch/pr_cp4_2016.nc");
        assert!(row.get("variable").is_none());
    }

    #[test]
    fn groupby_attrs_follow_the_flavour() {
        let flavour = Flavour::BuiltIn(BuiltInFlavour::Cmip6);
        let cat = catalogue(&flavour, UniqKey::Uri, &[]);
        let groupby = cat["aggregation_control"]["groupby_attrs"].as_array().unwrap();
        assert!(groupby.contains(&json!("source_id")));
        assert!(!groupby.contains(&json!("model")));
        assert_eq!(cat["assets"]["column_name"], "uri");
    }
}

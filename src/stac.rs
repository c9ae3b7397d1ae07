//! STAC 1.1.0 synthesis: landing page, collections, items, search, and the
//! opaque pagination tokens.
//!
//! Conformance is limited to `core`, `collections` and `item-search`. A STAC
//! collection is a canonical `project` (lowercased); an item is one search
//! document, id-addressed. Pagination is keyset-based over the numeric
//! document id, wrapped into an opaque `direction:collection:item_id` token,
//! base64url-encoded.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::error::{ApiError, ApiResult};
use crate::query::{parse_partial_iso as parse_iso, TimeRange};

/// Advertised conformance classes.
pub const CONFORMANCE: &[&str] = &[
    "https://api.stacspec.org/v1.0.0/core",
    "https://api.stacspec.org/v1.0.0/collections",
    "https://api.stacspec.org/v1.0.0/item-search",
];

/// STAC spec version emitted on every object.
pub const STAC_VERSION: &str = "1.1.0";

/// Landing page id.
pub const LANDING_ID: &str = "freva";

/// Page limits for item listings.
pub const MAX_LIMIT: usize = 1_000;
pub const DEFAULT_LIMIT: usize = 100;

// ============================================================================
// Pagination tokens
// ============================================================================

/// Paging direction encoded in a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

/// An opaque keyset-pagination token: `direction:collection:item_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageToken {
    pub direction: Direction,
    pub collection: String,
    pub item_id: String,
}

impl PageToken {
    /// Serialise to the base64url wire form.
    pub fn encode(&self) -> String {
        let dir = match self.direction {
            Direction::Next => "next",
            Direction::Prev => "prev",
        };
        B64URL.encode(format!("{dir}:{}:{}", self.collection, self.item_id))
    }

    /// Parse the wire form back; rejects anything that does not decode to
    /// the three-part shape.
    pub fn decode(raw: &str) -> ApiResult<Self> {
        let bytes = B64URL
            .decode(raw.as_bytes())
            .map_err(|_| ApiError::InvalidInput("malformed pagination token".into()))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| ApiError::InvalidInput("malformed pagination token".into()))?;
        let mut parts = text.splitn(3, ':');
        let direction = match parts.next() {
            Some("next") => Direction::Next,
            Some("prev") => Direction::Prev,
            _ => return Err(ApiError::InvalidInput("malformed pagination token".into())),
        };
        let (collection, item_id) = match (parts.next(), parts.next()) {
            (Some(c), Some(i)) if !c.is_empty() && !i.is_empty() => {
                (c.to_string(), i.to_string())
            }
            _ => return Err(ApiError::InvalidInput("malformed pagination token".into())),
        };
        Ok(Self { direction, collection, item_id })
    }

    /// The id-range filter and sort direction this token implies.
    pub fn keyset_filter(&self) -> (String, bool) {
        match self.direction {
            Direction::Next => (format!("id:{{{} TO *]", self.item_id), false),
            Direction::Prev => (format!("id:[* TO {}}}", self.item_id), true),
        }
    }
}

// ============================================================================
// Datetime parameter
// ============================================================================

/// Parse the STAC `datetime` parameter: a single instant, or
/// `start/end` where either side may be the open marker `..`.
pub fn parse_datetime(raw: &str) -> ApiResult<TimeRange> {
    let open_min = DateTime::<Utc>::UNIX_EPOCH;
    let open_max: DateTime<Utc> = "9999-12-31T23:59:59Z".parse().expect("static timestamp");
    match raw.split_once('/') {
        None => {
            let t = parse_iso(raw)?;
            Ok(TimeRange { start: t, end: t })
        }
        Some((lo, hi)) => {
            let start = if lo == ".." { open_min } else { parse_iso(lo)? };
            let end = if hi == ".." { open_max } else { parse_iso(hi)? };
            if start > end {
                return Err(ApiError::InvalidInput(format!(
                    "{raw}: datetime start is after its end"
                )));
            }
            Ok(TimeRange { start, end })
        }
    }
}

// ============================================================================
// Document decoding helpers
// ============================================================================

fn first_str<'a>(doc: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    match doc.get(field) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Array(a)) => a.first().and_then(Value::as_str),
        _ => None,
    }
}

/// Parse the document `bbox` field: either four floats or the index's
/// `ENVELOPE(minx, maxx, maxy, miny)` form. Absent means global.
pub fn doc_bbox(doc: &Map<String, Value>) -> [f64; 4] {
    if let Some(Value::Array(a)) = doc.get("bbox") {
        let nums: Vec<f64> = a.iter().filter_map(Value::as_f64).collect();
        if nums.len() == 4 {
            return [nums[0], nums[1], nums[2], nums[3]];
        }
    }
    if let Some(s) = first_str(doc, "bbox") {
        if let Some(inner) = s
            .trim()
            .strip_prefix("ENVELOPE(")
            .and_then(|s| s.strip_suffix(')'))
        {
            let nums: Vec<f64> = inner
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if nums.len() == 4 {
                // ENVELOPE order is minx, maxx, maxy, miny.
                return [nums[0], nums[3], nums[1], nums[2]];
            }
        }
    }
    [-180.0, -90.0, 180.0, 90.0]
}

/// Parse the document `time` field, stored as the index's range form
/// `[start TO end]`.
pub fn doc_time(doc: &Map<String, Value>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let raw = first_str(doc, "time")?;
    let inner = raw.trim().strip_prefix('[')?.strip_suffix(']')?;
    let (lo, hi) = inner.split_once(" TO ")?;
    let start = parse_iso(lo.trim()).ok()?;
    let end = parse_iso(hi.trim()).ok()?;
    Some((start, end))
}

// ============================================================================
// Object synthesis
// ============================================================================

fn stac_base(base_url: &str) -> String {
    format!("{base_url}/api/freva-nextgen/stacapi")
}

/// The landing page document.
pub fn landing(base_url: &str) -> Value {
    let base = stac_base(base_url);
    json!({
        "type": "Catalog",
        "stac_version": STAC_VERSION,
        "id": LANDING_ID,
        "title": "Freva databrowser STAC API",
        "description": "Climate datasets indexed by the freva databrowser",
        "conformsTo": CONFORMANCE,
        "links": [
            { "rel": "self", "type": "application/json", "href": base },
            { "rel": "root", "type": "application/json", "href": base },
            { "rel": "conformance", "type": "application/json", "href": format!("{base}/conformance") },
            { "rel": "data", "type": "application/json", "href": format!("{base}/collections") },
            { "rel": "search", "type": "application/geo+json", "href": format!("{base}/search"), "method": "GET" },
        ],
    })
}

/// One collection document for a lowercased project name.
pub fn collection(base_url: &str, project: &str, item_count: u64) -> Value {
    let base = stac_base(base_url);
    json!({
        "type": "Collection",
        "stac_version": STAC_VERSION,
        "id": project,
        "title": project,
        "description": format!("Datasets of project {project}"),
        "license": "other",
        "extent": {
            "spatial": { "bbox": [[-180.0, -90.0, 180.0, 90.0]] },
            "temporal": { "interval": [[null, null]] },
        },
        "summaries": { "item_count": item_count },
        "links": [
            { "rel": "self", "type": "application/json", "href": format!("{base}/collections/{project}") },
            { "rel": "root", "type": "application/json", "href": base },
            { "rel": "parent", "type": "application/json", "href": base },
            { "rel": "items", "type": "application/geo+json", "href": format!("{base}/collections/{project}/items") },
            { "rel": "queryables", "type": "application/schema+json", "href": format!("{base}/collections/{project}/queryables") },
        ],
    })
}

/// One item (GeoJSON Feature) for a search document.
pub fn item(base_url: &str, collection_id: &str, doc: &Map<String, Value>) -> Value {
    let base = stac_base(base_url);
    let id = doc
        .get("id")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    let bbox = doc_bbox(doc);
    let [minx, miny, maxx, maxy] = bbox;

    let mut properties = Map::new();
    match doc_time(doc) {
        Some((start, end)) => {
            properties.insert("datetime".into(), Value::Null);
            properties.insert(
                "start_datetime".into(),
                json!(start.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            );
            properties.insert(
                "end_datetime".into(),
                json!(end.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            );
        }
        None => {
            properties.insert("datetime".into(), Value::Null);
        }
    }
    for (key, value) in doc {
        if !matches!(key.as_str(), "id" | "time" | "bbox" | "file" | "uri" | "_version_") {
            properties.insert(key.clone(), value.clone());
        }
    }

    let mut assets = Map::new();
    if let Some(file) = first_str(doc, "file") {
        assets.insert(
            "data".into(),
            json!({ "href": file, "type": "application/netcdf", "roles": ["data"] }),
        );
    }
    if let Some(uri) = first_str(doc, "uri") {
        assets.insert(
            "source".into(),
            json!({ "href": uri, "roles": ["data"] }),
        );
    }
    let location = first_str(doc, "file").or_else(|| first_str(doc, "uri")).unwrap_or("");
    assets.insert(
        "zarr-access".into(),
        json!({
            "href": format!(
                "{base_url}/api/freva-nextgen/data-portal/zarr/convert?path={location}"
            ),
            "type": "application/vnd+zarr",
            "roles": ["data"],
            "title": "Stream as Zarr",
        }),
    );

    json!({
        "type": "Feature",
        "stac_version": STAC_VERSION,
        "id": id,
        "collection": collection_id,
        "geometry": {
            "type": "Polygon",
            "coordinates": [[
                [minx, miny], [maxx, miny], [maxx, maxy], [minx, maxy], [minx, miny]
            ]],
        },
        "bbox": bbox,
        "properties": Value::Object(properties),
        "assets": Value::Object(assets),
        "links": [
            { "rel": "self", "type": "application/geo+json",
              "href": format!("{base}/collections/{collection_id}/items/{id}") },
            { "rel": "collection", "type": "application/json",
              "href": format!("{base}/collections/{collection_id}") },
            { "rel": "root", "type": "application/json", "href": base },
        ],
    })
}

/// The queryables schema shared by every collection.
pub fn queryables(fields: &[&str]) -> Value {
    let properties: Map<String, Value> = fields
        .iter()
        .map(|f| {
            (
                f.to_string(),
                json!({ "title": f, "type": "string" }),
            )
        })
        .collect();
    json!({
        "$schema": "https://json-schema.org/draft/2019-09/schema",
        "type": "object",
        "title": "Queryables",
        "properties": Value::Object(properties),
        "additionalProperties": true,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip_and_shape() {
        let t = PageToken {
            direction: Direction::Next,
            collection: "observations".into(),
            item_id: "4711".into(),
        };
        let encoded = t.encode();
        assert_eq!(PageToken::decode(&encoded).unwrap(), t);
        // The encoding is plain base64url over the documented shape.
        assert_eq!(
            B64URL.decode(encoded.as_bytes()).unwrap(),
            b"next:observations:4711"
        );
        assert!(PageToken::decode("!!!").is_err());
        assert!(PageToken::decode(&B64URL.encode("sideways:a:b")).is_err());
        assert!(PageToken::decode(&B64URL.encode("next:only-two")).is_err());
    }

    #[test]
    fn keyset_filters_are_half_open() {
        let next = PageToken {
            direction: Direction::Next,
            collection: "c".into(),
            item_id: "42".into(),
        };
        assert_eq!(next.keyset_filter(), ("id:{42 TO *]".to_string(), false));
        let prev = PageToken { direction: Direction::Prev, ..next };
        assert_eq!(prev.keyset_filter(), ("id:[* TO 42}".to_string(), true));
    }

    #[test]
    fn datetime_parameter_variants() {
        let r = parse_datetime("2020-01-01/2020-06-01").unwrap();
        assert!(r.start < r.end);
        let open = parse_datetime("../2020-06-01").unwrap();
        assert_eq!(open.start, DateTime::<Utc>::UNIX_EPOCH);
        let single = parse_datetime("2020-01-01T12:00:00Z").unwrap();
        assert_eq!(single.start, single.end);
        assert!(parse_datetime("2021-01-01/2020-01-01").is_err());
    }

    #[test]
    fn envelope_and_array_bboxes_decode() {
        let doc: Map<String, Value> =
            serde_json::from_value(json!({ "bbox": "ENVELOPE(-10, 20, 60, 30)" })).unwrap();
        assert_eq!(doc_bbox(&doc), [-10.0, 30.0, 20.0, 60.0]);
        let doc: Map<String, Value> =
            serde_json::from_value(json!({ "bbox": [1.0, 2.0, 3.0, 4.0] })).unwrap();
        assert_eq!(doc_bbox(&doc), [1.0, 2.0, 3.0, 4.0]);
        let doc: Map<String, Value> = serde_json::from_value(json!({})).unwrap();
        assert_eq!(doc_bbox(&doc), [-180.0, -90.0, 180.0, 90.0]);
    }

    #[test]
    fn items_carry_interval_and_zarr_asset() {
        let doc: Map<String, Value> = serde_json::from_value(json!({
            "id": 4711,
            "project": ["observations"],
            "variable": ["pr"],
            "file": "/arch/pr.nc",
            "time": "[2016-09-02T22:15:00Z TO 2016-10-01T00:00:00Z]",
            "bbox": "ENVELOPE(-10, 20, 60, 30)",
        }))
        .unwrap();
        let feature = item("https://host", "observations", &doc);
        assert_eq!(feature["id"], "4711");
        assert_eq!(feature["collection"], "observations");
        assert_eq!(feature["properties"]["start_datetime"], "2016-09-02T22:15:00Z");
        assert_eq!(feature["properties"]["end_datetime"], "2016-10-01T00:00:00Z");
        assert_eq!(feature["bbox"], json!([-10.0, 30.0, 20.0, 60.0]));
        let zarr = &feature["assets"]["zarr-access"];
        assert!(zarr["href"].as_str().unwrap().contains("/data-portal/zarr/convert"));
        // Location fields live in assets, not properties.
        assert!(feature["properties"].get("file").is_none());
    }
}

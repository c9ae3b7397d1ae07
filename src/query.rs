//! Search-time query syntax: facet values, time ranges, bounding boxes.
//!
//! This module owns everything the search index cannot express natively. It
//! parses the user-facing value syntax and renders Solr filter-query
//! fragments; the [`crate::solr`] client glues them onto the wire.
//!
//! Facet value grammar (per `key=value` pair):
//! - bare string: exact match;
//! - leading and/or trailing `*`: wildcard;
//! - `/…/`: regular expression, passed to the index;
//! - `{v1,v2,…}`: disjunction;
//! - a repeated key composes disjunctively, `key_not_` negations compose
//!   conjunctively.
//!
//! All matching is case-insensitive: facet values are lowercased at ingest
//! time, so queries are lowercased here as well.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};

/// Upper bound on `batch_size` for streaming (plain text / ndjson) results.
pub const MAX_BATCH_STREAMING: usize = 10_000;
/// Upper bound on `batch_size` for paged (JSON) results.
pub const MAX_BATCH_PAGED: usize = 1_000;

// ============================================================================
// Facet values
// ============================================================================

/// A parsed facet value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FacetValue {
    /// Exact (case-insensitive) term.
    Exact(String),
    /// Glob with `*` at either or both ends.
    Wildcard(String),
    /// Regular expression, `/…/` in the input.
    Regex(String),
    /// `{a,b,c}` disjunction.
    OneOf(Vec<FacetValue>),
}

/// Parse one facet value according to the grammar above.
pub fn parse_facet_value(raw: &str) -> ApiResult<FacetValue> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ApiError::InvalidInput("empty facet value".into()));
    }
    if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ApiError::InvalidInput(format!("{raw}: empty alternative")));
        }
        let values = parts
            .into_iter()
            .map(parse_facet_value)
            .collect::<ApiResult<Vec<_>>>()?;
        return Ok(FacetValue::OneOf(values));
    }
    if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
        return Ok(FacetValue::Regex(raw[1..raw.len() - 1].to_lowercase()));
    }
    if raw.starts_with('*') || raw.ends_with('*') {
        return Ok(FacetValue::Wildcard(raw.to_lowercase()));
    }
    Ok(FacetValue::Exact(raw.to_lowercase()))
}

/// Escape Lucene query specials in a term. Asterisks survive when the term
/// is a wildcard.
fn escape_term(term: &str, keep_stars: bool) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        let special = matches!(
            c,
            '+' | '-' | '&' | '|' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"'
                | '~' | '?' | ':' | '\\' | '/' | ' '
        ) || (c == '*' && !keep_stars);
        if special {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn render_atom(value: &FacetValue) -> String {
    match value {
        FacetValue::Exact(s) => escape_term(s, false),
        FacetValue::Wildcard(s) => escape_term(s, true),
        FacetValue::Regex(s) => format!("/{}/", s.replace('/', "\\/")),
        FacetValue::OneOf(vs) => {
            let parts: Vec<String> = vs.iter().map(render_atom).collect();
            format!("({})", parts.join(" OR "))
        }
    }
}

/// Render a positive filter query for `field` over one or more raw values.
/// Repeated values compose disjunctively.
pub fn facet_filter(field: &str, raw_values: &[String]) -> ApiResult<String> {
    let atoms = raw_values
        .iter()
        .map(|v| parse_facet_value(v).map(|p| render_atom(&p)))
        .collect::<ApiResult<Vec<_>>>()?;
    if atoms.len() == 1 {
        Ok(format!("{field}:{}", atoms[0]))
    } else {
        Ok(format!("{field}:({})", atoms.join(" OR ")))
    }
}

/// Render the conjunctive negation filters for `field`: one prohibitive
/// filter query per value.
pub fn negation_filters(field: &str, raw_values: &[String]) -> ApiResult<Vec<String>> {
    raw_values
        .iter()
        .map(|v| {
            let atom = render_atom(&parse_facet_value(v)?);
            Ok(format!("-{field}:{atom}"))
        })
        .collect()
}

// ============================================================================
// Time
// ============================================================================

/// Match mode for time-range filtering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSelect {
    /// Document interval intersects the query interval.
    #[default]
    Flexible,
    /// Document interval is contained within the query interval.
    Strict,
}

impl TimeSelect {
    /// Parse the `time_select` query parameter.
    pub fn parse(raw: &str) -> ApiResult<Self> {
        match raw {
            "flexible" => Ok(Self::Flexible),
            "strict" => Ok(Self::Strict),
            other => Err(ApiError::InvalidInput(format!(
                "{other}: time_select must be flexible or strict"
            ))),
        }
    }
}

/// A closed query interval `[start, end]` in UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Parse a partial ISO-8601 timestamp. Missing components snap to the start
/// of the named period, so `2016-10` is `2016-10-01T00:00:00Z`.
pub fn parse_partial_iso(raw: &str) -> ApiResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{raw}-01-01"), "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    Err(ApiError::InvalidInput(format!(
        "{raw}: not an ISO-8601 timestamp"
    )))
}

/// Parse a `time` parameter: `<iso>` or `<iso> to <iso>`. A single timestamp
/// is the instantaneous query `[t, t]`.
pub fn parse_time_spec(raw: &str) -> ApiResult<TimeRange> {
    let raw = raw.trim();
    let (lo, hi) = match raw.split_once(" to ") {
        Some((a, b)) => (parse_partial_iso(a)?, parse_partial_iso(b)?),
        None => {
            let t = parse_partial_iso(raw)?;
            (t, t)
        }
    };
    if lo > hi {
        return Err(ApiError::InvalidInput(format!(
            "{raw}: time range start is after its end"
        )));
    }
    Ok(TimeRange { start: lo, end: hi })
}

/// Render the Solr filter for the `time` date-range field.
pub fn time_filter(range: &TimeRange, select: TimeSelect) -> String {
    let op = match select {
        TimeSelect::Flexible => "Intersects",
        TimeSelect::Strict => "Within",
    };
    format!(
        "{{!field f=time op={op}}}[{} TO {}]",
        range.start.format("%Y-%m-%dT%H:%M:%SZ"),
        range.end.format("%Y-%m-%dT%H:%M:%SZ"),
    )
}

// ============================================================================
// Bounding boxes
// ============================================================================

/// Match mode for bbox filtering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BBoxSelect {
    /// Document box intersects the query box.
    #[default]
    Flexible,
    /// Document box is contained within the query box.
    Strict,
}

impl BBoxSelect {
    pub fn parse(raw: &str) -> ApiResult<Self> {
        match raw {
            "flexible" => Ok(Self::Flexible),
            "strict" => Ok(Self::Strict),
            other => Err(ApiError::InvalidInput(format!(
                "{other}: bbox_select must be flexible or strict"
            ))),
        }
    }
}

/// A WGS-84 bounding box. `minx > maxx` encodes an antimeridian crossing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

/// The whole globe; documents without a `bbox` are treated as global.
pub const GLOBAL_BBOX: BBox = BBox {
    minx: -180.0,
    miny: -90.0,
    maxx: 180.0,
    maxy: 90.0,
};

impl BBox {
    /// Whether this box crosses the antimeridian.
    pub fn crosses_antimeridian(&self) -> bool {
        self.minx > self.maxx
    }

    /// Split an antimeridian-crossing box into its two hemispheric parts.
    pub fn split(&self) -> Vec<BBox> {
        if self.crosses_antimeridian() {
            vec![
                BBox { minx: self.minx, miny: self.miny, maxx: 180.0, maxy: self.maxy },
                BBox { minx: -180.0, miny: self.miny, maxx: self.maxx, maxy: self.maxy },
            ]
        } else {
            vec![*self]
        }
    }
}

/// Parse a `bbox` parameter: four comma-separated floats
/// `minx,miny,maxx,maxy`.
pub fn parse_bbox(raw: &str) -> ApiResult<BBox> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ApiError::InvalidInput(format!("{raw}: bbox must be four numbers")))?;
    if parts.len() != 4 {
        return Err(ApiError::InvalidInput(format!(
            "{raw}: bbox must be minx,miny,maxx,maxy"
        )));
    }
    let b = BBox { minx: parts[0], miny: parts[1], maxx: parts[2], maxy: parts[3] };
    let lat_ok = (-90.0..=90.0).contains(&b.miny)
        && (-90.0..=90.0).contains(&b.maxy)
        && b.miny <= b.maxy;
    let lon_ok = (-180.0..=180.0).contains(&b.minx) && (-180.0..=180.0).contains(&b.maxx);
    if !lat_ok || !lon_ok {
        return Err(ApiError::InvalidInput(format!(
            "{raw}: bbox outside WGS-84 bounds"
        )));
    }
    Ok(b)
}

/// Render the Solr spatial filter for the `bbox` field. Antimeridian
/// crossings become a disjunction of two envelope queries.
pub fn bbox_filter(bbox: &BBox, select: BBoxSelect) -> String {
    let op = match select {
        BBoxSelect::Flexible => "Intersects",
        BBoxSelect::Strict => "IsWithin",
    };
    let clauses: Vec<String> = bbox
        .split()
        .iter()
        .map(|b| {
            format!(
                "bbox:\"{op}(ENVELOPE({}, {}, {}, {}))\"",
                b.minx, b.maxx, b.maxy, b.miny
            )
        })
        .collect();
    if clauses.len() == 1 {
        clauses.into_iter().next().expect("one clause")
    } else {
        format!("({})", clauses.join(" OR "))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facet_value_grammar() {
        assert_eq!(parse_facet_value("CP4").unwrap(), FacetValue::Exact("cp4".into()));
        assert_eq!(
            parse_facet_value("cp*").unwrap(),
            FacetValue::Wildcard("cp*".into())
        );
        assert_eq!(
            parse_facet_value("*ERA*").unwrap(),
            FacetValue::Wildcard("*era*".into())
        );
        assert_eq!(
            parse_facet_value("/cp.[0-9]/").unwrap(),
            FacetValue::Regex("cp.[0-9]".into())
        );
        assert_eq!(
            parse_facet_value("{pr,tas}").unwrap(),
            FacetValue::OneOf(vec![
                FacetValue::Exact("pr".into()),
                FacetValue::Exact("tas".into())
            ])
        );
        assert!(parse_facet_value("").is_err());
        assert!(parse_facet_value("{pr,}").is_err());
    }

    #[test]
    fn filters_render_solr_syntax() {
        assert_eq!(facet_filter("model", &["cp*".into()]).unwrap(), "model:cp*");
        assert_eq!(
            facet_filter("variable", &["pr".into(), "tas".into()]).unwrap(),
            "variable:(pr OR tas)"
        );
        assert_eq!(
            facet_filter("experiment", &["{hist,rcp85}".into()]).unwrap(),
            "experiment:(hist OR rcp85)"
        );
        // Specials are escaped, wildcard stars are not.
        assert_eq!(
            facet_filter("dataset", &["a b:c".into()]).unwrap(),
            "dataset:a\\ b\\:c"
        );
        assert_eq!(
            negation_filters("model", &["mpi*".into(), "cp4".into()]).unwrap(),
            vec!["-model:mpi*".to_string(), "-model:cp4".to_string()]
        );
    }

    #[test]
    fn partial_timestamps_snap_to_period_start() {
        assert_eq!(
            parse_partial_iso("2016-10").unwrap(),
            "2016-10-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            parse_partial_iso("2016").unwrap(),
            "2016-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            parse_partial_iso("2016-09-02T22:15").unwrap(),
            "2016-09-02T22:15:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert!(parse_partial_iso("not-a-date").is_err());
    }

    #[test]
    fn time_spec_and_filter() {
        let r = parse_time_spec("2016-09-02T22:15 to 2016-10").unwrap();
        assert_eq!(
            time_filter(&r, TimeSelect::Strict),
            "{!field f=time op=Within}[2016-09-02T22:15:00Z TO 2016-10-01T00:00:00Z]"
        );
        assert_eq!(
            time_filter(&r, TimeSelect::Flexible),
            "{!field f=time op=Intersects}[2016-09-02T22:15:00Z TO 2016-10-01T00:00:00Z]"
        );
        // Single timestamps query the instant.
        let instant = parse_time_spec("2000-01-01").unwrap();
        assert_eq!(instant.start, instant.end);
        assert!(parse_time_spec("2020 to 2010").is_err());
    }

    #[test]
    fn bbox_parse_and_filter() {
        let b = parse_bbox("-10, 30, 20, 60").unwrap();
        assert_eq!(
            bbox_filter(&b, BBoxSelect::Flexible),
            "bbox:\"Intersects(ENVELOPE(-10, 20, 60, 30))\""
        );
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("-10,95,20,99").is_err());
    }

    #[test]
    fn antimeridian_boxes_are_split_and_ored() {
        let b = parse_bbox("170,-10,-170,10").unwrap();
        assert!(b.crosses_antimeridian());
        let f = bbox_filter(&b, BBoxSelect::Flexible);
        assert_eq!(
            f,
            "(bbox:\"Intersects(ENVELOPE(170, 180, 10, -10))\" OR \
             bbox:\"Intersects(ENVELOPE(-180, -170, 10, -10))\")"
        );
    }
}

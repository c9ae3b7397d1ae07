//! Search engine adapter: the bridge between canonicalised queries and the
//! Solr client.
//!
//! Enforces the cross-cutting rules the index cannot express on its own
//! (time/bbox semantics, the multi-version switch, user-data ownership) and
//! exposes the operations the HTTP surface consumes: lazy location streams,
//! facet maps, counts, and user-data ingest/delete.

use std::collections::BTreeMap;

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tracing::info;

use crate::auth::Principal;
use crate::error::{ApiError, ApiResult};
use crate::flavour::{is_canonical, FACET_FIELDS};
use crate::query::{
    self, BBox, BBoxSelect, TimeRange, TimeSelect, MAX_BATCH_PAGED, MAX_BATCH_STREAMING,
};
use crate::solr::{SelectParams, SelectResponse, SolrClient};

/// The two addressable location fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniqKey {
    File,
    Uri,
}

impl UniqKey {
    pub fn parse(raw: &str) -> ApiResult<Self> {
        match raw {
            "file" => Ok(Self::File),
            "uri" => Ok(Self::Uri),
            other => Err(ApiError::InvalidInput(format!(
                "{other}: unique key must be file or uri"
            ))),
        }
    }

    pub fn field(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Uri => "uri",
        }
    }
}

/// A fully canonicalised search request.
#[derive(Clone, Debug, Default)]
pub struct SearchRequest {
    /// Canonical `key → values` with disjunctive value lists. Keys carrying
    /// the `_not_` suffix are negations.
    pub facets: BTreeMap<String, Vec<String>>,
    pub time: Option<(TimeRange, TimeSelect)>,
    pub bbox: Option<(BBox, BBoxSelect)>,
    /// Query the multi-version collection instead of the latest view.
    pub multi_version: bool,
}

impl SearchRequest {
    /// Fold a canonicalised key/value sequence into the request, composing
    /// repeated keys disjunctively.
    pub fn collect_facets(
        &mut self,
        pairs: impl IntoIterator<Item = (String, String)>,
    ) -> ApiResult<()> {
        for (key, value) in pairs {
            let bare = key.strip_suffix("_not_").unwrap_or(&key);
            if bare == "version" && !self.multi_version {
                return Err(ApiError::InvalidInput(
                    "version is only searchable together with multi-version".into(),
                ));
            }
            if !is_canonical(bare) {
                return Err(ApiError::InvalidInput(format!(
                    "{bare}: not a valid search facet"
                )));
            }
            self.facets.entry(key).or_default().push(value);
        }
        Ok(())
    }

    /// Render the Solr filter queries for this request.
    pub fn filters(&self) -> ApiResult<Vec<String>> {
        let mut fq = Vec::new();
        for (key, values) in &self.facets {
            match key.strip_suffix("_not_") {
                Some(field) => fq.extend(query::negation_filters(field, values)?),
                None => fq.push(query::facet_filter(key, values)?),
            }
        }
        if let Some((range, select)) = &self.time {
            fq.push(query::time_filter(range, *select));
        }
        if let Some((bbox, select)) = &self.bbox {
            fq.push(query::bbox_filter(bbox, *select));
        }
        Ok(fq)
    }
}

/// Outcome of a user-data ingest.
#[derive(Debug, serde::Serialize)]
pub struct IngestSummary {
    pub ingested: usize,
    pub skipped: usize,
}

/// Outcome of a user-data delete.
#[derive(Debug, serde::Serialize)]
pub struct DeleteSummary {
    pub deleted: u64,
}

/// The adapter itself. Cheap to clone.
#[derive(Clone)]
pub struct SearchAdapter {
    solr: SolrClient,
}

impl SearchAdapter {
    pub fn new(solr: SolrClient) -> Self {
        Self { solr }
    }

    /// Clamp a requested batch size against the streaming or paged cap.
    pub fn clamp_batch(batch_size: usize, streaming: bool) -> usize {
        let cap = if streaming { MAX_BATCH_STREAMING } else { MAX_BATCH_PAGED };
        batch_size.clamp(1, cap)
    }

    /// Lazy stream of `file`/`uri` locations, index-sorted by `id` so the
    /// order is stable across pages. Pages are pulled from the backend on
    /// demand; dropping the stream stops the pulling.
    pub fn data_search(
        &self,
        req: SearchRequest,
        uniq_key: UniqKey,
        start: usize,
        batch_size: usize,
    ) -> impl Stream<Item = ApiResult<String>> + Send + 'static {
        let solr = self.solr.clone();
        let rows = Self::clamp_batch(batch_size, true);
        let field = uniq_key.field();

        let init = (solr, req, start, false);
        stream::try_unfold(init, move |(solr, req, offset, done)| async move {
            if done {
                return Ok(None);
            }
            let params = SelectParams {
                fq: req.filters()?,
                fl: Some(format!("{field},id")),
                sort: Some("id asc".into()),
                start: Some(offset),
                rows,
                ..Default::default()
            };
            let page = solr.select(req.multi_version, &params).await?;
            let n = page.docs.len();
            let out: Vec<String> = page
                .docs
                .iter()
                .filter_map(|d| location_of(d, field))
                .collect();
            let exhausted = n < rows;
            Ok(Some((out, (solr, req, offset + n, exhausted))))
        })
        .map(|page: ApiResult<Vec<String>>| match page {
            Ok(items) => stream::iter(items.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        })
        .flatten()
    }

    /// One page of whole documents, for the JSON renditions and STAC items.
    pub async fn docs_page(
        &self,
        req: &SearchRequest,
        start: usize,
        rows: usize,
        extra_fq: Vec<String>,
        sort: Option<String>,
    ) -> ApiResult<SelectResponse> {
        let mut fq = req.filters()?;
        fq.extend(extra_fq);
        let params = SelectParams {
            fq,
            sort: Some(sort.unwrap_or_else(|| "id asc".into())),
            start: Some(start),
            rows,
            ..Default::default()
        };
        self.solr.select(req.multi_version, &params).await
    }

    /// Facet counts over the canonical facet fields.
    ///
    /// `extended` widens the field list to every canonical facet;
    /// `facet_filter` narrows the counted values by substring.
    pub async fn metadata_search(
        &self,
        req: &SearchRequest,
        extended: bool,
        facet_filter: Option<String>,
    ) -> ApiResult<(u64, BTreeMap<String, Vec<(String, u64)>>)> {
        let fields: Vec<String> = if extended {
            FACET_FIELDS.iter().map(|f| f.to_string()).collect()
        } else {
            // The standard set leaves out the rarely-populated fields.
            FACET_FIELDS
                .iter()
                .filter(|f| {
                    !matches!(
                        **f,
                        "time_aggregation" | "grid_id" | "level_type" | "format" | "dataset"
                    )
                })
                .map(|f| f.to_string())
                .collect()
        };
        let params = SelectParams {
            fq: req.filters()?,
            rows: 0,
            facet_fields: fields,
            facet_mincount: 1,
            facet_contains: facet_filter,
            ..Default::default()
        };
        let resp = self.solr.select(req.multi_version, &params).await?;
        Ok((resp.num_found, resp.facets))
    }

    /// Total hit count, optionally broken down per facet value.
    pub async fn count(
        &self,
        req: &SearchRequest,
        detail: bool,
    ) -> ApiResult<(u64, Option<BTreeMap<String, Vec<(String, u64)>>>)> {
        if detail {
            let (total, facets) = self.metadata_search(req, true, None).await?;
            Ok((total, Some(facets)))
        } else {
            let params = SelectParams {
                fq: req.filters()?,
                rows: 0,
                ..Default::default()
            };
            let resp = self.solr.select(req.multi_version, &params).await?;
            Ok((resp.num_found, None))
        }
    }

    /// Fetch one document by id within a project collection.
    pub async fn doc_by_id(
        &self,
        project: &str,
        id: &str,
        multi_version: bool,
    ) -> ApiResult<Option<serde_json::Map<String, Value>>> {
        let params = SelectParams {
            fq: vec![
                query::facet_filter("project", &[project.to_string()])?,
                format!("id:{}", id.replace(|c: char| !c.is_ascii_alphanumeric(), "")),
            ],
            rows: 1,
            ..Default::default()
        };
        let resp = self.solr.select(multi_version, &params).await?;
        Ok(resp.docs.into_iter().next())
    }

    // ------------------------------ User data ------------------------------

    /// Ingest user-owned entries. Defaults from `facets` apply to every
    /// entry, per-entry fields win. Entries missing one of
    /// `file, variable, time, time_frequency` are skipped, not fatal.
    pub async fn add_user_data(
        &self,
        principal: &Principal,
        entries: Vec<serde_json::Map<String, Value>>,
        facets: BTreeMap<String, String>,
    ) -> ApiResult<IngestSummary> {
        const REQUIRED: [&str; 4] = ["file", "variable", "time", "time_frequency"];

        for key in facets.keys() {
            if !is_canonical(key) {
                return Err(ApiError::InvalidInput(format!(
                    "{key}: not a canonical field"
                )));
            }
        }

        let mut docs = Vec::new();
        let mut skipped = 0usize;
        for entry in entries {
            let mut doc = serde_json::Map::new();
            for (k, v) in &facets {
                doc.insert(k.clone(), Value::String(v.clone()));
            }
            for (k, v) in entry {
                if !is_canonical(&k) {
                    skipped += 1;
                    doc.clear();
                    break;
                }
                doc.insert(k, v);
            }
            if doc.is_empty() {
                continue;
            }
            if REQUIRED.iter().any(|k| !doc.contains_key(*k)) {
                skipped += 1;
                continue;
            }
            // Ownership is stamped by the server, never taken from input.
            doc.insert("user".into(), Value::String(principal.username.clone()));
            doc.entry("project".to_string())
                .or_insert_with(|| Value::String("user-data".into()));
            normalise_user_doc(&mut doc);
            docs.push(Value::Object(doc));
        }

        let ingested = docs.len();
        if ingested > 0 {
            // User data is visible in both the multi-version collection and
            // the latest view.
            self.solr.add_docs(true, &docs).await?;
            self.solr.add_docs(false, &docs).await?;
            info!(
                user = %principal.username,
                ingested, skipped, "ingested user data"
            );
        }
        Ok(IngestSummary { ingested, skipped })
    }

    /// Delete user data matching `facets`. Refuses entirely when the match
    /// set contains documents owned by someone else; admins may scope an
    /// explicit `user=<name>` instead.
    pub async fn delete_user_data(
        &self,
        principal: &Principal,
        facets: BTreeMap<String, Vec<String>>,
    ) -> ApiResult<DeleteSummary> {
        let mut req = SearchRequest {
            multi_version: true,
            ..Default::default()
        };
        let explicit_user = facets.contains_key("user");
        if explicit_user && !principal.is_admin {
            return Err(ApiError::Forbidden(
                "only admins may delete other users' data".into(),
            ));
        }
        req.collect_facets(
            facets
                .into_iter()
                .flat_map(|(k, vs)| vs.into_iter().map(move |v| (k.clone(), v))),
        )?;
        if !explicit_user {
            req.facets
                .insert("user".into(), vec![principal.username.clone()]);
        }

        // Ownership check over the match set before anything is removed.
        let params = SelectParams {
            fq: req.filters()?,
            rows: 0,
            facet_fields: vec!["user".into()],
            facet_mincount: 1,
            ..Default::default()
        };
        let probe = self.solr.select(true, &params).await?;
        if probe.num_found == 0 {
            return Ok(DeleteSummary { deleted: 0 });
        }
        let owners = probe.facets.get("user").cloned().unwrap_or_default();
        let foreign = owners
            .iter()
            .any(|(owner, _)| !principal.is_admin && *owner != principal.username);
        if foreign {
            return Err(ApiError::Forbidden(
                "matched documents owned by another user".into(),
            ));
        }

        let joined = req.filters()?.join(" AND ");
        self.solr.delete_by_query(true, &joined).await?;
        self.solr.delete_by_query(false, &joined).await?;
        info!(user = %principal.username, deleted = probe.num_found, "deleted user data");
        Ok(DeleteSummary { deleted: probe.num_found })
    }
}

/// Pull the location string out of a document; Solr may hand multi-valued
/// fields back as arrays.
pub fn location_of(doc: &serde_json::Map<String, Value>, field: &str) -> Option<String> {
    match doc.get(field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(a)) => a.first().and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

fn normalise_user_doc(doc: &mut serde_json::Map<String, Value>) {
    // Facet fields are lowercased so matching stays case-insensitive.
    for (key, value) in doc.iter_mut() {
        if FACET_FIELDS.contains(&key.as_str()) {
            if let Value::String(s) = value {
                *value = Value::String(s.to_lowercase());
            }
        }
    }
    if !doc.contains_key("id") {
        let basis = location_of(doc, "file")
            .or_else(|| location_of(doc, "uri"))
            .unwrap_or_default();
        let digest = blake3::hash(basis.as_bytes());
        let id = i64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"));
        doc.insert("id".into(), Value::from(id.unsigned_abs()));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn req_with(pairs: &[(&str, &str)]) -> SearchRequest {
        let mut req = SearchRequest::default();
        req.collect_facets(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap();
        req
    }

    #[test]
    fn repeated_keys_compose_disjunctively() {
        let req = req_with(&[("variable", "pr"), ("variable", "tas")]);
        let fq = req.filters().unwrap();
        assert_eq!(fq, vec!["variable:(pr OR tas)".to_string()]);
    }

    #[test]
    fn negations_compose_conjunctively() {
        let req = req_with(&[("model_not_", "mpi*"), ("model_not_", "cp4")]);
        let fq = req.filters().unwrap();
        assert_eq!(fq, vec!["-model:mpi*".to_string(), "-model:cp4".to_string()]);
    }

    #[test]
    fn version_requires_multi_version() {
        let mut req = SearchRequest::default();
        assert!(req
            .collect_facets([("version".to_string(), "v20200101".to_string())])
            .is_err());
        req.multi_version = true;
        assert!(req
            .collect_facets([("version".to_string(), "v20200101".to_string())])
            .is_ok());
    }

    #[test]
    fn unknown_facets_are_rejected() {
        let mut req = SearchRequest::default();
        assert!(req
            .collect_facets([("colour".to_string(), "blue".to_string())])
            .is_err());
    }

    #[test]
    fn batch_clamping_follows_the_two_caps() {
        assert_eq!(SearchAdapter::clamp_batch(50_000, true), 10_000);
        assert_eq!(SearchAdapter::clamp_batch(50_000, false), 1_000);
        assert_eq!(SearchAdapter::clamp_batch(0, true), 1);
        assert_eq!(SearchAdapter::clamp_batch(150, true), 150);
    }

    #[test]
    fn location_extraction_handles_multivalued_fields() {
        let doc: serde_json::Map<String, Value> =
            serde_json::from_value(serde_json::json!({ "file": ["/a.nc", "/b.nc"] })).unwrap();
        assert_eq!(location_of(&doc, "file").as_deref(), Some("/a.nc"));
        let doc: serde_json::Map<String, Value> =
            serde_json::from_value(serde_json::json!({ "uri": "s3://x" })).unwrap();
        assert_eq!(location_of(&doc, "uri").as_deref(), Some("s3://x"));
    }

    #[test]
    fn user_doc_normalisation_stamps_id_and_lowercases() {
        let mut doc: serde_json::Map<String, Value> = serde_json::from_value(
            serde_json::json!({ "file": "/data/PR.nc", "variable": "PR" }),
        )
        .unwrap();
        normalise_user_doc(&mut doc);
        assert_eq!(doc["variable"], Value::String("pr".into()));
        assert!(doc.contains_key("id"));
        // Same input, same id.
        let mut again: serde_json::Map<String, Value> = serde_json::from_value(
            serde_json::json!({ "file": "/data/PR.nc", "variable": "PR" }),
        )
        .unwrap();
        normalise_user_doc(&mut again);
        assert_eq!(doc["id"], again["id"]);
    }
}

//! Low-level Solr client: select queries, facet counts, offset pagination,
//! and the update handler for user data.
//!
//! Two collections back the gateway: the configured core holds every
//! published version of a dataset (multi-version), `latest` holds the
//! deduplicated latest-version view. Callers pick per request. Result
//! pages are addressed by `start`/`rows` over a total sort order ending on
//! `id`; the index keeps no per-client cursor state.
//!
//! Connection errors and 5xx answers are retried up to three times with
//! exponential backoff (100, 400, 1600 ms); every attempt carries a 30 s
//! deadline. After the retries a `BACKEND_UNAVAILABLE` surfaces.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};

/// Per-attempt deadline on search backend calls.
pub const SOLR_DEADLINE: Duration = Duration::from_secs(30);

/// Backoff schedule between retries.
const BACKOFF_MS: [u64; 3] = [100, 400, 1600];

/// Parameters for one `select` call.
#[derive(Clone, Debug, Default)]
pub struct SelectParams {
    /// Main query; empty means match-all.
    pub q: Option<String>,
    /// Filter queries, combined conjunctively by Solr.
    pub fq: Vec<String>,
    /// Field list to return.
    pub fl: Option<String>,
    /// Sort spec. Stable pagination requires a total order ending on `id`.
    pub sort: Option<String>,
    /// Offset pagination.
    pub start: Option<usize>,
    /// Page size.
    pub rows: usize,
    /// Fields to facet on (classic facet API).
    pub facet_fields: Vec<String>,
    /// Facet count floor; 1 hides empty values.
    pub facet_mincount: u32,
    /// Substring filter on facet values (`facet.contains`).
    pub facet_contains: Option<String>,
}

impl SelectParams {
    fn to_query(&self) -> Vec<(String, String)> {
        let mut p: Vec<(String, String)> = Vec::new();
        p.push(("q".into(), self.q.clone().unwrap_or_else(|| "*:*".into())));
        p.push(("wt".into(), "json".into()));
        for fq in &self.fq {
            p.push(("fq".into(), fq.clone()));
        }
        if let Some(fl) = &self.fl {
            p.push(("fl".into(), fl.clone()));
        }
        if let Some(sort) = &self.sort {
            p.push(("sort".into(), sort.clone()));
        }
        if let Some(start) = self.start {
            p.push(("start".into(), start.to_string()));
        }
        p.push(("rows".into(), self.rows.to_string()));
        if !self.facet_fields.is_empty() {
            p.push(("facet".into(), "true".into()));
            p.push(("facet.limit".into(), "-1".into()));
            p.push(("facet.mincount".into(), self.facet_mincount.to_string()));
            if let Some(contains) = &self.facet_contains {
                p.push(("facet.contains".into(), contains.clone()));
                p.push(("facet.contains.ignoreCase".into(), "true".into()));
            }
            for f in &self.facet_fields {
                p.push(("facet.field".into(), f.clone()));
            }
        }
        p
    }
}

/// Decoded `select` answer.
#[derive(Debug, Default)]
pub struct SelectResponse {
    pub num_found: u64,
    pub docs: Vec<serde_json::Map<String, Value>>,
    /// Facet name → (value, count) pairs, in Solr's count-descending order.
    pub facets: BTreeMap<String, Vec<(String, u64)>>,
}

fn decode_select(raw: Value) -> ApiResult<SelectResponse> {
    let num_found = raw
        .pointer("/response/numFound")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let docs = raw
        .pointer("/response/docs")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|d| d.as_object().cloned())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    // Classic facet API interleaves values and counts in one array.
    let mut facets = BTreeMap::new();
    if let Some(fields) = raw
        .pointer("/facet_counts/facet_fields")
        .and_then(Value::as_object)
    {
        for (name, flat) in fields {
            let mut pairs = Vec::new();
            if let Some(arr) = flat.as_array() {
                for chunk in arr.chunks(2) {
                    if let [v, c] = chunk {
                        if let (Some(v), Some(c)) = (v.as_str(), c.as_u64()) {
                            pairs.push((v.to_string(), c));
                        }
                    }
                }
            }
            facets.insert(name.clone(), pairs);
        }
    }

    Ok(SelectResponse { num_found, docs, facets })
}

/// HTTP client for the search index. Cheap to clone.
#[derive(Clone)]
pub struct SolrClient {
    base: String,
    multi_core: String,
    http: reqwest::Client,
}

/// Name of the latest-version view.
const LATEST_CORE: &str = "latest";

impl SolrClient {
    pub fn new(host: &str, core: &str) -> Self {
        Self {
            base: host.trim_end_matches('/').to_string(),
            multi_core: core.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Collection for a query: the multi-version core or the latest view.
    pub fn collection(&self, multi_version: bool) -> &str {
        if multi_version {
            &self.multi_core
        } else {
            LATEST_CORE
        }
    }

    async fn request(
        &self,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> ApiResult<Value> {
        let mut last_err = String::new();
        for (attempt, backoff) in BACKOFF_MS.iter().copied().chain([0]).enumerate() {
            let res = build(&self.http).timeout(SOLR_DEADLINE).send().await;
            match res {
                Ok(res) if res.status().is_success() => {
                    return res
                        .json::<Value>()
                        .await
                        .map_err(|e| ApiError::internal(anyhow::anyhow!("solr response: {e}")));
                }
                Ok(res) if res.status().is_server_error() => {
                    last_err = format!("solr answered {}", res.status());
                }
                Ok(res) => {
                    let status = res.status();
                    let body = res.text().await.unwrap_or_default();
                    debug!("solr rejected query ({status}): {body}");
                    return Err(ApiError::InvalidInput(
                        "search backend rejected the query".into(),
                    ));
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_err = e.to_string();
                }
                Err(e) => return Err(ApiError::internal(e)),
            }
            if backoff > 0 {
                warn!("solr attempt {} failed ({last_err}), retrying", attempt + 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        Err(ApiError::BackendUnavailable(format!(
            "search backend unreachable: {last_err}"
        )))
    }

    /// Run one `select` query against a collection.
    pub async fn select(
        &self,
        multi_version: bool,
        params: &SelectParams,
    ) -> ApiResult<SelectResponse> {
        let url = format!("{}/solr/{}/select", self.base, self.collection(multi_version));
        let query = params.to_query();
        let raw = self
            .request(move |http| http.get(&url).query(&query))
            .await?;
        decode_select(raw)
    }

    /// Add (or overwrite) documents; commits immediately so user data is
    /// searchable on return.
    pub async fn add_docs(&self, multi_version: bool, docs: &[Value]) -> ApiResult<()> {
        let url = format!(
            "{}/solr/{}/update?commit=true",
            self.base,
            self.collection(multi_version)
        );
        self.request(move |http| http.post(&url).json(&docs)).await?;
        Ok(())
    }

    /// Delete every document matching a query; commits immediately.
    pub async fn delete_by_query(&self, multi_version: bool, query: &str) -> ApiResult<()> {
        let url = format!(
            "{}/solr/{}/update?commit=true",
            self.base,
            self.collection(multi_version)
        );
        let body = serde_json::json!({ "delete": { "query": query } });
        self.request(move |http| http.post(&url).json(&body)).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_params_render_expected_pairs() {
        let p = SelectParams {
            fq: vec!["project:observations".into(), "variable:pr".into()],
            fl: Some("file".into()),
            sort: Some("id asc".into()),
            start: Some(300),
            rows: 150,
            facet_fields: vec!["model".into()],
            facet_mincount: 1,
            ..Default::default()
        };
        let q = p.to_query();
        assert!(q.contains(&("q".into(), "*:*".into())));
        assert_eq!(q.iter().filter(|(k, _)| k == "fq").count(), 2);
        assert!(q.contains(&("start".into(), "300".into())));
        assert!(q.contains(&("facet.field".into(), "model".into())));
        assert!(q.contains(&("rows".into(), "150".into())));
    }

    #[test]
    fn facet_arrays_decode_interleaved() {
        let raw = serde_json::json!({
            "response": { "numFound": 2, "docs": [ { "file": "/a.nc" }, { "file": "/b.nc" } ] },
            "facet_counts": {
                "facet_fields": { "model": ["cp4", 5, "mpi-esm", 2] }
            }
        });
        let decoded = decode_select(raw).unwrap();
        assert_eq!(decoded.num_found, 2);
        assert_eq!(decoded.docs.len(), 2);
        assert_eq!(
            decoded.facets["model"],
            vec![("cp4".to_string(), 5), ("mpi-esm".to_string(), 2)]
        );
    }

    #[test]
    fn collection_switch_follows_multi_version() {
        let c = SolrClient::new("http://localhost:8983", "files");
        assert_eq!(c.collection(true), "files");
        assert_eq!(c.collection(false), "latest");
    }
}

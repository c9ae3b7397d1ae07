//! HTTP surface of the freva-rest gateway.
//!
//! Routes (all nested under `/api/freva-nextgen`, surfaces switchable via
//! `API_SERVICES`):
//!
//! Databrowser:
//! - GET  /databrowser/overview                                  -> flavours + attributes
//! - GET  /databrowser/data-search/:flavour/:uniq_key            -> text/plain stream (ndjson with `json`)
//! - GET  /databrowser/metadata-search/:flavour/:uniq_key        -> facet map
//! - GET  /databrowser/data-count/:flavour/:uniq_key             -> hit count (per-facet with `detail`)
//! - GET  /databrowser/intake-catalogue/:flavour/:uniq_key       -> intake-ESM JSON
//! - POST /databrowser/user-data        (auth)                   -> {ingested, skipped}
//! - DELETE /databrowser/user-data      (auth)                   -> {deleted}
//! - GET/POST /databrowser/flavours, PUT/DELETE /databrowser/flavours/:name (auth)
//!
//! STAC API:
//! - GET  /stacapi, /stacapi/conformance, /stacapi/queryables
//! - GET  /stacapi/collections[/:id[/items[/:item_id]]]
//! - GET/POST /stacapi/search
//!
//! Data portal (Zarr):
//! - GET/POST /data-portal/zarr/convert (auth)                   -> {urls}
//! - GET  /data-portal/zarr-utils/status?token= (auth)           -> {status, reason}
//! - GET  /data-portal/zarr-utils/html (auth)                    -> HTML summary
//! - GET  /data-portal/zarr/:store/*key (auth or public job)     -> metadata/chunks
//! - POST /data-portal/zarr/share-zarr (auth)                    -> share grant
//! - GET  /data-portal/share/:sig/:store/*key?expires=           -> as above, no auth
//!
//! Auth:
//! - GET  /auth/v2/.well-known/openid-configuration
//! - GET  /auth/v2/login, /auth/v2/callback, POST /auth/v2/token, POST /auth/v2/device
//! - GET  /auth/v2/status, /auth/v2/userinfo, /auth/v2/systemuser, /auth/v2/checkuser
//! - GET  /auth/v2/logout

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post, put};
use axum::{Form, Json, Router};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::auth::{AuthMediator, Principal, TokenGrant};
use crate::config::{Service, Settings};
use crate::docstore::DocStore;
use crate::error::{ApiError, ApiResult};
use crate::flavour::{BuiltInFlavour, Flavour, FlavourRegistry, FlavourUpsert, FACET_FIELDS};
use crate::intake;
use crate::query::{self, BBoxSelect, TimeSelect};
use crate::search::{SearchAdapter, SearchRequest, UniqKey};
use crate::stac::{self, Direction, PageToken};
use crate::stats::{StatsRecord, StatsSink};
use crate::zarr::{ConvertOptions, ZarrBroker, ZarrContent};

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub search: SearchAdapter,
    pub flavours: Arc<FlavourRegistry>,
    pub broker: ZarrBroker,
    pub auth: Arc<AuthMediator>,
    pub stats: StatsSink,
    pub store: DocStore,
}

/// Assemble the router for the enabled surfaces. CORS, tracing and rate
/// limiting are layered on by the binary.
pub fn router(state: AppState) -> Router {
    let mut inner = Router::new()
        .route("/ping", get(ping))
        .route(
            "/auth/v2/.well-known/openid-configuration",
            get(openid_configuration),
        )
        .route("/auth/v2/login", get(auth_login))
        .route("/auth/v2/callback", get(auth_callback))
        .route("/auth/v2/token", post(auth_token))
        .route("/auth/v2/device", post(auth_device))
        .route("/auth/v2/status", get(auth_status))
        .route("/auth/v2/userinfo", get(auth_userinfo))
        .route("/auth/v2/systemuser", get(auth_systemuser))
        .route("/auth/v2/checkuser", get(auth_checkuser))
        .route("/auth/v2/logout", get(auth_logout));

    if state.settings.service_enabled(Service::Databrowser) {
        inner = inner
            .route("/databrowser/overview", get(overview))
            .route(
                "/databrowser/data-search/:flavour/:uniq_key",
                get(data_search),
            )
            .route(
                "/databrowser/metadata-search/:flavour/:uniq_key",
                get(metadata_search),
            )
            .route("/databrowser/data-count/:flavour/:uniq_key", get(data_count))
            .route(
                "/databrowser/intake-catalogue/:flavour/:uniq_key",
                get(intake_catalogue),
            )
            .route(
                "/databrowser/user-data",
                post(user_data_add).delete(user_data_delete),
            )
            .route("/databrowser/flavours", get(flavours_list).post(flavour_create))
            .route(
                "/databrowser/flavours/:name",
                put(flavour_update).delete(flavour_delete),
            );
    }

    if state.settings.service_enabled(Service::StacApi) {
        inner = inner
            .route("/stacapi", get(stac_landing))
            .route("/stacapi/conformance", get(stac_conformance))
            .route("/stacapi/queryables", get(stac_queryables))
            .route("/stacapi/collections", get(stac_collections))
            .route("/stacapi/collections/:id", get(stac_collection))
            .route("/stacapi/collections/:id/queryables", get(stac_queryables))
            .route("/stacapi/collections/:id/items", get(stac_items))
            .route("/stacapi/collections/:id/items/:item_id", get(stac_item))
            .route("/stacapi/search", get(stac_search_get).post(stac_search_post));
    }

    if state.settings.service_enabled(Service::ZarrStream) {
        inner = inner
            .route("/data-portal/zarr/convert", get(convert_get).post(convert_post))
            .route("/data-portal/zarr/share-zarr", post(share_zarr))
            .route("/data-portal/zarr-utils/status", get(zarr_status))
            .route("/data-portal/zarr-utils/html", get(zarr_html))
            .route("/data-portal/zarr/:store", get(zarr_root))
            .route("/data-portal/zarr/:store/*key", get(zarr_chunk))
            .route("/data-portal/share/:sig/:store/*key", get(shared_chunk));
    }

    Router::new()
        .nest("/api/freva-nextgen", inner)
        .with_state(state)
}

// ------------------------------ Helpers ------------------------------

async fn ping() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn bearer_of(headers: &HeaderMap) -> Option<String> {
    use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

/// Required authentication: missing or invalid bearer is a 401.
async fn require_principal(st: &AppState, headers: &HeaderMap) -> ApiResult<Principal> {
    let bearer = bearer_of(headers)
        .ok_or_else(|| ApiError::Unauthenticated("missing Bearer token".into()))?;
    st.auth.validate(&bearer).await
}

/// Optional authentication: no header means anonymous, a bad header is
/// still a 401.
async fn maybe_principal(st: &AppState, headers: &HeaderMap) -> ApiResult<Option<Principal>> {
    match bearer_of(headers) {
        None => Ok(None),
        Some(bearer) => st.auth.validate(&bearer).await.map(Some),
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h).ok().and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_bool_flag(raw: &str) -> bool {
    raw.is_empty() || matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Everything a databrowser query string can carry: the reserved parameters
/// plus the remaining facet constraints. Repeated facet keys are kept in
/// arrival order.
#[derive(Debug, Default)]
struct QueryBag {
    facets: Vec<(String, String)>,
    time: Option<String>,
    time_select: TimeSelect,
    bbox: Option<String>,
    bbox_select: BBoxSelect,
    multi_version: bool,
    start: usize,
    batch_size: Option<usize>,
    max_results: Option<usize>,
    translate: bool,
    zarr: bool,
    json: bool,
    extended: bool,
    facet_filter: Option<String>,
    detail: bool,
}

impl QueryBag {
    fn parse(raw: Option<String>) -> ApiResult<Self> {
        let mut bag = Self {
            translate: true,
            ..Self::default()
        };
        let Some(raw) = raw else { return Ok(bag) };
        for pair in raw.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (percent_decode(k), percent_decode(v)),
                None => (percent_decode(pair), String::new()),
            };
            match key.as_str() {
                "time" => bag.time = Some(value),
                "time_select" | "time-select" => bag.time_select = TimeSelect::parse(&value)?,
                "bbox" => bag.bbox = Some(value),
                "bbox_select" | "bbox-select" => bag.bbox_select = BBoxSelect::parse(&value)?,
                "multi-version" | "multi_version" => bag.multi_version = parse_bool_flag(&value),
                "start" => {
                    bag.start = value.parse().map_err(|_| {
                        ApiError::InvalidInput(format!("{value}: start must be a number"))
                    })?
                }
                "batch-size" | "batch_size" => {
                    bag.batch_size = Some(value.parse().map_err(|_| {
                        ApiError::InvalidInput(format!("{value}: batch-size must be a number"))
                    })?)
                }
                "max-results" | "max_results" => {
                    bag.max_results = Some(value.parse().map_err(|_| {
                        ApiError::InvalidInput(format!("{value}: max-results must be a number"))
                    })?)
                }
                "translate" => bag.translate = parse_bool_flag(&value),
                "zarr" => bag.zarr = parse_bool_flag(&value),
                "json" => bag.json = parse_bool_flag(&value),
                "extended-search" | "extended_search" => bag.extended = parse_bool_flag(&value),
                "facet-filter" | "facet_filter" => bag.facet_filter = Some(value),
                "detail" => bag.detail = parse_bool_flag(&value),
                _ => bag.facets.push((key, value)),
            }
        }
        Ok(bag)
    }

    /// Resolve the flavour (identity when translation is disabled) and turn
    /// the bag into a canonical search request.
    fn into_request(self, flavour: &Flavour) -> ApiResult<(SearchRequest, QueryBag)> {
        let mut req = SearchRequest {
            multi_version: self.multi_version,
            ..Default::default()
        };
        let pairs = flavour.translate_in(self.facets.clone())?;
        req.collect_facets(pairs)?;
        if let Some(time) = &self.time {
            if !time.is_empty() {
                req.time = Some((query::parse_time_spec(time)?, self.time_select));
            }
        }
        if let Some(bbox) = &self.bbox {
            if !bbox.is_empty() {
                req.bbox = Some((query::parse_bbox(bbox)?, self.bbox_select));
            }
        }
        Ok((req, self))
    }
}

fn resolve_flavour(
    st: &AppState,
    name: &str,
    principal: Option<&Principal>,
    translate: bool,
) -> ApiResult<Flavour> {
    if translate {
        st.flavours.resolve(name, principal)
    } else {
        // Translation off: field names are taken and returned canonically.
        Ok(Flavour::BuiltIn(BuiltInFlavour::Freva))
    }
}

fn stats_record(
    route: &str,
    principal: Option<&Principal>,
    flavour: &str,
    req: &SearchRequest,
    result_count: u64,
    started: Instant,
) -> StatsRecord {
    StatsRecord {
        timestamp: Utc::now(),
        route: route.to_string(),
        principal: principal.map(|p| p.username.clone()),
        flavour: flavour.to_string(),
        facets: req.facets.clone(),
        result_count,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn emit_stats(
    st: &AppState,
    route: &str,
    principal: Option<&Principal>,
    flavour: &str,
    req: &SearchRequest,
    result_count: u64,
    started: Instant,
) {
    st.stats
        .record(stats_record(route, principal, flavour, req, result_count, started));
}

/// Response-body stream that settles its statistics record only when the
/// client has read it to the end.
///
/// A dropped client connection drops this stream: the held record is then
/// discarded and the abort is logged instead, so no statistics row is
/// written for a response the client never finished. A mid-stream backend
/// error (already logged where it happens) clears the record too.
struct TrackedStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    record: Option<StatsRecord>,
    sink: StatsSink,
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                if let Some(record) = this.record.take() {
                    this.sink.record(record);
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.record.take();
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            info!(
                aborted = true,
                route = %record.route,
                "client disconnected before the stream finished"
            );
        }
    }
}

// ------------------------------ Databrowser ------------------------------

async fn overview(
    State(st): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = maybe_principal(&st, &headers).await?;
    let flavours = st.flavours.list(principal.as_ref());
    let names: Vec<&str> = flavours.iter().map(|f| f.name.as_str()).collect();
    let mut attributes = serde_json::Map::new();
    for def in &flavours {
        let flavour = st.flavours.resolve(&def.name, principal.as_ref())?;
        let fields: Vec<&str> = FACET_FIELDS.iter().map(|f| flavour.key_out(f)).collect();
        attributes.insert(def.name.clone(), json!(fields));
    }
    Ok(Json(json!({ "flavours": names, "attributes": attributes })))
}

async fn data_search(
    State(st): State<AppState>,
    Path((flavour_name, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let started = Instant::now();
    let principal = maybe_principal(&st, &headers).await?;
    let uniq = UniqKey::parse(&uniq_key)?;
    let bag = QueryBag::parse(raw)?;
    if bag.zarr && principal.is_none() {
        return Err(ApiError::Unauthenticated(
            "zarr streaming links require authentication".into(),
        ));
    }
    let flavour = resolve_flavour(&st, &flavour_name, principal.as_ref(), bag.translate)?;
    let (req, bag) = bag.into_request(&flavour)?;

    // The headers must commit before the first byte, so the hit count for
    // the statistics record comes from a cheap upfront query. The record
    // itself is held by the body stream and only written once the client
    // has read the response to the end.
    let (total, _) = st.search.count(&req, false).await?;
    let record = stats_record(
        "databrowser/data-search",
        principal.as_ref(),
        flavour.name(),
        &req,
        total,
        started,
    );

    let batch = SearchAdapter::clamp_batch(bag.batch_size.unwrap_or(150), true);
    let locations = st.search.data_search(req, uniq, bag.start, batch);
    let locations = match bag.max_results {
        Some(cap) => locations.take(cap).left_stream(),
        None => locations.right_stream(),
    };

    let json_lines = bag.json;
    let field = uniq.field();
    let broker = st.broker.clone();
    let zarr_principal = if bag.zarr { principal.clone() } else { None };

    let body = locations
        .then(move |item| {
            let broker = broker.clone();
            let principal = zarr_principal.clone();
            async move {
                match (item, principal) {
                    (Ok(loc), Some(p)) => {
                        // Each hit becomes a queued conversion and streams
                        // back as its Zarr URL.
                        let receipt = broker
                            .convert(&p, vec![loc], ConvertOptions::default())
                            .await?;
                        Ok(receipt.urls.into_iter().next().unwrap_or_default())
                    }
                    (item, _) => item,
                }
            }
        })
        .map(move |item| match item {
            Ok(loc) => {
                let line = if json_lines {
                    format!("{}\n", json!({ field: loc }))
                } else {
                    format!("{loc}\n")
                };
                Ok(Bytes::from(line))
            }
            Err(e) => {
                // Mid-stream failures cannot change the status line any
                // more; log and drop the connection.
                error!("search stream failed mid-flight: {e}");
                Err(std::io::Error::other(e.to_string()))
            }
        });

    // A client that disconnects drops the tracked stream: page pulling
    // stops, the statistics record is discarded and the abort is logged.
    let tracked = TrackedStream {
        inner: Box::pin(body),
        record: Some(record),
        sink: st.stats.clone(),
    };

    let content_type = if json_lines {
        "application/x-ndjson"
    } else {
        "text/plain; charset=utf-8"
    };
    Ok((
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(tracked),
    )
        .into_response())
}

async fn metadata_search(
    State(st): State<AppState>,
    Path((flavour_name, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let started = Instant::now();
    let principal = maybe_principal(&st, &headers).await?;
    UniqKey::parse(&uniq_key)?;
    let bag = QueryBag::parse(raw)?;
    let flavour = resolve_flavour(&st, &flavour_name, principal.as_ref(), bag.translate)?;
    let extended = bag.extended;
    let facet_filter = bag.facet_filter.clone();
    let (req, _) = bag.into_request(&flavour)?;

    let (total, facets) = st.search.metadata_search(&req, extended, facet_filter).await?;
    emit_stats(
        &st,
        "databrowser/metadata-search",
        principal.as_ref(),
        flavour.name(),
        &req,
        total,
        started,
    );

    let mut out = serde_json::Map::new();
    for (field, values) in facets {
        let pairs: Vec<Value> = values
            .into_iter()
            .flat_map(|(v, c)| [json!(v), json!(c)])
            .collect();
        out.insert(flavour.key_out(&field).to_string(), json!(pairs));
    }
    Ok(Json(json!({ "total_count": total, "facets": out })))
}

async fn data_count(
    State(st): State<AppState>,
    Path((flavour_name, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let started = Instant::now();
    let principal = maybe_principal(&st, &headers).await?;
    UniqKey::parse(&uniq_key)?;
    let bag = QueryBag::parse(raw)?;
    let detail = bag.detail;
    let flavour = resolve_flavour(&st, &flavour_name, principal.as_ref(), bag.translate)?;
    let (req, _) = bag.into_request(&flavour)?;

    let (total, facets) = st.search.count(&req, detail).await?;
    emit_stats(
        &st,
        "databrowser/data-count",
        principal.as_ref(),
        flavour.name(),
        &req,
        total,
        started,
    );
    match facets {
        None => Ok(Json(json!({ "total_count": total }))),
        Some(facets) => {
            let mut detail = serde_json::Map::new();
            for (field, values) in facets {
                let counts: serde_json::Map<String, Value> = values
                    .into_iter()
                    .map(|(v, c)| (v, json!(c)))
                    .collect();
                detail.insert(flavour.key_out(&field).to_string(), json!(counts));
            }
            Ok(Json(json!({ "total_count": total, "counts": detail })))
        }
    }
}

/// Hard cap on catalogue rows; intake materialises the whole document.
const INTAKE_MAX_ROWS: usize = 10_000;

async fn intake_catalogue(
    State(st): State<AppState>,
    Path((flavour_name, uniq_key)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let started = Instant::now();
    let principal = maybe_principal(&st, &headers).await?;
    let uniq = UniqKey::parse(&uniq_key)?;
    let bag = QueryBag::parse(raw)?;
    let max_rows = bag.max_results.unwrap_or(INTAKE_MAX_ROWS).min(INTAKE_MAX_ROWS);
    let flavour = resolve_flavour(&st, &flavour_name, principal.as_ref(), bag.translate)?;
    let (req, _) = bag.into_request(&flavour)?;

    let mut docs = Vec::new();
    let mut offset = 0usize;
    loop {
        let rows = (max_rows - docs.len()).min(1_000);
        if rows == 0 {
            break;
        }
        let page = st.search.docs_page(&req, offset, rows, Vec::new(), None).await?;
        let n = page.docs.len();
        docs.extend(page.docs);
        offset += n;
        if n < rows {
            break;
        }
    }
    emit_stats(
        &st,
        "databrowser/intake-catalogue",
        principal.as_ref(),
        flavour.name(),
        &req,
        docs.len() as u64,
        started,
    );

    // An empty catalogue is useless to intake; answer 400, not an empty
    // document.
    if docs.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "no data matched your constraints" })),
        )
            .into_response());
    }
    Ok(Json(intake::catalogue(&flavour, uniq, &docs)).into_response())
}

#[derive(serde::Deserialize)]
struct UserDataAdd {
    #[serde(default, alias = "user_metadata")]
    entries: Vec<serde_json::Map<String, Value>>,
    #[serde(default)]
    facets: BTreeMap<String, String>,
}

async fn user_data_add(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<UserDataAdd>,
) -> ApiResult<impl IntoResponse> {
    let principal = require_principal(&st, &headers).await?;
    if principal.is_guest {
        return Err(ApiError::Forbidden("guests may not upload data".into()));
    }
    let facets = body.facets.clone();
    let summary = st
        .search
        .add_user_data(&principal, body.entries, body.facets)
        .await?;
    // Bookkeeping only; the authoritative copy lives in the search index.
    let _ = st
        .store
        .insert_one(
            "user_data_meta",
            &json!({
                "user": principal.username,
                "facets": facets,
                "ingested": summary.ingested,
                "skipped": summary.skipped,
                "created_at": Utc::now(),
            }),
        )
        .await;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn user_data_delete(
    State(st): State<AppState>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = require_principal(&st, &headers).await?;
    if principal.is_guest {
        return Err(ApiError::Forbidden("guests may not delete data".into()));
    }
    let bag = QueryBag::parse(raw)?;
    let mut facets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in bag.facets {
        facets.entry(key).or_default().push(value);
    }
    let summary = st.search.delete_user_data(&principal, facets).await?;
    Ok(Json(summary))
}

// ------------------------------ Flavour CRUD ------------------------------

async fn flavours_list(
    State(st): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = maybe_principal(&st, &headers).await?;
    Ok(Json(json!({ "flavours": st.flavours.list(principal.as_ref()) })))
}

#[derive(serde::Deserialize)]
struct FlavourCreate {
    flavour_name: String,
    #[serde(default)]
    mapping: BTreeMap<String, String>,
    #[serde(default)]
    global: bool,
}

async fn flavour_create(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<FlavourCreate>,
) -> ApiResult<impl IntoResponse> {
    let principal = require_principal(&st, &headers).await?;
    if principal.is_guest {
        return Err(ApiError::Forbidden("guests may not create flavours".into()));
    }
    let name = body.flavour_name.clone();
    let def = st
        .flavours
        .create(
            &principal,
            &name,
            FlavourUpsert {
                flavour_name: None,
                mapping: body.mapping,
                global: body.global,
            },
        )
        .await?;
    info!(flavour = %def.name, owner = %def.owner, "flavour created");
    Ok((StatusCode::CREATED, Json(def)))
}

async fn flavour_update(
    State(st): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FlavourUpsert>,
) -> ApiResult<impl IntoResponse> {
    let principal = require_principal(&st, &headers).await?;
    if principal.is_guest {
        return Err(ApiError::Forbidden("guests may not edit flavours".into()));
    }
    let def = st.flavours.update(&principal, &name, body).await?;
    info!(flavour = %def.name, owner = %def.owner, "flavour updated");
    Ok(Json(def))
}

async fn flavour_delete(
    State(st): State<AppState>,
    Path(name): Path<String>,
    axum::extract::Query(params): axum::extract::Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = require_principal(&st, &headers).await?;
    if principal.is_guest {
        return Err(ApiError::Forbidden("guests may not delete flavours".into()));
    }
    let global = params
        .get("global")
        .map(|v| parse_bool_flag(v))
        .unwrap_or(false);
    st.flavours.delete(&principal, &name, global).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ------------------------------ STAC ------------------------------

const GEOJSON: &str = "application/geo+json";
const SCHEMA_JSON: &str = "application/schema+json";

async fn stac_landing(State(st): State<AppState>) -> impl IntoResponse {
    Json(stac::landing(&st.settings.public_url))
}

async fn stac_conformance() -> impl IntoResponse {
    Json(json!({ "conformsTo": stac::CONFORMANCE }))
}

async fn stac_queryables() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, SCHEMA_JSON)],
        Json(stac::queryables(FACET_FIELDS)).into_response(),
    )
}

/// Collection ids are lowercased canonical projects.
async fn project_counts(st: &AppState) -> ApiResult<Vec<(String, u64)>> {
    let req = SearchRequest::default();
    let (_, facets) = st.search.metadata_search(&req, false, None).await?;
    Ok(facets.get("project").cloned().unwrap_or_default())
}

async fn stac_collections(State(st): State<AppState>) -> ApiResult<impl IntoResponse> {
    let projects = project_counts(&st).await?;
    let collections: Vec<Value> = projects
        .iter()
        .map(|(project, count)| {
            stac::collection(&st.settings.public_url, &project.to_lowercase(), *count)
        })
        .collect();
    let base = format!("{}/api/freva-nextgen/stacapi", st.settings.public_url);
    Ok(Json(json!({
        "collections": collections,
        "links": [
            { "rel": "self", "type": "application/json", "href": format!("{base}/collections") },
            { "rel": "root", "type": "application/json", "href": base },
        ],
    })))
}

async fn stac_collection(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let projects = project_counts(&st).await?;
    let found = projects
        .iter()
        .find(|(p, _)| p.to_lowercase() == id)
        .ok_or_else(|| ApiError::NotFound(format!("no collection {id}")))?;
    Ok(Json(stac::collection(
        &st.settings.public_url,
        &id,
        found.1,
    )))
}

#[derive(Debug, Default, serde::Deserialize)]
struct ItemsQuery {
    limit: Option<usize>,
    token: Option<String>,
    datetime: Option<String>,
    bbox: Option<String>,
    collections: Option<String>,
}

fn parse_limit(limit: Option<usize>) -> ApiResult<usize> {
    let limit = limit.unwrap_or(stac::DEFAULT_LIMIT);
    if !(1..=stac::MAX_LIMIT).contains(&limit) {
        return Err(ApiError::InvalidInput(format!(
            "limit must be between 1 and {}",
            stac::MAX_LIMIT
        )));
    }
    Ok(limit)
}

/// Shared item-page engine for `/items` and `/search`.
async fn item_page(
    st: &AppState,
    collection_hint: Option<&str>,
    q: ItemsQuery,
    self_href: String,
) -> ApiResult<Response> {
    let limit = parse_limit(q.limit)?;
    let token = q.token.as_deref().map(PageToken::decode).transpose()?;

    let mut req = SearchRequest::default();
    if let Some(collection) = collection_hint {
        req.facets
            .insert("project".into(), vec![collection.to_string()]);
    } else if let Some(collections) = &q.collections {
        let values: Vec<String> = collections
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if !values.is_empty() {
            req.facets.insert("project".into(), values);
        }
    }
    if let Some(datetime) = &q.datetime {
        req.time = Some((stac::parse_datetime(datetime)?, TimeSelect::Flexible));
    }
    if let Some(bbox) = &q.bbox {
        req.bbox = Some((query::parse_bbox(bbox)?, BBoxSelect::Flexible));
    }

    let scope = collection_hint.unwrap_or("search").to_string();
    let (extra_fq, descending) = match &token {
        Some(t) => {
            if t.collection != scope {
                return Err(ApiError::InvalidInput(
                    "pagination token does not belong to this query".into(),
                ));
            }
            let (fq, desc) = t.keyset_filter();
            (vec![fq], desc)
        }
        None => (Vec::new(), false),
    };
    let sort = Some(if descending { "id desc".into() } else { "id asc".into() });
    let page = st.search.docs_page(&req, 0, limit, extra_fq, sort).await?;
    let mut docs = page.docs;
    if descending {
        docs.reverse();
    }

    let features: Vec<Value> = docs
        .iter()
        .map(|d| {
            let collection = collection_hint
                .map(str::to_string)
                .or_else(|| crate::search::location_of(d, "project").map(|p| p.to_lowercase()))
                .unwrap_or_default();
            stac::item(&st.settings.public_url, &collection, d)
        })
        .collect();

    let mut links = vec![json!({ "rel": "self", "type": GEOJSON, "href": self_href })];
    if docs.len() == limit {
        if let Some(last) = features.last().and_then(|f| f["id"].as_str()) {
            let next = PageToken {
                direction: Direction::Next,
                collection: scope.clone(),
                item_id: last.to_string(),
            };
            links.push(json!({
                "rel": "next", "type": GEOJSON,
                "href": format!("{self_href}?limit={limit}&token={}", next.encode()),
            }));
        }
    }
    if token.is_some() {
        if let Some(first) = features.first().and_then(|f| f["id"].as_str()) {
            let prev = PageToken {
                direction: Direction::Prev,
                collection: scope,
                item_id: first.to_string(),
            };
            links.push(json!({
                "rel": "prev", "type": GEOJSON,
                "href": format!("{self_href}?limit={limit}&token={}", prev.encode()),
            }));
        }
    }

    let body = json!({
        "type": "FeatureCollection",
        "features": features,
        "numberReturned": features.len(),
        "numberMatched": page.num_found,
        "links": links,
    });
    Ok(([(header::CONTENT_TYPE, GEOJSON)], Json(body)).into_response())
}

async fn stac_items(
    State(st): State<AppState>,
    Path(id): Path<String>,
    axum::extract::Query(q): axum::extract::Query<ItemsQuery>,
) -> ApiResult<Response> {
    let href = format!(
        "{}/api/freva-nextgen/stacapi/collections/{id}/items",
        st.settings.public_url
    );
    item_page(&st, Some(&id), q, href).await
}

async fn stac_item(
    State(st): State<AppState>,
    Path((id, item_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let doc = st
        .search
        .doc_by_id(&id, &item_id, false)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no item {item_id} in {id}")))?;
    let feature = stac::item(&st.settings.public_url, &id, &doc);
    Ok(([(header::CONTENT_TYPE, GEOJSON)], Json(feature)).into_response())
}

async fn stac_search_get(
    State(st): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<ItemsQuery>,
) -> ApiResult<Response> {
    let href = format!("{}/api/freva-nextgen/stacapi/search", st.settings.public_url);
    item_page(&st, None, q, href).await
}

#[derive(serde::Deserialize)]
struct SearchBody {
    #[serde(default)]
    collections: Option<Vec<String>>,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
    #[serde(default)]
    datetime: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    token: Option<String>,
}

async fn stac_search_post(
    State(st): State<AppState>,
    Json(body): Json<SearchBody>,
) -> ApiResult<Response> {
    let q = ItemsQuery {
        limit: body.limit,
        token: body.token,
        datetime: body.datetime,
        bbox: body.bbox.map(|b| {
            b.iter()
                .map(f64::to_string)
                .collect::<Vec<_>>()
                .join(",")
        }),
        collections: body.collections.map(|c| c.join(",")),
    };
    let href = format!("{}/api/freva-nextgen/stacapi/search", st.settings.public_url);
    item_page(&st, None, q, href).await
}

// ------------------------------ Zarr streaming ------------------------------

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(p) => vec![p],
            Self::Many(ps) => ps,
        }
    }
}

#[derive(serde::Deserialize)]
struct ConvertBody {
    path: OneOrMany,
    #[serde(flatten)]
    options: ConvertOptions,
}

async fn convert_post(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConvertBody>,
) -> ApiResult<impl IntoResponse> {
    let principal = require_principal(&st, &headers).await?;
    let receipt = st
        .broker
        .convert(&principal, body.path.into_vec(), body.options)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// GET alias of the convert endpoint: `path` may repeat, options arrive as
/// query parameters.
async fn convert_get(
    State(st): State<AppState>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let principal = require_principal(&st, &headers).await?;
    let mut paths = Vec::new();
    let mut options = serde_json::Map::new();
    if let Some(raw) = raw {
        for pair in raw.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (percent_decode(k), percent_decode(v)),
                None => (percent_decode(pair), String::new()),
            };
            if key == "path" {
                paths.push(value);
            } else {
                // Coerce bools and numbers so `?public=true&ttl_seconds=60`
                // deserialises like its JSON-body equivalent.
                let coerced = serde_json::from_str::<Value>(&value)
                    .unwrap_or(Value::String(value));
                options.insert(key, coerced);
            }
        }
    }
    let options: ConvertOptions = serde_json::from_value(Value::Object(options))
        .map_err(|e| ApiError::InvalidInput(format!("invalid conversion options: {e}")))?;
    let receipt = st.broker.convert(&principal, paths, options).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(serde::Deserialize)]
struct StatusQuery {
    token: Uuid,
}

async fn zarr_status(
    State(st): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<StatusQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_principal(&st, &headers).await?;
    let (status, reason) = st.broker.status(&q.token).await?;
    Ok(Json(json!({ "status": status, "reason": reason })))
}

fn store_token(store: &str) -> ApiResult<Uuid> {
    store
        .strip_suffix(".zarr")
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ApiError::InvalidInput(format!("{store}: not a zarr store name")))
}

/// Gate for direct (non-share) chunk access: a valid bearer, or a public
/// unexpired job.
async fn authorise_chunk(st: &AppState, headers: &HeaderMap, token: &Uuid) -> ApiResult<()> {
    if let Some(bearer) = bearer_of(headers) {
        st.auth.validate(&bearer).await?;
        return Ok(());
    }
    match st.broker.job(token).await? {
        Some(job) if job.public && !job.expired() => Ok(()),
        _ => Err(ApiError::Unauthenticated(
            "this conversion requires authentication".into(),
        )),
    }
}

fn chunk_response(content: ZarrContent, bytes: Vec<u8>) -> Response {
    let content_type = match content {
        ZarrContent::Json => "application/json",
        ZarrContent::Bytes => "application/octet-stream",
    };
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

async fn zarr_root(
    State(st): State<AppState>,
    Path(store): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let token = store_token(&store)?;
    authorise_chunk(&st, &headers, &token).await?;
    let (status, reason) = st.broker.status(&token).await?;
    Ok(Json(json!({ "token": token, "status": status, "reason": reason })))
}

async fn zarr_chunk(
    State(st): State<AppState>,
    Path((store, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let token = store_token(&store)?;
    authorise_chunk(&st, &headers, &token).await?;
    let (content, bytes) = st.broker.chunk(&token, &key).await?;
    Ok(chunk_response(content, bytes))
}

#[derive(serde::Deserialize)]
struct ShareBody {
    path: String,
    #[serde(default = "default_share_ttl")]
    ttl_seconds: i64,
}

fn default_share_ttl() -> i64 {
    3600
}

async fn share_zarr(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ShareBody>,
) -> ApiResult<impl IntoResponse> {
    require_principal(&st, &headers).await?;
    let grant = st.broker.share(&body.path, body.ttl_seconds).await?;
    Ok((StatusCode::CREATED, Json(grant)))
}

#[derive(serde::Deserialize)]
struct ShareQuery {
    expires: i64,
}

async fn shared_chunk(
    State(st): State<AppState>,
    Path((sig, store, key)): Path<(String, String, String)>,
    axum::extract::Query(q): axum::extract::Query<ShareQuery>,
) -> ApiResult<Response> {
    let token = store_token(&store)?;
    if !st.broker.verify(&sig, &token, q.expires) {
        return Err(ApiError::Unauthenticated(
            "share link invalid or expired".into(),
        ));
    }
    let (content, bytes) = st.broker.chunk(&token, &key).await?;
    Ok(chunk_response(content, bytes))
}

async fn zarr_html(
    State(st): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let principal = require_principal(&st, &headers).await?;
    let job = st
        .broker
        .last_job(&principal.username)
        .await?
        .ok_or_else(|| ApiError::NotFound("no active conversion for this user".into()))?;
    let metadata = match st.broker.chunk(&job.token, ".zmetadata").await {
        Ok((_, bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => "null".to_string(),
    };
    // The metadata JSON is embedded for a client-side renderer.
    let html = format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\">\
         <title>Zarr dataset {token}</title></head>\n\
         <body>\n<h1>Zarr dataset</h1>\n\
         <p>token: <code>{token}</code> status: {status} ({reason})</p>\n\
         <script type=\"application/json\" id=\"zmetadata\">{metadata}</script>\n\
         </body></html>\n",
        token = job.token,
        status = job.status.code(),
        reason = job.reason,
    );
    Ok((
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response())
}

// ------------------------------ Auth ------------------------------

async fn openid_configuration(State(st): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(st.auth.well_known().await?))
}

#[derive(serde::Deserialize)]
struct LoginQuery {
    redirect_uri: String,
    #[serde(default)]
    offline_access: bool,
}

async fn auth_login(
    State(st): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<LoginQuery>,
) -> ApiResult<impl IntoResponse> {
    let url = st.auth.authorize_url(&q.redirect_uri, q.offline_access).await?;
    Ok(Redirect::temporary(&url))
}

#[derive(serde::Deserialize)]
struct CallbackQuery {
    code: String,
    state: String,
}

async fn auth_callback(
    State(st): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<CallbackQuery>,
) -> ApiResult<impl IntoResponse> {
    let redirect_uri = st
        .auth
        .consume_state(&q.state)
        .ok_or_else(|| ApiError::Unauthenticated("unknown or expired state".into()))?;
    let sep = if redirect_uri.contains('?') { '&' } else { '?' };
    Ok(Redirect::temporary(&format!(
        "{redirect_uri}{sep}code={}&state={}",
        q.code, q.state
    )))
}

async fn auth_token(
    State(st): State<AppState>,
    Form(form): Form<BTreeMap<String, String>>,
) -> ApiResult<impl IntoResponse> {
    let missing = |f: &str| ApiError::InvalidInput(format!("missing form field {f}"));
    let grant = match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => TokenGrant::AuthorizationCode {
            code: form.get("code").cloned().ok_or_else(|| missing("code"))?,
            redirect_uri: form.get("redirect_uri").cloned().unwrap_or_default(),
        },
        Some("refresh_token") => TokenGrant::RefreshToken {
            refresh_token: form
                .get("refresh_token")
                .cloned()
                .ok_or_else(|| missing("refresh_token"))?,
        },
        Some("urn:ietf:params:oauth:grant-type:device_code") => TokenGrant::DeviceCode {
            device_code: form
                .get("device_code")
                .cloned()
                .ok_or_else(|| missing("device_code"))?,
        },
        other => {
            return Err(ApiError::InvalidInput(format!(
                "unsupported grant_type {other:?}"
            )))
        }
    };
    Ok(Json(st.auth.exchange(grant).await?))
}

async fn auth_device(State(st): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(st.auth.device_flow().await?))
}

async fn auth_status(
    State(st): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let p = require_principal(&st, &headers).await?;
    Ok(Json(json!({ "sub": p.sub, "exp": p.exp, "email": p.email })))
}

async fn auth_userinfo(
    State(st): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let p = require_principal(&st, &headers).await?;
    let claim = |k: &str| p.claims.get(k).and_then(Value::as_str).unwrap_or("").to_string();
    let home = match p.claims.get("home").and_then(Value::as_str) {
        Some(h) => h.to_string(),
        None => format!("/home/{}", p.username),
    };
    Ok(Json(json!({
        "username": p.username,
        "first_name": claim("given_name"),
        "last_name": claim("family_name"),
        "email": p.email,
        "home": home,
        "is_guest": p.is_guest,
    })))
}

async fn auth_systemuser(
    State(st): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let p = require_principal(&st, &headers).await?;
    if p.is_guest {
        return Err(ApiError::Forbidden("guests have no system user".into()));
    }
    Ok(Json(json!({ "username": p.username })))
}

async fn auth_checkuser(
    State(st): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let p = require_principal(&st, &headers).await?;
    if p.is_guest {
        return Err(ApiError::Forbidden("not a primary user".into()));
    }
    Ok(Json(json!({ "pw_name": p.username })))
}

#[derive(serde::Deserialize)]
struct LogoutQuery {
    post_logout_redirect_uri: Option<String>,
}

async fn auth_logout(
    State(st): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<LogoutQuery>,
) -> ApiResult<Response> {
    let target = q
        .post_logout_redirect_uri
        .unwrap_or_else(|| st.settings.public_url.clone());
    let url = st.auth.end_session_url(&target).await?;
    // Any server-side session cookie dies with the redirect.
    let mut response = Redirect::temporary(&url).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        "session=; Max-Age=0; Path=/; HttpOnly"
            .parse()
            .expect("static cookie"),
    );
    Ok(response)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_bag_separates_reserved_from_facets() {
        let bag = QueryBag::parse(Some(
            "project=observations&variable=pr&model=cp*&time=2016-09&time_select=strict\
             &multi-version=true&start=10&batch-size=200&json"
                .into(),
        ))
        .unwrap();
        assert_eq!(
            bag.facets,
            vec![
                ("project".to_string(), "observations".to_string()),
                ("variable".to_string(), "pr".to_string()),
                ("model".to_string(), "cp*".to_string()),
            ]
        );
        assert_eq!(bag.time.as_deref(), Some("2016-09"));
        assert_eq!(bag.time_select, TimeSelect::Strict);
        assert!(bag.multi_version);
        assert_eq!(bag.start, 10);
        assert_eq!(bag.batch_size, Some(200));
        assert!(bag.json);
        assert!(bag.translate);
    }

    #[test]
    fn query_bag_decodes_percent_escapes() {
        let bag =
            QueryBag::parse(Some("time=2016-09-02T22%3A15%20to%202016-10".into())).unwrap();
        assert_eq!(bag.time.as_deref(), Some("2016-09-02T22:15 to 2016-10"));
        let bag = QueryBag::parse(Some("variable=pr+tas".into())).unwrap();
        assert_eq!(bag.facets[0].1, "pr tas");
    }

    #[test]
    fn query_bag_rejects_bad_numbers() {
        assert!(QueryBag::parse(Some("start=ten".into())).is_err());
        assert!(QueryBag::parse(Some("batch-size=-1".into())).is_err());
        assert!(QueryBag::parse(Some("time_select=sideways".into())).is_err());
    }

    #[test]
    fn store_names_must_carry_the_zarr_suffix() {
        let token = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"t");
        assert_eq!(store_token(&format!("{token}.zarr")).unwrap(), token);
        assert!(store_token(&token.to_string()).is_err());
        assert!(store_token("garbage.zarr").is_err());
    }

    #[test]
    fn limits_are_bounded() {
        assert_eq!(parse_limit(None).unwrap(), stac::DEFAULT_LIMIT);
        assert_eq!(parse_limit(Some(2)).unwrap(), 2);
        assert!(parse_limit(Some(0)).is_err());
        assert!(parse_limit(Some(1_001)).is_err());
    }

    fn sample_record() -> StatsRecord {
        StatsRecord {
            timestamp: Utc::now(),
            route: "databrowser/data-search".into(),
            principal: None,
            flavour: "freva".into(),
            facets: BTreeMap::new(),
            result_count: 2,
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn tracked_stream_settles_stats_only_on_completion() {
        use crate::stats::StatsSink;
        use futures::stream;

        let (sink, mut rx) = StatsSink::disconnected();

        // Read to the end: the record lands in the queue.
        let mut s = TrackedStream {
            inner: Box::pin(stream::iter(vec![Ok(Bytes::from("a\n")), Ok(Bytes::from("b\n"))])),
            record: Some(sample_record()),
            sink: sink.clone(),
        };
        while s.next().await.is_some() {}
        drop(s);
        assert!(rx.try_recv().is_ok());

        // Dropped after one item, like a disconnecting client: no record.
        let mut s = TrackedStream {
            inner: Box::pin(stream::iter(vec![Ok(Bytes::from("a\n")), Ok(Bytes::from("b\n"))])),
            record: Some(sample_record()),
            sink: sink.clone(),
        };
        let _ = s.next().await;
        drop(s);
        assert!(rx.try_recv().is_err());

        // A mid-stream backend error clears the record as well.
        let mut s = TrackedStream {
            inner: Box::pin(stream::iter(vec![
                Ok(Bytes::from("a\n")),
                Err(std::io::Error::other("backend gone")),
            ])),
            record: Some(sample_record()),
            sink,
        };
        while s.next().await.is_some() {}
        drop(s);
        assert!(rx.try_recv().is_err());
    }
}

//! Zarr streaming broker: conversion jobs, status tracking, chunk retrieval,
//! and the HMAC-signed share URLs.
//!
//! A conversion request becomes a deterministic token (UUIDv5 over the
//! requester and the canonicalised request), a status record in the cache
//! (written set-if-not-exists so identical requests collapse onto one job),
//! and a message on the worker channel. The worker writes consolidated
//! metadata and chunk bytes back under `zarr:<token>:blob:<key>`; this
//! module only moves bytes between the cache and the client.
//!
//! Share URLs are stateless: the signature is an HMAC over
//! `method|token|expires` with the server secret, so verification needs no
//! lookup besides the clock.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::cache::CacheClient;
use crate::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

/// Channel the data-loading worker subscribes to.
pub const WORKER_CHANNEL: &str = "data-portal";

/// Namespace GUID of this service; XOR-ed with the principal subject to give
/// per-user token namespaces.
const SERVICE_GUID: Uuid = Uuid::from_bytes([
    0x6b, 0x1d, 0x5a, 0x0e, 0x41, 0x3e, 0x5d, 0x0b, 0x9a, 0x6f, 0x3d, 0x2c, 0x71, 0x88, 0x4e,
    0x52,
]);

/// Job states, serialised as their numeric codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZarrStatus {
    Queued,
    Running,
    Ready,
    Failed,
}

impl ZarrStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Queued => 1,
            Self::Running => 2,
            Self::Ready => 3,
            Self::Failed => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Queued),
            2 => Some(Self::Running),
            3 => Some(Self::Ready),
            4 => Some(Self::Failed),
            _ => None,
        }
    }
}

impl Serialize for ZarrStatus {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for ZarrStatus {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(d)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status code {code}")))
    }
}

/// How multiple input paths are combined by the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Auto,
    Merge,
    Concat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Join {
    Outer,
    Inner,
    Left,
    Right,
    Exact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compat {
    Equals,
    NoConflicts,
    Override,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectMode {
    Minimal,
    Different,
    All,
}

fn default_ttl() -> u64 {
    86_400
}

/// Options accepted by the convert endpoint; forwarded verbatim to the
/// worker after validation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConvertOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat: Option<Compat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_vars: Option<SelectMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<SelectMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
}

impl ConvertOptions {
    /// Reject option combinations the worker cannot honour.
    pub fn validate(&self) -> ApiResult<()> {
        if self.aggregate.is_none() && self.join.is_some() {
            return Err(ApiError::InvalidInput(
                "join is only meaningful together with aggregate".into(),
            ));
        }
        if self.aggregate.is_none() && self.dim.is_some() {
            return Err(ApiError::InvalidInput(
                "dim is only meaningful together with aggregate".into(),
            ));
        }
        Ok(())
    }
}

/// The status record stored under `zarr:<token>:status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZarrJob {
    pub token: Uuid,
    pub status: ZarrStatus,
    pub reason: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub paths: Vec<String>,
    #[serde(default)]
    pub options: ConvertOptions,
    #[serde(default)]
    pub public: bool,
}

impl ZarrJob {
    pub fn expired(&self) -> bool {
        self.expiry <= Utc::now()
    }
}

/// Cache key of a job's status record.
pub fn status_key(token: &Uuid) -> String {
    format!("zarr:{token}:status")
}

/// Cache key of one blob (metadata or chunk) of a job.
pub fn blob_key(token: &Uuid, key: &str) -> String {
    format!("zarr:{token}:blob:{key}")
}

/// Cache key remembering a user's most recent conversion, for the HTML
/// preview.
pub fn last_key(owner: &str) -> String {
    format!("zarr:last:{owner}")
}

// ============================================================================
// Token derivation
// ============================================================================

fn user_namespace(sub: &str) -> Uuid {
    let digest = blake3::hash(sub.as_bytes());
    let mut bytes = *SERVICE_GUID.as_bytes();
    for (b, d) in bytes.iter_mut().zip(digest.as_bytes()) {
        *b ^= d;
    }
    Uuid::from_bytes(bytes)
}

/// Canonical JSON of the request: sorted paths plus the option set with
/// sorted keys, so equal requests hash equally.
fn canonical_request(paths: &[String], options: &ConvertOptions) -> String {
    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort();
    let opts: BTreeMap<String, serde_json::Value> = serde_json::to_value(options)
        .map(|v| match v {
            serde_json::Value::Object(m) => m.into_iter().collect(),
            _ => BTreeMap::new(),
        })
        .unwrap_or_default();
    serde_json::json!({ "paths": sorted, "options": opts }).to_string()
}

/// Derive the deterministic job token for a request.
pub fn derive_token(sub: &str, paths: &[String], options: &ConvertOptions) -> Uuid {
    Uuid::new_v5(
        &user_namespace(sub),
        canonical_request(paths, options).as_bytes(),
    )
}

// ============================================================================
// Chunk keys
// ============================================================================

/// Content type a valid zarr key resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZarrContent {
    Json,
    Bytes,
}

/// Validate a slash-separated zarr store key and classify its payload.
///
/// Accepted shapes: the consolidated root metadata (`.zmetadata`,
/// `.zgroup`, `.zattrs`), variable-level metadata (`<var>/.zarray`,
/// `<var>/.zgroup`, `<var>/.zattrs`), and chunk coordinates
/// (`<var>/<i>.<j>…`). Anything else is a client error, not a miss.
pub fn classify_key(key: &str) -> ApiResult<ZarrContent> {
    let parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [".zmetadata" | ".zgroup" | ".zattrs"] => Ok(ZarrContent::Json),
        [var, ".zarray" | ".zgroup" | ".zattrs"] if valid_var(var) => Ok(ZarrContent::Json),
        [var, chunk] if valid_var(var) && valid_chunk(chunk) => Ok(ZarrContent::Bytes),
        _ => Err(ApiError::InvalidInput(format!(
            "{key}: not a zarr store key"
        ))),
    }
}

fn valid_var(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn valid_chunk(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(|p| p.chars().all(|c| c.is_ascii_digit()))
}

// ============================================================================
// Share signatures
// ============================================================================

/// A granted share: everything the client needs to build and present the
/// URL.
#[derive(Debug, Serialize)]
pub struct ShareGrant {
    pub url: String,
    pub sig: String,
    pub token: Uuid,
    pub expires: i64,
    pub method: &'static str,
}

/// Compute the share signature over `method|token|expires`.
pub fn share_sig(secret: &[u8], method: &str, token: &Uuid, expires: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(format!("{method}|{token}|{expires}").as_bytes());
    B64URL.encode(mac.finalize().into_bytes())
}

/// Verify a presented signature: constant-time HMAC comparison, then the
/// expiry check.
pub fn verify_share(secret: &[u8], sig: &str, token: &Uuid, expires: i64) -> bool {
    let Ok(presented) = B64URL.decode(sig.as_bytes()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(format!("GET|{token}|{expires}").as_bytes());
    if mac.verify_slice(&presented).is_err() {
        return false;
    }
    Utc::now().timestamp() < expires
}

// ============================================================================
// Broker
// ============================================================================

/// Outcome of a convert call: the ordered URLs, one per request path (or a
/// single one for aggregated requests).
#[derive(Debug, Serialize)]
pub struct ConvertReceipt {
    pub urls: Vec<String>,
}

/// The broker wires the cache primitives together. Cheap to clone.
#[derive(Clone)]
pub struct ZarrBroker {
    cache: CacheClient,
    public_url: String,
    default_ttl: u64,
    share_secret: Vec<u8>,
}

impl ZarrBroker {
    pub fn new(cache: CacheClient, public_url: &str, default_ttl: u64, share_secret: Vec<u8>) -> Self {
        Self {
            cache,
            public_url: public_url.trim_end_matches('/').to_string(),
            default_ttl,
            share_secret,
        }
    }

    fn zarr_url(&self, token: &Uuid) -> String {
        format!(
            "{}/api/freva-nextgen/data-portal/zarr/{token}.zarr",
            self.public_url
        )
    }

    /// Queue one conversion job and return its streaming URL. Idempotent:
    /// the status record is written set-if-not-exists, so a duplicate
    /// request reuses the running job.
    async fn submit(
        &self,
        principal: &Principal,
        paths: Vec<String>,
        options: &ConvertOptions,
    ) -> ApiResult<Uuid> {
        let token = derive_token(&principal.sub, &paths, options);
        let ttl = if options.ttl_seconds > 0 { options.ttl_seconds } else { self.default_ttl };
        let now = Utc::now();
        let job = ZarrJob {
            token,
            status: ZarrStatus::Queued,
            reason: "submitted".into(),
            owner: principal.username.clone(),
            created_at: now,
            expiry: now + chrono::Duration::seconds(ttl as i64),
            paths: paths.clone(),
            options: options.clone(),
            public: options.public,
        };
        let record = serde_json::to_string(&job).map_err(ApiError::internal)?;
        let fresh = self.cache.set_nx_ex(&status_key(&token), &record, ttl).await?;
        self.cache
            .set_ex(&last_key(&principal.username), &token.to_string(), ttl)
            .await?;
        if !fresh {
            info!(%token, "conversion already queued, reusing job");
            return Ok(token);
        }

        let message = serde_json::json!({
            "token": token,
            "paths": paths,
            "options": options,
        })
        .to_string();
        match self.cache.publish(WORKER_CHANNEL, &message).await {
            Ok(receivers) => {
                if receivers == 0 {
                    warn!(%token, "no worker subscribed to the conversion channel");
                }
                Ok(token)
            }
            Err(e) => {
                // Roll the job back so a later retry starts clean.
                let _ = self.cache.del(&status_key(&token)).await;
                Err(ApiError::BackendUnavailable(format!(
                    "conversion broker unavailable: {e}"
                )))
            }
        }
    }

    /// Convert one or more paths. Without aggregation every path becomes
    /// its own job and URL; with aggregation the sorted path set shares one.
    pub async fn convert(
        &self,
        principal: &Principal,
        paths: Vec<String>,
        options: ConvertOptions,
    ) -> ApiResult<ConvertReceipt> {
        if paths.is_empty() {
            return Err(ApiError::InvalidInput("no input paths given".into()));
        }
        options.validate()?;
        let mut urls = Vec::new();
        if options.aggregate.is_some() {
            let token = self.submit(principal, paths, &options).await?;
            urls.push(self.zarr_url(&token));
        } else {
            for path in paths {
                let token = self.submit(principal, vec![path], &options).await?;
                urls.push(self.zarr_url(&token));
            }
        }
        Ok(ConvertReceipt { urls })
    }

    /// Load a job record; `None` when the token is unknown or expired out
    /// of the cache.
    pub async fn job(&self, token: &Uuid) -> ApiResult<Option<ZarrJob>> {
        match self.cache.get(&status_key(token)).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ApiError::internal(anyhow::anyhow!("job record: {e}"))),
        }
    }

    /// The caller's most recent job, if it is still alive in the cache.
    pub async fn last_job(&self, owner: &str) -> ApiResult<Option<ZarrJob>> {
        match self.cache.get(&last_key(owner)).await? {
            None => Ok(None),
            Some(raw) => match raw.parse::<Uuid>() {
                Ok(token) => self.job(&token).await,
                Err(_) => Ok(None),
            },
        }
    }

    /// Status poll: `{status, reason}` or 404.
    pub async fn status(&self, token: &Uuid) -> ApiResult<(ZarrStatus, String)> {
        match self.job(token).await? {
            Some(job) => Ok((job.status, job.reason)),
            None => Err(ApiError::NotFound(format!("unknown conversion {token}"))),
        }
    }

    /// Fetch one blob for a token. The key is validated before the lookup,
    /// so malformed keys answer 422 rather than 404.
    pub async fn chunk(&self, token: &Uuid, key: &str) -> ApiResult<(ZarrContent, Vec<u8>)> {
        let content = classify_key(key)?;
        match self.cache.get_bytes(&blob_key(token, key)).await? {
            Some(bytes) => Ok((content, bytes)),
            None => Err(ApiError::NotFound(format!("{key}: no such key for {token}"))),
        }
    }

    /// Issue a share grant for an existing job.
    pub async fn share(&self, path: &str, ttl_seconds: i64) -> ApiResult<ShareGrant> {
        let token = token_from_path(path)?;
        let job = self
            .job(&token)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("unknown conversion {token}")))?;
        if job.expired() {
            return Err(ApiError::NotFound(format!("conversion {token} expired")));
        }
        if ttl_seconds <= 0 {
            return Err(ApiError::InvalidInput("ttl_seconds must be positive".into()));
        }
        let expires = Utc::now().timestamp() + ttl_seconds;
        let sig = share_sig(&self.share_secret, "GET", &token, expires);
        Ok(ShareGrant {
            url: format!(
                "{}/api/freva-nextgen/data-portal/share/{sig}/{token}.zarr?expires={expires}",
                self.public_url
            ),
            sig,
            token,
            expires,
            method: "GET",
        })
    }

    /// Verify a presented share signature for a token.
    pub fn verify(&self, sig: &str, token: &Uuid, expires: i64) -> bool {
        verify_share(&self.share_secret, sig, token, expires)
    }
}

/// Extract the token from a `…/data-portal/zarr/<token>.zarr` path.
pub fn token_from_path(path: &str) -> ApiResult<Uuid> {
    let name = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let token = name.strip_suffix(".zarr").ok_or_else(|| {
        ApiError::InvalidInput(format!("{path}: not a zarr streaming path"))
    })?;
    let inside = path.contains("/data-portal/zarr/");
    if !inside {
        return Err(ApiError::InvalidInput(format!(
            "{path}: not a zarr streaming path"
        )));
    }
    token
        .parse()
        .map_err(|_| ApiError::InvalidInput(format!("{token}: not a conversion token")))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_deterministic_per_user_and_request() {
        let opts = ConvertOptions::default();
        let a = derive_token("sub-1", &["/a.nc".into(), "/b.nc".into()], &opts);
        let b = derive_token("sub-1", &["/b.nc".into(), "/a.nc".into()], &opts);
        // Path order is canonicalised away.
        assert_eq!(a, b);
        // Different user, different namespace.
        assert_ne!(a, derive_token("sub-2", &["/a.nc".into(), "/b.nc".into()], &opts));
        // Different options, different token.
        let mut other = ConvertOptions::default();
        other.aggregate = Some(Aggregate::Concat);
        assert_ne!(a, derive_token("sub-1", &["/a.nc".into(), "/b.nc".into()], &other));
    }

    #[test]
    fn option_validation_gates_join_and_dim() {
        let mut opts = ConvertOptions::default();
        opts.join = Some(Join::Outer);
        assert!(opts.validate().is_err());
        opts.aggregate = Some(Aggregate::Concat);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn status_codes_round_trip() {
        for code in 1..=4u8 {
            let s = ZarrStatus::from_code(code).unwrap();
            assert_eq!(s.code(), code);
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, code.to_string());
        }
        assert!(ZarrStatus::from_code(0).is_none());
        assert!(ZarrStatus::from_code(5).is_none());
    }

    #[test]
    fn key_classification() {
        assert_eq!(classify_key(".zmetadata").unwrap(), ZarrContent::Json);
        assert_eq!(classify_key(".zattrs").unwrap(), ZarrContent::Json);
        assert_eq!(classify_key("pr/.zarray").unwrap(), ZarrContent::Json);
        assert_eq!(classify_key("pr/0.0.1").unwrap(), ZarrContent::Bytes);
        assert_eq!(classify_key("t2m/12.0").unwrap(), ZarrContent::Bytes);
        // Metadata names cannot appear as variables, chunks need digits.
        assert!(classify_key(".zarray").is_err());
        assert!(classify_key("pr/tas/.zattrs").is_err());
        assert!(classify_key("pr/abc").is_err());
        assert!(classify_key("../escape").is_err());
    }

    #[test]
    fn share_signature_soundness() {
        let secret = b"server-secret";
        let token = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"x");
        let expires = Utc::now().timestamp() + 60;
        let sig = share_sig(secret, "GET", &token, expires);
        assert!(verify_share(secret, &sig, &token, expires));

        // Tampering any component breaks verification.
        let mut bad_sig = sig.clone();
        bad_sig.replace_range(0..1, if sig.starts_with('A') { "B" } else { "A" });
        assert!(!verify_share(secret, &bad_sig, &token, expires));
        let other_token = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"y");
        assert!(!verify_share(secret, &sig, &other_token, expires));
        assert!(!verify_share(secret, &sig, &token, expires + 1));
        // Expired grants are rejected even with a valid signature.
        let past = Utc::now().timestamp() - 1;
        let old = share_sig(secret, "GET", &token, past);
        assert!(!verify_share(secret, &old, &token, past));
    }

    #[test]
    fn token_extraction_from_share_paths() {
        let token = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"x");
        let path = format!("https://host/api/freva-nextgen/data-portal/zarr/{token}.zarr");
        assert_eq!(token_from_path(&path).unwrap(), token);
        assert!(token_from_path("/data-portal/zarr/not-a-token.zarr").is_err());
        assert!(token_from_path("/elsewhere/abc.zarr").is_err());
        assert!(token_from_path("/data-portal/zarr/abc.nc").is_err());
    }
}

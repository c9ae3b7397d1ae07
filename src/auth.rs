//! OIDC authentication mediator.
//!
//! The gateway never stores credentials: it brokers the authorization-code
//! and device-code flows against the configured identity provider, validates
//! bearer tokens offline against the provider's JWKS, and reduces a token to
//! an internal [`Principal`].
//!
//! Caching discipline: the discovery document is cached for ten minutes, the
//! JWKS until a token arrives whose key id is unknown (then refreshed once).
//! Both caches are read-mostly `RwLock<Arc<…>>` snapshots; no lock is held
//! across I/O.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{ApiError, ApiResult};

/// Discovery document lifetime.
const DISCOVERY_TTL: Duration = Duration::from_secs(600);
/// Login `state` nonces are single-use and die after ten minutes.
const STATE_TTL: Duration = Duration::from_secs(600);

/// The authenticated caller, as every protected route sees it.
#[derive(Clone, Debug)]
pub struct Principal {
    /// OIDC subject.
    pub sub: String,
    /// `preferred_username` when present, otherwise the subject.
    pub username: String,
    pub email: Option<String>,
    /// Guests may read but never touch admin surfaces.
    pub is_guest: bool,
    /// Granted by the configured admin claim filters.
    pub is_admin: bool,
    /// Token expiry (unix seconds).
    pub exp: i64,
    /// The full validated claim set.
    pub claims: Value,
}

/// Relevant endpoints of the provider's discovery document.
#[derive(Clone, Debug, Deserialize)]
pub struct Discovery {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: String,
    #[serde(default)]
    pub device_authorization_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Token answer handed to clients.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    /// Absolute expiry, unix seconds.
    pub expires: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct IdpTokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Device-flow bootstrap answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceFlowResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub interval: u64,
    pub expires_in: u64,
}

/// The supported grant types of the token endpoint.
#[derive(Debug)]
pub enum TokenGrant {
    AuthorizationCode { code: String, redirect_uri: String },
    RefreshToken { refresh_token: String },
    DeviceCode { device_code: String },
}

// ============================================================================
// Claim filters
// ============================================================================

/// One declarative claim filter: a `.`-separated path into the claim set
/// plus a substring/regex pattern. A filter passes when any addressed value
/// matches.
#[derive(Debug)]
pub struct ClaimFilter {
    path: Vec<String>,
    pattern: String,
    regex: Option<Regex>,
}

impl ClaimFilter {
    /// Compile a configured filter map.
    pub fn compile(filters: &std::collections::BTreeMap<String, String>) -> Vec<Self> {
        filters
            .iter()
            .map(|(path, pattern)| {
                let regex = Regex::new(pattern).ok();
                if regex.is_none() {
                    warn!("claim filter {path}: pattern {pattern:?} is not a regex, using substring match");
                }
                Self {
                    path: path.split('.').map(str::to_string).collect(),
                    pattern: pattern.clone(),
                    regex,
                }
            })
            .collect()
    }

    /// Whether any value addressed by the path satisfies the pattern.
    pub fn matches(&self, claims: &Value) -> bool {
        claim_values(claims, &self.path)
            .iter()
            .any(|v| match &self.regex {
                Some(re) => re.is_match(v),
                None => v.contains(&self.pattern),
            })
    }
}

/// Descend a claim path and flatten the addressed values to strings.
/// Arrays match element-wise, numbers and booleans by their display form.
fn claim_values(claims: &Value, path: &[String]) -> Vec<String> {
    let mut current = claims;
    for segment in path {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Vec::new(),
        }
    }
    flatten_value(current)
}

fn flatten_value(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Number(n) => vec![n.to_string()],
        Value::Bool(b) => vec![b.to_string()],
        Value::Array(items) => items.iter().flat_map(flatten_value).collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Mediator
// ============================================================================

struct StateEntry {
    created: Instant,
    redirect_uri: String,
}

/// The mediator. One instance lives in the application state.
pub struct AuthMediator {
    http: reqwest::Client,
    discovery_url: String,
    client_id: String,
    client_secret: String,
    auth_ports: Vec<u16>,
    public_url: String,
    token_filters: Vec<ClaimFilter>,
    admin_filters: Vec<ClaimFilter>,
    discovery: RwLock<Option<(Instant, std::sync::Arc<Discovery>)>>,
    jwks: RwLock<Option<std::sync::Arc<JwkSet>>>,
    states: Mutex<HashMap<String, StateEntry>>,
}

impl AuthMediator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            discovery_url: settings.oidc_discovery_url.clone(),
            client_id: settings.oidc_client_id.clone(),
            client_secret: settings.oidc_client_secret.clone(),
            auth_ports: settings.auth_ports.clone(),
            public_url: settings.public_url.clone(),
            token_filters: ClaimFilter::compile(&settings.token_claims),
            admin_filters: ClaimFilter::compile(&settings.admin_claims),
            discovery: RwLock::new(None),
            jwks: RwLock::new(None),
            states: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------ Discovery ------------------------------

    /// The provider's discovery document, cached ten minutes.
    pub async fn discovery(&self) -> ApiResult<std::sync::Arc<Discovery>> {
        if let Some((fetched, doc)) = self.discovery.read().expect("discovery lock").clone() {
            if fetched.elapsed() < DISCOVERY_TTL {
                return Ok(doc);
            }
        }
        let res = self.http.get(&self.discovery_url).send().await?;
        if !res.status().is_success() {
            return Err(ApiError::BackendUnavailable(format!(
                "identity provider answered {}",
                res.status()
            )));
        }
        let doc: Discovery = res
            .json()
            .await
            .map_err(|e| ApiError::internal(anyhow::anyhow!("discovery document: {e}")))?;
        let doc = std::sync::Arc::new(doc);
        *self.discovery.write().expect("discovery lock") = Some((Instant::now(), doc.clone()));
        Ok(doc)
    }

    /// The openid-configuration this service republishes: provider values
    /// with the token and userinfo endpoints rewritten to the proxy routes.
    pub async fn well_known(&self) -> ApiResult<Value> {
        let doc = self.discovery().await?;
        Ok(serde_json::json!({
            "issuer": doc.issuer,
            "authorization_endpoint": doc.authorization_endpoint,
            "token_endpoint": format!("{}/api/freva-nextgen/auth/v2/token", self.public_url),
            "userinfo_endpoint": format!("{}/api/freva-nextgen/auth/v2/userinfo", self.public_url),
            "jwks_uri": doc.jwks_uri,
            "device_authorization_endpoint": doc.device_authorization_endpoint,
            "end_session_endpoint": doc.end_session_endpoint,
        }))
    }

    // ------------------------------ JWKS ------------------------------

    async fn jwks(&self, force_refresh: bool) -> ApiResult<std::sync::Arc<JwkSet>> {
        if !force_refresh {
            if let Some(set) = self.jwks.read().expect("jwks lock").clone() {
                return Ok(set);
            }
        }
        let doc = self.discovery().await?;
        // One retry on transient failure; the JWKS is load-bearing for every
        // protected route.
        let mut last = None;
        for _ in 0..2 {
            match self.http.get(&doc.jwks_uri).send().await {
                Ok(res) if res.status().is_success() => {
                    let set: JwkSet = res.json().await.map_err(|e| {
                        ApiError::internal(anyhow::anyhow!("jwks document: {e}"))
                    })?;
                    let set = std::sync::Arc::new(set);
                    *self.jwks.write().expect("jwks lock") = Some(set.clone());
                    return Ok(set);
                }
                Ok(res) => last = Some(format!("jwks endpoint answered {}", res.status())),
                Err(e) => last = Some(e.to_string()),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(ApiError::BackendUnavailable(format!(
            "cannot fetch signing keys: {}",
            last.unwrap_or_default()
        )))
    }

    // ------------------------------ Validation ------------------------------

    /// Validate a bearer token and reduce it to a [`Principal`].
    pub async fn validate(&self, bearer: &str) -> ApiResult<Principal> {
        let unauthenticated = |msg: &str| ApiError::Unauthenticated(msg.to_string());

        let header =
            decode_header(bearer).map_err(|_| unauthenticated("malformed bearer token"))?;
        let kid = header.kid.clone();

        let jwks = self.jwks(false).await?;
        let jwk = match kid.as_deref().and_then(|k| jwks.find(k)) {
            Some(jwk) => jwk.clone(),
            None => {
                // Key rotation: refresh once before giving up.
                let jwks = self.jwks(true).await?;
                kid.as_deref()
                    .and_then(|k| jwks.find(k))
                    .cloned()
                    .ok_or_else(|| unauthenticated("unknown signing key"))?
            }
        };
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| ApiError::internal(anyhow::anyhow!("jwk decode: {e}")))?;

        let discovery = self.discovery().await?;
        let mut validation = Validation::new(header.alg);
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_issuer(&[discovery.issuer.as_str()]);

        let data = decode::<Value>(bearer, &key, &validation)
            .map_err(|e| unauthenticated(&format!("token rejected: {e}")))?;
        let claims = data.claims;

        for filter in &self.token_filters {
            if !filter.matches(&claims) {
                debug!("token failed claim filter {:?}", filter.path);
                return Err(unauthenticated("token does not satisfy the claim policy"));
            }
        }

        let sub = claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| unauthenticated("token has no subject"))?
            .to_string();
        let username = claims
            .get("preferred_username")
            .and_then(Value::as_str)
            .unwrap_or(&sub)
            .to_string();
        let is_admin =
            !self.admin_filters.is_empty() && self.admin_filters.iter().all(|f| f.matches(&claims));

        Ok(Principal {
            username,
            email: claims.get("email").and_then(Value::as_str).map(String::from),
            is_guest: claims
                .get("is_guest")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            is_admin,
            exp: claims.get("exp").and_then(Value::as_i64).unwrap_or(0),
            claims: claims.clone(),
            sub,
        })
    }

    // ------------------------------ Code flow ------------------------------

    /// A `redirect_uri` is acceptable when it points back at this service or
    /// at a localhost port from the configured allow-list.
    pub fn check_redirect_uri(&self, uri: &str) -> ApiResult<()> {
        if uri.starts_with(&self.public_url) {
            return Ok(());
        }
        for scheme in ["http://localhost:", "http://127.0.0.1:"] {
            if let Some(rest) = uri.strip_prefix(scheme) {
                let port: String = rest.chars().take_while(char::is_ascii_digit).collect();
                if let Ok(port) = port.parse::<u16>() {
                    if self.auth_ports.contains(&port) {
                        return Ok(());
                    }
                }
            }
        }
        Err(ApiError::InvalidInput(format!(
            "{uri}: redirect_uri is not registered"
        )))
    }

    /// Mint a single-use `state` nonce bound to the client's redirect URI.
    pub fn new_state(&self, redirect_uri: &str) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let state = hex::encode(blake3::hash(&raw).as_bytes());
        let mut states = self.states.lock().expect("state lock");
        states.retain(|_, e| e.created.elapsed() < STATE_TTL);
        states.insert(
            state.clone(),
            StateEntry {
                created: Instant::now(),
                redirect_uri: redirect_uri.to_string(),
            },
        );
        state
    }

    /// Redeem a `state` nonce; single use, ten-minute lifetime.
    pub fn consume_state(&self, state: &str) -> Option<String> {
        let mut states = self.states.lock().expect("state lock");
        states
            .remove(state)
            .filter(|e| e.created.elapsed() < STATE_TTL)
            .map(|e| e.redirect_uri)
    }

    /// Build the IdP authorize URL for the code flow.
    pub async fn authorize_url(
        &self,
        redirect_uri: &str,
        offline_access: bool,
    ) -> ApiResult<String> {
        self.check_redirect_uri(redirect_uri)?;
        let doc = self.discovery().await?;
        let state = self.new_state(redirect_uri);
        let callback = format!("{}/api/freva-nextgen/auth/v2/callback", self.public_url);
        let mut scope = "openid profile email".to_string();
        if offline_access {
            scope.push_str(" offline_access");
        }
        let query = [
            ("client_id", self.client_id.as_str()),
            ("response_type", "code"),
            ("redirect_uri", callback.as_str()),
            ("scope", scope.as_str()),
            ("state", state.as_str()),
        ];
        let qs = query
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");
        Ok(format!("{}?{qs}", doc.authorization_endpoint))
    }

    // ------------------------------ Token endpoint ------------------------------

    /// Exchange a grant with the IdP. Used by all three grant types.
    pub async fn exchange(&self, grant: TokenGrant) -> ApiResult<TokenResponse> {
        let doc = self.discovery().await?;
        let mut form: Vec<(&str, String)> = vec![
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
        ];
        match grant {
            // The code was issued for the mediator's own callback, so the
            // exchange always names that URI, not the client's.
            TokenGrant::AuthorizationCode { code, .. } => {
                let callback =
                    format!("{}/api/freva-nextgen/auth/v2/callback", self.public_url);
                form.push(("grant_type", "authorization_code".into()));
                form.push(("code", code));
                form.push(("redirect_uri", callback));
            }
            TokenGrant::RefreshToken { refresh_token } => {
                form.push(("grant_type", "refresh_token".into()));
                form.push(("refresh_token", refresh_token));
            }
            TokenGrant::DeviceCode { device_code } => {
                form.push((
                    "grant_type",
                    "urn:ietf:params:oauth:grant-type:device_code".into(),
                ));
                form.push(("device_code", device_code));
            }
        }
        let res = self
            .http
            .post(&doc.token_endpoint)
            .form(&form)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            debug!("token exchange rejected ({status}): {body}");
            return Err(ApiError::Unauthenticated(
                "token exchange rejected by the identity provider".into(),
            ));
        }
        let idp: IdpTokenResponse = res
            .json()
            .await
            .map_err(|e| ApiError::internal(anyhow::anyhow!("token response: {e}")))?;
        let now = chrono::Utc::now().timestamp();
        Ok(TokenResponse {
            access_token: idp.access_token,
            token_type: idp.token_type,
            expires: now + idp.expires_in,
            refresh_token: idp.refresh_token,
            refresh_expires: idp.refresh_expires_in.map(|s| now + s),
            scope: idp.scope,
        })
    }

    // ------------------------------ Device flow ------------------------------

    /// Start the device-code flow; the fallback when no localhost port can
    /// be bound.
    pub async fn device_flow(&self) -> ApiResult<DeviceFlowResponse> {
        let doc = self.discovery().await?;
        let endpoint = doc.device_authorization_endpoint.as_deref().ok_or_else(|| {
            ApiError::NotFound("identity provider offers no device flow".into())
        })?;
        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", "openid profile email"),
        ];
        let res = self.http.post(endpoint).form(&form).send().await?;
        if !res.status().is_success() {
            return Err(ApiError::BackendUnavailable(format!(
                "device authorization answered {}",
                res.status()
            )));
        }
        res.json()
            .await
            .map_err(|e| ApiError::internal(anyhow::anyhow!("device flow response: {e}")))
    }

    // ------------------------------ Logout ------------------------------

    /// Build the IdP end-session URL for a logout redirect.
    pub async fn end_session_url(&self, post_logout_redirect_uri: &str) -> ApiResult<String> {
        let doc = self.discovery().await?;
        let endpoint = doc
            .end_session_endpoint
            .as_deref()
            .ok_or_else(|| ApiError::NotFound("identity provider offers no logout".into()))?;
        Ok(format!(
            "{endpoint}?post_logout_redirect_uri={}&client_id={}",
            urlencode(post_logout_redirect_uri),
            urlencode(&self.client_id)
        ))
    }
}

/// Percent-encode a query value.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn filters(pairs: &[(&str, &str)]) -> Vec<ClaimFilter> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClaimFilter::compile(&map)
    }

    #[test]
    fn claim_filters_descend_nested_paths() {
        let claims = serde_json::json!({
            "realm_access": { "roles": ["offline_access", "freva-user"] },
            "org": { "tier": 3 },
        });
        assert!(filters(&[("realm_access.roles", "freva.*")])[0].matches(&claims));
        assert!(!filters(&[("realm_access.roles", "^admin$")])[0].matches(&claims));
        // Numbers match by their display form.
        assert!(filters(&[("org.tier", "3")])[0].matches(&claims));
        // Missing paths never match.
        assert!(!filters(&[("missing.path", ".*")])[0].matches(&claims));
    }

    #[test]
    fn invalid_regex_degrades_to_substring() {
        let claims = serde_json::json!({ "group": "freva([x]" });
        let f = filters(&[("group", "freva([x")]);
        assert!(f[0].matches(&claims));
    }

    #[test]
    fn redirect_uri_rules() {
        let mut settings = test_settings();
        settings.public_url = "https://www.freva.example".into();
        settings.auth_ports = vec![8080];
        let auth = AuthMediator::new(&settings);
        assert!(auth.check_redirect_uri("https://www.freva.example/ui").is_ok());
        assert!(auth.check_redirect_uri("http://localhost:8080/cb").is_ok());
        assert!(auth.check_redirect_uri("http://localhost:9999/cb").is_err());
        assert!(auth.check_redirect_uri("https://evil.example/cb").is_err());
    }

    #[test]
    fn states_are_single_use() {
        let auth = AuthMediator::new(&test_settings());
        let state = auth.new_state("http://localhost:8080/cb");
        assert_eq!(
            auth.consume_state(&state).as_deref(),
            Some("http://localhost:8080/cb")
        );
        assert!(auth.consume_state(&state).is_none());
        assert!(auth.consume_state("never-issued").is_none());
    }

    #[test]
    fn urlencode_keeps_unreserved() {
        assert_eq!(urlencode("abc-123_~."), "abc-123_~.");
        assert_eq!(urlencode("a b/c"), "a%20b%2Fc");
    }

    fn test_settings() -> Settings {
        // Minimal snapshot for unit tests; no environment involved.
        let mut settings = Settings::test_default();
        settings.auth_ports = vec![8080];
        settings
    }
}

//! Service configuration: `API_*` environment variables layered over an
//! optional TOML file.
//!
//! Precedence is environment > file > built-in default, resolved once at
//! startup into an immutable [`Settings`] snapshot that is cloned into the
//! application state. Nothing in the request path re-reads the environment.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

/// Services that can be switched on per deployment (`API_SERVICES`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    /// The `/databrowser` search surface.
    Databrowser,
    /// The `/stacapi` surface.
    StacApi,
    /// The `/data-portal` Zarr streaming surface.
    ZarrStream,
}

impl Service {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "databrowser" => Some(Self::Databrowser),
            "stacapi" => Some(Self::StacApi),
            "zarr-stream" => Some(Self::ZarrStream),
            _ => None,
        }
    }
}

/// Immutable configuration snapshot for the whole service.
#[derive(Clone)]
pub struct Settings {
    /// TCP port the server binds (`API_PORT`).
    pub port: u16,
    /// Number of worker threads for the runtime (`API_WORKER`).
    pub workers: usize,
    /// Public base URL of this service, used when generating absolute URLs
    /// (`API_PROXY`, falling back to `API_URL`, falling back to localhost).
    pub public_url: String,
    /// Default TTL in seconds for Zarr conversion jobs (`API_CACHE_EXP`).
    pub cache_exp: u64,
    /// Solr base URL (`API_SOLR_HOST`), e.g. `http://localhost:8983`.
    pub solr_host: String,
    /// Solr core holding the latest-version view (`API_SOLR_CORE`). The
    /// multi-version core is derived by convention (`<core>_files` vs
    /// `latest`).
    pub solr_core: String,
    /// Document store REST endpoint (`API_MONGO_HOST`).
    pub mongo_host: String,
    /// Document store credentials (`API_MONGO_USER` / `API_MONGO_PASSWORD`).
    pub mongo_user: String,
    pub mongo_password: String,
    /// Database name (`API_MONGO_DB`).
    pub mongo_db: String,
    /// Cache/broker REST endpoint (`API_REDIS_HOST`).
    pub redis_host: String,
    pub redis_user: String,
    pub redis_password: String,
    /// Optional client certificate pair for the cache connection.
    pub redis_ssl_certfile: Option<String>,
    pub redis_ssl_keyfile: Option<String>,
    /// OIDC discovery document URL (`API_OIDC_DISCOVERY_URL`).
    pub oidc_discovery_url: String,
    /// OIDC client credentials.
    pub oidc_client_id: String,
    pub oidc_client_secret: String,
    /// Claim filters applied during token validation: `.`-separated claim
    /// path to substring/regex pattern (`API_OIDC_TOKEN_CLAIMS`, JSON object).
    pub token_claims: BTreeMap<String, String>,
    /// Claim filters that grant admin rights; empty means nobody is admin.
    pub admin_claims: BTreeMap<String, String>,
    /// Localhost ports accepted in `redirect_uri` during the code flow.
    pub auth_ports: Vec<u16>,
    /// Secret key for HMAC-signed share URLs.
    pub share_secret: Vec<u8>,
    /// Enabled service surfaces (`API_SERVICES`).
    pub services: Vec<Service>,
    /// Debug logging switch (`DEBUG`).
    pub debug: bool,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secrets stay out of logs.
        f.debug_struct("Settings")
            .field("port", &self.port)
            .field("public_url", &self.public_url)
            .field("solr_host", &self.solr_host)
            .field("solr_core", &self.solr_core)
            .field("mongo_host", &self.mongo_host)
            .field("mongo_db", &self.mongo_db)
            .field("redis_host", &self.redis_host)
            .field("oidc_discovery_url", &self.oidc_discovery_url)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

/// File-form configuration (`API_CONFIG` points at a TOML file). Every key is
/// optional; the environment wins on conflict.
#[derive(Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    worker: Option<usize>,
    url: Option<String>,
    proxy: Option<String>,
    cache_exp: Option<u64>,
    services: Option<Vec<String>>,
    auth_ports: Option<Vec<u16>>,
    share_secret: Option<String>,
    #[serde(default)]
    solr: FileSolr,
    #[serde(default)]
    mongo: FileMongo,
    #[serde(default)]
    redis: FileRedis,
    #[serde(default)]
    oidc: FileOidc,
}

#[derive(Default, Deserialize)]
struct FileSolr {
    host: Option<String>,
    core: Option<String>,
}

#[derive(Default, Deserialize)]
struct FileMongo {
    host: Option<String>,
    user: Option<String>,
    password: Option<String>,
    db: Option<String>,
}

#[derive(Default, Deserialize)]
struct FileRedis {
    host: Option<String>,
    user: Option<String>,
    password: Option<String>,
    ssl_certfile: Option<String>,
    ssl_keyfile: Option<String>,
}

#[derive(Default, Deserialize)]
struct FileOidc {
    discovery_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    #[serde(default)]
    token_claims: BTreeMap<String, String>,
    #[serde(default)]
    admin_claims: BTreeMap<String, String>,
}

/// Configuration failure. Surfaced to the binary, which exits with code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|s| s.parse().ok())
}

/// Parse a claim-filter map from its JSON env form
/// (`{"realm_access.roles": "freva.*"}`).
fn claims_from_json(key: &str, raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::Invalid {
        key: key.into(),
        reason: e.to_string(),
    })
}

impl Settings {
    /// Resolve the configuration from the environment, layering an optional
    /// TOML file referenced by `API_CONFIG` underneath.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match env_str("API_CONFIG") {
            Some(path) => Self::read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file)
    }

    fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn resolve(file: FileConfig) -> Result<Self, ConfigError> {
        let port = env_parse("API_PORT").or(file.port).unwrap_or(8080);
        let workers = env_parse("API_WORKER").or(file.worker).unwrap_or(8);

        let url = env_str("API_URL").or(file.url);
        let proxy = env_str("API_PROXY").or(file.proxy);
        let public_url = proxy
            .or(url)
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();

        let token_claims = match env_str("API_OIDC_TOKEN_CLAIMS") {
            Some(raw) => claims_from_json("API_OIDC_TOKEN_CLAIMS", &raw)?,
            None => file.oidc.token_claims,
        };
        let admin_claims = match env_str("API_OIDC_ADMIN_CLAIMS") {
            Some(raw) => claims_from_json("API_OIDC_ADMIN_CLAIMS", &raw)?,
            None => file.oidc.admin_claims,
        };

        let services_raw = env_str("API_SERVICES")
            .map(|s| s.split(',').map(|p| p.trim().to_string()).collect::<Vec<_>>())
            .or(file.services)
            .unwrap_or_else(|| {
                vec!["databrowser".into(), "stacapi".into(), "zarr-stream".into()]
            });
        let mut services = Vec::new();
        for name in &services_raw {
            match Service::parse(name) {
                Some(s) if !services.contains(&s) => services.push(s),
                Some(_) => {}
                None => {
                    return Err(ConfigError::Invalid {
                        key: "API_SERVICES".into(),
                        reason: format!("unknown service {name:?}"),
                    })
                }
            }
        }

        let share_secret = match env_str("API_SHARE_SECRET").or(file.share_secret) {
            Some(s) => s.into_bytes(),
            None => {
                // Ephemeral key: share URLs stop verifying after a restart.
                warn!("no share secret configured, generating an ephemeral one");
                use rand::RngCore;
                let mut key = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                key
            }
        };

        let auth_ports = env_str("API_OIDC_AUTH_PORTS")
            .map(|s| s.split(',').filter_map(|p| p.trim().parse().ok()).collect())
            .or(file.auth_ports)
            .unwrap_or_else(|| vec![8080, 8081, 8082]);

        Ok(Self {
            port,
            workers,
            public_url,
            cache_exp: env_parse("API_CACHE_EXP").or(file.cache_exp).unwrap_or(86_400),
            solr_host: env_str("API_SOLR_HOST")
                .or(file.solr.host)
                .unwrap_or_else(|| "http://localhost:8983".into()),
            solr_core: env_str("API_SOLR_CORE")
                .or(file.solr.core)
                .unwrap_or_else(|| "files".into()),
            mongo_host: env_str("API_MONGO_HOST")
                .or(file.mongo.host)
                .unwrap_or_else(|| "http://localhost:27017".into()),
            mongo_user: env_str("API_MONGO_USER").or(file.mongo.user).unwrap_or_default(),
            mongo_password: env_str("API_MONGO_PASSWORD")
                .or(file.mongo.password)
                .unwrap_or_default(),
            mongo_db: env_str("API_MONGO_DB")
                .or(file.mongo.db)
                .unwrap_or_else(|| "search_stats".into()),
            redis_host: env_str("API_REDIS_HOST")
                .or(file.redis.host)
                .unwrap_or_else(|| "http://localhost:6379".into()),
            redis_user: env_str("API_REDIS_USER").or(file.redis.user).unwrap_or_default(),
            redis_password: env_str("API_REDIS_PASSWORD")
                .or(file.redis.password)
                .unwrap_or_default(),
            redis_ssl_certfile: env_str("API_REDIS_SSL_CERTFILE").or(file.redis.ssl_certfile),
            redis_ssl_keyfile: env_str("API_REDIS_SSL_KEYFILE").or(file.redis.ssl_keyfile),
            oidc_discovery_url: env_str("API_OIDC_DISCOVERY_URL")
                .or(file.oidc.discovery_url)
                .unwrap_or_default(),
            oidc_client_id: env_str("API_OIDC_CLIENT_ID")
                .or(file.oidc.client_id)
                .unwrap_or_else(|| "freva".into()),
            oidc_client_secret: env_str("API_OIDC_CLIENT_SECRET")
                .or(file.oidc.client_secret)
                .unwrap_or_default(),
            token_claims,
            admin_claims,
            auth_ports,
            share_secret,
            services,
            debug: env_str("DEBUG").map(|s| s != "0" && s != "false").unwrap_or(false),
        })
    }

    /// Default snapshot for unit tests; bypasses the environment entirely.
    #[cfg(test)]
    pub(crate) fn test_default() -> Self {
        Self::resolve(FileConfig::default()).expect("defaults resolve")
    }

    /// Whether a given surface is switched on.
    pub fn service_enabled(&self, service: Service) -> bool {
        self.services.contains(&service)
    }

    /// Absolute URL under the service prefix, e.g.
    /// `abs_url("data-portal/zarr/<token>.zarr")`.
    pub fn abs_url(&self, path: &str) -> String {
        format!(
            "{}/api/freva-nextgen/{}",
            self.public_url,
            path.trim_start_matches('/')
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn resolve_with_file(raw: &str) -> Settings {
        let parsed: FileConfig = toml::from_str(raw).unwrap();
        Settings::resolve(parsed).unwrap()
    }

    #[test]
    fn defaults_apply_without_file_or_env() {
        let st = Settings::resolve(FileConfig::default()).unwrap();
        assert_eq!(st.port, 8080);
        assert_eq!(st.cache_exp, 86_400);
        assert_eq!(st.solr_core, "files");
        assert_eq!(
            st.services,
            vec![Service::Databrowser, Service::StacApi, Service::ZarrStream]
        );
    }

    #[test]
    fn file_values_are_picked_up() {
        let st = resolve_with_file(
            r#"
            port = 7777
            proxy = "https://www.freva.dkrz.de/"
            services = ["databrowser"]
            auth_ports = [9988]

            [solr]
            host = "http://solr:8983"
            core = "fs_files"

            [oidc]
            discovery_url = "https://idp/.well-known/openid-configuration"
            client_id = "freva-dev"

            [oidc.token_claims]
            "realm_access.roles" = "freva.*"
            "#,
        );
        assert_eq!(st.port, 7777);
        assert_eq!(st.public_url, "https://www.freva.dkrz.de");
        assert_eq!(st.services, vec![Service::Databrowser]);
        assert_eq!(st.auth_ports, vec![9988]);
        assert_eq!(st.solr_core, "fs_files");
        assert_eq!(st.oidc_client_id, "freva-dev");
        assert_eq!(
            st.token_claims.get("realm_access.roles").map(String::as_str),
            Some("freva.*")
        );
    }

    #[test]
    fn unknown_service_is_rejected() {
        let parsed: FileConfig = toml::from_str(r#"services = ["legacy-ui"]"#).unwrap();
        assert!(matches!(
            Settings::resolve(parsed),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn config_file_round_trip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port = 9000").unwrap();
        let parsed = Settings::read_file(f.path()).unwrap();
        assert_eq!(parsed.port, Some(9000));
    }

    #[test]
    fn abs_url_joins_under_the_service_prefix() {
        let mut st = Settings::resolve(FileConfig::default()).unwrap();
        st.public_url = "https://host".into();
        assert_eq!(
            st.abs_url("/data-portal/zarr/abc.zarr"),
            "https://host/api/freva-nextgen/data-portal/zarr/abc.zarr"
        );
    }
}

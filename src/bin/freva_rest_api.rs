//! freva-rest-api: the REST gateway for climate-dataset search, user data,
//! Zarr streaming and OIDC mediation.
//!
//! Configuration comes from `API_*` environment variables, optionally
//! layered over a TOML file named by `API_CONFIG` (§ the project README).
//! Surfaces are switched with `API_SERVICES` (comma list of
//! `databrowser`, `stacapi`, `zarr-stream`).
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 authentication
//! bootstrap failed, 3 backend unavailable.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use freva_rest::api::{router, AppState};
use freva_rest::auth::AuthMediator;
use freva_rest::cache::CacheClient;
use freva_rest::config::{Service, Settings};
use freva_rest::docstore::DocStore;
use freva_rest::error::ApiError;
use freva_rest::flavour::FlavourRegistry;
use freva_rest::search::SearchAdapter;
use freva_rest::solr::SolrClient;
use freva_rest::stats::StatsSink;
use freva_rest::zarr::ZarrBroker;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                if std::env::var("DEBUG").map(|v| v != "0").unwrap_or(false) {
                    "freva_rest=debug,tower_http=debug".into()
                } else {
                    "freva_rest=info,tower_http=info".into()
                }
            }),
        )
        .with_target(false)
        .compact()
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.workers.max(1))
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {e}");
            std::process::exit(1);
        }
    };

    std::process::exit(runtime.block_on(run(settings)));
}

async fn run(settings: Settings) -> i32 {
    info!("starting freva-rest gateway: {settings:?}");

    let solr = SolrClient::new(&settings.solr_host, &settings.solr_core);
    let store = DocStore::new(
        &settings.mongo_host,
        &settings.mongo_db,
        &settings.mongo_user,
        &settings.mongo_password,
    );
    let cache = CacheClient::new(
        &settings.redis_host,
        &settings.redis_user,
        &settings.redis_password,
    );

    // Startup probes: the cache is load-bearing for the zarr surface, the
    // identity provider for everything protected. A missing search index is
    // only fatal per request.
    if settings.service_enabled(Service::ZarrStream) {
        if let Err(e) = cache.ping().await {
            error!("cache/broker unreachable: {e}");
            return 3;
        }
    }

    let auth = Arc::new(AuthMediator::new(&settings));
    if !settings.oidc_discovery_url.is_empty() {
        match auth.discovery().await {
            Ok(doc) => info!("identity provider: {}", doc.issuer),
            Err(ApiError::BackendUnavailable(e)) => {
                error!("identity provider unreachable: {e}");
                return 3;
            }
            Err(e) => {
                error!("identity provider rejected the configuration: {e}");
                return 2;
            }
        }
    } else {
        warn!("no OIDC discovery URL configured, protected routes will reject");
    }

    let flavours = Arc::new(FlavourRegistry::new(store.clone()));
    if let Err(e) = flavours.refresh().await {
        // User flavours reload lazily after the first successful write; the
        // built-ins carry the service until then.
        warn!("cannot preload user flavours: {e}");
    }

    let state = AppState {
        search: SearchAdapter::new(solr),
        flavours,
        broker: ZarrBroker::new(
            cache,
            &settings.public_url,
            settings.cache_exp,
            settings.share_secret.clone(),
        ),
        auth,
        stats: StatsSink::spawn(store.clone()),
        store,
        settings: settings.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let governor_conf = Box::leak(Box::new(
        GovernorConfigBuilder::default()
            .per_second(25)
            .burst_size(100)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("governor configuration is static"),
    ));

    let app = router(state)
        .layer(GovernorLayer { config: governor_conf })
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {addr}: {e}");
            return 1;
        }
    };
    info!("freva-rest listening on http://{addr}");

    match axum::serve(listener, app).await {
        Ok(()) => 0,
        Err(e) => {
            error!("server terminated: {e}");
            3
        }
    }
}

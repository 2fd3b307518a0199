use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_admin_key,
    engine::{Engine, EngineConfig},
    handlers::{
        activate, audit_events, create_license, deactivate, get_license, health, list_licenses,
        public_key,
    },
    store::Store,
    token::TokenIssuer,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// RSA private signing key, PEM ($LICD_PRIVATE_KEY_FILE).
    pub private_key_file: PathBuf,
    /// Matching RSA public key, PEM ($LICD_PUBLIC_KEY_FILE).
    pub public_key_file: PathBuf,
    /// Enables the admin routes when set.
    pub admin_key: Option<String>,
    pub store_timeout: Duration,
    pub max_attempts: u32,
    /// Adds an `exp` claim to issued tokens when set ($LICD_TOKEN_TTL, e.g. `30d`).
    pub token_ttl: Option<Duration>,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            host: std::env::var("LICD_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("LICD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("LICD_DATA_DIR").ok().map(PathBuf::from),
            private_key_file: std::env::var("LICD_PRIVATE_KEY_FILE")
                .unwrap_or_else(|_| "privkey.pem".into())
                .into(),
            public_key_file: std::env::var("LICD_PUBLIC_KEY_FILE")
                .unwrap_or_else(|_| "pubkey.pem".into())
                .into(),
            admin_key: resolve_admin_key(),
            store_timeout: std::env::var("LICD_STORE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(engine.store_timeout),
            max_attempts: std::env::var("LICD_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(engine.max_attempts),
            token_ttl: std::env::var("LICD_TOKEN_TTL")
                .ok()
                .and_then(|v| parse_ttl(&v)),
            cors_origins: std::env::var("LICD_CORS_ORIGINS").ok(),
        }
    }
}

fn parse_ttl(value: &str) -> Option<Duration> {
    match humantime::parse_duration(value.trim()) {
        Ok(d) if !d.is_zero() => Some(d),
        Ok(_) => None,
        Err(e) => {
            warn!(value, error = %e, "ignoring invalid LICD_TOKEN_TTL");
            None
        }
    }
}

/// Read a key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the admin key from `LICD_ADMIN_KEY_FILE` (preferred) or `LICD_ADMIN_KEY`.
fn resolve_admin_key() -> Option<String> {
    if let Ok(path) = std::env::var("LICD_ADMIN_KEY_FILE") {
        match read_key_file(Path::new(&path)) {
            Ok(key) => {
                if std::env::var("LICD_ADMIN_KEY").is_ok() {
                    warn!("both LICD_ADMIN_KEY and LICD_ADMIN_KEY_FILE are set; using file");
                }
                return Some(key);
            }
            Err(e) => warn!(error = %e, "ignoring LICD_ADMIN_KEY_FILE"),
        }
    }
    std::env::var("LICD_ADMIN_KEY").ok().filter(|k| !k.is_empty())
}

/// Resolve and create the data directory holding `licd.db`.
///
/// Priority: explicit path, then the platform data dir (`~/.local/share/licd/`, etc.).
pub fn resolve_data_dir(data_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.to_owned(),
        None => directories::ProjectDirs::from("", "", "licd")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir: {}", dir.display()))?;
    Ok(dir)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_deref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = Store::open(&data_dir.join("licd.db")).context("open store")?;

    let issuer = TokenIssuer::load(&cfg.private_key_file, &cfg.public_key_file, cfg.token_ttl)
        .context("load signing keys")?;
    info!(kid = %issuer.key_id(), token_ttl = ?cfg.token_ttl, "signing key loaded");

    if cfg.admin_key.is_none() {
        info!("no admin key configured; admin routes disabled");
    }

    let engine = Engine::new(
        store,
        EngineConfig {
            store_timeout: cfg.store_timeout,
            max_attempts: cfg.max_attempts,
        },
    );
    let state = AppState {
        engine,
        issuer: Arc::new(issuer),
        admin_key: cfg.admin_key,
    };

    let app = build_router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    let listener = TcpListener::bind(addr).await.context("bind listener")?;
    info!(%addr, "licd listening");

    serve(listener, app).await
}

/// Build the HTTP router. Admin routes are mounted only when `state.admin_key` is set.
pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/public-key", get(public_key))
        .route("/activate", post(activate))
        .route("/deactivate", post(deactivate));

    let mut app = Router::new().merge(public);

    if state.admin_key.is_some() {
        let admin = Router::new()
            .route("/licenses", post(create_license).get(list_licenses))
            .route("/licenses/{id}", get(get_license))
            .route("/audit", get(audit_events))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                require_admin_key,
            ));
        app = app.merge(admin);
    }

    app.with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// Serve `app` on `listener`, exposing peer addresses to the handlers.
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

pub mod auth;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod server;
pub mod store;
pub mod token;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: engine::Engine<store::Store>,
    pub issuer: Arc<token::TokenIssuer>,
    /// Bearer key for the admin routes. Admin routes are not mounted without it.
    pub admin_key: Option<String>,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub use error::ActivationError;
pub use server::{build_router, read_key_file, run, serve, ServerConfig};
pub use token::{verify_token, Claims, TokenIssuer};

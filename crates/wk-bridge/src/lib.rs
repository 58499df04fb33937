//! HTTP/WebSocket bridge for warkeep — the command dispatcher, the per-user
//! push channel, and the axum router that exposes both plus the health
//! endpoint.

pub mod dispatcher;
pub mod health;
pub mod http_api;
pub mod protocol;
pub mod push;

pub use health::HealthRegistry;
pub use http_api::{api_router, AppState};
pub use push::PushChannel;

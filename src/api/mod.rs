//! HTTP API for the orchestrator.
//!
//! ## Endpoints
//!
//! - `POST /api/requests` - Submit a new evidence-gathering request
//! - `GET /api/requests/{id}` - Snapshot of a request's progress and outcome
//! - `GET /api/requests/{id}/events` - Stream request progress via SSE
//! - `POST /api/requests/{id}/cancel` - Cooperatively cancel a running request
//! - `GET /api/strategies` - List the registered gathering strategies
//! - `GET /api/history` - Recent run records
//! - `GET /api/health` - Health check

mod hub;
mod routes;
pub mod types;

pub use hub::RequestHub;
pub use routes::{router, serve, AppState};
pub use types::*;

//! API request and response types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::RequestEvent;

/// Body of `POST /api/requests`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// The natural-language request to gather evidence for.
    pub text: String,

    /// Recent conversation context, passed to the planner verbatim.
    #[serde(default)]
    pub recent_context: Option<String>,

    /// Consent to run a plan priced above the hard unit ceiling.
    #[serde(default)]
    pub confirm_budget: bool,
}

/// Response after accepting a request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Identifier for polling, streaming, and cancellation.
    pub request_id: Uuid,
}

/// Where a request currently is in its lifecycle.
///
/// The fine-grained disposition of a finished run (degraded, aborted,
/// cancelled) lives in the final event's metadata and in the run record;
/// this is only the stream-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// Accepted and still producing events.
    Running,
    /// Ended with a `final` event carrying an answer.
    Completed,
    /// Ended with a `failed` event; no answer was produced.
    Failed,
}

/// Snapshot of one request, for refresh resilience.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub request_id: Uuid,
    pub phase: RequestPhase,
    /// Every event emitted so far, in order.
    pub events: Vec<RequestEvent>,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Model the decomposer plans with
    pub planner_model: String,

    /// Model the synthesizer answers with
    pub synthesis_model: String,

    /// Upper bound on concurrently executing graph nodes
    pub fan_out_limit: usize,

    /// Whether run history survives a restart
    pub history_persistent: bool,
}

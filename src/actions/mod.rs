//! Confirm-then-execute plans for mutating operations.
//!
//! Gathering strategies are read-only; anything that writes to a
//! system of record (sending a reply, scheduling an event) goes through an
//! [`ActionPlan`] instead of the execution graph. The plan walks a strictly
//! linear state machine and cannot reach `Confirmed` without the confirmation
//! token issued when the plan was previewed, so nothing mutates state without
//! an explicit external sign-off. Concrete mutating executors live outside
//! this crate; this module owns the lifecycle they must obey.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a mutating action.
///
/// Transitions are strictly linear. There is no branch, no retry state, and
/// no path around the confirmation gate between `Previewed` and `Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    /// Drafted from the request; side effect described but not rendered.
    Proposed,
    /// Rendered preview attached; waiting for external confirmation.
    Previewed,
    /// Confirmation token presented; the action may now run.
    Confirmed,
    /// The side effect has been performed.
    Executed,
    /// The side effect was checked against the system of record.
    Verified,
}

impl ActionState {
    /// The only state reachable from `self`, if any.
    pub fn successor(&self) -> Option<ActionState> {
        match self {
            Self::Proposed => Some(Self::Previewed),
            Self::Previewed => Some(Self::Confirmed),
            Self::Confirmed => Some(Self::Executed),
            Self::Executed => Some(Self::Verified),
            Self::Verified => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proposed => write!(f, "proposed"),
            Self::Previewed => write!(f, "previewed"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Executed => write!(f, "executed"),
            Self::Verified => write!(f, "verified"),
        }
    }
}

/// Opaque proof that a specific preview was seen.
///
/// Issued by [`ActionPlan::preview`] and required by [`ActionPlan::confirm`];
/// a token from another plan (or another preview of the same plan) does not
/// confirm this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationToken(Uuid);

impl ConfirmationToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConfirmationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One mutating operation moving through the confirm-then-execute lifecycle.
///
/// Plans are processed one at a time per request; the coordinator never
/// schedules them and they never appear in an execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPlan {
    pub id: Uuid,
    /// Request this action was drafted for.
    pub request_id: Uuid,
    /// Operation identifier, e.g. `send_reply` or `create_event`.
    pub kind: String,
    /// Human-readable statement of the intended side effect.
    pub description: String,
    /// Operation arguments, opaque to the lifecycle.
    pub payload: serde_json::Value,
    pub state: ActionState,
    /// Rendered preview of the side effect, set at `Previewed`.
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<ConfirmationToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionPlan {
    /// Draft a plan in the `Proposed` state.
    pub fn propose(
        request_id: Uuid,
        kind: impl Into<String>,
        description: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Self, ActionError> {
        let kind = kind.into();
        let description = description.into();
        if kind.trim().is_empty() || description.trim().is_empty() {
            return Err(ActionError::EmptyDescription);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            request_id,
            kind,
            description,
            payload,
            state: ActionState::Proposed,
            preview: None,
            token: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn awaiting_confirmation(&self) -> bool {
        self.state == ActionState::Previewed
    }

    /// Attach the rendered preview and issue the confirmation token.
    ///
    /// The token must be surfaced to whoever confirms; it is the only way
    /// to move this plan past `Previewed`.
    pub fn preview(&mut self, rendered: String) -> Result<ConfirmationToken, ActionError> {
        self.advance_to(ActionState::Previewed)?;
        let token = ConfirmationToken::new();
        self.preview = Some(rendered);
        self.token = Some(token);
        Ok(token)
    }

    /// Record the external confirmation.
    ///
    /// Fails unless the plan is `Previewed` and `token` matches the one
    /// issued by [`preview`](Self::preview).
    pub fn confirm(&mut self, token: ConfirmationToken) -> Result<(), ActionError> {
        if self.state == ActionState::Previewed && self.token != Some(token) {
            return Err(ActionError::ConfirmationMismatch { id: self.id });
        }
        self.advance_to(ActionState::Confirmed)
    }

    /// Record that the side effect was performed.
    pub fn mark_executed(&mut self) -> Result<(), ActionError> {
        self.advance_to(ActionState::Executed)
    }

    /// Record that the side effect was checked against the system of record.
    pub fn mark_verified(&mut self) -> Result<(), ActionError> {
        self.advance_to(ActionState::Verified)
    }

    fn advance_to(&mut self, to: ActionState) -> Result<(), ActionError> {
        if self.state.successor() != Some(to) {
            return Err(ActionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("action kind and description cannot be empty")]
    EmptyDescription,

    #[error("invalid action transition from {from} to {to}")]
    InvalidTransition { from: ActionState, to: ActionState },

    #[error("confirmation token does not match the preview of action {id}")]
    ConfirmationMismatch { id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft() -> ActionPlan {
        ActionPlan::propose(
            Uuid::new_v4(),
            "send_reply",
            "Reply to Dana's thread about the offsite agenda",
            json!({"threadId": "m-17", "body": "Looks good, see you there."}),
        )
        .unwrap()
    }

    #[test]
    fn test_full_lifecycle_walks_every_state_in_order() {
        let mut plan = draft();
        assert_eq!(plan.state, ActionState::Proposed);
        assert!(!plan.awaiting_confirmation());

        let token = plan
            .preview("To: dana@example.com\nLooks good, see you there.".to_string())
            .unwrap();
        assert_eq!(plan.state, ActionState::Previewed);
        assert!(plan.awaiting_confirmation());
        assert!(plan.preview.as_deref().unwrap().contains("dana@example.com"));

        plan.confirm(token).unwrap();
        assert_eq!(plan.state, ActionState::Confirmed);

        plan.mark_executed().unwrap();
        plan.mark_verified().unwrap();
        assert_eq!(plan.state, ActionState::Verified);
        assert!(plan.state.is_final());
        assert_eq!(plan.state.successor(), None);
    }

    #[test]
    fn test_cannot_skip_the_preview() {
        let mut plan = draft();
        let err = plan.confirm(ConfirmationToken::new()).unwrap_err();
        assert_eq!(
            err,
            ActionError::InvalidTransition {
                from: ActionState::Proposed,
                to: ActionState::Confirmed,
            }
        );
    }

    #[test]
    fn test_cannot_execute_without_confirmation() {
        let mut plan = draft();
        plan.preview("preview".to_string()).unwrap();
        let err = plan.mark_executed().unwrap_err();
        assert_eq!(
            err,
            ActionError::InvalidTransition {
                from: ActionState::Previewed,
                to: ActionState::Executed,
            }
        );
    }

    #[test]
    fn test_wrong_token_is_rejected() {
        let mut plan = draft();
        let issued = plan.preview("preview".to_string()).unwrap();

        let mut other = draft();
        let foreign = other.preview("another preview".to_string()).unwrap();

        let err = plan.confirm(foreign).unwrap_err();
        assert_eq!(err, ActionError::ConfirmationMismatch { id: plan.id });

        // The issued token still works afterwards.
        plan.confirm(issued).unwrap();
        assert_eq!(plan.state, ActionState::Confirmed);
    }

    #[test]
    fn test_verified_is_terminal() {
        let mut plan = draft();
        let token = plan.preview("preview".to_string()).unwrap();
        plan.confirm(token).unwrap();
        plan.mark_executed().unwrap();
        plan.mark_verified().unwrap();

        assert!(plan.mark_verified().is_err());
        assert!(plan.preview("again".to_string()).is_err());
    }

    #[test]
    fn test_empty_kind_is_rejected() {
        let err = ActionPlan::propose(Uuid::new_v4(), "  ", "description", json!({})).unwrap_err();
        assert_eq!(err, ActionError::EmptyDescription);
    }

    #[test]
    fn test_wire_shape_is_stable() {
        let mut plan = draft();
        plan.preview("rendered".to_string()).unwrap();

        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["state"], "previewed");
        assert_eq!(value["kind"], "send_reply");
        assert!(value["requestId"].is_string());
        assert!(value["createdAt"].is_string());
        assert_eq!(value["preview"], "rendered");

        let back: ActionPlan = serde_json::from_value(value).unwrap();
        assert_eq!(back.state, ActionState::Previewed);
        assert_eq!(back.kind, plan.kind);
    }
}

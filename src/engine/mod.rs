//! Request pipeline: plan, budget, execute, synthesize, maybe replan once.
//!
//! The engine owns the whole life of one request. It calls the planner for a
//! graph, lets the budget manager narrow it, drives the coordinator through
//! the stages, hands the terminal set to the synthesizer, and asks the
//! replanner whether one more round is worth it. Progress is emitted as
//! [`RequestEvent`]s; the outcome lands in the run history store either way.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::budget::{BudgetError, BudgetManager};
use crate::config::Config;
use crate::coordinator::{
    Coordinator, CoordinatorError, ExecutionContext, NodeSummaryCounts, StageEvent,
    TerminalResultSet,
};
use crate::graph::NodeStatus;
use crate::history::{RunRecord, RunStatus, RunStore};
use crate::llm::{CompletionClient, TokenUsage};
use crate::planner::{DecompositionError, Planner};
use crate::replan::{self, Sufficiency};
use crate::strategy::StrategyRegistry;
use crate::synthesis::{FinalResult, ResultMetadata, SynthesizedAnswer, Synthesizer};

/// One caller request as accepted by the API.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub text: String,
    /// Short free-text context from the caller's recent conversation.
    pub recent_context: Option<String>,
    /// Explicit consent to run a plan priced above the hard ceiling.
    pub confirm_budget: bool,
}

impl Submission {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            recent_context: None,
            confirm_budget: false,
        }
    }
}

/// Progress and outcome events for one request, in emission order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestEvent {
    #[serde(rename_all = "camelCase")]
    Accepted { request_id: Uuid },
    #[serde(rename_all = "camelCase")]
    PlanReady {
        graph_id: Uuid,
        node_count: usize,
        stage_count: usize,
        predicted_units: u64,
        narrowed: bool,
    },
    #[serde(rename_all = "camelCase")]
    StageStarted {
        stage_index: usize,
        group: u32,
        node_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    NodeRetrying {
        node_id: String,
        attempt: u32,
        limit: u32,
    },
    #[serde(rename_all = "camelCase")]
    NodeFinished {
        node_id: String,
        status: NodeStatus,
        items: usize,
        units_consumed: u64,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        stage_index: usize,
        node_summary_counts: NodeSummaryCounts,
    },
    Replanning { hint: String },
    Final { result: FinalResult },
    Failed { message: String },
}

impl RequestEvent {
    /// SSE event name; matches the serialized `type` tag.
    pub fn event_name(&self) -> &'static str {
        match self {
            RequestEvent::Accepted { .. } => "accepted",
            RequestEvent::PlanReady { .. } => "planReady",
            RequestEvent::StageStarted { .. } => "stageStarted",
            RequestEvent::NodeRetrying { .. } => "nodeRetrying",
            RequestEvent::NodeFinished { .. } => "nodeFinished",
            RequestEvent::Progress { .. } => "progress",
            RequestEvent::Replanning { .. } => "replanning",
            RequestEvent::Final { .. } => "final",
            RequestEvent::Failed { .. } => "failed",
        }
    }

    /// True for the last event a request will ever emit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestEvent::Final { .. } | RequestEvent::Failed { .. }
        )
    }
}

pub type RequestEventSender = mpsc::UnboundedSender<RequestEvent>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("could not understand the request's scope: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Output of one plan-execute-synthesize round.
struct RoundOutput {
    graph_id: Uuid,
    node_count: usize,
    set: TerminalResultSet,
    answer: SynthesizedAnswer,
    usage: TokenUsage,
}

pub struct Engine {
    planner: Planner,
    coordinator: Coordinator,
    synthesizer: Synthesizer,
    budget: BudgetManager,
    registry: Arc<StrategyRegistry>,
    store: Arc<dyn RunStore>,
    config: Arc<Config>,
}

impl Engine {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        registry: Arc<StrategyRegistry>,
        store: Arc<dyn RunStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            planner: Planner::new(client.clone(), config.clone()),
            coordinator: Coordinator::new(registry.clone(), config.clone()),
            synthesizer: Synthesizer::new(client, config.clone()),
            budget: BudgetManager::from_config(&config),
            registry,
            store,
            config,
        }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Run `submission` to completion and return its answer.
    ///
    /// The outcome is always recorded in the run store and mirrored on the
    /// event stream: a `final` event on success, a `failed` event otherwise.
    pub async fn run(
        &self,
        request_id: Uuid,
        submission: &Submission,
        cancel: CancellationToken,
        events: &RequestEventSender,
    ) -> Result<FinalResult, EngineError> {
        let outcome = self.execute(request_id, submission, &cancel, events).await;
        match &outcome {
            Ok(result) => {
                let record =
                    RunRecord::from_answer(&submission.text, result, run_status(result));
                if let Err(error) = self.store.record(&record).await {
                    tracing::warn!(%request_id, %error, "failed to record run");
                }
                let _ = events.send(RequestEvent::Final {
                    result: result.clone(),
                });
            }
            Err(error) => {
                tracing::error!(%request_id, %error, "request failed");
                let record =
                    RunRecord::from_failure(request_id, &submission.text, &error.to_string());
                if let Err(store_error) = self.store.record(&record).await {
                    tracing::warn!(%request_id, %store_error, "failed to record failed run");
                }
                let _ = events.send(RequestEvent::Failed {
                    message: error.to_string(),
                });
            }
        }
        outcome
    }

    async fn execute(
        &self,
        request_id: Uuid,
        submission: &Submission,
        cancel: &CancellationToken,
        events: &RequestEventSender,
    ) -> Result<FinalResult, EngineError> {
        let started = Instant::now();
        tracing::info!(%request_id, request = %submission.text, "request accepted");

        let mut round = self
            .run_round(request_id, submission, None, cancel, events)
            .await?;
        let mut usage = round.usage;
        let mut replans = 0u32;

        while replans < self.config.replan_limit && !cancel.is_cancelled() {
            let hint = match replan::assess(
                &round.answer,
                &round.set,
                self.config.replan_item_floor,
            ) {
                Sufficiency::Sufficient => break,
                Sufficiency::Insufficient { hint } => hint,
            };
            replans += 1;
            tracing::info!(%request_id, attempt = replans, "replanning with a fresh graph");
            let _ = events.send(RequestEvent::Replanning { hint: hint.clone() });

            match self
                .run_round(request_id, submission, Some(&hint), cancel, events)
                .await
            {
                Ok(next) => {
                    usage = usage.merge(&next.usage);
                    round = next;
                }
                Err(error) => {
                    tracing::warn!(%request_id, %error, "replan round failed, keeping the previous answer");
                    break;
                }
            }
        }

        let metadata = ResultMetadata {
            graph_id: round.graph_id,
            node_count: round.node_count,
            succeeded: round.set.counts.succeeded,
            failed: round.set.counts.failed,
            skipped: round.set.counts.skipped,
            units_consumed: round.set.units_consumed,
            predicted_units: round.set.predicted_units,
            elapsed_ms: started.elapsed().as_millis() as u64,
            token_usage: usage,
            replanned: replans > 0,
            degraded: round.answer.degraded,
            cancelled: round.set.cancelled,
            aborted: round.set.aborted.clone(),
        };
        tracing::info!(
            %request_id,
            units = metadata.units_consumed,
            elapsed_ms = metadata.elapsed_ms,
            replanned = metadata.replanned,
            "request finished"
        );

        Ok(FinalResult {
            request_id,
            text: round.answer.text,
            metadata,
        })
    }

    /// One full round: decompose, assess, execute, synthesize.
    async fn run_round(
        &self,
        request_id: Uuid,
        submission: &Submission,
        refinement: Option<&str>,
        cancel: &CancellationToken,
        events: &RequestEventSender,
    ) -> Result<RoundOutput, EngineError> {
        let decomposition = self
            .planner
            .decompose(
                &submission.text,
                submission.recent_context.as_deref(),
                &self.registry,
                refinement,
            )
            .await?;
        let mut usage = decomposition.usage;

        let assessment = self.budget.assess(
            decomposition.graph,
            &self.registry.known_names(),
            submission.confirm_budget,
        )?;
        let graph = assessment.graph;
        let graph_id = graph.id();
        let node_count = graph.graph().nodes.len();
        let _ = events.send(RequestEvent::PlanReady {
            graph_id,
            node_count,
            stage_count: graph.groups().len(),
            predicted_units: assessment.estimate.predicted_units,
            narrowed: assessment.narrowed,
        });

        let ctx = Arc::new(ExecutionContext::new(request_id, &graph, cancel.clone()));
        let (stage_tx, mut stage_rx) = mpsc::unbounded_channel();
        let forward = events.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = stage_rx.recv().await {
                let _ = forward.send(request_event_from_stage(event));
            }
        });

        let run = self.coordinator.run(&graph, &ctx, &stage_tx).await;
        drop(stage_tx);
        let _ = pump.await;
        let set = run?;

        let answer = self
            .synthesizer
            .synthesize(
                &submission.text,
                &graph.graph().synthesis_instructions,
                &set,
            )
            .await;
        usage = usage.merge(&answer.usage);

        Ok(RoundOutput {
            graph_id,
            node_count,
            set,
            answer,
            usage,
        })
    }
}

fn request_event_from_stage(event: StageEvent) -> RequestEvent {
    match event {
        StageEvent::StageStarted {
            stage_index,
            group,
            node_count,
        } => RequestEvent::StageStarted {
            stage_index,
            group,
            node_count,
        },
        StageEvent::NodeRetrying {
            node_id,
            attempt,
            limit,
        } => RequestEvent::NodeRetrying {
            node_id,
            attempt,
            limit,
        },
        StageEvent::NodeFinished {
            node_id,
            status,
            items,
            units_consumed,
        } => RequestEvent::NodeFinished {
            node_id,
            status,
            items,
            units_consumed,
        },
        StageEvent::StageCompleted {
            stage_index, counts, ..
        } => RequestEvent::Progress {
            stage_index,
            node_summary_counts: counts,
        },
    }
}

fn run_status(result: &FinalResult) -> RunStatus {
    if result.metadata.cancelled {
        RunStatus::Cancelled
    } else if result.metadata.aborted.is_some() {
        RunStatus::Aborted
    } else if result.metadata.degraded {
        RunStatus::Degraded
    } else {
        RunStatus::Completed
    }
}

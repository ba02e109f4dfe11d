//! Stage-by-stage graph execution.
//!
//! The coordinator walks a validated graph one parallel group at a time.
//! Within a group every node runs as its own tokio task behind a shared
//! semaphore, so intra-stage fan-out never exceeds the configured limit.
//! A group must reach a terminal state for all of its nodes before the
//! next group starts, which is what lets dependents read their inputs
//! without any cross-task locking.
//!
//! Failure policy: transient errors retry with exponential backoff up to
//! the attempt limit. A required node failing permanently aborts the
//! graph after its stage finishes, unless the node declares a fallback
//! strategy, which is swapped in with a fresh attempt budget. An optional
//! node failing or timing out is recorded as skipped and its dependents
//! see an unavailability marker instead of a result.

mod context;

pub use context::{ContextError, ExecutionContext, MissingNode, NodeSummaryCounts};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::graph::{GraphNode, NodeStatus, ValidGraph};
use crate::strategy::{ResolvedInputs, ResultStatus, Strategy, StrategyRegistry, StrategyResult};

/// Ceiling for the exponential retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("strategy '{strategy}' for node '{node}' is not registered")]
    UnknownStrategy { node: String, strategy: String },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("node task aborted unexpectedly: {0}")]
    TaskPanic(String),
}

/// Why a run stopped before executing every group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortInfo {
    pub node_id: String,
    pub reason: String,
}

/// Everything the synthesizer is allowed to see: compressed results from
/// terminal nodes plus an account of what is missing and why.
#[derive(Debug, Clone)]
pub struct TerminalResultSet {
    /// Results of terminal nodes, in graph order.
    pub results: Vec<StrategyResult>,
    /// Nodes that produced nothing, with reasons.
    pub missing: Vec<MissingNode>,
    pub counts: NodeSummaryCounts,
    pub units_consumed: u64,
    pub predicted_units: u64,
    pub stages_completed: usize,
    pub stages_total: usize,
    pub cancelled: bool,
    pub aborted: Option<AbortInfo>,
}

impl TerminalResultSet {
    /// True when every node ran to success.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.aborted.is_none() && self.counts.failed == 0
            && self.counts.skipped == 0
    }

    pub fn total_items(&self) -> usize {
        self.results.iter().map(|r| r.items.len()).sum()
    }
}

/// Progress notifications emitted while a graph runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StageEvent {
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
    StageCompleted {
        stage_index: usize,
        counts: NodeSummaryCounts,
        units_consumed: u64,
    },
}

pub type StageEventSender = mpsc::UnboundedSender<StageEvent>;

/// How one node task ended.
enum NodeOutcome {
    Completed(StrategyResult),
    Failed { reason: String },
    /// Optional node exceeded its attempt deadline; skipped without retries
    /// so the stage keeps moving.
    TimedOut,
    Cancelled,
}

struct FinishedNode {
    node_id: String,
    required: bool,
    outcome: NodeOutcome,
}

/// Everything a spawned node task needs, moved in at launch.
struct NodeTask {
    node: GraphNode,
    inputs: ResolvedInputs,
    strategy: Arc<dyn Strategy>,
    fallback: Option<Arc<dyn Strategy>>,
    attempt_limit: u32,
    attempt_timeout: Duration,
    base_delay: Duration,
    cancel: CancellationToken,
    events: StageEventSender,
}

pub struct Coordinator {
    registry: Arc<StrategyRegistry>,
    config: Arc<Config>,
}

impl Coordinator {
    pub fn new(registry: Arc<StrategyRegistry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    /// Execute every group of `graph` in ascending label order and return
    /// the terminal results. Cancellation and required-node aborts are not
    /// errors: both produce a partial [`TerminalResultSet`] so the caller
    /// can still synthesize from what completed.
    pub async fn run(
        &self,
        graph: &ValidGraph,
        ctx: &Arc<ExecutionContext>,
        events: &StageEventSender,
    ) -> Result<TerminalResultSet, CoordinatorError> {
        let groups = graph.groups().to_vec();
        let stages_total = groups.len();
        let mut stages_completed = 0usize;
        let mut cancelled = false;
        let mut aborted: Option<AbortInfo> = None;
        let cancel = ctx.cancel_token().clone();

        for (stage_index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let nodes: Vec<GraphNode> = graph
                .nodes_in_group(*group)
                .into_iter()
                .cloned()
                .collect();
            tracing::debug!(
                request = %ctx.request_id(),
                stage = stage_index,
                group,
                nodes = nodes.len(),
                "starting stage"
            );
            let _ = events.send(StageEvent::StageStarted {
                stage_index,
                group: *group,
                node_count: nodes.len(),
            });

            let launched: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
            let mut join_set = self.launch_stage(nodes, ctx, &cancel, events)?;

            // Join the whole stage. Once cancellation is observed, in-flight
            // nodes get a grace period before being aborted outright.
            let mut finished: Vec<FinishedNode> = Vec::new();
            let mut grace_deadline: Option<tokio::time::Instant> = None;
            loop {
                if join_set.is_empty() {
                    break;
                }
                if let Some(deadline) = grace_deadline {
                    match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                        Ok(Some(joined)) => finished.push(unwrap_join(joined)?),
                        Ok(None) => break,
                        Err(_) => {
                            join_set.abort_all();
                            while let Some(joined) = join_set.join_next().await {
                                match joined {
                                    Ok(f) => finished.push(f),
                                    Err(e) if e.is_cancelled() => {}
                                    Err(e) => {
                                        return Err(CoordinatorError::TaskPanic(e.to_string()))
                                    }
                                }
                            }
                            break;
                        }
                    }
                } else {
                    tokio::select! {
                        joined = join_set.join_next() => match joined {
                            Some(j) => finished.push(unwrap_join(j)?),
                            None => break,
                        },
                        _ = cancel.cancelled() => {
                            cancelled = true;
                            grace_deadline = Some(
                                tokio::time::Instant::now() + self.config.cancel_grace,
                            );
                        }
                    }
                }
            }

            let mut stage_abort: Option<AbortInfo> = None;
            for f in finished {
                match f.outcome {
                    NodeOutcome::Completed(result) => {
                        let items = result.items.len();
                        let units = result.units_consumed;
                        ctx.complete(&f.node_id, result)?;
                        let _ = events.send(StageEvent::NodeFinished {
                            node_id: f.node_id,
                            status: NodeStatus::Succeeded,
                            items,
                            units_consumed: units,
                        });
                    }
                    NodeOutcome::Failed { reason } => {
                        let status = if f.required {
                            tracing::warn!(node = %f.node_id, %reason, "required node failed");
                            ctx.fail(&f.node_id, reason.clone())?;
                            if stage_abort.is_none() {
                                stage_abort = Some(AbortInfo {
                                    node_id: f.node_id.clone(),
                                    reason,
                                });
                            }
                            NodeStatus::Failed
                        } else {
                            ctx.skip(&f.node_id, format!("node unavailable: {reason}"))?;
                            NodeStatus::Skipped
                        };
                        let _ = events.send(StageEvent::NodeFinished {
                            node_id: f.node_id,
                            status,
                            items: 0,
                            units_consumed: 0,
                        });
                    }
                    NodeOutcome::TimedOut => {
                        ctx.skip(&f.node_id, "node unavailable: timed out")?;
                        let _ = events.send(StageEvent::NodeFinished {
                            node_id: f.node_id,
                            status: NodeStatus::Skipped,
                            items: 0,
                            units_consumed: 0,
                        });
                    }
                    NodeOutcome::Cancelled => {
                        ctx.skip(&f.node_id, "cancelled")?;
                        let _ = events.send(StageEvent::NodeFinished {
                            node_id: f.node_id,
                            status: NodeStatus::Skipped,
                            items: 0,
                            units_consumed: 0,
                        });
                    }
                }
            }
            // Tasks torn down after the grace period never reported back.
            for id in &launched {
                if ctx.status(id) == Some(NodeStatus::Running) {
                    ctx.skip(id, "cancelled")?;
                }
            }

            let _ = events.send(StageEvent::StageCompleted {
                stage_index,
                counts: ctx.summary(),
                units_consumed: ctx.tracker().consumed(),
            });
            if !cancelled {
                stages_completed += 1;
            }
            if let Some(abort) = stage_abort {
                aborted = Some(abort);
                break;
            }
            if cancelled {
                break;
            }
        }

        // Later groups never started. Mark them so the gap report is exact.
        let mut pending = ctx.pending_nodes();
        if !pending.is_empty() {
            pending.sort();
            let reason = if cancelled {
                "cancelled before start".to_string()
            } else if let Some(a) = &aborted {
                format!("not executed: required node '{}' failed", a.node_id)
            } else {
                "not executed".to_string()
            };
            for id in &pending {
                ctx.skip(id, reason.clone())?;
            }
        }

        let results: Vec<StrategyResult> = graph
            .terminal_node_ids()
            .iter()
            .filter_map(|id| ctx.result(id))
            .map(|r| (*r).clone())
            .collect();
        let set = TerminalResultSet {
            results,
            missing: ctx.missing_nodes(graph),
            counts: ctx.summary(),
            units_consumed: ctx.tracker().consumed(),
            predicted_units: ctx.tracker().predicted(),
            stages_completed,
            stages_total,
            cancelled,
            aborted,
        };
        tracing::info!(
            request = %ctx.request_id(),
            stages = set.stages_completed,
            succeeded = set.counts.succeeded,
            skipped = set.counts.skipped,
            failed = set.counts.failed,
            units = set.units_consumed,
            predicted = set.predicted_units,
            cancelled = set.cancelled,
            "graph execution finished"
        );
        Ok(set)
    }

    /// Spawn one task per stage node behind a shared fan-out semaphore.
    fn launch_stage(
        &self,
        nodes: Vec<GraphNode>,
        ctx: &Arc<ExecutionContext>,
        cancel: &CancellationToken,
        events: &StageEventSender,
    ) -> Result<JoinSet<FinishedNode>, CoordinatorError> {
        let semaphore = Arc::new(Semaphore::new(self.config.fan_out_limit));
        let mut join_set = JoinSet::new();
        for node in nodes {
            let inputs = ctx.resolve_inputs(&node)?;
            ctx.begin(&node.id)?;
            let strategy =
                self.registry
                    .get(&node.strategy)
                    .ok_or_else(|| CoordinatorError::UnknownStrategy {
                        node: node.id.clone(),
                        strategy: node.strategy.clone(),
                    })?;
            let fallback = match &node.fallback {
                Some(name) => Some(self.registry.get(name).ok_or_else(|| {
                    CoordinatorError::UnknownStrategy {
                        node: node.id.clone(),
                        strategy: name.clone(),
                    }
                })?),
                None => None,
            };
            let task = NodeTask {
                node,
                inputs,
                strategy,
                fallback,
                attempt_limit: self.config.node_attempt_limit,
                attempt_timeout: self.config.stage_timeout,
                base_delay: self.config.retry_base_delay,
                cancel: cancel.clone(),
                events: events.clone(),
            };
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return FinishedNode {
                            node_id: task.node.id.clone(),
                            required: task.node.required,
                            outcome: NodeOutcome::Failed {
                                reason: "executor shut down".to_string(),
                            },
                        }
                    }
                };
                let _permit = permit;
                run_node(task).await
            });
        }
        Ok(join_set)
    }
}

/// Attempt loop for a single node: deadline per attempt, backoff between
/// transient failures, at most one switch to the declared fallback.
async fn run_node(task: NodeTask) -> FinishedNode {
    let node_id = task.node.id.clone();
    let required = task.node.required;
    let finish = |outcome| FinishedNode {
        node_id: task.node.id.clone(),
        required,
        outcome,
    };

    let mut strategy = task.strategy.clone();
    let mut fallback = task.fallback.clone();
    let mut attempt = 0u32;
    loop {
        if task.cancel.is_cancelled() {
            return finish(NodeOutcome::Cancelled);
        }
        attempt += 1;

        let attempt_result = timeout(
            task.attempt_timeout,
            strategy.execute(&task.node, &task.inputs),
        )
        .await;

        let failure = match attempt_result {
            Ok(Ok(result)) if result.status != ResultStatus::Failed => {
                return finish(NodeOutcome::Completed(result));
            }
            Ok(Ok(_)) => "strategy produced no usable data".to_string(),
            Ok(Err(err)) if err.is_transient() && attempt < task.attempt_limit => {
                tracing::debug!(node = %node_id, attempt, error = %err, "retrying after transient failure");
                let _ = task.events.send(StageEvent::NodeRetrying {
                    node_id: node_id.clone(),
                    attempt,
                    limit: task.attempt_limit,
                });
                let delay = task
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(attempt - 1))
                    .min(MAX_BACKOFF);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = task.cancel.cancelled() => return finish(NodeOutcome::Cancelled),
                }
                continue;
            }
            Ok(Err(err)) if err.is_transient() => {
                format!("{err} (after {attempt} attempts)")
            }
            Ok(Err(err)) => err.to_string(),
            Err(_elapsed) if !required => {
                return finish(NodeOutcome::TimedOut);
            }
            Err(_elapsed) if attempt < task.attempt_limit => {
                let _ = task.events.send(StageEvent::NodeRetrying {
                    node_id: node_id.clone(),
                    attempt,
                    limit: task.attempt_limit,
                });
                continue;
            }
            Err(_elapsed) => format!("timed out after {attempt} attempts"),
        };

        // Permanent failure of the current strategy.
        if let Some(alt) = fallback.take() {
            tracing::info!(
                node = %node_id,
                from = strategy.name(),
                to = alt.name(),
                %failure,
                "switching to fallback strategy"
            );
            strategy = alt;
            attempt = 0;
            continue;
        }
        return finish(NodeOutcome::Failed { reason: failure });
    }
}

fn unwrap_join(
    joined: Result<FinishedNode, tokio::task::JoinError>,
) -> Result<FinishedNode, CoordinatorError> {
    joined.map_err(|e| CoordinatorError::TaskPanic(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::{graph_of, node, node_with_deps};
    use crate::graph::validate;
    use crate::strategy::testing::{new_log, ExecutionLog, ProbeStrategy};
    use crate::strategy::StrategyError;
    use std::time::Instant;
    use uuid::Uuid;

    fn registry_with(probes: Vec<Arc<ProbeStrategy>>) -> Arc<StrategyRegistry> {
        let mut registry = StrategyRegistry::empty();
        for probe in probes {
            registry.register(probe);
        }
        Arc::new(registry)
    }

    struct Run {
        set: TerminalResultSet,
        ctx: Arc<ExecutionContext>,
        events: Vec<StageEvent>,
    }

    async fn run_graph(
        nodes: Vec<GraphNode>,
        registry: Arc<StrategyRegistry>,
        config: Config,
    ) -> Run {
        let graph = graph_of(nodes);
        let valid = validate(graph, &registry.known_names()).unwrap();
        let ctx = Arc::new(ExecutionContext::new(
            Uuid::new_v4(),
            &valid,
            CancellationToken::new(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(registry, Arc::new(config));
        let set = coordinator.run(&valid, &ctx, &tx).await.unwrap();
        drop(tx);
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        Run { set, ctx, events }
    }

    fn log_positions(log: &ExecutionLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_stages_run_in_dependency_order() {
        let log = new_log();
        let probe = Arc::new(ProbeStrategy::new("probe", log.clone()));
        let registry = registry_with(vec![probe]);
        let run = run_graph(
            vec![
                node("a", "probe", 1),
                node("b", "probe", 1),
                node_with_deps("c", "probe", 2, &["a", "b"]),
                node_with_deps("d", "probe", 3, &["c"]),
            ],
            registry,
            Config::for_tests(),
        )
        .await;

        let order = log_positions(&log);
        assert_eq!(order.len(), 4);
        assert!(order[..2].contains(&"a".to_string()));
        assert!(order[..2].contains(&"b".to_string()));
        assert_eq!(order[2], "c");
        assert_eq!(order[3], "d");

        assert_eq!(run.set.stages_completed, 3);
        assert_eq!(run.set.counts.succeeded, 4);
        // Only `d` has no dependents.
        assert_eq!(run.set.results.len(), 1);
        assert_eq!(run.set.results[0].node_id, "d");
        assert!(run.set.is_complete());

        let starts = run
            .events
            .iter()
            .filter(|e| matches!(e, StageEvent::StageStarted { .. }))
            .count();
        assert_eq!(starts, 3);
    }

    #[tokio::test]
    async fn test_fan_out_respects_limit() {
        let log = new_log();
        let probe = Arc::new(
            ProbeStrategy::new("probe", log.clone()).with_delay(Duration::from_millis(25)),
        );
        let registry = registry_with(vec![probe]);
        let mut config = Config::for_tests();
        config.fan_out_limit = 2;

        let start = Instant::now();
        let run = run_graph(
            vec![
                node("n1", "probe", 1),
                node("n2", "probe", 1),
                node("n3", "probe", 1),
                node("n4", "probe", 1),
            ],
            registry,
            config,
        )
        .await;
        // Two at a time, so two batches of 25ms minimum.
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(run.set.counts.succeeded, 4);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_success() {
        let log = new_log();
        let probe = Arc::new(ProbeStrategy::new("probe", log.clone()));
        probe.fail_transiently(2);
        let registry = registry_with(vec![probe]);
        let run = run_graph(vec![node("n1", "probe", 1)], registry, Config::for_tests()).await;

        assert_eq!(log_positions(&log), vec!["n1!", "n1!", "n1"]);
        assert_eq!(run.set.counts.succeeded, 1);
        assert!(run.ctx.result("n1").is_some());
        let retries = run
            .events
            .iter()
            .filter(|e| matches!(e, StageEvent::NodeRetrying { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_required_failure_aborts_and_skips_descendants() {
        let log = new_log();
        let probe = Arc::new(ProbeStrategy::new("probe", log.clone()));
        probe.push_failure(StrategyError::InvalidParams {
            strategy: "probe".to_string(),
            reason: "bad keywords".to_string(),
        });
        let registry = registry_with(vec![probe]);
        let run = run_graph(
            vec![
                node("a", "probe", 1),
                node("b", "probe", 1),
                node_with_deps("c", "probe", 2, &["a"]),
            ],
            registry,
            Config::for_tests(),
        )
        .await;

        // Scripted failure pops on the first executed call; a and b race, so
        // identify the failed one from the context.
        let failed = ["a", "b"]
            .iter()
            .find(|id| run.ctx.status(id) == Some(NodeStatus::Failed))
            .copied()
            .expect("one first-stage node failed");
        let survivor = if failed == "a" { "b" } else { "a" };

        let abort = run.set.aborted.as_ref().expect("graph aborted");
        assert_eq!(abort.node_id, failed);
        assert!(abort.reason.contains("invalid params"));
        assert_eq!(run.ctx.status(survivor), Some(NodeStatus::Succeeded));
        assert_eq!(run.ctx.status("c"), Some(NodeStatus::Skipped));
        assert_eq!(run.set.stages_completed, 1);
        assert!(!run.set.is_complete());

        let missing_ids: Vec<&str> = run.set.missing.iter().map(|m| m.node_id.as_str()).collect();
        assert!(missing_ids.contains(&failed));
        assert!(missing_ids.contains(&"c"));
    }

    #[tokio::test]
    async fn test_optional_failure_skips_and_continues() {
        let log = new_log();
        let probe = Arc::new(ProbeStrategy::new("probe", log.clone()));
        probe.push_failure(StrategyError::InvalidParams {
            strategy: "probe".to_string(),
            reason: "bad keywords".to_string(),
        });
        let registry = registry_with(vec![probe]);

        let mut optional = node("a", "probe", 1);
        optional.required = false;
        let run = run_graph(
            vec![optional, node_with_deps("c", "probe", 2, &["a"])],
            registry,
            Config::for_tests(),
        )
        .await;

        assert!(run.set.aborted.is_none());
        assert_eq!(run.ctx.status("a"), Some(NodeStatus::Skipped));
        assert_eq!(run.ctx.status("c"), Some(NodeStatus::Succeeded));
        assert_eq!(run.set.stages_completed, 2);
        let gap = &run.set.missing[0];
        assert_eq!(gap.node_id, "a");
        assert!(!gap.required);
        assert!(gap.reason.starts_with("node unavailable"));
    }

    #[tokio::test]
    async fn test_required_timeout_aborts_after_attempt_limit() {
        let log = new_log();
        let slow = Arc::new(
            ProbeStrategy::new("slow", log.clone()).with_delay(Duration::from_millis(200)),
        );
        let fast = Arc::new(ProbeStrategy::new("fast", log.clone()));
        let registry = registry_with(vec![slow, fast]);
        let mut config = Config::for_tests();
        config.stage_timeout = Duration::from_millis(30);

        let run = run_graph(
            vec![node("stuck", "slow", 1), node("ok", "fast", 1)],
            registry,
            config,
        )
        .await;

        let abort = run.set.aborted.as_ref().expect("graph aborted");
        assert_eq!(abort.node_id, "stuck");
        assert!(abort.reason.contains("timed out after 3 attempts"));
        assert_eq!(run.ctx.status("stuck"), Some(NodeStatus::Failed));
        // The rest of the stage still completed and its data survives.
        assert_eq!(run.ctx.status("ok"), Some(NodeStatus::Succeeded));
        assert!(run.set.results.iter().any(|r| r.node_id == "ok"));
        assert!(run.set.missing.iter().any(|m| m.node_id == "stuck" && m.required));
    }

    #[tokio::test]
    async fn test_optional_timeout_skips_without_retries() {
        let log = new_log();
        let slow = Arc::new(
            ProbeStrategy::new("slow", log.clone()).with_delay(Duration::from_millis(200)),
        );
        let fast = Arc::new(ProbeStrategy::new("fast", log.clone()));
        let registry = registry_with(vec![slow, fast]);
        let mut config = Config::for_tests();
        config.stage_timeout = Duration::from_millis(30);

        let mut lagging = node("lagging", "slow", 1);
        lagging.required = false;
        let start = Instant::now();
        let run = run_graph(vec![lagging, node("ok", "fast", 1)], registry, config).await;

        assert!(run.set.aborted.is_none());
        assert_eq!(run.ctx.status("lagging"), Some(NodeStatus::Skipped));
        assert_eq!(run.ctx.status("ok"), Some(NodeStatus::Succeeded));
        assert_eq!(run.set.stages_completed, 1);
        // One deadline, not three.
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_fallback_strategy_rescues_required_node() {
        let log = new_log();
        let primary = Arc::new(ProbeStrategy::new("primary", log.clone()));
        primary.push_failure(StrategyError::InvalidParams {
            strategy: "primary".to_string(),
            reason: "unsupported filter".to_string(),
        });
        let rescue = Arc::new(ProbeStrategy::new("rescue", log.clone()));
        let registry = registry_with(vec![primary, rescue]);

        let mut n1 = node("n1", "primary", 1);
        n1.fallback = Some("rescue".to_string());
        let run = run_graph(vec![n1], registry, Config::for_tests()).await;

        // Primary failed once, rescue produced the result under the same id.
        assert_eq!(log_positions(&log), vec!["n1!", "n1"]);
        assert!(run.set.aborted.is_none());
        assert_eq!(run.ctx.status("n1"), Some(NodeStatus::Succeeded));
        assert_eq!(run.set.results.len(), 1);
        assert_eq!(run.set.results[0].node_id, "n1");
    }

    #[tokio::test]
    async fn test_cancellation_finalizes_completed_stages() {
        let log = new_log();
        let fast = Arc::new(ProbeStrategy::new("fast", log.clone()));
        let slow = Arc::new(
            ProbeStrategy::new("slow", log.clone()).with_delay(Duration::from_millis(300)),
        );
        let registry = registry_with(vec![fast, slow]);

        let graph = graph_of(vec![
            node("a", "fast", 1),
            node_with_deps("b", "slow", 2, &["a"]),
        ]);
        let valid = validate(graph, &registry.known_names()).unwrap();
        let cancel = CancellationToken::new();
        let ctx = Arc::new(ExecutionContext::new(
            Uuid::new_v4(),
            &valid,
            cancel.clone(),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(registry, Arc::new(Config::for_tests()));

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel.cancel();
        });
        let set = coordinator.run(&valid, &ctx, &tx).await.unwrap();
        canceller.await.unwrap();

        assert!(set.cancelled);
        assert_eq!(set.stages_completed, 1);
        // Completed work survives the cancellation.
        assert_eq!(ctx.status("a"), Some(NodeStatus::Succeeded));
        assert!(ctx.result("a").is_some());
        assert_eq!(ctx.status("b"), Some(NodeStatus::Skipped));
        assert!(set.missing.iter().any(|m| m.node_id == "b"));
    }

    #[tokio::test]
    async fn test_random_graphs_respect_declared_ordering() {
        use rand::{Rng, SeedableRng};

        for seed in 0..8u64 {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let node_count = rng.gen_range(5..10);
            let mut nodes: Vec<GraphNode> = Vec::new();
            let mut edges: Vec<(String, String)> = Vec::new();
            for i in 0..node_count {
                let group = rng.gen_range(1..=3u32);
                let id = format!("n{i}");
                let lower: Vec<String> = nodes
                    .iter()
                    .filter(|n| n.parallel_group < group)
                    .map(|n| n.id.clone())
                    .collect();
                let mut deps: Vec<&str> = Vec::new();
                if !lower.is_empty() {
                    for _ in 0..rng.gen_range(0..=2usize.min(lower.len())) {
                        let pick = lower[rng.gen_range(0..lower.len())].as_str();
                        if !deps.contains(&pick) {
                            deps.push(pick);
                        }
                    }
                }
                for d in &deps {
                    edges.push((d.to_string(), id.clone()));
                }
                nodes.push(node_with_deps(&id, "probe", group, &deps));
            }

            let log = new_log();
            let probe = Arc::new(ProbeStrategy::new("probe", log.clone()));
            let registry = registry_with(vec![probe]);
            let run = run_graph(nodes.clone(), registry, Config::for_tests()).await;
            assert_eq!(run.set.counts.succeeded, nodes.len(), "seed {seed}");

            let order = log_positions(&log);
            let position = |id: &str| order.iter().position(|x| x == id).unwrap();
            for (from, to) in &edges {
                assert!(
                    position(from) < position(to),
                    "seed {seed}: '{from}' must run before '{to}'"
                );
            }
            // Stage labels are non-decreasing in execution order.
            let group_of = |id: &str| {
                nodes.iter().find(|n| n.id == id).unwrap().parallel_group
            };
            for pair in order.windows(2) {
                assert!(group_of(&pair[0]) <= group_of(&pair[1]), "seed {seed}");
            }
        }
    }
}

//! # legwork
//!
//! Staged evidence-gathering orchestrator: turns an open question into a
//! bounded, parallel research plan, runs it, and answers from compressed
//! findings only.
//!
//! ## Architecture
//!
//! ```text
//!   request ──► planner ──► budget ──► coordinator ──► synthesizer ──► answer
//!                 │           │            │
//!                 ▼           ▼            ▼
//!            strategy      narrowing   stage-by-stage
//!            catalog       / refusal   bounded fan-out
//! ```
//!
//! ## Request Flow
//! 1. The planner decomposes the request into a validated dependency graph
//! 2. The budget manager prices the graph and narrows or refuses it
//! 3. The coordinator runs each stage with bounded parallelism, compressing
//!    every node's output to capped summaries
//! 4. The synthesizer answers from terminal-node summaries alone
//! 5. A thin round may trigger one fresh planning round before the answer
//!    is final
//!
//! ## Modules
//! - `engine`: request lifecycle from submission to recorded answer
//! - `graph`: execution graph schema and structural validation
//! - `strategy`: bounded gathering strategies and their registry
//! - `coordinator`: staged execution, retries, cancellation
//! - `api`: HTTP surface with SSE progress streams

pub mod actions;
pub mod api;
pub mod budget;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod evidence;
pub mod graph;
pub mod history;
pub mod llm;
pub mod planner;
pub mod replan;
pub mod strategy;
pub mod synthesis;

pub use config::Config;
pub use engine::{Engine, RequestEvent, Submission};
pub use synthesis::FinalResult;

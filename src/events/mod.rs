//! Typed progress events streamed to observers.
//!
//! Producers anywhere in a grading run push events into an [`EventQueue`];
//! a single consumer bound to the subscriber's writer drains them in enqueue
//! order.

mod queue;

use serde::{Deserialize, Serialize};

pub use queue::EventQueue;

/// Progress of one activity.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Waiting,
    Running,
    Generating,
    Generated,
    Validating,
    Validated,
    Solving,
    Executing,
    Executed,
    Checking,
    Done,
    Failure,
}

/// Outcome payload of a solution evaluated on one testcase.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EvaluationResult {
    pub score: f64,
    pub message: String,
    pub cpu_time_used: f64,
    pub wall_time_used: f64,
    pub memory_used_kb: u64,
}

/// Outcome payload of a checker pass over a terry solution.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TerryCheckResult {
    pub score: f64,
    pub message: String,
}

/// One progress event.
///
/// `from_cache` marks artifacts replayed from a previous run rather than
/// produced fresh.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Compilation {
        filename: String,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
        from_cache: bool,
    },
    Generation {
        testcase: i64,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        from_cache: bool,
    },
    TerryGeneration {
        solution: String,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        from_cache: bool,
    },
    Evaluation {
        solution: String,
        testcase: i64,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<EvaluationResult>,
        from_cache: bool,
    },
    TerryEvaluation {
        solution: String,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<String>,
        from_cache: bool,
    },
    TerryCheck {
        solution: String,
        status: EventStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<TerryCheckResult>,
        from_cache: bool,
    },
    TaskScore {
        solution: String,
        score: f64,
    },
    SubtaskScore {
        solution: String,
        score: f64,
        subtask_id: i64,
    },
    FatalError {
        msg: String,
    },
}

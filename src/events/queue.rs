use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use spin::Mutex;
use tokio::{io::AsyncWriteExt, sync::Notify};

use super::{Event, EventStatus, EvaluationResult, TerryCheckResult};
use crate::{error::Error, Result};

struct QueueInner {
    queue: Mutex<VecDeque<Event>>,
    stopped: AtomicBool,
    notify: Notify,
}

/// Multi-producer, single-consumer stream of [`Event`]s.
///
/// Enqueue order is the mutex-serialized order producers observed; the one
/// consumer sees exactly that order. After [`EventQueue::stop`] the consumer
/// drains whatever is left and then gets `None`.
#[derive(Clone)]
pub struct EventQueue(Arc<QueueInner>);

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue(Arc::new(QueueInner {
            queue: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn enqueue(&self, event: Event) {
        self.0.queue.lock().push_back(event);
        self.0.notify.notify_one();
    }

    /// Next event, waiting for one if necessary. `None` only after the
    /// queue was stopped and fully drained.
    pub async fn dequeue(&self) -> Option<Event> {
        loop {
            let notified = self.0.notify.notified();
            if let Some(event) = self.0.queue.lock().pop_front() {
                return Some(event);
            }
            if self.0.stopped.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn stop(&self) {
        self.0.stopped.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
        self.0.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.stopped.load(Ordering::Acquire)
    }

    /// Forward every event to `writer` as JSON lines until the queue stops.
    ///
    /// When several queues share one transport, pass the transport's mutex:
    /// it is held across each write so lines never interleave.
    pub async fn bind_writer<W>(
        &self,
        writer: &mut W,
        serializing: Option<&tokio::sync::Mutex<()>>,
    ) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        while let Some(event) = self.dequeue().await {
            let mut line = serde_json::to_vec(&event)
                .map_err(|err| Error::EventStream(err.into()))?;
            line.push(b'\n');
            let _guard = match serializing {
                Some(mutex) => Some(mutex.lock().await),
                None => None,
            };
            writer.write_all(&line).await.map_err(Error::EventStream)?;
            writer.flush().await.map_err(Error::EventStream)?;
        }
        Ok(())
    }
}

/// Typed constructors, one per activity transition.
impl EventQueue {
    pub fn fatal_error(&self, message: impl Into<String>) {
        self.enqueue(Event::FatalError {
            msg: message.into(),
        });
    }

    pub fn task_score(&self, solution: impl Into<String>, score: f64) {
        self.enqueue(Event::TaskScore {
            solution: solution.into(),
            score,
        });
    }

    pub fn subtask_score(&self, solution: impl Into<String>, score: f64, subtask_id: i64) {
        self.enqueue(Event::SubtaskScore {
            solution: solution.into(),
            score,
            subtask_id,
        });
    }

    fn compilation(&self, filename: impl Into<String>, status: EventStatus, errors: String, from_cache: bool) {
        self.enqueue(Event::Compilation {
            filename: filename.into(),
            status,
            stderr: (!errors.is_empty()).then_some(errors),
            from_cache,
        });
    }

    pub fn compilation_waiting(&self, filename: impl Into<String>) {
        self.compilation(filename, EventStatus::Waiting, String::new(), false);
    }

    pub fn compilation_running(&self, filename: impl Into<String>) {
        self.compilation(filename, EventStatus::Running, String::new(), false);
    }

    pub fn compilation_done(&self, filename: impl Into<String>, errors: impl Into<String>, from_cache: bool) {
        self.compilation(filename, EventStatus::Done, errors.into(), from_cache);
    }

    pub fn compilation_failure(&self, filename: impl Into<String>, errors: impl Into<String>, from_cache: bool) {
        self.compilation(filename, EventStatus::Failure, errors.into(), from_cache);
    }

    fn generation(&self, testcase: i64, status: EventStatus, error: String, from_cache: bool) {
        self.enqueue(Event::Generation {
            testcase,
            status,
            error: (!error.is_empty()).then_some(error),
            from_cache,
        });
    }

    pub fn generation_waiting(&self, testcase: i64) {
        self.generation(testcase, EventStatus::Waiting, String::new(), false);
    }

    pub fn generating(&self, testcase: i64) {
        self.generation(testcase, EventStatus::Generating, String::new(), false);
    }

    pub fn generated(&self, testcase: i64, from_cache: bool) {
        self.generation(testcase, EventStatus::Generated, String::new(), from_cache);
    }

    pub fn validating(&self, testcase: i64) {
        self.generation(testcase, EventStatus::Validating, String::new(), false);
    }

    pub fn validated(&self, testcase: i64, from_cache: bool) {
        self.generation(testcase, EventStatus::Validated, String::new(), from_cache);
    }

    pub fn solving(&self, testcase: i64) {
        self.generation(testcase, EventStatus::Solving, String::new(), false);
    }

    pub fn generation_done(&self, testcase: i64, from_cache: bool) {
        self.generation(testcase, EventStatus::Done, String::new(), from_cache);
    }

    pub fn generation_failure(&self, testcase: i64, errors: impl Into<String>, from_cache: bool) {
        self.generation(testcase, EventStatus::Failure, errors.into(), from_cache);
    }

    fn terry_generation(&self, solution: impl Into<String>, status: EventStatus, error: String, from_cache: bool) {
        self.enqueue(Event::TerryGeneration {
            solution: solution.into(),
            status,
            error: (!error.is_empty()).then_some(error),
            from_cache,
        });
    }

    pub fn terry_generation_waiting(&self, solution: impl Into<String>) {
        self.terry_generation(solution, EventStatus::Waiting, String::new(), false);
    }

    pub fn terry_generating(&self, solution: impl Into<String>) {
        self.terry_generation(solution, EventStatus::Generating, String::new(), false);
    }

    pub fn terry_generated(&self, solution: impl Into<String>, from_cache: bool) {
        self.terry_generation(solution, EventStatus::Generated, String::new(), from_cache);
    }

    pub fn terry_validating(&self, solution: impl Into<String>) {
        self.terry_generation(solution, EventStatus::Validating, String::new(), false);
    }

    pub fn terry_validated(&self, solution: impl Into<String>, from_cache: bool) {
        self.terry_generation(solution, EventStatus::Validated, String::new(), from_cache);
    }

    pub fn terry_generation_failure(&self, solution: impl Into<String>, errors: impl Into<String>, from_cache: bool) {
        self.terry_generation(solution, EventStatus::Failure, errors.into(), from_cache);
    }

    fn evaluation(
        &self,
        solution: impl Into<String>,
        testcase: i64,
        status: EventStatus,
        result: Option<EvaluationResult>,
        from_cache: bool,
    ) {
        self.enqueue(Event::Evaluation {
            solution: solution.into(),
            testcase,
            status,
            result,
            from_cache,
        });
    }

    pub fn evaluation_waiting(&self, solution: impl Into<String>, testcase: i64) {
        self.evaluation(solution, testcase, EventStatus::Waiting, None, false);
    }

    pub fn executing(&self, solution: impl Into<String>, testcase: i64) {
        self.evaluation(solution, testcase, EventStatus::Executing, None, false);
    }

    pub fn executed(&self, solution: impl Into<String>, testcase: i64, from_cache: bool) {
        self.evaluation(solution, testcase, EventStatus::Executed, None, from_cache);
    }

    pub fn checking(&self, solution: impl Into<String>, testcase: i64) {
        self.evaluation(solution, testcase, EventStatus::Checking, None, false);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn evaluation_done(
        &self,
        solution: impl Into<String>,
        testcase: i64,
        score: f64,
        message: impl Into<String>,
        cpu_time: f64,
        wall_time: f64,
        memory_kb: u64,
        from_cache: bool,
    ) {
        let result = EvaluationResult {
            score,
            message: message.into(),
            cpu_time_used: cpu_time,
            wall_time_used: wall_time,
            memory_used_kb: memory_kb,
        };
        self.evaluation(solution, testcase, EventStatus::Done, Some(result), from_cache);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn evaluation_failure(
        &self,
        solution: impl Into<String>,
        testcase: i64,
        message: impl Into<String>,
        cpu_time: f64,
        wall_time: f64,
        memory_kb: u64,
        from_cache: bool,
    ) {
        let result = EvaluationResult {
            score: 0.0,
            message: message.into(),
            cpu_time_used: cpu_time,
            wall_time_used: wall_time,
            memory_used_kb: memory_kb,
        };
        self.evaluation(solution, testcase, EventStatus::Failure, Some(result), from_cache);
    }

    fn terry_evaluation(&self, solution: impl Into<String>, status: EventStatus, errors: String, from_cache: bool) {
        self.enqueue(Event::TerryEvaluation {
            solution: solution.into(),
            status,
            errors: (!errors.is_empty()).then_some(errors),
            from_cache,
        });
    }

    pub fn terry_evaluating(&self, solution: impl Into<String>) {
        self.terry_evaluation(solution, EventStatus::Executing, String::new(), false);
    }

    pub fn terry_evaluated(&self, solution: impl Into<String>, from_cache: bool) {
        self.terry_evaluation(solution, EventStatus::Executed, String::new(), from_cache);
    }

    pub fn terry_evaluation_failure(&self, solution: impl Into<String>, errors: impl Into<String>, from_cache: bool) {
        self.terry_evaluation(solution, EventStatus::Failure, errors.into(), from_cache);
    }

    fn terry_check(
        &self,
        solution: impl Into<String>,
        status: EventStatus,
        errors: String,
        result: Option<TerryCheckResult>,
        from_cache: bool,
    ) {
        self.enqueue(Event::TerryCheck {
            solution: solution.into(),
            status,
            errors: (!errors.is_empty()).then_some(errors),
            result,
            from_cache,
        });
    }

    pub fn terry_checking(&self, solution: impl Into<String>) {
        self.terry_check(solution, EventStatus::Checking, String::new(), None, false);
    }

    pub fn terry_checked(&self, solution: impl Into<String>, result: TerryCheckResult, from_cache: bool) {
        self.terry_check(solution, EventStatus::Done, String::new(), Some(result), from_cache);
    }

    pub fn terry_check_failure(&self, solution: impl Into<String>, errors: impl Into<String>, from_cache: bool) {
        self.terry_check(solution, EventStatus::Failure, errors.into(), None, from_cache);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = EventQueue::new();
        for testcase in 0..100 {
            queue.generation_waiting(testcase);
        }
        for expected in 0..100 {
            match queue.dequeue().await.unwrap() {
                Event::Generation { testcase, .. } => assert_eq!(testcase, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn stop_drains_then_ends() {
        let queue = EventQueue::new();
        queue.compilation_running("sol.cpp");
        queue.compilation_done("sol.cpp", "", true);
        queue.stop();

        assert!(queue.is_stopped());
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn stop_wakes_a_blocked_consumer() {
        let queue = EventQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        queue.stop();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn helpers_shape_their_events() {
        let queue = EventQueue::new();
        queue.compilation_failure("bad.cpp", "syntax error", false);
        queue.evaluation_done("sol", 3, 1.0, "Output is correct", 0.1, 0.2, 1024, false);
        queue.terry_checked("alice", TerryCheckResult { score: 0.5, message: "half".into() }, true);
        queue.fatal_error("boom");

        assert_eq!(
            queue.dequeue().await.unwrap(),
            Event::Compilation {
                filename: "bad.cpp".into(),
                status: EventStatus::Failure,
                stderr: Some("syntax error".into()),
                from_cache: false,
            }
        );
        match queue.dequeue().await.unwrap() {
            Event::Evaluation { status, result, .. } => {
                assert_eq!(status, EventStatus::Done);
                assert_eq!(result.unwrap().score, 1.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match queue.dequeue().await.unwrap() {
            Event::TerryCheck { from_cache, result, .. } => {
                assert!(from_cache);
                assert_eq!(result.unwrap().score, 0.5);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            queue.dequeue().await.unwrap(),
            Event::FatalError { msg: "boom".into() }
        );
    }

    #[tokio::test]
    async fn bound_writer_streams_json_lines() {
        let queue = EventQueue::new();
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);

        let writer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.bind_writer(&mut tx, None).await })
        };

        queue.generation_waiting(7);
        queue.task_score("sol", 100.0);
        queue.stop();
        writer.await.unwrap().unwrap();

        let mut lines = tokio::io::BufReader::new(rx).lines();
        let first: Event = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            first,
            Event::Generation {
                testcase: 7,
                status: EventStatus::Waiting,
                error: None,
                from_cache: false,
            }
        );
        let second: Event = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second, Event::TaskScore { solution: "sol".into(), score: 100.0 });
        assert!(lines.next_line().await.unwrap().is_none());
    }
}

//! Signal-coalescing background worker
//!
//! An `Agent` drains one repository's event log through an `AgentTask`.
//! Signals only mark the agent dirty; at most one worker task runs per agent
//! and it keeps draining until no signal arrived during its last pass.

use async_trait::async_trait;
use futures::FutureExt;
use revstore_core::{Event, StoreError};
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Result of applying one event to a target
#[derive(Debug)]
pub enum Outcome {
    /// Fully applied; move on to the next event
    Applied,
    /// Target temporarily unable to apply the event; retry it on the next signal
    Retryable(String),
    /// Retrying cannot help; the agent faults until restarted
    Fatal(anyhow::Error),
}

impl From<StoreError> for Outcome {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            Outcome::Retryable(err.to_string())
        } else {
            Outcome::Fatal(err.into())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// What an agent does with the events it drains
#[async_trait]
pub trait AgentTask: Send + Sync {
    /// Events with `seq > after`, oldest first, at most `limit`
    async fn history(&self, after: u64, limit: usize) -> revstore_core::Result<Vec<Event>>;

    /// Apply one event. Must be idempotent, events are redelivered after failures.
    async fn process(&self, event: &Event) -> Outcome;
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Events fetched per history page
    pub batch_size: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Created, never started
    Idle,
    Started,
    Stopped,
    /// Stopped by a fatal outcome; `start()` retries the failed event
    Faulted,
}

/// Point-in-time view of an agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub state: AgentState,
    pub running: bool,
    pub cursor: u64,
    pub pending: usize,
    pub processed: u64,
    pub last_failure: Option<String>,
}

struct Control {
    state: AgentState,
    signaled: bool,
    running: bool,
    /// Workers spawned so far
    spawns: u64,
    cursor: u64,
    pending: usize,
    processed: u64,
    last_failure: Option<String>,
}

/// Only the active worker touches this
#[derive(Default)]
struct Backlog {
    cursor: u64,
    pending: VecDeque<Event>,
}

enum Step {
    Applied,
    Drained,
    Blocked,
}

pub struct Agent {
    name: String,
    task: Arc<dyn AgentTask>,
    options: AgentOptions,
    runtime: Handle,
    control: Mutex<Control>,
    backlog: tokio::sync::Mutex<Backlog>,
    idle: watch::Sender<bool>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        task: Arc<dyn AgentTask>,
        options: AgentOptions,
        runtime: Handle,
    ) -> Arc<Self> {
        let (idle, _) = watch::channel(true);
        Arc::new(Self {
            name: name.into(),
            task,
            options,
            runtime,
            control: Mutex::new(Control {
                state: AgentState::Idle,
                signaled: false,
                running: false,
                spawns: 0,
                cursor: 0,
                pending: 0,
                processed: 0,
                last_failure: None,
            }),
            backlog: tokio::sync::Mutex::new(Backlog::default()),
            idle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start (or restart after a fault) and look for new events
    pub fn start(self: &Arc<Self>) {
        {
            let mut control = self.control();
            if control.state == AgentState::Faulted {
                info!("[{}] restarting after fault", self.name);
            }
            control.state = AgentState::Started;
        }
        self.signal();
    }

    /// Stop picking up events; an in-flight event is finished first
    pub fn stop(&self) {
        let mut control = self.control();
        if control.state == AgentState::Started {
            control.state = AgentState::Stopped;
            debug!("[{}] stopped", self.name);
        }
    }

    /// New events may be available. Spawns a worker unless one is running.
    pub fn signal(self: &Arc<Self>) {
        let mut control = self.control();
        if control.state != AgentState::Started {
            return;
        }
        control.signaled = true;
        if !control.running {
            control.running = true;
            control.spawns += 1;
            self.idle.send_replace(false);
            let agent = Arc::clone(self);
            self.runtime.spawn(async move {
                let worker = AssertUnwindSafe(Arc::clone(&agent).work());
                if let Err(panic) = worker.catch_unwind().await {
                    agent.fault(format!("worker panicked: {}", panic_message(&*panic)));
                    agent.retire(&mut agent.control());
                }
            });
        }
    }

    pub fn state(&self) -> AgentState {
        self.control().state
    }

    pub fn is_idle(&self) -> bool {
        !self.control().running
    }

    /// Idle flag and number of workers spawned, read together
    pub(crate) fn activity(&self) -> (bool, u64) {
        let control = self.control();
        (!control.running, control.spawns)
    }

    pub fn status(&self) -> AgentStatus {
        let control = self.control();
        AgentStatus {
            name: self.name.clone(),
            state: control.state,
            running: control.running,
            cursor: control.cursor,
            pending: control.pending,
            processed: control.processed,
            last_failure: control.last_failure.clone(),
        }
    }

    /// Resolves once no worker is running
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = idle.wait_for(|idle| *idle).await;
    }

    async fn work(self: Arc<Self>) {
        let mut backlog = self.backlog.lock().await;
        debug!("[{}] worker started at #{}", self.name, backlog.cursor);
        loop {
            {
                let mut control = self.control();
                if control.state != AgentState::Started {
                    self.retire(&mut control);
                    return;
                }
                control.signaled = false;
            }

            if let Step::Applied = self.step(&mut backlog).await {
                continue;
            }

            let done = {
                let mut control = self.control();
                if control.signaled && control.state == AgentState::Started {
                    false
                } else {
                    self.retire(&mut control);
                    true
                }
            };
            if done {
                return;
            }
        }
    }

    fn retire(&self, control: &mut Control) {
        control.running = false;
        self.idle.send_replace(true);
        debug!("[{}] worker idle at #{}", self.name, control.cursor);
    }

    async fn step(&self, backlog: &mut Backlog) -> Step {
        if backlog.pending.is_empty() {
            match self.task.history(backlog.cursor, self.options.batch_size).await {
                Ok(events) => {
                    if let Some(last) = events.last() {
                        backlog.cursor = last.seq;
                    }
                    backlog.pending.extend(events);
                    self.publish(backlog);
                }
                Err(e) => {
                    warn!("[{}] cannot read history: {}", self.name, e);
                    self.control().last_failure = Some(e.to_string());
                    return Step::Blocked;
                }
            }
        }

        if self.state() != AgentState::Started {
            return Step::Blocked;
        }
        let Some(event) = backlog.pending.pop_front() else {
            return Step::Drained;
        };

        debug!("[{}] processing {}", self.name, event);
        let outcome = match AssertUnwindSafe(self.task.process(&event)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Outcome::Fatal(anyhow::anyhow!("task panicked: {}", panic_message(&*panic))),
        };
        let step = match outcome {
            Outcome::Applied => {
                self.control().processed += 1;
                Step::Applied
            }
            Outcome::Retryable(reason) => {
                warn!("[{}] will retry #{}: {}", self.name, event.seq, reason);
                self.control().last_failure = Some(reason);
                backlog.pending.push_front(event);
                Step::Blocked
            }
            Outcome::Fatal(err) => {
                error!("[{}] failed on #{}, agent faulted: {:#}", self.name, event.seq, err);
                self.fault(format!("{:#}", err));
                backlog.pending.push_front(event);
                Step::Blocked
            }
        };
        self.publish(backlog);
        step
    }

    fn fault(&self, reason: String) {
        let mut control = self.control();
        control.state = AgentState::Faulted;
        control.last_failure = Some(reason);
    }

    fn publish(&self, backlog: &Backlog) {
        let mut control = self.control();
        control.cursor = backlog.cursor;
        control.pending = backlog.pending.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revstore_core::{Hash, Operation};
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Script {
        Retry,
        Fail,
        Panic,
    }

    #[derive(Default)]
    struct ScriptedTask {
        log: Mutex<Vec<Event>>,
        script: Mutex<HashMap<u64, VecDeque<Script>>>,
        seen: Mutex<Vec<u64>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedTask {
        fn append(&self, count: usize) {
            let mut log = self.log.lock().unwrap();
            for _ in 0..count {
                let seq = log.len() as u64 + 1;
                let content = Hash::from_data(&seq.to_be_bytes());
                log.push(Event::new(seq, content, BTreeSet::new(), Operation::Create));
            }
        }

        fn script(&self, seq: u64, step: Script) {
            self.script.lock().unwrap().entry(seq).or_default().push_back(step);
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentTask for ScriptedTask {
        async fn history(&self, after: u64, limit: usize) -> revstore_core::Result<Vec<Event>> {
            let log = self.log.lock().unwrap();
            Ok(log.iter().filter(|e| e.seq > after).take(limit).cloned().collect())
        }

        async fn process(&self, event: &Event) -> Outcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(event.seq);
            let step = self.script.lock().unwrap().get_mut(&event.seq).and_then(VecDeque::pop_front);
            self.active.fetch_sub(1, Ordering::SeqCst);
            match step {
                None => Outcome::Applied,
                Some(Script::Retry) => Outcome::Retryable("busy".into()),
                Some(Script::Fail) => Outcome::Fatal(anyhow::anyhow!("broken")),
                Some(Script::Panic) => panic!("boom on #{}", event.seq),
            }
        }
    }

    fn agent(task: &Arc<ScriptedTask>, batch_size: usize) -> Arc<Agent> {
        Agent::new("test", task.clone(), AgentOptions { batch_size }, Handle::current())
    }

    #[tokio::test]
    async fn test_drains_in_order_across_batches() {
        let task = Arc::new(ScriptedTask::default());
        task.append(7);
        let agent = agent(&task, 3);
        agent.start();
        agent.wait_idle().await;

        assert_eq!(task.seen(), (1..=7).collect::<Vec<_>>());
        let status = agent.status();
        assert_eq!(status.cursor, 7);
        assert_eq!(status.processed, 7);
        assert_eq!(status.pending, 0);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_signal_before_start_is_ignored() {
        let task = Arc::new(ScriptedTask::default());
        task.append(2);
        let agent = agent(&task, 100);
        agent.signal();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(task.seen().is_empty());
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_worker_under_concurrent_signals() {
        let task = Arc::new(ScriptedTask {
            delay: Some(Duration::from_millis(2)),
            ..Default::default()
        });
        let agent = agent(&task, 100);
        agent.start();

        let mut handles = vec![];
        for _ in 0..16 {
            let agent = agent.clone();
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    task.append(1);
                    agent.signal();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        agent.wait_idle().await;

        assert_eq!(task.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(task.seen(), (1..=80).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_retry_redelivers_same_event() {
        let task = Arc::new(ScriptedTask::default());
        task.append(3);
        task.script(2, Script::Retry);
        let agent = agent(&task, 100);
        agent.start();
        agent.wait_idle().await;

        assert_eq!(task.seen(), vec![1, 2]);
        let status = agent.status();
        assert_eq!(status.pending, 2);
        assert_eq!(status.last_failure.as_deref(), Some("busy"));

        agent.signal();
        agent.wait_idle().await;
        assert_eq!(task.seen(), vec![1, 2, 2, 3]);
        assert_eq!(agent.status().processed, 3);
    }

    #[tokio::test]
    async fn test_stop_prevents_processing_until_start() {
        let task = Arc::new(ScriptedTask::default());
        task.append(1);
        let agent = agent(&task, 100);
        agent.start();
        agent.wait_idle().await;

        agent.stop();
        task.append(2);
        agent.signal();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.seen(), vec![1]);
        assert_eq!(agent.state(), AgentState::Stopped);

        agent.start();
        agent.wait_idle().await;
        assert_eq!(task.seen(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fatal_faults_until_restart() {
        let task = Arc::new(ScriptedTask::default());
        task.append(3);
        task.script(2, Script::Fail);
        let agent = agent(&task, 100);
        agent.start();
        agent.wait_idle().await;

        assert_eq!(agent.state(), AgentState::Faulted);
        assert_eq!(agent.status().last_failure.as_deref(), Some("broken"));

        agent.signal();
        agent.wait_idle().await;
        assert_eq!(task.seen(), vec![1, 2]);

        agent.start();
        agent.wait_idle().await;
        assert_eq!(agent.state(), AgentState::Started);
        assert_eq!(task.seen(), vec![1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn test_panicking_task_faults_instead_of_wedging() {
        let task = Arc::new(ScriptedTask::default());
        task.append(3);
        task.script(2, Script::Panic);
        let agent = agent(&task, 100);
        agent.start();
        agent.wait_idle().await;

        let status = agent.status();
        assert_eq!(status.state, AgentState::Faulted);
        assert!(!status.running);
        assert_eq!(status.pending, 2);
        assert!(status.last_failure.unwrap().contains("boom on #2"));

        agent.start();
        agent.wait_idle().await;
        assert_eq!(agent.state(), AgentState::Started);
        assert_eq!(task.seen(), vec![1, 2, 2, 3]);
        assert_eq!(agent.status().processed, 3);
    }

    #[test]
    fn test_outcome_from_store_error() {
        let transient = Outcome::from(StoreError::UnknownContent(Hash::from_data(b"x")));
        assert!(matches!(transient, Outcome::Retryable(_)));
        let fatal = Outcome::from(StoreError::Integrity {
            expected: Hash::from_data(b"a"),
            actual: Hash::from_data(b"b"),
        });
        assert!(matches!(fatal, Outcome::Fatal(_)));
    }
}

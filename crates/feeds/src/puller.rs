//! REST poll scheduler.
//!
//! One task per currency pair. Each task waits a random start offset so that
//! a restored session does not hit the REST API all at once, then fetches
//! the pair every `interval` and fans the record out to every output.

use crate::session::{parse_task_session_name, task_session_name};
use crate::{FeedError, RestClient, SessionRepo};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ticker_core::{pair_key, TickerData};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Poll scheduler settings.
#[derive(Debug, Clone)]
pub struct PullerConfig {
    /// Used when a task is added with a zero interval.
    pub default_interval_secs: u64,
    /// Upper bound (exclusive) of the random delay before the first tick.
    pub start_jitter_secs: u64,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: 60,
            start_jitter_secs: 30,
        }
    }
}

/// A running poll task for one pair.
#[derive(Debug)]
pub struct Task {
    from: String,
    to: String,
    interval_ms: AtomicU64,
    running: AtomicBool,
    changed: Notify,
    cancel: CancellationToken,
}

impl Task {
    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn key(&self) -> String {
        pair_key(&self.from, &self.to)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_interval(&self, interval: Duration) {
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Release);
        self.changed.notify_one();
    }
}

struct TaskEntry {
    task: Arc<Task>,
    join: JoinHandle<()>,
}

/// Schedules and tracks REST poll tasks.
pub struct Puller {
    rest: Arc<dyn RestClient>,
    outputs: Vec<mpsc::Sender<TickerData>>,
    session: Option<Arc<dyn SessionRepo>>,
    config: PullerConfig,
    tasks: RwLock<HashMap<String, TaskEntry>>,
    shutdown: CancellationToken,
}

impl Puller {
    pub fn new(
        rest: Arc<dyn RestClient>,
        outputs: Vec<mpsc::Sender<TickerData>>,
        session: Option<Arc<dyn SessionRepo>>,
        config: PullerConfig,
    ) -> Self {
        Self {
            rest,
            outputs,
            session,
            config,
            tasks: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn effective_interval(&self, interval: Duration) -> Duration {
        if interval.is_zero() {
            Duration::from_secs(self.config.default_interval_secs)
        } else {
            interval
        }
    }

    /// Session entries hold whole seconds, so partial seconds round up and a
    /// sub-second interval never reads back as zero.
    fn session_secs(interval: Duration) -> u64 {
        interval.as_secs() + u64::from(interval.subsec_nanos() > 0)
    }

    /// Start polling a pair. A zero interval means the default one.
    ///
    /// If the pair is already polled, its interval is updated instead and the
    /// existing task is returned.
    pub async fn add_task(&self, from: &str, to: &str, interval: Duration) -> Arc<Task> {
        let interval = self.effective_interval(interval);
        let key = pair_key(from, to);

        let task = {
            let mut tasks = self.tasks.write().await;
            if let Some(entry) = tasks.get(&key) {
                let task = entry.task.clone();
                drop(tasks);
                self.update_task(&task, interval).await;
                return task;
            }

            let task = Arc::new(Task {
                from: from.to_uppercase(),
                to: to.to_uppercase(),
                interval_ms: AtomicU64::new(interval.as_millis() as u64),
                running: AtomicBool::new(true),
                changed: Notify::new(),
                cancel: self.shutdown.child_token(),
            });
            let jitter = Duration::from_secs(self.config.start_jitter_secs);
            let join = tokio::spawn(run_task(
                task.clone(),
                self.rest.clone(),
                self.outputs.clone(),
                jitter,
            ));
            tasks.insert(
                key.clone(),
                TaskEntry {
                    task: task.clone(),
                    join,
                },
            );
            task
        };

        info!("Poll task {} started (every {:?})", key, interval);
        if let Some(session) = &self.session {
            if let Err(e) = session
                .add_task(&task_session_name(from, to), Self::session_secs(interval))
                .await
            {
                warn!("Failed to record session for {}: {}", key, e);
            }
        }
        task
    }

    /// Swap a task's interval in place. The next tick uses the new value.
    pub async fn update_task(&self, task: &Task, interval: Duration) {
        let interval = self.effective_interval(interval);
        task.set_interval(interval);
        debug!("Poll task {} interval set to {:?}", task.key(), interval);

        if let Some(session) = &self.session {
            if let Err(e) = session
                .update_task(&task_session_name(&task.from, &task.to), Self::session_secs(interval))
                .await
            {
                warn!("Failed to update session for {}: {}", task.key(), e);
            }
        }
    }

    /// Stop and forget a task. Returns `false` if the pair was not polled.
    pub async fn remove_task(&self, from: &str, to: &str) -> bool {
        let key = pair_key(from, to);
        let Some(entry) = self.tasks.write().await.remove(&key) else {
            return false;
        };

        entry.task.cancel.cancel();
        if let Err(e) = entry.join.await {
            warn!("Poll task {} ended abnormally: {}", key, e);
        }
        info!("Poll task {} removed", key);

        if let Some(session) = &self.session {
            if let Err(e) = session.remove_task(&task_session_name(from, to)).await {
                warn!("Failed to remove session for {}: {}", key, e);
            }
        }
        true
    }

    /// Snapshot of pair key -> task.
    pub async fn list_tasks(&self) -> HashMap<String, Arc<Task>> {
        self.tasks
            .read()
            .await
            .iter()
            .map(|(key, entry)| (key.clone(), entry.task.clone()))
            .collect()
    }

    /// Re-add every `FROM:TO` entry stored in the session repository.
    pub async fn restore_last_session(&self) -> Result<usize, FeedError> {
        let Some(session) = &self.session else {
            return Ok(0);
        };
        let entries = session
            .get_session()
            .await
            .map_err(|e| FeedError::SubscriptionFailed(e.to_string()))?;

        let mut restored = 0;
        for (name, interval_secs) in entries {
            if let Some((from, to)) = parse_task_session_name(&name) {
                self.add_task(&from, &to, Duration::from_secs(interval_secs))
                    .await;
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Stop every task and wait for them to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let entries: Vec<TaskEntry> = self.tasks.write().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            let _ = entry.join.await;
        }
    }
}

async fn run_task(
    task: Arc<Task>,
    rest: Arc<dyn RestClient>,
    outputs: Vec<mpsc::Sender<TickerData>>,
    jitter: Duration,
) {
    let key = task.key();

    let start_delay = if jitter.is_zero() {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..jitter.as_millis() as u64))
    };
    debug!("Poll task {} first tick in {:?}", key, start_delay);

    tokio::select! {
        biased;
        _ = task.cancel.cancelled() => {
            task.running.store(false, Ordering::Release);
            return;
        }
        _ = tokio::time::sleep(start_delay) => {}
    }

    'ticks: loop {
        let fetched = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => break 'ticks,
            res = rest.get(&task.from, &task.to) => res,
        };

        match fetched {
            Ok(data) => {
                for output in &outputs {
                    tokio::select! {
                        biased;
                        _ = task.cancel.cancelled() => break 'ticks,
                        sent = output.send(data.clone()) => {
                            if sent.is_err() {
                                warn!("Poll task {}: output channel closed", key);
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("Poll task {}: fetch failed: {}", key, e),
        }

        let last_tick = Instant::now();
        loop {
            let deadline = last_tick + task.interval();
            tokio::select! {
                biased;
                _ = task.cancel.cancelled() => break 'ticks,
                _ = task.changed.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
    }

    task.running.store(false, Ordering::Release);
    debug!("Poll task {} stopped", key);
}

//! Delivery of task results and AP status changes to registered observers.
//!
//! Producers never block: events go through bounded queues and two drain
//! tasks invoke the observers. Task results are delivered in batches, AP
//! status changes one at a time.

use crate::model::{ApStatusEvent, TaskResult, TaskResultBatch};
use crate::throttle::{ErrorThrottle, LOOP_ERROR_EVERY};
use chrono::Utc;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type TaskResultObserver = Arc<dyn Fn(TaskResultBatch) + Send + Sync>;
pub type ApStatusObserver = Arc<dyn Fn(ApStatusEvent) + Send + Sync>;

const RESULT_DRAIN: &str = "task_result_drain";
const STATUS_DRAIN: &str = "ap_status_drain";

struct Receivers {
    results: mpsc::Receiver<TaskResult>,
    status: mpsc::Receiver<ApStatusEvent>,
}

pub struct EventFanout {
    results_tx: mpsc::Sender<TaskResult>,
    status_tx: mpsc::Sender<ApStatusEvent>,
    receivers: Mutex<Option<Receivers>>,
    result_observers: RwLock<Vec<TaskResultObserver>>,
    status_observers: RwLock<Vec<ApStatusObserver>>,
}

impl EventFanout {
    pub fn new(capacity: usize) -> Self {
        let (results_tx, results) = mpsc::channel(capacity.max(1));
        let (status_tx, status) = mpsc::channel(capacity.max(1));
        Self {
            results_tx,
            status_tx,
            receivers: Mutex::new(Some(Receivers { results, status })),
            result_observers: RwLock::new(Vec::new()),
            status_observers: RwLock::new(Vec::new()),
        }
    }

    pub fn on_task_results(&self, observer: TaskResultObserver) {
        self.result_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn on_ap_status(&self, observer: ApStatusObserver) {
        self.status_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn publish_result(&self, result: TaskResult) {
        if let Err(err) = self.results_tx.try_send(result) {
            warn!(event = "esl_event_queue_full", queue = "task_result", error = %err);
        }
    }

    pub fn publish_results<I>(&self, results: I)
    where
        I: IntoIterator<Item = TaskResult>,
    {
        for result in results {
            self.publish_result(result);
        }
    }

    pub fn publish_status(&self, event: ApStatusEvent) {
        if let Err(err) = self.status_tx.try_send(event) {
            warn!(event = "esl_event_queue_full", queue = "ap_status", error = %err);
        }
    }

    /// Starts both drains. The queues can only be drained once; later calls
    /// spawn nothing. Once `shutdown` flips, whatever is still queued is
    /// delivered before the drains return.
    pub(crate) fn spawn_drains(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let taken = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Receivers { results, status }) = taken else {
            return Vec::new();
        };
        vec![
            tokio::spawn(self.clone().drain_results(results, shutdown.clone())),
            tokio::spawn(self.drain_status(status, shutdown)),
        ]
    }

    async fn drain_results(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<TaskResult>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut throttle = ErrorThrottle::new(RESULT_DRAIN, LOOP_ERROR_EVERY);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                first = rx.recv() => {
                    let Some(first) = first else {
                        return;
                    };
                    let mut results = vec![first];
                    results.extend(take_queued(&mut rx));
                    self.deliver_results(
                        TaskResultBatch {
                            results,
                            created: Utc::now(),
                        },
                        &mut throttle,
                    );
                }
            }
        }
        let results = take_queued(&mut rx);
        if !results.is_empty() {
            debug!(event = "esl_event_queue_flush", queue = "task_result", pending = results.len());
            self.deliver_results(
                TaskResultBatch {
                    results,
                    created: Utc::now(),
                },
                &mut throttle,
            );
        }
    }

    async fn drain_status(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ApStatusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut throttle = ErrorThrottle::new(STATUS_DRAIN, LOOP_ERROR_EVERY);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        return;
                    };
                    self.deliver_status(event, &mut throttle);
                }
            }
        }
        for event in take_queued(&mut rx) {
            self.deliver_status(event, &mut throttle);
        }
    }

    fn deliver_results(&self, batch: TaskResultBatch, throttle: &mut ErrorThrottle) {
        let observers = self
            .result_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let batch = batch.clone();
            if catch_unwind(AssertUnwindSafe(|| observer(batch))).is_err() {
                throttle.record("task result observer panicked");
            }
        }
    }

    fn deliver_status(&self, event: ApStatusEvent, throttle: &mut ErrorThrottle) {
        let observers = self
            .status_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let event = event.clone();
            if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
                throttle.record("ap status observer panicked");
            }
        }
    }
}

fn take_queued<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut queued = Vec::new();
    while let Ok(next) = rx.try_recv() {
        queued.push(next);
    }
    queued
}

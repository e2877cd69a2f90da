//! Update workers: lease a task, run it through the update engine under a
//! per-attempt timeout, then complete or fail it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dispatch::{TaskDispatcher, TaskStatus};
use crate::error::{FactgraphError, Result};
use crate::graph::Extractor;
use crate::update::{ApplyReport, UpdateEngine};

/// Builds one extractor per worker. Called once when the worker starts.
pub type ExtractorLoader = Arc<dyn Fn() -> Result<Box<dyn Extractor>> + Send + Sync>;

/// Result of one [`Worker::process_next`] call.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Nothing visible in the queue.
    Idle,
    Completed { task_id: String, report: ApplyReport },
    /// The attempt failed and the task will be redelivered after backoff.
    Retrying { task_id: String, error: FactgraphError },
    /// The task is terminally failed.
    Failed { task_id: String, error: FactgraphError },
    /// The lease expired mid-attempt and another worker owns the task now;
    /// this attempt's result was discarded.
    LeaseLost { task_id: String },
}

pub struct Worker {
    id: String,
    dispatcher: TaskDispatcher,
    engine: Arc<UpdateEngine>,
    extractor: Box<dyn Extractor>,
    attempt_timeout: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        dispatcher: TaskDispatcher,
        engine: Arc<UpdateEngine>,
        loader: &ExtractorLoader,
        attempt_timeout: Duration,
    ) -> Result<Self> {
        let id = id.into();
        let extractor = loader()?;
        log::debug!("worker {} loaded its extractor", id);
        Ok(Self {
            id,
            dispatcher,
            engine,
            extractor,
            attempt_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lease and process at most one task.
    ///
    /// Errors are returned only when the queue itself cannot be reached; a
    /// failing task is reported through [`TaskOutcome`].
    pub async fn process_next(&self) -> Result<TaskOutcome> {
        let Some(task) = self.dispatcher.dequeue(&self.id).await? else {
            return Ok(TaskOutcome::Idle);
        };
        let task_id = task.task_id.clone();

        let attempt = tokio::time::timeout(
            self.attempt_timeout,
            self.engine.apply_task(&task, self.extractor.as_ref()),
        )
        .await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(FactgraphError::Timeout(format!(
                "task {} exceeded {:?}",
                task_id, self.attempt_timeout
            ))),
        };

        match result {
            Ok(report) => {
                if !self.dispatcher.complete(&task_id, &self.id).await? {
                    return Ok(TaskOutcome::LeaseLost { task_id });
                }
                log::info!(
                    "worker {} completed task {} (attempt {}): {} nodes, {} new edges, {} versioned",
                    self.id,
                    task_id,
                    task.attempt_count,
                    report.nodes_created,
                    report.edges_created,
                    report.edges_versioned
                );
                Ok(TaskOutcome::Completed { task_id, report })
            }
            Err(error) => match self.dispatcher.fail(&task_id, &self.id, &error).await? {
                None => Ok(TaskOutcome::LeaseLost { task_id }),
                Some(TaskStatus::Failed) => Ok(TaskOutcome::Failed { task_id, error }),
                Some(_) => Ok(TaskOutcome::Retrying { task_id, error }),
            },
        }
    }

    async fn run(self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        log::info!("worker {} started", self.id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.process_next().await {
                Ok(TaskOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    log::warn!("worker {} could not reach the task queue: {}", self.id, e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        log::info!("worker {} stopped", self.id);
    }
}

/// A fixed set of workers draining one dispatcher.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` workers. Fails without starting anything if any
    /// extractor fails to load.
    pub fn spawn(
        workers: usize,
        dispatcher: TaskDispatcher,
        engine: Arc<UpdateEngine>,
        loader: ExtractorLoader,
        attempt_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let mut ready = Vec::with_capacity(workers);
        for n in 0..workers {
            ready.push(Worker::new(
                format!("worker-{}", n),
                dispatcher.clone(),
                engine.clone(),
                &loader,
                attempt_timeout,
            )?);
        }

        let (shutdown, rx) = watch::channel(false);
        let handles = ready
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(poll_interval, rx.clone())))
            .collect();
        Ok(Self { shutdown, handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal shutdown and wait for every worker to finish its current task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::error!("worker task panicked: {}", e);
            }
        }
    }
}

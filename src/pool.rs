//! Pool job controller.
//!
//! A control-plane entity coupled to the bus: it subscribes to a pool
//! channel carrying `start_job`/`stop_job` directives, runs one pipeline
//! per job up to a configured capacity, and heartbeats liveness onto the
//! pool status channel every five seconds.
//!
//! Per-job lifecycle:
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Terminated
//! ```
//!
//! Transitions are driven only by bus directives and terminal pipeline
//! events; a running pipeline that errors is removed automatically.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::bot::PipelineHandle;
use crate::bus::{BusClient, SubscriptionCallbacks, SubscriptionHandle};
use crate::error::{Error, Result};
use crate::metrics::HEARTBEATS_PUBLISHED;

/// Interval between liveness heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// One externally dispatched unit of work: a logical stream processed by
/// one pipeline.
#[derive(Clone, Debug)]
pub struct Job {
    /// Unique job id.
    pub id: String,
    /// Full job descriptor as received on the pool channel.
    pub descriptor: Value,
}

impl Job {
    /// Parse the `"job"` object of a pool directive.
    pub fn from_value(value: &Value) -> Result<Self> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ResponseParsing("job without id".into()))?;
        Ok(Self {
            id: id.to_owned(),
            descriptor: value.clone(),
        })
    }
}

/// Job lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Known but not yet started.
    Idle,
    /// Pipeline under construction.
    Starting,
    /// Pipeline running.
    Running,
    /// Stop directive received, tearing down.
    Stopping,
    /// Pipeline gone.
    Terminated,
}

/// Builds and starts the pipeline for one job.
///
/// `on_terminal` must be wired into the pipeline (for instance through a
/// `do_finally`) so the controller learns when a job ends on its own.
pub trait JobRunner {
    /// Start a pipeline for `job`.
    fn start_job(&self, job: &Job, on_terminal: Box<dyn FnOnce()>) -> Result<PipelineHandle>;
}

impl<F> JobRunner for F
where
    F: Fn(&Job, Box<dyn FnOnce()>) -> Result<PipelineHandle>,
{
    fn start_job(&self, job: &Job, on_terminal: Box<dyn FnOnce()>) -> Result<PipelineHandle> {
        self(job, on_terminal)
    }
}

struct RunningJob {
    descriptor: Value,
    /// Absent while the job is Starting.
    handle: Option<PipelineHandle>,
    state: JobState,
}

struct PoolShared {
    bus: Rc<dyn BusClient>,
    pool_channel: String,
    status_channel: String,
    job_type: String,
    max_capacity: usize,
    runner: Box<dyn JobRunner>,
    running: RefCell<HashMap<String, RunningJob>>,
    subscription: SubscriptionHandle,
    heartbeat: RefCell<Option<tokio::task::JoinHandle<()>>>,
    on_fatal: Box<dyn Fn(Error)>,
}

impl PoolShared {
    fn publish_heartbeat(&self) -> Result<()> {
        let running = self.running.borrow();
        let jobs: Vec<Value> = running.values().map(|job| job.descriptor.clone()).collect();
        let body = json!({
            "job_type": self.job_type,
            "jobs": jobs,
            "capacity": {"used": running.len(), "max": self.max_capacity},
        });
        drop(running);

        self.bus.publish(&self.status_channel, &body)?;
        metrics::counter!(HEARTBEATS_PUBLISHED).increment(1);
        Ok(())
    }

    fn start_job(self: &Rc<Self>, directive: &Value) {
        let job = match directive.get("job").map(Job::from_value) {
            Some(Ok(job)) => job,
            Some(Err(error)) => {
                warn!(%error, "malformed job in start directive");
                return;
            }
            None => {
                warn!("start directive without job");
                return;
            }
        };

        let mut running = self.running.borrow_mut();
        if running.len() >= self.max_capacity {
            warn!(
                job = %job.id,
                capacity = self.max_capacity,
                "pool at capacity, ignoring start_job"
            );
            return;
        }
        if running.contains_key(&job.id) {
            warn!(job = %job.id, "job already running, ignoring start_job");
            return;
        }
        running.insert(
            job.id.clone(),
            RunningJob {
                descriptor: job.descriptor.clone(),
                handle: None,
                state: JobState::Starting,
            },
        );
        drop(running);

        let weak = Rc::downgrade(self);
        let terminal_id = job.id.clone();
        let on_terminal = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.job_terminated(&terminal_id);
            }
        });

        match self.runner.start_job(&job, on_terminal) {
            Ok(handle) => {
                info!(job = %job.id, "job started");
                let mut running = self.running.borrow_mut();
                if let Some(entry) = running.get_mut(&job.id) {
                    entry.handle = Some(handle);
                    entry.state = JobState::Running;
                }
            }
            Err(error) => {
                error!(job = %job.id, %error, "failed to start job");
                self.running.borrow_mut().remove(&job.id);
            }
        }
    }

    fn stop_job(&self, directive: &Value) {
        let id = directive
            .get("job")
            .and_then(|job| job.get("id"))
            .and_then(Value::as_str);
        let Some(id) = id else {
            warn!("stop directive without job id");
            return;
        };

        let handle = {
            let mut running = self.running.borrow_mut();
            match running.get_mut(id) {
                Some(entry) => {
                    entry.state = JobState::Stopping;
                    entry.handle.take()
                }
                None => {
                    warn!(job = %id, "stop_job for unknown job");
                    return;
                }
            }
        };
        if let Some(handle) = handle {
            // Idempotently tears the whole chain down; the terminal hook
            // removes the entry.
            handle.cancel();
        }
        self.running.borrow_mut().remove(id);
        info!(job = %id, "job stopped");
    }

    fn job_terminated(&self, id: &str) {
        if self.running.borrow_mut().remove(id).is_some() {
            info!(job = %id, "job terminated");
        }
    }
}

struct PoolCallbacks {
    shared: Weak<PoolShared>,
}

impl SubscriptionCallbacks for PoolCallbacks {
    fn on_data(&self, _sub: SubscriptionHandle, message: Value) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match message.get("action").and_then(Value::as_str) {
            Some("start_job") => shared.start_job(&message),
            Some("stop_job") => shared.stop_job(&message),
            Some(other) => debug!(action = other, "ignoring pool directive"),
            None => warn!(%message, "pool directive without action"),
        }
    }

    fn on_error(&self, error: Error) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        error!(%error, "pool channel subscription failed");
        (shared.on_fatal)(error);
    }
}

/// The pool job controller.
pub struct PoolJobController {
    shared: Rc<PoolShared>,
}

impl PoolJobController {
    /// Create a controller for `pool_channel`, reporting as `job_type`
    /// and running at most `max_capacity` simultaneous pipelines built by
    /// `runner`.
    ///
    /// `on_fatal` is invoked for unrecoverable bus failures on the pool
    /// channel; callers usually shut the process down from there.
    pub fn new(
        bus: Rc<dyn BusClient>,
        pool_channel: &str,
        job_type: &str,
        max_capacity: usize,
        runner: impl JobRunner + 'static,
        on_fatal: impl Fn(Error) + 'static,
    ) -> Self {
        Self {
            shared: Rc::new(PoolShared {
                bus,
                pool_channel: pool_channel.to_owned(),
                status_channel: format!("{pool_channel}/status"),
                job_type: job_type.to_owned(),
                max_capacity,
                runner: Box::new(runner),
                running: RefCell::new(HashMap::new()),
                subscription: SubscriptionHandle::next(),
                heartbeat: RefCell::new(None),
                on_fatal: Box::new(on_fatal),
            }),
        }
    }

    /// Subscribe to the pool channel and arm the heartbeat timer.
    ///
    /// Must run inside the reactor's `LocalSet`.
    pub fn start(&self) -> Result<()> {
        info!(
            pool = %self.shared.pool_channel,
            capacity = self.shared.max_capacity,
            "pool controller starting"
        );
        let callbacks = Rc::new(PoolCallbacks {
            shared: Rc::downgrade(&self.shared),
        });
        self.shared.bus.subscribe_channel(
            &self.shared.pool_channel,
            self.shared.subscription,
            callbacks,
            None,
        )?;

        let weak = Rc::downgrade(&self.shared);
        let task = tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            // The first tick completes immediately; heartbeats start one
            // interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if let Err(error) = shared.publish_heartbeat() {
                    error!(%error, "heartbeat failed, timer disarmed");
                    (shared.on_fatal)(error);
                    break;
                }
            }
        });
        *self.shared.heartbeat.borrow_mut() = Some(task);
        Ok(())
    }

    /// Number of jobs currently running.
    pub fn running_count(&self) -> usize {
        self.shared.running.borrow().len()
    }

    /// Ids of the jobs currently running.
    pub fn running_jobs(&self) -> Vec<String> {
        self.shared.running.borrow().keys().cloned().collect()
    }

    /// Lifecycle state of one job, if the controller still tracks it.
    pub fn job_state(&self, id: &str) -> Option<JobState> {
        self.shared.running.borrow().get(id).map(|job| job.state)
    }

    /// Cancel the heartbeat, drop the pool subscription and tear down
    /// every running pipeline.
    pub fn shutdown(&self) {
        info!(pool = %self.shared.pool_channel, "pool controller shutting down");
        if let Some(task) = self.shared.heartbeat.borrow_mut().take() {
            task.abort();
        }
        if let Err(error) = self.shared.bus.unsubscribe(self.shared.subscription) {
            warn!(%error, "pool channel unsubscribe failed");
        }
        let jobs: Vec<RunningJob> = {
            let mut running = self.shared.running.borrow_mut();
            running.drain().map(|(_, job)| job).collect()
        };
        for job in jobs {
            if let Some(handle) = job.handle {
                handle.cancel();
            }
        }
    }
}

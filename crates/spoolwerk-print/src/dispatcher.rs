// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Queue dispatcher.
//
// One background loop looks at every device with queued work and hands its
// oldest job to a delivery task.  A semaphore caps deliveries across all
// devices, and the in-flight set keeps a device's head job from being picked
// twice, which is what keeps each device strictly FIFO.
//
// A job leaves the queue exactly once, after its last attempt, whatever the
// outcome.  A printer that keeps failing must not hold every later job for
// that device hostage.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use spoolwerk_core::config::DispatcherConfig;
use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{Device, Job, JobId, QueueStats, ServerStatus};

use crate::discovery::Rediscovery;
use crate::normalize::normalize;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::spool::{Spool, placeholder_document, verify_hash};
use crate::store::{DeviceRepository, JobRepository, blocking};
use crate::transport::Deliverer;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct DispatchState {
    devices: Arc<dyn DeviceRepository>,
    jobs: Arc<dyn JobRepository>,
    spool: Spool,
    deliverer: Arc<dyn Deliverer>,
    rediscovery: Option<Arc<Rediscovery>>,
    policy: RetryPolicy,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<JobId>>,
    wake: Arc<Notify>,
    running: AtomicBool,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Background delivery loop over the job queue.
pub struct Dispatcher {
    state: Arc<DispatchState>,
    status: ServerStatus,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

/// Wiring for a [`Dispatcher`]. Optional parts are set here, before the
/// state is shared with the dispatch loop.
pub struct DispatcherBuilder {
    devices: Arc<dyn DeviceRepository>,
    jobs: Arc<dyn JobRepository>,
    spool: Spool,
    deliverer: Arc<dyn Deliverer>,
    config: DispatcherConfig,
    rediscovery: Option<Arc<Rediscovery>>,
    wake: Option<Arc<Notify>>,
}

impl DispatcherBuilder {
    /// Relocate devices whose address stopped answering.
    pub fn rediscovery(mut self, rediscovery: Arc<Rediscovery>) -> Self {
        self.rediscovery = Some(rediscovery);
        self
    }

    /// Share the ingestion wake-up so new jobs skip the poll delay.
    pub fn wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn build(self) -> Dispatcher {
        let state = DispatchState {
            devices: self.devices,
            jobs: self.jobs,
            spool: self.spool,
            deliverer: self.deliverer,
            rediscovery: self.rediscovery,
            policy: RetryPolicy::from_config(&self.config),
            permits: Arc::new(Semaphore::new(self.config.max_concurrent.max(1))),
            config: self.config,
            in_flight: Mutex::new(HashSet::new()),
            wake: self.wake.unwrap_or_default(),
            running: AtomicBool::new(false),
        };
        Dispatcher {
            state: Arc::new(state),
            status: ServerStatus::Stopped,
            shutdown: Arc::new(Notify::new()),
            task: None,
        }
    }
}

impl Dispatcher {
    pub fn builder(
        devices: Arc<dyn DeviceRepository>,
        jobs: Arc<dyn JobRepository>,
        spool: Spool,
        deliverer: Arc<dyn Deliverer>,
        config: DispatcherConfig,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            devices,
            jobs,
            spool,
            deliverer,
            config,
            rediscovery: None,
            wake: None,
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// Start the loop. Calling it twice is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.status == ServerStatus::Running {
            debug!("dispatcher already running");
            return Ok(());
        }
        self.status = ServerStatus::Starting;
        self.state.running.store(true, Ordering::SeqCst);

        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        self.task = Some(tokio::spawn(async move {
            Self::run(state, shutdown).await;
        }));

        self.status = ServerStatus::Running;
        info!(
            max_concurrent = self.state.config.max_concurrent,
            max_attempts = self.state.policy.max_attempts,
            "dispatcher started"
        );
        Ok(())
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Deliveries already under way run to completion in their own tasks.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }
        self.state.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        if let Some(handle) = self.task.take() {
            handle
                .await
                .map_err(|e| SpoolwerkError::Delivery(format!("dispatcher join: {e}")))?;
        }
        self.status = ServerStatus::Stopped;
        info!("dispatcher stopped");
        Ok(())
    }

    /// Job ids currently being delivered, ascending.
    pub fn in_flight(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.state.in_flight_guard().iter().copied().collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let jobs = Arc::clone(&self.state.jobs);
        let (total_jobs, active_devices) =
            blocking(move || Ok((jobs.count_jobs()?, jobs.devices_with_jobs()?.len() as u64)))
                .await?;
        Ok(QueueStats {
            total_jobs,
            active_devices,
            in_flight: self.state.in_flight_guard().len(),
            max_concurrent: self.state.config.max_concurrent,
            running: self.state.running.load(Ordering::SeqCst),
        })
    }

    /// The dispatch loop.
    ///
    /// Polls quickly while work exists and slowly once the queue is empty;
    /// a committed job wakes it early either way.
    async fn run(state: Arc<DispatchState>, shutdown: Arc<Notify>) {
        let mut had_work = false;
        loop {
            let pause = match state.cycle().await {
                Ok(0) => {
                    if had_work {
                        debug!("queue drained, waiting for new jobs");
                    }
                    had_work = false;
                    state.config.idle_poll()
                }
                Ok(queued) => {
                    if !had_work {
                        debug!(queued, "jobs queued, dispatching");
                    }
                    had_work = true;
                    state.config.active_poll()
                }
                Err(e) => {
                    error!(error = %e, "dispatch cycle failed");
                    state.config.error_pause()
                }
            };

            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("dispatch loop received shutdown signal");
                    break;
                }
                _ = state.wake.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

impl DispatchState {
    fn in_flight_guard(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One pass over the queue. Returns the number of queued jobs seen.
    async fn cycle(self: &Arc<Self>) -> Result<u64> {
        let jobs = Arc::clone(&self.jobs);
        let queued = blocking(move || jobs.count_jobs()).await?;
        if queued == 0 {
            return Ok(0);
        }

        let jobs = Arc::clone(&self.jobs);
        let device_ids = blocking(move || jobs.devices_with_jobs()).await?;

        for device_id in device_ids {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let jobs = Arc::clone(&self.jobs);
            let Some(job) = blocking(move || jobs.oldest_pending(device_id)).await? else {
                continue;
            };
            if self.in_flight_guard().contains(&job.id) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!("delivery ceiling reached, deferring to next cycle");
                break;
            };
            if !self.in_flight_guard().insert(job.id) {
                continue;
            }

            let state = Arc::clone(self);
            tokio::spawn(async move {
                state.process_job(job).await;
                drop(permit);
            });
        }
        Ok(queued)
    }

    /// Deliver one job, then remove it from the queue no matter what.
    #[instrument(skip_all, fields(job_id = %job.id, device = %job.device_id, file = %job.file_name))]
    async fn process_job(&self, job: Job) {
        info!(owner = %job.owner, "processing job");
        match self.deliver_job(&job).await {
            Ok(sent) => info!(bytes = sent, "job delivered"),
            Err(e) => error!(error = %e, "job dropped after final failure"),
        }
        self.finish(&job).await;
        self.in_flight_guard().remove(&job.id);
    }

    async fn deliver_job(&self, job: &Job) -> Result<u64> {
        let devices = Arc::clone(&self.devices);
        let device_id = job.device_id;
        let mut device = blocking(move || devices.device(device_id))
            .await?
            .ok_or_else(|| SpoolwerkError::DeviceNotFound(device_id.to_string()))?;

        let payload = self.load_payload(job, &device).await?;
        let prepared = normalize(&payload, device.model.as_deref());
        let budget = self.policy.attempts_for(&device);
        let mut relocated_once = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut err = match self.deliverer.deliver(&device, job, &prepared.bytes).await {
                Ok(sent) => return Ok(sent),
                Err(e) => e,
            };
            warn!(attempt, max = budget, error = %err, "delivery attempt failed");

            if err.triggers_rediscovery() && !device.shared && !relocated_once {
                if let Some(rediscovery) = &self.rediscovery {
                    relocated_once = true;
                    match rediscovery.locate(&device).await {
                        Ok(relocation) => {
                            device = relocation.device;
                            match self.deliverer.deliver(&device, job, &prepared.bytes).await {
                                Ok(sent) => return Ok(sent),
                                Err(e) => {
                                    warn!(ip = %device.ip, error = %e, "delivery to new address failed");
                                    err = e;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "device could not be located"),
                    }
                }
            }

            match self.policy.decide(&err, attempt, &device) {
                RetryDecision::RetryAfter(delay) => tokio::time::sleep(delay).await,
                RetryDecision::GiveUp | RetryDecision::Exhausted => return Err(err),
            }
        }
    }

    /// The spooled bytes, or a printed notice if the spool file is gone.
    async fn load_payload(&self, job: &Job, device: &Device) -> Result<Vec<u8>> {
        match self.spool.read(job).await? {
            Some(bytes) => {
                if let Some(expected) = job.payload_hash.as_deref() {
                    if !verify_hash(&bytes, expected) {
                        warn!("spooled payload changed since ingestion");
                    }
                }
                Ok(bytes)
            }
            None => {
                warn!("spool file missing, delivering a placeholder notice");
                Ok(placeholder_document(job, device))
            }
        }
    }

    async fn finish(&self, job: &Job) {
        if let Err(e) = self.spool.remove(job) {
            warn!(error = %e, "spool file could not be removed");
        }
        let jobs = Arc::clone(&self.jobs);
        let id = job.id;
        match blocking(move || jobs.delete_job(id)).await {
            Ok(true) => debug!("job removed from queue"),
            Ok(false) => debug!("job was already gone"),
            Err(e) => error!(error = %e, "job row could not be deleted"),
        }
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job ingestion: the only writer of new jobs.
//
// A job row and its spool file are created together or not at all.  Once a
// job is committed the dispatcher is woken so delivery does not wait for the
// next poll tick.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

use spoolwerk_core::error::{Result, SpoolwerkError};
use spoolwerk_core::types::{Device, DeviceId, Job, JobId, NewJob};

use crate::spool::Spool;
use crate::store::{DeviceRepository, JobRepository, blocking};
use crate::wire::IppRequest;

/// A payload accepted from a client, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub file_name: String,
    pub owner: String,
    pub payload: Vec<u8>,
}

impl Submission {
    /// Owner and file name from the request's attributes, peer host otherwise.
    pub fn from_request(request: &IppRequest, peer: IpAddr) -> Self {
        let owner = request
            .string_attr("requesting-user-name")
            .or_else(|| request.string_attr("job-originating-user-name"))
            .unwrap_or_else(|| peer.to_string());
        let file_name = request
            .string_attr("job-name")
            .or_else(|| request.string_attr("document-name"))
            .unwrap_or_else(default_file_name);
        Self {
            file_name,
            owner,
            payload: request.document_data.clone(),
        }
    }

    /// A protocol-less stream. Nothing names it, so the peer owns it.
    pub fn raw(payload: Vec<u8>, peer: IpAddr) -> Self {
        Self {
            file_name: default_file_name(),
            owner: peer.to_string(),
            payload,
        }
    }
}

/// `document_<unix-millis>.dat`
pub fn default_file_name() -> String {
    format!("document_{}.dat", Utc::now().timestamp_millis())
}

/// Records jobs and owns the spool lifecycle outside of delivery.
#[derive(Clone)]
pub struct Ingestor {
    devices: Arc<dyn DeviceRepository>,
    jobs: Arc<dyn JobRepository>,
    spool: Spool,
    wake: Arc<Notify>,
}

impl Ingestor {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        jobs: Arc<dyn JobRepository>,
        spool: Spool,
    ) -> Self {
        Self {
            devices,
            jobs,
            spool,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Signalled after every committed job.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn devices(&self) -> Arc<dyn DeviceRepository> {
        Arc::clone(&self.devices)
    }

    pub fn jobs(&self) -> Arc<dyn JobRepository> {
        Arc::clone(&self.jobs)
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// Persist a job for `device` and spool its payload.
    ///
    /// Any storage failure leaves neither a row nor a file behind.
    #[instrument(skip_all, fields(device = %device.alias, file = %submission.file_name))]
    pub async fn submit(&self, device: &Device, submission: Submission) -> Result<Job> {
        let jobs = Arc::clone(&self.jobs);
        let spool = self.spool.clone();
        let new_job = NewJob {
            device_id: device.id,
            file_name: submission.file_name,
            owner: submission.owner,
        };
        let payload = submission.payload;

        let job = blocking(move || {
            // Write outside the store lock; the insert only renames.
            let staged = spool.stage(&new_job.file_name, &payload)?;
            jobs.create_job(&new_job, &mut |id| staged.place(id))
                .inspect_err(|_| staged.discard())
        })
        .await?;

        info!(
            job_id = %job.id,
            owner = %job.owner,
            bytes = job.payload_len,
            "job accepted"
        );
        self.wake.notify_one();
        Ok(job)
    }

    /// Delete one queued job and its payload. Returns whether it existed.
    #[instrument(skip(self), fields(job_id = %id))]
    pub async fn cancel_job(&self, id: JobId) -> Result<bool> {
        let jobs = Arc::clone(&self.jobs);
        let Some(job) = blocking(move || jobs.job(id)).await? else {
            return Ok(false);
        };
        self.discard(&job).await
    }

    /// Delete every job queued for `device`. Returns how many were removed.
    #[instrument(skip(self), fields(device = %device))]
    pub async fn clear_queue(&self, device: DeviceId) -> Result<usize> {
        let jobs = Arc::clone(&self.jobs);
        let queued = blocking(move || jobs.jobs_for_device(device)).await?;
        let mut removed = 0;
        for job in &queued {
            if self.discard(job).await? {
                removed += 1;
            }
        }
        info!(removed, "queue cleared");
        Ok(removed)
    }

    /// Delete a device together with its queue.
    ///
    /// Spool files go first; the device row takes its job rows with it.
    #[instrument(skip(self), fields(device = %id))]
    pub async fn remove_device(&self, id: DeviceId) -> Result<bool> {
        let devices = Arc::clone(&self.devices);
        if blocking(move || devices.device(id)).await?.is_none() {
            return Ok(false);
        }
        self.clear_queue(id).await?;
        let devices = Arc::clone(&self.devices);
        let existed = blocking(move || devices.delete_device(id)).await?;
        info!(existed, "device removed");
        Ok(existed)
    }

    /// Resolve a device by alias, failing with `DeviceNotFound`.
    pub async fn device_named(&self, alias: &str) -> Result<Device> {
        let devices = Arc::clone(&self.devices);
        let name = alias.to_string();
        blocking(move || devices.device_by_alias(&name))
            .await?
            .ok_or_else(|| SpoolwerkError::DeviceNotFound(alias.to_string()))
    }

    /// The first-registered device, target of protocol-less streams.
    pub async fn default_device(&self) -> Result<Option<Device>> {
        let devices = Arc::clone(&self.devices);
        blocking(move || devices.default_device()).await
    }

    async fn discard(&self, job: &Job) -> Result<bool> {
        if let Err(e) = self.spool.remove(job) {
            warn!(job_id = %job.id, error = %e, "spool file left behind");
        }
        let jobs = Arc::clone(&self.jobs);
        let id = job.id;
        blocking(move || jobs.delete_job(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::wire::tests::build_test_ipp_request;
    use crate::wire::{OP_PRINT_JOB, VALUE_TAG_NAME, parse_ipp_request};
    use spoolwerk_core::types::NewDevice;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, Arc<SqliteStore>, Ingestor, Device) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let spool = Spool::open(dir.path().join("spool")).expect("spool");
        let device = store
            .create_device(&NewDevice::raw(
                "Lab",
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)),
                9100,
            ))
            .expect("device");
        let ingestor = Ingestor::new(store.clone(), store.clone(), spool);
        (dir, store, ingestor, device)
    }

    fn peer() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))
    }

    #[tokio::test]
    async fn submit_spools_payload_and_wakes_dispatcher() {
        let (_dir, store, ingestor, device) = setup();
        let wake = ingestor.wake_handle();
        let notified = wake.notified();

        let job = ingestor
            .submit(
                &device,
                Submission {
                    file_name: "notes.txt".into(),
                    owner: "alice".into(),
                    payload: b"hello".to_vec(),
                },
            )
            .await
            .expect("submit");

        let path = job.spool_path.clone().expect("spool path");
        assert_eq!(std::fs::read(&path).expect("read spool"), b"hello");
        assert_eq!(store.count_jobs().expect("count"), 1);
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("dispatcher woken");
    }

    #[tokio::test]
    async fn spool_failure_leaves_no_job() {
        let (dir, store, ingestor, device) = setup();
        std::fs::remove_dir_all(dir.path().join("spool")).expect("remove spool dir");

        let err = ingestor
            .submit(&device, Submission::raw(b"data".to_vec(), peer()))
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolwerkError::Spool(_)), "got {err:?}");
        assert_eq!(store.count_jobs().expect("count"), 0);
    }

    #[tokio::test]
    async fn failed_insert_discards_staged_payload() {
        let (_dir, store, ingestor, device) = setup();
        // A directory squatting on job 1's spool path makes the rename fail.
        let squatter = ingestor.spool().path_for(JobId(1), "notes.txt");
        std::fs::create_dir(&squatter).expect("squat");

        let result = ingestor
            .submit(
                &device,
                Submission {
                    file_name: "notes.txt".into(),
                    owner: "alice".into(),
                    payload: b"hello".to_vec(),
                },
            )
            .await;
        assert!(matches!(result, Err(SpoolwerkError::Spool(_))), "got {result:?}");
        assert_eq!(store.count_jobs().expect("count"), 0);
        let entries: Vec<_> = std::fs::read_dir(ingestor.spool().dir())
            .expect("dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        assert_eq!(entries, vec![squatter]);
    }

    #[tokio::test]
    async fn cancel_removes_row_and_file() {
        let (_dir, store, ingestor, device) = setup();
        let job = ingestor
            .submit(&device, Submission::raw(b"data".to_vec(), peer()))
            .await
            .expect("submit");
        let path = job.spool_path.clone().expect("path");

        assert!(ingestor.cancel_job(job.id).await.expect("cancel"));
        assert!(!path.exists());
        assert!(store.job(job.id).expect("query").is_none());
        assert!(!ingestor.cancel_job(job.id).await.expect("second cancel"));
    }

    #[tokio::test]
    async fn clear_queue_counts_removed_jobs() {
        let (_dir, store, ingestor, device) = setup();
        for n in 0..3 {
            ingestor
                .submit(&device, Submission::raw(vec![b'a' + n], peer()))
                .await
                .expect("submit");
        }
        assert_eq!(ingestor.clear_queue(device.id).await.expect("clear"), 3);
        assert_eq!(store.count_jobs().expect("count"), 0);
        assert_eq!(
            std::fs::read_dir(ingestor.spool().dir()).expect("dir").count(),
            0
        );
    }

    #[tokio::test]
    async fn remove_device_drops_queue_and_record() {
        let (_dir, store, ingestor, device) = setup();
        ingestor
            .submit(&device, Submission::raw(b"data".to_vec(), peer()))
            .await
            .expect("submit");

        assert!(ingestor.remove_device(device.id).await.expect("remove"));
        assert!(store.device(device.id).expect("query").is_none());
        assert_eq!(store.count_jobs().expect("count"), 0);
        assert!(!ingestor.remove_device(device.id).await.expect("again"));
    }

    #[test]
    fn owner_and_name_come_from_attributes() {
        let bytes = build_test_ipp_request(
            OP_PRINT_JOB,
            7,
            &[
                (VALUE_TAG_NAME, "requesting-user-name", b"alice"),
                (VALUE_TAG_NAME, "job-name", b"notes.txt"),
            ],
            b"body",
        );
        let request = parse_ipp_request(&bytes).expect("parse");
        let submission = Submission::from_request(&request, peer());
        assert_eq!(submission.owner, "alice");
        assert_eq!(submission.file_name, "notes.txt");
        assert_eq!(submission.payload, b"body");
    }

    #[test]
    fn missing_attributes_fall_back_to_peer_and_timestamp() {
        let bytes = build_test_ipp_request(OP_PRINT_JOB, 7, &[], b"");
        let request = parse_ipp_request(&bytes).expect("parse");
        let submission = Submission::from_request(&request, peer());
        assert_eq!(submission.owner, "10.1.2.3");
        assert!(submission.file_name.starts_with("document_"));
        assert!(submission.file_name.ends_with(".dat"));
    }
}

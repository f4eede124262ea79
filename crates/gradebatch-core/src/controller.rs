//! Uniform lifecycle over one [`BatchAdapter`].
//!
//! The sentinel file `<output>.processing` is the only persisted state: while
//! it exists the job is in flight and its batch id is reused instead of
//! resubmitting. It is removed exactly when the job reaches a terminal state.

use crate::jsonl::read_requests;
use crate::providers::BatchAdapter;
use crate::sentinel::Sentinel;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Submitted,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Submitted => "submitted",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A vendor status string placed into the adapter's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    Unknown,
}

pub fn classify(adapter: &dyn BatchAdapter, status: &str) -> StatusClass {
    if adapter.processing_statuses().contains(&status) {
        StatusClass::Processing
    } else if adapter.success_statuses().contains(&status) {
        StatusClass::Succeeded
    } else if adapter.failure_statuses().contains(&status) {
        if status.to_ascii_lowercase().contains("cancel") {
            StatusClass::Cancelled
        } else {
            StatusClass::Failed
        }
    } else {
        StatusClass::Unknown
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Unfinished jobs older than this (measured from submission) are
    /// treated as failed.
    pub expiry: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            expiry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchJob {
    pub jsonl_path: PathBuf,
    pub output_path: PathBuf,
    pub sentinel: Sentinel,
    pub batch_id: Option<String>,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Vendor status string; `None` when the provider was not contacted.
    pub raw: Option<String>,
    pub state: JobState,
}

pub struct BatchJobController {
    adapter: Box<dyn BatchAdapter>,
    job: BatchJob,
}

impl BatchJobController {
    pub fn new(
        mut adapter: Box<dyn BatchAdapter>,
        jsonl_path: &Path,
        output_path: &Path,
    ) -> anyhow::Result<Self> {
        let sentinel = Sentinel::for_output(output_path);
        let (batch_id, state) = if output_path.exists() {
            if sentinel.exists() {
                tracing::warn!(sentinel = %sentinel.path().display(), "output already present; removing stale sentinel");
                sentinel.remove()?;
            }
            (None, JobState::Succeeded)
        } else {
            match sentinel.read()? {
                Some(id) => {
                    tracing::info!(batch_id = %id, output = %output_path.display(), "resuming in-flight batch");
                    (Some(id), JobState::Submitted)
                }
                None => (None, JobState::NotStarted),
            }
        };

        if jsonl_path.exists() {
            adapter.attach_requests(&read_requests(jsonl_path)?);
        }

        Ok(Self {
            adapter,
            job: BatchJob {
                jsonl_path: jsonl_path.to_path_buf(),
                output_path: output_path.to_path_buf(),
                sentinel,
                batch_id,
                state,
            },
        })
    }

    pub fn job(&self) -> &BatchJob {
        &self.job
    }

    pub fn state(&self) -> JobState {
        self.job.state
    }

    pub fn adapter(&self) -> &dyn BatchAdapter {
        self.adapter.as_ref()
    }

    /// Submits the request file unless a batch is already in flight.
    ///
    /// Returns the batch id (the existing one when reattaching), or `None`
    /// when the output already exists and there is nothing to do.
    pub async fn send(&mut self) -> anyhow::Result<Option<String>> {
        let provider = self.adapter.provider().as_str();
        if self.job.state == JobState::Succeeded {
            tracing::info!(provider, output = %self.job.output_path.display(), "output already present; not submitting");
            return Ok(None);
        }
        if let (Some(id), false) = (&self.job.batch_id, self.job.state.is_terminal()) {
            tracing::info!(provider, batch_id = %id, "batch already submitted; reusing id");
            return Ok(Some(id.clone()));
        }

        let id = self.adapter.send(&self.job.jsonl_path).await?;
        if self.adapter.is_synchronous() {
            self.job.state = JobState::Succeeded;
        } else {
            self.job.sentinel.write(&id)?;
            self.job.state = JobState::Submitted;
        }
        tracing::info!(provider, batch_id = %id, input = %self.job.jsonl_path.display(), "submitted");
        self.job.batch_id = Some(id.clone());
        Ok(Some(id))
    }

    /// One status probe. A terminal failure clears the sentinel so the next
    /// `send` resubmits.
    pub async fn check_status(&mut self) -> anyhow::Result<StatusReport> {
        if self.adapter.is_synchronous() {
            let id = self.job.output_path.display().to_string();
            let raw = self.adapter.check_status(&id).await?;
            self.job.state = match classify(self.adapter.as_ref(), &raw) {
                StatusClass::Succeeded => JobState::Succeeded,
                _ => JobState::NotStarted,
            };
            return Ok(StatusReport { raw: Some(raw), state: self.job.state });
        }

        let Some(id) = self.job.batch_id.clone() else {
            return Ok(StatusReport { raw: None, state: self.job.state });
        };
        let raw = self.adapter.check_status(&id).await?;
        let class = classify(self.adapter.as_ref(), &raw);
        self.job.state = match class {
            StatusClass::Processing => JobState::Processing,
            StatusClass::Succeeded => JobState::Succeeded,
            StatusClass::Failed => {
                tracing::warn!(batch_id = %id, status = %raw, "batch failed");
                self.finish_unsuccessful(JobState::Failed)?;
                JobState::Failed
            }
            StatusClass::Cancelled => {
                tracing::warn!(batch_id = %id, status = %raw, "batch cancelled");
                self.finish_unsuccessful(JobState::Cancelled)?;
                JobState::Cancelled
            }
            StatusClass::Unknown => {
                tracing::warn!(batch_id = %id, status = %raw, "unrecognized vendor status");
                self.job.state
            }
        };
        Ok(StatusReport { raw: Some(raw), state: self.job.state })
    }

    /// Fetches and normalizes results for the current batch. The sentinel is
    /// removed when an output file was written or the vendor reports the
    /// batch as failed or cancelled.
    pub async fn download(&mut self) -> anyhow::Result<Option<PathBuf>> {
        if self.job.output_path.exists() && self.job.batch_id.is_none() {
            return Ok(Some(self.job.output_path.clone()));
        }
        let Some(id) = self.job.batch_id.clone() else {
            anyhow::bail!(
                "no batch recorded for {}; submit it first",
                self.job.output_path.display()
            );
        };
        let out = self.adapter.download(&id, &self.job.output_path).await?;
        if out.is_some() {
            self.job.sentinel.remove()?;
            self.job.state = JobState::Succeeded;
            return Ok(out);
        }
        let raw = self.adapter.check_status(&id).await?;
        match classify(self.adapter.as_ref(), &raw) {
            StatusClass::Failed => {
                tracing::warn!(batch_id = %id, status = %raw, "no results for failed batch");
                self.finish_unsuccessful(JobState::Failed)
            }
            StatusClass::Cancelled => {
                tracing::warn!(batch_id = %id, status = %raw, "no results for cancelled batch");
                self.finish_unsuccessful(JobState::Cancelled)
            }
            _ => Ok(None),
        }
    }

    /// Polls until the batch is terminal. `Some(output)` on success; `None`
    /// when the vendor reports failure or cancellation, or the job expired.
    pub async fn wait_for_completion(
        &mut self,
        policy: &PollPolicy,
    ) -> anyhow::Result<Option<PathBuf>> {
        if self.adapter.is_synchronous() {
            anyhow::bail!(
                "{} performs requests synchronously; wait_for_completion is not supported",
                self.adapter.provider().as_str()
            );
        }
        if self.job.state == JobState::Succeeded && self.job.output_path.exists() {
            return Ok(Some(self.job.output_path.clone()));
        }
        let Some(id) = self.job.batch_id.clone() else {
            anyhow::bail!(
                "no batch recorded for {}; submit it first",
                self.job.output_path.display()
            );
        };
        let provider = self.adapter.provider().as_str();

        loop {
            if let (Some(expiry), Some(age)) = (policy.expiry, self.job.sentinel.age()) {
                if age > expiry {
                    tracing::warn!(provider, batch_id = %id, age_secs = age.as_secs(), "batch exceeded expiry horizon; giving up");
                    return self.finish_unsuccessful(JobState::Failed);
                }
            }

            match self.adapter.check_status(&id).await {
                Err(e) => {
                    tracing::warn!(provider, batch_id = %id, error = %e, "status check failed; will retry");
                }
                Ok(raw) => match classify(self.adapter.as_ref(), &raw) {
                    StatusClass::Processing => {
                        self.job.state = JobState::Processing;
                        tracing::info!(provider, batch_id = %id, status = %raw, "waiting");
                    }
                    StatusClass::Succeeded => {
                        match self.adapter.download(&id, &self.job.output_path).await {
                            Ok(Some(path)) => {
                                self.job.sentinel.remove()?;
                                self.job.state = JobState::Succeeded;
                                tracing::info!(provider, batch_id = %id, output = %path.display(), "batch complete");
                                return Ok(Some(path));
                            }
                            Ok(None) => {
                                tracing::warn!(provider, batch_id = %id, "batch succeeded without results");
                                return self.finish_unsuccessful(JobState::Failed);
                            }
                            Err(e) => {
                                tracing::warn!(provider, batch_id = %id, error = %e, "download failed; will retry");
                            }
                        }
                    }
                    StatusClass::Failed => {
                        tracing::warn!(provider, batch_id = %id, status = %raw, "batch failed");
                        return self.finish_unsuccessful(JobState::Failed);
                    }
                    StatusClass::Cancelled => {
                        tracing::warn!(provider, batch_id = %id, status = %raw, "batch cancelled");
                        return self.finish_unsuccessful(JobState::Cancelled);
                    }
                    StatusClass::Unknown => {
                        tracing::warn!(provider, batch_id = %id, status = %raw, "unrecognized vendor status; still polling");
                    }
                },
            }

            tokio::time::sleep(policy.interval).await;
        }
    }

    fn finish_unsuccessful(&mut self, state: JobState) -> anyhow::Result<Option<PathBuf>> {
        self.job.sentinel.remove()?;
        self.job.state = state;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonl::write_jsonl;
    use crate::model::{Provider, ResponseRecord};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Counters {
        sends: AtomicUsize,
        downloads: AtomicUsize,
    }

    struct ScriptedAdapter {
        statuses: Mutex<VecDeque<anyhow::Result<String>>>,
        counters: Arc<Counters>,
        has_results: bool,
    }

    impl ScriptedAdapter {
        fn new(statuses: Vec<anyhow::Result<String>>, counters: Arc<Counters>) -> Box<Self> {
            Box::new(Self {
                statuses: Mutex::new(statuses.into()),
                counters,
                has_results: true,
            })
        }

        fn without_results(mut self: Box<Self>) -> Box<Self> {
            self.has_results = false;
            self
        }
    }

    #[async_trait]
    impl BatchAdapter for ScriptedAdapter {
        fn provider(&self) -> Provider {
            Provider::Openai
        }

        async fn send(&self, _jsonl_path: &Path) -> anyhow::Result<String> {
            let n = self.counters.sends.fetch_add(1, Ordering::SeqCst);
            Ok(format!("batch_{}", n + 1))
        }

        async fn check_status(&self, _batch_id: &str) -> anyhow::Result<String> {
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("in_progress".into()))
        }

        async fn download(&self, _batch_id: &str, output_path: &Path) -> anyhow::Result<Option<PathBuf>> {
            self.counters.downloads.fetch_add(1, Ordering::SeqCst);
            if !self.has_results {
                return Ok(None);
            }
            write_jsonl(output_path, &[ResponseRecord::ok("mc01-q1-p1", "A")])?;
            Ok(Some(output_path.to_path_buf()))
        }

        fn processing_statuses(&self) -> &'static [&'static str] {
            &["validating", "in_progress"]
        }
        fn success_statuses(&self) -> &'static [&'static str] {
            &["completed"]
        }
        fn failure_statuses(&self) -> &'static [&'static str] {
            &["failed", "cancelled"]
        }
    }

    fn fast() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            expiry: None,
        }
    }

    #[tokio::test]
    async fn send_is_idempotent_across_restarts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("mc01.jsonl");
        let output = dir.path().join("out/mc01.jsonl");
        let counters = Arc::new(Counters::default());

        let mut c = BatchJobController::new(ScriptedAdapter::new(vec![], counters.clone()), &input, &output)?;
        let first = c.send().await?;
        assert_eq!(first.as_deref(), Some("batch_1"));
        assert_eq!(c.send().await?, first);

        // a fresh controller picks the id up from the sentinel
        let mut c = BatchJobController::new(ScriptedAdapter::new(vec![], counters.clone()), &input, &output)?;
        assert_eq!(c.state(), JobState::Submitted);
        assert_eq!(c.send().await?, first);
        assert_eq!(counters.sends.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_transient_statuses_keep_polling() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("mc01.jsonl");
        let counters = Arc::new(Counters::default());
        let script = vec![
            Ok("validating".to_string()),
            Ok("archiving_soon".to_string()),
            Err(anyhow::anyhow!("connection reset")),
            Ok("completed".to_string()),
        ];
        let mut c = BatchJobController::new(ScriptedAdapter::new(script, counters.clone()), &dir.path().join("in.jsonl"), &output)?;
        c.send().await?;

        let out = c.wait_for_completion(&fast()).await?;
        assert_eq!(out.as_deref(), Some(output.as_path()));
        assert_eq!(c.state(), JobState::Succeeded);
        assert!(!c.job().sentinel.exists());
        assert_eq!(counters.downloads.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn terminal_failure_returns_none_and_clears_sentinel() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("mc01.jsonl");
        let counters = Arc::new(Counters::default());
        let script = vec![Ok("in_progress".to_string()), Ok("cancelled".to_string())];
        let mut c = BatchJobController::new(ScriptedAdapter::new(script, counters.clone()), &dir.path().join("in.jsonl"), &output)?;
        c.send().await?;

        assert_eq!(c.wait_for_completion(&fast()).await?, None);
        assert_eq!(c.state(), JobState::Cancelled);
        assert!(!c.job().sentinel.exists());
        assert_eq!(counters.downloads.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn expired_job_is_failed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("mc01.jsonl");
        let counters = Arc::new(Counters::default());
        let mut c = BatchJobController::new(ScriptedAdapter::new(vec![], counters.clone()), &dir.path().join("in.jsonl"), &output)?;
        c.send().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            expiry: Some(Duration::from_millis(5)),
        };
        assert_eq!(c.wait_for_completion(&policy).await?, None);
        assert_eq!(c.state(), JobState::Failed);
        assert!(!c.job().sentinel.exists());
        Ok(())
    }

    #[tokio::test]
    async fn existing_output_short_circuits() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("mc01.jsonl");
        write_jsonl(&output, &[ResponseRecord::ok("mc01-q1-p1", "A")])?;
        Sentinel::for_output(&output).write("stale")?;
        let counters = Arc::new(Counters::default());

        let mut c = BatchJobController::new(ScriptedAdapter::new(vec![], counters.clone()), &dir.path().join("in.jsonl"), &output)?;
        assert_eq!(c.state(), JobState::Succeeded);
        assert!(!Sentinel::for_output(&output).exists());
        assert_eq!(c.send().await?, None);
        assert_eq!(c.wait_for_completion(&fast()).await?, Some(output.clone()));
        assert_eq!(counters.sends.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_status_clears_sentinel_and_allows_resubmit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("in.jsonl");
        let output = dir.path().join("mc01.jsonl");
        let counters = Arc::new(Counters::default());
        let script = vec![Ok("failed".to_string())];
        let mut c = BatchJobController::new(ScriptedAdapter::new(script, counters.clone()), &input, &output)?;
        c.send().await?;

        let report = c.check_status().await?;
        assert_eq!(report.state, JobState::Failed);
        assert!(!Sentinel::for_output(&output).exists());

        // a restart after the failure starts over instead of reattaching
        let mut c = BatchJobController::new(ScriptedAdapter::new(vec![], counters.clone()), &input, &output)?;
        assert_eq!(c.state(), JobState::NotStarted);
        assert_eq!(c.send().await?.as_deref(), Some("batch_2"));
        assert_eq!(counters.sends.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn empty_download_of_cancelled_batch_clears_sentinel() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("mc01.jsonl");
        let counters = Arc::new(Counters::default());
        let script = vec![Ok("cancelled".to_string())];
        let adapter = ScriptedAdapter::new(script, counters.clone()).without_results();
        let mut c = BatchJobController::new(adapter, &dir.path().join("in.jsonl"), &output)?;
        c.send().await?;

        assert_eq!(c.download().await?, None);
        assert_eq!(c.state(), JobState::Cancelled);
        assert!(!Sentinel::for_output(&output).exists());
        assert_eq!(c.send().await?.as_deref(), Some("batch_2"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_download_while_processing_keeps_sentinel() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let output = dir.path().join("mc01.jsonl");
        let counters = Arc::new(Counters::default());
        let adapter = ScriptedAdapter::new(vec![], counters.clone()).without_results();
        let mut c = BatchJobController::new(adapter, &dir.path().join("in.jsonl"), &output)?;
        c.send().await?;

        assert_eq!(c.download().await?, None);
        assert!(Sentinel::for_output(&output).exists());
        Ok(())
    }
}

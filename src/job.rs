use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::translations::LanguagePair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Converting,
    ParsingDocx,
    Translating,
    Qa,
    Packing,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Converting => "converting",
            JobStatus::ParsingDocx => "parsing-docx",
            JobStatus::Translating => "translating",
            JobStatus::Qa => "qa",
            JobStatus::Packing => "packing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Error | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (_, JobStatus::Error)
                | (_, JobStatus::Cancelled)
                | (JobStatus::Queued, JobStatus::Converting)
                | (JobStatus::Queued, JobStatus::ParsingDocx)
                | (JobStatus::Converting, JobStatus::ParsingDocx)
                | (JobStatus::ParsingDocx, JobStatus::Translating)
                | (JobStatus::Translating, JobStatus::Qa)
                | (JobStatus::Qa, JobStatus::Packing)
                | (JobStatus::Packing, JobStatus::Done)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job cannot move from {} to {}", from.as_str(), to.as_str())]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub file_name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub step_message: String,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub total_segments: usize,
    pub translated_segments: usize,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub output_path: Option<PathBuf>,
}

impl Job {
    fn new(id: String, file_name: String) -> Self {
        Self {
            id,
            file_name,
            status: JobStatus::Queued,
            progress: 0,
            step_message: "Queued".to_string(),
            error_message: None,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            finished_at: None,
            total_segments: 0,
            translated_segments: 0,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            output_path: None,
        }
    }

    fn move_to(&mut self, next: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = OffsetDateTime::now_utc();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    fn raise_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }
}

/// Polling view of a job, serialized for the HTTP layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub file_name: String,
    pub status: JobStatus,
    pub progress: u8,
    pub step_message: String,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub cancelled: bool,
    pub total_segments: usize,
    pub translated_segments: usize,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub output_path: Option<String>,
}

/// Shared handle to one job. The pipeline owns every status change; a
/// cancellation request only flips the flag.
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    languages: LanguagePair,
    state: Mutex<Job>,
    cancelled: AtomicBool,
}

impl JobHandle {
    pub fn new(id: impl Into<String>, file_name: impl Into<String>, languages: LanguagePair) -> Self {
        let id = id.into();
        Self {
            state: Mutex::new(Job::new(id.clone(), file_name.into())),
            id,
            languages,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn languages(&self) -> &LanguagePair {
        &self.languages
    }

    fn lock(&self) -> MutexGuard<'_, Job> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn job(&self) -> Job {
        self.lock().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns false when the job has already finished. The check and the
    /// flag store happen under the job lock, so a request never lands on a
    /// job that has already settled.
    pub fn request_cancel(&self) -> bool {
        let job = self.lock();
        if job.status.is_terminal() {
            return false;
        }
        self.cancelled.store(true, Ordering::Release);
        true
    }

    pub fn transition(
        &self,
        next: JobStatus,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<(), JobError> {
        let mut job = self.lock();
        job.move_to(next)?;
        job.raise_progress(progress);
        job.step_message = message.into();
        Ok(())
    }

    /// Progress never goes backwards and stops moving once the job is over.
    pub fn set_progress(&self, progress: u8, message: impl Into<String>) {
        let mut job = self.lock();
        if job.status.is_terminal() {
            return;
        }
        job.raise_progress(progress);
        job.step_message = message.into();
    }

    /// Maps `done / total` translated items onto the 20..=90 band.
    pub fn report_translation_progress(&self, done: usize, total: usize) {
        let total = total.max(1);
        let done = done.min(total);
        let progress = 20 + (70 * done / total) as u8;
        self.set_progress(progress, format!("Translating ({}/{})", done, total));
    }

    pub fn set_total_segments(&self, total: usize) {
        self.lock().total_segments = total;
    }

    pub fn record_usage(&self, usage: TokenUsage, cost_usd: f64) {
        let mut job = self.lock();
        job.usage.add(usage);
        job.cost_usd += cost_usd;
    }

    pub fn complete(&self, output_path: &Path, translated_segments: usize) -> Result<(), JobError> {
        let mut job = self.lock();
        job.move_to(JobStatus::Done)?;
        job.progress = 100;
        job.step_message = "Done".to_string();
        job.translated_segments = translated_segments;
        job.output_path = Some(output_path.to_path_buf());
        Ok(())
    }

    pub fn fail(&self, message: impl Into<String>) -> Result<(), JobError> {
        let message = message.into();
        let mut job = self.lock();
        job.move_to(JobStatus::Error)?;
        job.step_message = "Failed".to_string();
        job.error_message = Some(message);
        Ok(())
    }

    pub fn mark_cancelled(&self) -> Result<(), JobError> {
        let mut job = self.lock();
        job.move_to(JobStatus::Cancelled)?;
        job.step_message = "Cancelled".to_string();
        Ok(())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let job = self.lock();
        // A request that arrived after the last checkpoint lost to completion.
        let cancelled = job.status != JobStatus::Done && self.is_cancelled();
        JobSnapshot {
            id: job.id.clone(),
            file_name: job.file_name.clone(),
            status: job.status,
            progress: job.progress,
            step_message: job.step_message.clone(),
            error_message: job.error_message.clone(),
            started_at: job.started_at.and_then(format_time),
            finished_at: job.finished_at.and_then(format_time),
            cancelled,
            total_segments: job.total_segments,
            translated_segments: job.translated_segments,
            usage: job.usage,
            cost_usd: job.cost_usd,
            output_path: job
                .output_path
                .as_ref()
                .map(|path| path.display().to_string()),
        }
    }
}

fn format_time(value: OffsetDateTime) -> Option<String> {
    value.format(&Rfc3339).ok()
}

/// Process-wide table of jobs, keyed by id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Arc<JobHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<JobHandle>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, file_name: &str, languages: LanguagePair) -> Arc<JobHandle> {
        let id = uuid::Uuid::new_v4().to_string();
        let handle = Arc::new(JobHandle::new(id.clone(), file_name, languages));
        self.lock().insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: &str) -> Option<Arc<JobHandle>> {
        self.lock().get(id).cloned()
    }

    pub fn snapshot(&self, id: &str) -> Option<JobSnapshot> {
        self.get(id).map(|job| job.snapshot())
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.get(id).is_some_and(|job| job.request_cancel())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops finished jobs older than `retention`. Returns the removed ids so
    /// the caller can clean up their working files.
    pub fn prune(&self, retention: Duration) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        let mut jobs = self.lock();
        let expired = jobs
            .iter()
            .filter(|(_, handle)| {
                handle
                    .job()
                    .finished_at
                    .is_some_and(|finished| now - finished >= retention)
            })
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for id in &expired {
            jobs.remove(id);
        }
        expired
    }
}

use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::data::{SourceKind, sanitize_file_name};
use crate::docx::{Document, Segment};
use crate::error::PipelineError;
use crate::job::{JobHandle, JobStatus};
use crate::translations::LanguagePair;

pub type StageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Turns a source file into a document the parser understands.
pub trait Converter: Send + Sync {
    fn convert<'a>(&'a self, source: &'a Path) -> StageFuture<'a, PathBuf>;
}

/// A pass over the segment list that fills in or revises `translated_text`.
///
/// Implementations may stop early when `job.is_cancelled()` turns true; the
/// pipeline discards their results in that case.
pub trait SegmentPass: Send + Sync {
    fn run<'a>(
        &'a self,
        job: &'a JobHandle,
        segments: &'a mut [Segment],
        languages: &'a LanguagePair,
    ) -> StageFuture<'a, ()>;
}

/// Stand-in for a disabled pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipPass;

impl SegmentPass for SkipPass {
    fn run<'a>(
        &'a self,
        _job: &'a JobHandle,
        _segments: &'a mut [Segment],
        _languages: &'a LanguagePair,
    ) -> StageFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

enum Flow {
    Completed { scratch: Vec<PathBuf> },
    Cancelled,
}

/// Drives one job from upload to packaged output.
#[derive(Clone)]
pub struct Pipeline {
    converter: Arc<dyn Converter>,
    translator: Arc<dyn SegmentPass>,
    reviewer: Arc<dyn SegmentPass>,
    work_dir: PathBuf,
    remove_input: bool,
    #[cfg(test)]
    on_parsed: Option<Arc<dyn Fn(&JobHandle) + Send + Sync>>,
}

impl Pipeline {
    pub fn new(
        converter: Arc<dyn Converter>,
        translator: Arc<dyn SegmentPass>,
        reviewer: Arc<dyn SegmentPass>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            converter,
            translator,
            reviewer,
            work_dir: work_dir.into(),
            remove_input: true,
            #[cfg(test)]
            on_parsed: None,
        }
    }

    #[cfg(test)]
    fn on_parsed(mut self, hook: impl Fn(&JobHandle) + Send + Sync + 'static) -> Self {
        self.on_parsed = Some(Arc::new(hook));
        self
    }

    /// Keep the input file after a successful run (default: remove it).
    pub fn keep_input(mut self) -> Self {
        self.remove_input = false;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// `<work_dir>/<job id>/<input stem>.<target>.docx`. Both name parts are
    /// reduced to a single path component.
    pub fn output_path(&self, job: &JobHandle, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let target = sanitize_file_name(job.languages().target.trim());
        self.work_dir
            .join(sanitize_file_name(job.id()))
            .join(format!("{}.{}.docx", sanitize_file_name(&stem), target))
    }

    /// Runs every stage against `job`. All outcomes are recorded on the job;
    /// nothing is returned.
    pub async fn run(&self, job: &JobHandle, input: &Path) {
        match self.execute(job, input).await {
            Ok(Flow::Completed { scratch }) => {
                info!(job = %job.id(), "job finished");
                let mut removable = scratch;
                if self.remove_input {
                    removable.push(input.to_path_buf());
                }
                cleanup(&removable).await;
            }
            Ok(Flow::Cancelled) => {
                info!(job = %job.id(), "job cancelled");
                self.settle_cancelled(job);
            }
            Err(err) if job.is_cancelled() => {
                debug!(job = %job.id(), "ignoring failure after cancellation: {:#}", err);
                self.settle_cancelled(job);
            }
            Err(err) => {
                warn!(job = %job.id(), "job failed: {:#}", err);
                if let Err(state) = job.fail(format!("{:#}", err)) {
                    warn!(job = %job.id(), "could not record failure: {}", state);
                }
            }
        }
    }

    fn settle_cancelled(&self, job: &JobHandle) {
        if let Err(state) = job.mark_cancelled() {
            debug!(job = %job.id(), "cancellation not recorded: {}", state);
        }
    }

    fn cancelled(&self, job: &JobHandle, checkpoint: &str) -> bool {
        let cancelled = job.is_cancelled();
        if cancelled {
            info!(job = %job.id(), "cancellation observed {}", checkpoint);
        }
        cancelled
    }

    async fn execute(&self, job: &JobHandle, input: &Path) -> Result<Flow> {
        let languages = job.languages().clone();
        let mut scratch = Vec::new();
        if self.cancelled(job, "before start") {
            return Ok(Flow::Cancelled);
        }
        languages.validate()?;

        let docx_path = if SourceKind::from_path(input) == Some(SourceKind::Pdf) {
            job.transition(JobStatus::Converting, 5, "Converting PDF to DOCX")?;
            info!(job = %job.id(), "stage: converting");
            let converted = self
                .converter
                .convert(input)
                .await
                .with_context(|| format!("failed to convert {}", display_name(input)))?;
            scratch.push(converted.clone());
            if self.cancelled(job, "after conversion") {
                return Ok(Flow::Cancelled);
            }
            converted
        } else {
            input.to_path_buf()
        };

        job.transition(JobStatus::ParsingDocx, 10, "Reading document")?;
        info!(job = %job.id(), "stage: parsing");
        let bytes = tokio::fs::read(&docx_path)
            .await
            .map_err(|err| PipelineError::io(format!("failed to read {}", docx_path.display()), err))?;
        let (mut document, mut segments) = Document::parse(bytes)?;
        job.set_total_segments(segments.len());
        job.set_progress(15, format!("Found {} paragraphs", segments.len()));
        #[cfg(test)]
        if let Some(hook) = &self.on_parsed {
            hook(job);
        }
        if self.cancelled(job, "after parsing") {
            return Ok(Flow::Cancelled);
        }

        job.transition(JobStatus::Translating, 20, "Translating")?;
        info!(job = %job.id(), segments = segments.len(), "stage: translating");
        self.translator
            .run(job, &mut segments, &languages)
            .await
            .context("translation failed")?;
        if self.cancelled(job, "after translation") {
            return Ok(Flow::Cancelled);
        }

        job.transition(JobStatus::Qa, 90, "Reviewing translation")?;
        info!(job = %job.id(), "stage: qa");
        self.reviewer
            .run(job, &mut segments, &languages)
            .await
            .context("quality review failed")?;
        if self.cancelled(job, "after review") {
            return Ok(Flow::Cancelled);
        }

        job.transition(JobStatus::Packing, 95, "Packing document")?;
        info!(job = %job.id(), "stage: packing");
        let output = document.write(&segments)?;
        if self.cancelled(job, "before saving") {
            return Ok(Flow::Cancelled);
        }
        let output_path = self.output_path(job, input);
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| PipelineError::io("failed to create output directory", err))?;
        }
        tokio::fs::write(&output_path, output)
            .await
            .map_err(|err| PipelineError::io(format!("failed to write {}", output_path.display()), err))?;

        let translated = segments.iter().filter(|segment| segment.is_translated()).count();
        job.complete(&output_path, translated)?;
        Ok(Flow::Completed { scratch })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn cleanup(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = tokio::fs::remove_file(path).await {
            debug!("failed to remove {}: {}", path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::fixtures::{docx, entry};
    use crate::docx::BODY_PART;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BODY: &str = r#"<w:p><w:r><w:t>Hello world.</w:t></w:r></w:p><w:p><w:r><w:t xml:space="preserve">  </w:t></w:r></w:p><w:p><w:r><w:t>Second.</w:t></w:r></w:p>"#;

    /// Uppercases every segment; optionally cancels the job or fails.
    #[derive(Default)]
    struct FakeTranslator {
        calls: AtomicUsize,
        cancel: bool,
        fail: bool,
    }

    impl SegmentPass for FakeTranslator {
        fn run<'a>(
            &'a self,
            job: &'a JobHandle,
            segments: &'a mut [Segment],
            _languages: &'a LanguagePair,
        ) -> StageFuture<'a, ()> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                for segment in segments.iter_mut() {
                    segment.translated_text = Some(segment.source_text.to_uppercase());
                }
                if self.cancel {
                    job.request_cancel();
                }
                if self.fail {
                    return Err(anyhow!("provider unavailable"));
                }
                Ok(())
            })
        }
    }

    struct FakeConverter {
        cancel_job: Option<Arc<JobHandle>>,
    }

    impl Converter for FakeConverter {
        fn convert<'a>(&'a self, source: &'a Path) -> StageFuture<'a, PathBuf> {
            Box::pin(async move {
                let target = source.with_extension("converted.docx");
                tokio::fs::write(&target, docx(BODY)).await?;
                if let Some(job) = &self.cancel_job {
                    job.request_cancel();
                }
                Ok(target)
            })
        }
    }

    struct FailingConverter;

    impl Converter for FailingConverter {
        fn convert<'a>(&'a self, _source: &'a Path) -> StageFuture<'a, PathBuf> {
            Box::pin(async {
                Err(PipelineError::ConversionFailed {
                    message: "soffice exited with 1".to_string(),
                }
                .into())
            })
        }
    }

    fn job() -> Arc<JobHandle> {
        Arc::new(JobHandle::new("job-1", "memo.docx", LanguagePair::new("en", "de")))
    }

    fn pipeline(
        dir: &Path,
        converter: Arc<dyn Converter>,
        translator: Arc<dyn SegmentPass>,
    ) -> Pipeline {
        Pipeline::new(converter, translator, Arc::new(SkipPass), dir.join("out"))
    }

    fn write_input(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).expect("write input");
        path
    }

    #[tokio::test]
    async fn docx_job_runs_to_done() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "memo.docx", &docx(BODY));
        let job = job();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FailingConverter),
            Arc::new(FakeTranslator::default()),
        );

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Done);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.total_segments, 2);
        assert_eq!(snapshot.translated_segments, 2);
        let output = PathBuf::from(snapshot.output_path.expect("output path"));
        assert!(output.ends_with("job-1/memo.de.docx"));
        let body = String::from_utf8(entry(&std::fs::read(&output).expect("output"), BODY_PART))
            .expect("utf8");
        assert!(body.contains("<w:t>HELLO WORLD.</w:t>"));
        assert!(body.contains("<w:t>SECOND.</w:t>"));
        assert!(!input.exists(), "input is cleaned up");
    }

    #[tokio::test]
    async fn pdf_input_is_converted_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "scan.pdf", b"%PDF-1.4");
        let job = job();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FakeConverter { cancel_job: None }),
            Arc::new(FakeTranslator::default()),
        )
        .keep_input();

        pipeline.run(&job, &input).await;

        assert_eq!(job.status(), JobStatus::Done);
        assert!(input.exists());
        assert!(!dir.path().join("scan.converted.docx").exists());
    }

    #[tokio::test]
    async fn cancellation_after_conversion_stops_before_parsing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "scan.pdf", b"%PDF-1.4");
        let job = job();
        let translator = Arc::new(FakeTranslator::default());
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FakeConverter {
                cancel_job: Some(job.clone()),
            }),
            translator.clone(),
        );

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(snapshot.progress, 5);
        assert_eq!(snapshot.total_segments, 0);
        assert!(snapshot.error_message.is_none());
        assert!(snapshot.output_path.is_none());
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_after_parsing_skips_translation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "memo.docx", &docx(BODY));
        let job = job();
        let translator = Arc::new(FakeTranslator::default());
        let pipeline = pipeline(dir.path(), Arc::new(FailingConverter), translator.clone())
            .on_parsed(|job| {
                job.request_cancel();
            });

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert_eq!(snapshot.progress, 15);
        assert_eq!(snapshot.total_segments, 2);
        assert_eq!(snapshot.translated_segments, 0);
        assert!(snapshot.error_message.is_none());
        assert!(snapshot.output_path.is_none());
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
        assert!(!pipeline.output_path(&job, &input).exists());
        assert!(!dir.path().join("out").exists());
        assert!(input.exists());
    }

    #[tokio::test]
    async fn cancellation_during_translation_discards_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "memo.docx", &docx(BODY));
        let job = job();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FailingConverter),
            Arc::new(FakeTranslator {
                cancel: true,
                ..FakeTranslator::default()
            }),
        );

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert!(snapshot.output_path.is_none());
        assert!(!pipeline.output_path(&job, &input).exists());
        assert!(input.exists(), "cancelled jobs keep their input");
    }

    #[tokio::test]
    async fn failure_after_cancellation_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "memo.docx", &docx(BODY));
        let job = job();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FailingConverter),
            Arc::new(FakeTranslator {
                cancel: true,
                fail: true,
                ..FakeTranslator::default()
            }),
        );

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Cancelled);
        assert!(snapshot.error_message.is_none());
    }

    #[tokio::test]
    async fn translation_failure_becomes_error_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "memo.docx", &docx(BODY));
        let job = job();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FailingConverter),
            Arc::new(FakeTranslator {
                fail: true,
                ..FakeTranslator::default()
            }),
        );

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Error);
        assert_eq!(
            snapshot.error_message.as_deref(),
            Some("translation failed: provider unavailable")
        );
        assert!(snapshot.finished_at.is_some());
        assert!(snapshot.output_path.is_none());
    }

    #[tokio::test]
    async fn conversion_failure_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "scan.pdf", b"%PDF-1.4");
        let job = job();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FailingConverter),
            Arc::new(FakeTranslator::default()),
        );

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Error);
        assert_eq!(
            snapshot.error_message.as_deref(),
            Some("failed to convert scan.pdf: conversion failed: soffice exited with 1")
        );
    }

    #[tokio::test]
    async fn broken_archive_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "memo.docx", b"not a zip");
        let job = job();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FailingConverter),
            Arc::new(FakeTranslator::default()),
        );

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Error);
        let message = snapshot.error_message.expect("message");
        assert!(message.starts_with("failed to open document archive"));
    }

    #[test]
    fn output_path_stays_inside_the_job_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = pipeline(
            dir.path(),
            Arc::new(FailingConverter),
            Arc::new(FakeTranslator::default()),
        );
        let job = JobHandle::new(
            "job-1",
            "memo.docx",
            LanguagePair::new("en", "x/../../../escaped"),
        );
        let output = pipeline.output_path(&job, Path::new("/uploads/memo.docx"));
        assert_eq!(output, dir.path().join("out/job-1/memo.escaped.docx"));
    }

    #[tokio::test]
    async fn target_that_is_not_a_language_tag_fails_without_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let jobs = dir.path().join("jobs");
        std::fs::create_dir_all(&jobs).expect("jobs dir");
        let input = write_input(&jobs, "memo.docx", &docx(BODY));
        let job = Arc::new(JobHandle::new(
            "job-1",
            "memo.docx",
            LanguagePair::new("en", "x/../../../escaped"),
        ));
        let translator = Arc::new(FakeTranslator::default());
        let pipeline = Pipeline::new(
            Arc::new(FailingConverter),
            translator.clone(),
            Arc::new(SkipPass),
            &jobs,
        );

        pipeline.run(&job, &input).await;

        let snapshot = job.snapshot();
        assert_eq!(snapshot.status, JobStatus::Error);
        let message = snapshot.error_message.expect("message");
        assert!(message.contains("not a language tag"), "{}", message);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("escaped.docx").exists());
        assert!(!jobs.join("job-1").exists());
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = write_input(dir.path(), "memo.docx", &docx(BODY));
        let job = job();
        job.request_cancel();
        let translator = Arc::new(FakeTranslator::default());
        let pipeline = pipeline(dir.path(), Arc::new(FailingConverter), translator.clone());

        pipeline.run(&job, &input).await;

        assert_eq!(job.status(), JobStatus::Cancelled);
        assert_eq!(job.job().progress, 0);
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
    }
}

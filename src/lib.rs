use std::sync::Arc;

pub mod convert;
pub mod data;
pub mod docx;
pub mod error;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod settings;
pub mod translations;
pub mod translator;

pub use convert::SofficeConverter;
pub use docx::{Document, Segment};
pub use error::{DocumentError, PipelineError};
pub use job::{JobHandle, JobRegistry, JobSnapshot, JobStatus, TokenUsage};
pub use pipeline::{Converter, Pipeline, SegmentPass, SkipPass, StageFuture};
pub use providers::{OpenAI, Provider, ProviderUsage};
pub use settings::Settings;
pub use translations::LanguagePair;
pub use translator::{LlmReviewer, LlmTranslator};

/// Wires the production collaborators: LibreOffice for conversion and an
/// OpenAI-compatible model for translation and review.
pub fn build_pipeline(settings: &Settings, key: String) -> Pipeline {
    let provider = OpenAI::new(key).with_model(settings.model.clone());
    let reviewer: Arc<dyn SegmentPass> = if settings.qa {
        Arc::new(LlmReviewer::new(
            provider.clone(),
            settings.batch_chars,
            settings.pricing,
        ))
    } else {
        Arc::new(SkipPass)
    };
    let translator = LlmTranslator::new(provider, settings.batch_chars, settings.pricing);
    Pipeline::new(
        Arc::new(SofficeConverter::new(settings.converter_command.clone())),
        Arc::new(translator),
        reviewer,
        settings.work_dir.clone(),
    )
}

/// Human-readable report of a job, printed by the CLI after a run.
pub fn format_summary(snapshot: &JobSnapshot) -> String {
    let mut lines = vec![format!("status: {}", snapshot.status.as_str())];
    if let Some(path) = snapshot.output_path.as_deref() {
        lines.push(format!("output: {}", path));
    }
    if let Some(message) = snapshot.error_message.as_deref() {
        lines.push(format!("error: {}", message));
    }
    lines.push(format!(
        "paragraphs: {}/{} translated",
        snapshot.translated_segments, snapshot.total_segments
    ));
    lines.push(format!(
        "tokens: prompt={} completion={} total={}",
        snapshot.usage.prompt_tokens, snapshot.usage.completion_tokens, snapshot.usage.total_tokens
    ));
    lines.push(format!("cost: ${:.6}", snapshot.cost_usd));
    lines.join("\n")
}

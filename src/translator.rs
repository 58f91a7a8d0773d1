use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::docx::Segment;
use crate::job::{JobHandle, TokenUsage};
use crate::pipeline::{SegmentPass, StageFuture};
use crate::providers::{Provider, ProviderUsage};
use crate::settings::Pricing;
use crate::translations::{
    self, LanguagePair, REVIEW_TOOL, ReviewItem, TRANSLATE_TOOL, TranslateItem,
};

/// Translates segments in batches through a tool-calling chat model.
#[derive(Debug, Clone)]
pub struct LlmTranslator<P: Provider> {
    provider: P,
    batch_chars: usize,
    pricing: Pricing,
}

impl<P: Provider> LlmTranslator<P> {
    pub fn new(provider: P, batch_chars: usize, pricing: Pricing) -> Self {
        Self {
            provider,
            batch_chars: batch_chars.max(1),
            pricing,
        }
    }
}

impl<P: Provider> SegmentPass for LlmTranslator<P> {
    fn run<'a>(
        &'a self,
        job: &'a JobHandle,
        segments: &'a mut [Segment],
        languages: &'a LanguagePair,
    ) -> StageFuture<'a, ()> {
        Box::pin(async move {
            let pending = (0..segments.len()).collect::<Vec<_>>();
            let client = BatchClient {
                provider: &self.provider,
                batch_chars: self.batch_chars,
                pricing: self.pricing,
            };
            client
                .translate(job, segments, pending, languages, true)
                .await
        })
    }
}

/// Second pass: fills translation gaps once, then asks the model to flag and
/// correct bad translations.
#[derive(Debug, Clone)]
pub struct LlmReviewer<P: Provider> {
    provider: P,
    batch_chars: usize,
    pricing: Pricing,
}

impl<P: Provider> LlmReviewer<P> {
    pub fn new(provider: P, batch_chars: usize, pricing: Pricing) -> Self {
        Self {
            provider,
            batch_chars: batch_chars.max(1),
            pricing,
        }
    }
}

impl<P: Provider> SegmentPass for LlmReviewer<P> {
    fn run<'a>(
        &'a self,
        job: &'a JobHandle,
        segments: &'a mut [Segment],
        languages: &'a LanguagePair,
    ) -> StageFuture<'a, ()> {
        Box::pin(async move {
            let client = BatchClient {
                provider: &self.provider,
                batch_chars: self.batch_chars,
                pricing: self.pricing,
            };
            let missing = segments
                .iter()
                .enumerate()
                .filter(|(_, segment)| !segment.is_translated())
                .map(|(index, _)| index)
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                info!(job = %job.id(), missing = missing.len(), "retrying untranslated segments");
                client
                    .translate(job, segments, missing, languages, false)
                    .await?;
            }
            client.review(job, segments, languages).await
        })
    }
}

struct BatchClient<'p, P: Provider> {
    provider: &'p P,
    batch_chars: usize,
    pricing: Pricing,
}

impl<P: Provider> BatchClient<'_, P> {
    async fn translate(
        &self,
        job: &JobHandle,
        segments: &mut [Segment],
        indices: Vec<usize>,
        languages: &LanguagePair,
        report_progress: bool,
    ) -> Result<()> {
        let file_name = job.job().file_name;
        let prompt = translations::render_translate_prompt(languages, Some(&file_name))?;
        let total = indices.len();
        let batches = plan_batches(
            indices
                .into_iter()
                .map(|index| (index, segments[index].source_text.chars().count())),
            self.batch_chars,
        );
        debug!(job = %job.id(), batches = batches.len(), "translation batches planned");

        let mut done = 0usize;
        for batch in batches {
            if job.is_cancelled() {
                debug!(job = %job.id(), "stopping translation early");
                return Ok(());
            }
            let input = {
                let items = batch
                    .iter()
                    .map(|&index| TranslateItem {
                        id: segments[index].id,
                        text: &segments[index].source_text,
                    })
                    .collect::<Vec<_>>();
                serde_json::to_string(&items)?
            };
            let response = self
                .provider
                .clone()
                .register_tool(translations::translate_tool_spec())
                .append_system_input(prompt.clone())
                .append_user_input(input)
                .call_tool(TRANSLATE_TOOL)
                .await
                .with_context(|| format!("provider call failed for {} paragraphs", batch.len()))?;
            record_usage(job, &self.pricing, response.usage.as_ref());

            let by_id = positions(segments, &batch);
            let mut applied = 0usize;
            for item in translations::parse_translations(response.args)? {
                match by_id.get(&item.id) {
                    Some(&index) if !item.text.trim().is_empty() => {
                        segments[index].translated_text = Some(item.text);
                        applied += 1;
                    }
                    Some(_) => {}
                    None => debug!(job = %job.id(), id = item.id, "ignoring unknown segment id"),
                }
            }
            if applied < batch.len() {
                warn!(
                    job = %job.id(),
                    "{} of {} paragraphs came back without a translation",
                    batch.len() - applied,
                    batch.len()
                );
            }

            done += batch.len();
            if report_progress {
                job.report_translation_progress(done, total);
            }
        }
        Ok(())
    }

    async fn review(
        &self,
        job: &JobHandle,
        segments: &mut [Segment],
        languages: &LanguagePair,
    ) -> Result<()> {
        let prompt = translations::render_review_prompt(languages)?;
        let batches = plan_batches(
            segments.iter().enumerate().filter_map(|(index, segment)| {
                segment.translated_text.as_ref().map(|translation| {
                    (
                        index,
                        segment.source_text.chars().count() + translation.chars().count(),
                    )
                })
            }),
            self.batch_chars,
        );

        let mut corrected = 0usize;
        for batch in batches {
            if job.is_cancelled() {
                debug!(job = %job.id(), "stopping review early");
                return Ok(());
            }
            let input = {
                let items = batch
                    .iter()
                    .map(|&index| ReviewItem {
                        id: segments[index].id,
                        source: &segments[index].source_text,
                        translation: segments[index].translated_text.as_deref().unwrap_or_default(),
                    })
                    .collect::<Vec<_>>();
                serde_json::to_string(&items)?
            };
            let response = self
                .provider
                .clone()
                .register_tool(translations::review_tool_spec())
                .append_system_input(prompt.clone())
                .append_user_input(input)
                .call_tool(REVIEW_TOOL)
                .await
                .with_context(|| format!("review call failed for {} paragraphs", batch.len()))?;
            record_usage(job, &self.pricing, response.usage.as_ref());

            let by_id = positions(segments, &batch);
            for correction in translations::parse_corrections(response.args)? {
                if let Some(&index) = by_id.get(&correction.id) {
                    debug!(job = %job.id(), id = correction.id, reason = %correction.reason, "correction applied");
                    segments[index].translated_text = Some(correction.text);
                    corrected += 1;
                }
            }
        }
        info!(job = %job.id(), corrected, "review finished");
        Ok(())
    }
}

/// Maps segment ids in `batch` to their slice positions.
fn positions(segments: &[Segment], batch: &[usize]) -> HashMap<usize, usize> {
    batch
        .iter()
        .map(|&index| (segments[index].id, index))
        .collect()
}

/// Groups `(index, size)` pairs into consecutive batches no larger than
/// `limit`. An item larger than `limit` gets a batch of its own.
fn plan_batches(items: impl IntoIterator<Item = (usize, usize)>, limit: usize) -> Vec<Vec<usize>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = 0usize;
    for (index, chars) in items {
        if !current.is_empty() && size + chars > limit {
            batches.push(std::mem::take(&mut current));
            size = 0;
        }
        current.push(index);
        size += chars;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn record_usage(job: &JobHandle, pricing: &Pricing, usage: Option<&ProviderUsage>) {
    let Some(usage) = usage else {
        return;
    };
    let prompt_tokens = usage.prompt_tokens.unwrap_or(0);
    let completion_tokens = usage.completion_tokens.unwrap_or(0);
    let total_tokens = usage
        .total_tokens
        .unwrap_or(prompt_tokens + completion_tokens);
    job.record_usage(
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        },
        pricing.cost(prompt_tokens, completion_tokens),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderFuture, ProviderResponse, ToolSpec};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct TestProvider {
        last_user_input: Option<String>,
        calls: Arc<Mutex<Vec<(String, String)>>>,
        drop_ids: Vec<u64>,
        corrections: Value,
        cancel: Option<Arc<JobHandle>>,
    }

    impl TestProvider {
        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().expect("calls").clone()
        }
    }

    impl Provider for TestProvider {
        fn append_system_input(self, _input: String) -> Self {
            self
        }

        fn append_user_input(mut self, input: String) -> Self {
            self.last_user_input = Some(input);
            self
        }

        fn register_tool(self, _tool: ToolSpec) -> Self {
            self
        }

        fn call_tool(self, tool_name: &str) -> ProviderFuture {
            let input = self.last_user_input.clone().unwrap_or_default();
            self.calls
                .lock()
                .expect("calls")
                .push((tool_name.to_string(), input.clone()));
            if let Some(job) = &self.cancel {
                job.request_cancel();
            }
            let items: Vec<Value> = serde_json::from_str(&input).expect("json input");
            let args = if tool_name == TRANSLATE_TOOL {
                let translations = items
                    .iter()
                    .filter(|item| !self.drop_ids.contains(&item["id"].as_u64().unwrap_or(0)))
                    .map(|item| {
                        json!({
                            "id": item["id"],
                            "text": format!("T:{}", item["text"].as_str().unwrap_or_default())
                        })
                    })
                    .chain(std::iter::once(json!({"id": 999, "text": "stray"})))
                    .collect::<Vec<_>>();
                json!({ "translations": translations })
            } else {
                json!({ "corrections": self.corrections.clone() })
            };
            let response = ProviderResponse {
                args,
                model: Some("test".to_string()),
                usage: Some(ProviderUsage {
                    prompt_tokens: Some(100),
                    completion_tokens: Some(20),
                    total_tokens: None,
                }),
            };
            Box::pin(async move { Ok(response) })
        }
    }

    fn segments(texts: &[&str]) -> Vec<Segment> {
        texts
            .iter()
            .enumerate()
            .map(|(id, text)| Segment::new(id, text.to_string(), Vec::new()))
            .collect()
    }

    fn job() -> Arc<JobHandle> {
        Arc::new(JobHandle::new("job-1", "memo.docx", LanguagePair::new("en", "de")))
    }

    fn pricing() -> Pricing {
        Pricing {
            prompt_per_million: 1.0,
            completion_per_million: 2.0,
        }
    }

    fn translations(segments: &[Segment]) -> Vec<Option<&str>> {
        segments
            .iter()
            .map(|segment| segment.translated_text.as_deref())
            .collect()
    }

    #[test]
    fn batches_respect_the_char_limit() {
        let batches = plan_batches([(0, 5), (1, 4), (2, 5), (3, 20), (4, 1)], 9);
        assert_eq!(batches, vec![vec![0, 1], vec![2], vec![3], vec![4]]);
        assert!(plan_batches(std::iter::empty(), 9).is_empty());
    }

    #[tokio::test]
    async fn every_segment_is_translated_in_batches() {
        let provider = TestProvider::default();
        let translator = LlmTranslator::new(provider.clone(), 9, pricing());
        let job = job();
        let mut segments = segments(&["Alpha", "Beta", "Gamma"]);

        translator
            .run(&job, &mut segments, &LanguagePair::new("en", "de"))
            .await
            .expect("translate");

        assert_eq!(
            translations(&segments),
            vec![Some("T:Alpha"), Some("T:Beta"), Some("T:Gamma")]
        );
        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, r#"[{"id":0,"text":"Alpha"},{"id":1,"text":"Beta"}]"#);

        let snapshot = job.snapshot();
        assert_eq!(snapshot.progress, 90);
        assert_eq!(snapshot.usage.prompt_tokens, 200);
        assert_eq!(snapshot.usage.total_tokens, 240);
        assert!((snapshot.cost_usd - 0.00028).abs() < 1e-12);
    }

    #[tokio::test]
    async fn missing_ids_stay_untranslated() {
        let provider = TestProvider {
            drop_ids: vec![1],
            ..TestProvider::default()
        };
        let translator = LlmTranslator::new(provider, 6000, pricing());
        let mut segments = segments(&["One", "Two"]);

        translator
            .run(&job(), &mut segments, &LanguagePair::new("en", "de"))
            .await
            .expect("translate");

        assert_eq!(translations(&segments), vec![Some("T:One"), None]);
    }

    #[tokio::test]
    async fn cancellation_stops_after_the_current_batch() {
        let job = job();
        let provider = TestProvider {
            cancel: Some(job.clone()),
            ..TestProvider::default()
        };
        let translator = LlmTranslator::new(provider.clone(), 3, pricing());
        let mut segments = segments(&["One", "Two", "Six"]);

        translator
            .run(&job, &mut segments, &LanguagePair::new("en", "de"))
            .await
            .expect("translate");

        assert_eq!(provider.calls().len(), 1);
        assert_eq!(translations(&segments), vec![Some("T:One"), None, None]);
    }

    #[tokio::test]
    async fn review_fills_gaps_and_applies_corrections() {
        let provider = TestProvider {
            corrections: json!([
                {"id": 0, "text": "Eins", "reason": "wrong language"},
                {"id": 2, "text": " ", "reason": "blank"}
            ]),
            ..TestProvider::default()
        };
        let reviewer = LlmReviewer::new(provider.clone(), 6000, pricing());
        let job = job();
        let mut segments = segments(&["One", "Two", "Three"]);
        segments[0].translated_text = Some("One".to_string());
        segments[2].translated_text = Some("Drei".to_string());

        reviewer
            .run(&job, &mut segments, &LanguagePair::new("en", "de"))
            .await
            .expect("review");

        assert_eq!(
            translations(&segments),
            vec![Some("Eins"), Some("T:Two"), Some("Drei")]
        );
        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, TRANSLATE_TOOL);
        assert_eq!(calls[0].1, r#"[{"id":1,"text":"Two"}]"#);
        assert_eq!(calls[1].0, REVIEW_TOOL);
        assert!(calls[1].1.contains(r#""translation":"T:Two""#));
        assert_eq!(job.snapshot().usage.total_tokens, 240);
    }
}

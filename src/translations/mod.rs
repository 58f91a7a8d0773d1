use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tera::{Context as TeraContext, Tera};

use crate::providers::ToolSpec;

pub const TRANSLATE_TOOL: &str = "deliver_translations";
pub const REVIEW_TOOL: &str = "deliver_review";

const TRANSLATE_PROMPT: &str = include_str!("prompts/translate.tera");
const REVIEW_PROMPT: &str = include_str!("prompts/review.tera");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(anyhow!("source language is empty"));
        }
        if self.target.trim().is_empty() {
            return Err(anyhow!("target language is empty"));
        }
        if self.target.trim().eq_ignore_ascii_case("auto") {
            return Err(anyhow!("target language cannot be 'auto'"));
        }
        for (side, value) in [("source", &self.source), ("target", &self.target)] {
            if !is_language_tag(value.trim()) {
                return Err(anyhow!("{} language '{}' is not a language tag", side, value));
            }
        }
        Ok(())
    }
}

// Letters, digits, `-` and `_` only: `en`, `zh-TW`, `pt_BR`. The target ends
// up in the output file name.
fn is_language_tag(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslateItem<'a> {
    pub id: usize,
    pub text: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem<'a> {
    pub id: usize,
    pub source: &'a str,
    pub translation: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TranslatedItem {
    pub id: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Correction {
    pub id: usize,
    pub text: String,
    #[serde(default)]
    pub reason: String,
}

pub fn translate_tool_spec() -> ToolSpec {
    ToolSpec {
        name: TRANSLATE_TOOL.to_string(),
        description: "Return the translated paragraphs keyed by id.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "translations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "integer"},
                            "text": {"type": "string"}
                        },
                        "required": ["id", "text"]
                    }
                }
            },
            "required": ["translations"]
        }),
    }
}

pub fn review_tool_spec() -> ToolSpec {
    ToolSpec {
        name: REVIEW_TOOL.to_string(),
        description: "Return corrected paragraphs keyed by id. Omit correct ones.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "corrections": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "integer"},
                            "text": {"type": "string"},
                            "reason": {"type": "string"}
                        },
                        "required": ["id", "text", "reason"]
                    }
                }
            },
            "required": ["corrections"]
        }),
    }
}

pub fn render_translate_prompt(languages: &LanguagePair, context: Option<&str>) -> Result<String> {
    let mut ctx = prompt_context(languages, TRANSLATE_TOOL);
    ctx.insert("context", &context.filter(|value| !value.trim().is_empty()));
    Tera::one_off(TRANSLATE_PROMPT, &ctx, false)
        .with_context(|| "failed to render translation prompt")
}

pub fn render_review_prompt(languages: &LanguagePair) -> Result<String> {
    let ctx = prompt_context(languages, REVIEW_TOOL);
    Tera::one_off(REVIEW_PROMPT, &ctx, false).with_context(|| "failed to render review prompt")
}

fn prompt_context(languages: &LanguagePair, tool_name: &str) -> TeraContext {
    let mut ctx = TeraContext::new();
    ctx.insert("source_lang", languages.source.trim());
    ctx.insert("target_lang", languages.target.trim());
    ctx.insert("tool_name", tool_name);
    ctx
}

pub fn parse_translations(value: Value) -> Result<Vec<TranslatedItem>> {
    #[derive(Deserialize)]
    struct Args {
        translations: Vec<TranslatedItem>,
    }
    let args: Args =
        serde_json::from_value(value).with_context(|| "invalid translation tool arguments")?;
    Ok(args.translations)
}

pub fn parse_corrections(value: Value) -> Result<Vec<Correction>> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        corrections: Vec<Correction>,
    }
    let args: Args =
        serde_json::from_value(value).with_context(|| "invalid review tool arguments")?;
    Ok(args
        .corrections
        .into_iter()
        .filter(|correction| !correction.text.trim().is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_prompt_names_both_languages() {
        let prompt =
            render_translate_prompt(&LanguagePair::new("en", "ja"), Some("Q3 report.docx"))
                .expect("prompt");
        assert!(prompt.contains("from en into ja"));
        assert!(prompt.contains("Q3 report.docx"));
        assert!(prompt.contains(TRANSLATE_TOOL));
    }

    #[test]
    fn auto_source_is_not_mentioned() {
        let prompt =
            render_translate_prompt(&LanguagePair::new("auto", "de"), None).expect("prompt");
        assert!(prompt.starts_with("You translate paragraphs of a business document into de."));
        assert!(!prompt.contains("Document context"));
    }

    #[test]
    fn review_prompt_renders() {
        let prompt = render_review_prompt(&LanguagePair::new("en", "fr")).expect("prompt");
        assert!(prompt.contains("not written in fr"));
        assert!(prompt.contains(REVIEW_TOOL));
    }

    #[test]
    fn translations_are_parsed() {
        let items = parse_translations(json!({
            "translations": [{"id": 0, "text": "Hallo"}, {"id": 2, "text": "Welt"}]
        }))
        .expect("parse");
        assert_eq!(
            items,
            vec![
                TranslatedItem { id: 0, text: "Hallo".to_string() },
                TranslatedItem { id: 2, text: "Welt".to_string() },
            ]
        );
    }

    #[test]
    fn malformed_translations_are_rejected() {
        assert!(parse_translations(json!({"translation": "Hallo"})).is_err());
    }

    #[test]
    fn blank_corrections_are_dropped() {
        let items = parse_corrections(json!({
            "corrections": [
                {"id": 1, "text": "  ", "reason": "empty"},
                {"id": 3, "text": "Bonjour", "reason": "wrong language"}
            ]
        }))
        .expect("parse");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, 3);
        assert!(parse_corrections(json!({})).expect("empty").is_empty());
    }

    #[test]
    fn language_pair_validation() {
        assert!(LanguagePair::new("auto", "en").validate().is_ok());
        assert!(LanguagePair::new("en", "auto").validate().is_err());
        assert!(LanguagePair::new("", "en").validate().is_err());
        assert!(LanguagePair::new("en", "zh-TW").validate().is_ok());
        assert!(LanguagePair::new("pt_BR", " ja ").validate().is_ok());
    }

    #[test]
    fn language_tags_cannot_carry_paths() {
        for target in ["x/../../../escaped", "..", r"..\up", "en us", "de.docx"] {
            let err = LanguagePair::new("en", target)
                .validate()
                .expect_err(target);
            assert!(err.to_string().contains("not a language tag"), "{}", err);
        }
        assert!(LanguagePair::new("../en", "de").validate().is_err());
    }
}

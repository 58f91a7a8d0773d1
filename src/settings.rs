use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::translations::LanguagePair;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");
const BASE_DIR_ENV: &str = "LLM_DOC_TRANSLATOR_DIR";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub languages: LanguagePair,
    pub model: String,
    pub batch_chars: usize,
    pub qa: bool,
    pub pricing: Pricing,
    pub converter_command: String,
    pub server_addr: String,
    pub work_dir: PathBuf,
    pub retention: Duration,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pricing {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.prompt_per_million
            + completion_tokens as f64 * self.completion_per_million)
            / 1_000_000.0
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            languages: LanguagePair::new("auto", "en"),
            model: String::new(),
            batch_chars: 6000,
            qa: true,
            pricing: Pricing::default(),
            converter_command: "soffice".to_string(),
            server_addr: "127.0.0.1:8787".to_string(),
            work_dir: PathBuf::from(".llm-doc-translator/jobs"),
            retention: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    languages: Option<LanguageSettings>,
    translation: Option<TranslationSettings>,
    pricing: Option<PricingSettings>,
    converter: Option<ConverterSettings>,
    server: Option<ServerSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct LanguageSettings {
    source: Option<String>,
    target: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslationSettings {
    model: Option<String>,
    batch_chars: Option<usize>,
    qa: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct PricingSettings {
    prompt_per_million: Option<f64>,
    completion_per_million: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConverterSettings {
    command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSettings {
    addr: Option<String>,
    work_dir: Option<String>,
    retention_secs: Option<u64>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    settings.merge(parse_settings(DEFAULT_SETTINGS_TOML, Path::new("<embedded>"))?);

    let mut ordered_paths = vec![
        PathBuf::from("settings.toml"),
        PathBuf::from("settings.local.toml"),
    ];
    if let Some(dir) = settings_dir() {
        ordered_paths.push(dir.join("settings.toml"));
        ordered_paths.push(dir.join("settings.local.toml"));
    }
    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings.merge(parse_settings(&content, &path)?);
        }
    }

    Ok(settings)
}

fn parse_settings(content: &str, path: &Path) -> Result<SettingsFile> {
    toml::from_str(content).with_context(|| format!("failed to parse settings: {}", path.display()))
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(languages) = incoming.languages {
            if let Some(source) = non_empty(languages.source) {
                self.languages.source = source;
            }
            if let Some(target) = non_empty(languages.target) {
                self.languages.target = target;
            }
        }
        if let Some(translation) = incoming.translation {
            if let Some(model) = non_empty(translation.model) {
                self.model = model;
            }
            if let Some(limit) = translation.batch_chars.filter(|limit| *limit > 0) {
                self.batch_chars = limit;
            }
            if let Some(qa) = translation.qa {
                self.qa = qa;
            }
        }
        if let Some(pricing) = incoming.pricing {
            if let Some(value) = pricing.prompt_per_million.filter(|value| *value >= 0.0) {
                self.pricing.prompt_per_million = value;
            }
            if let Some(value) = pricing.completion_per_million.filter(|value| *value >= 0.0) {
                self.pricing.completion_per_million = value;
            }
        }
        if let Some(converter) = incoming.converter {
            if let Some(command) = non_empty(converter.command) {
                self.converter_command = command;
            }
        }
        if let Some(server) = incoming.server {
            if let Some(addr) = non_empty(server.addr) {
                self.server_addr = addr;
            }
            if let Some(dir) = non_empty(server.work_dir) {
                self.work_dir = PathBuf::from(dir);
            }
            if let Some(secs) = server.retention_secs.filter(|secs| *secs > 0) {
                self.retention = Duration::from_secs(secs);
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn settings_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var(BASE_DIR_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
    {
        return Some(PathBuf::from(dir.trim()));
    }
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".llm-doc-translator"))
        }
    })
}

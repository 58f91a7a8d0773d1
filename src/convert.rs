use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::pipeline::{Converter, StageFuture};

/// Converts PDF files to DOCX with a headless LibreOffice.
#[derive(Debug, Clone)]
pub struct SofficeConverter {
    command: String,
}

impl SofficeConverter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn run(&self, source: &Path) -> Result<PathBuf, PipelineError> {
        let parent = source.parent().unwrap_or_else(|| Path::new("."));
        let out_dir = std::path::absolute(parent.join("converted"))
            .map_err(|err| PipelineError::io("failed to resolve conversion directory", err))?;
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|err| PipelineError::io("failed to create conversion directory", err))?;
        // A private profile lets several conversions run at the same time.
        let profile = out_dir.join("profile");

        info!("converting {} with {}", source.display(), self.command);
        let output = Command::new(&self.command)
            .arg(format!("-env:UserInstallation=file://{}", profile.display()))
            .arg("--headless")
            .arg("--convert-to")
            .arg("docx")
            .arg("--outdir")
            .arg(&out_dir)
            .arg(source)
            .output()
            .await
            .map_err(|err| PipelineError::ConversionFailed {
                message: format!("failed to launch {}: {}", self.command, err),
            })?;
        debug!(
            "{} stdout: {}",
            self.command,
            String::from_utf8_lossy(&output.stdout).trim()
        );

        if !output.status.success() {
            return Err(PipelineError::ConversionFailed {
                message: format!(
                    "{} exited with {}: {}",
                    self.command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let target = converted_path(source, &out_dir);
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(PipelineError::ConversionFailed {
                message: format!("{} produced no output for {}", self.command, source.display()),
            });
        }
        Ok(target)
    }
}

fn converted_path(source: &Path, out_dir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    out_dir.join(format!("{}.docx", stem))
}

impl Converter for SofficeConverter {
    fn convert<'a>(&'a self, source: &'a Path) -> StageFuture<'a, PathBuf> {
        Box::pin(async move { Ok(self.run(source).await?) })
    }
}

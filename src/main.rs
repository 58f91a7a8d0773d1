use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use llm_doc_translator::data::SourceKind;
use llm_doc_translator::{JobHandle, JobStatus, LanguagePair, providers, settings};

#[derive(Parser, Debug)]
#[command(
    name = "llm-doc-translator",
    version,
    about = "Translate Word documents and PDFs with LLM tool calls, keeping the layout"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP job server
    Serve(ServeArgs),
    /// Translate one file in-process and print the result
    Translate(TranslateArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// API key (overrides OPENAI_API_KEY)
    #[arg(short = 'k', long = "key")]
    key: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "settings")]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on (default from settings [server] addr)
    #[arg(long = "addr")]
    addr: Option<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct TranslateArgs {
    /// Input file (.docx or .pdf)
    file: PathBuf,

    /// Source language. Use "auto" to detect.
    #[arg(short = 'L', long = "source-lang")]
    source_lang: Option<String>,

    /// Target language
    #[arg(short = 'l', long = "target-lang")]
    target_lang: Option<String>,

    /// Copy the translated document to this path
    #[arg(short = 'o', long = "out")]
    out: Option<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Translate(args) => translate(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    llm_doc_translator::logging::init(args.common.verbose)?;
    let mut settings = settings::load_settings(args.common.settings.as_deref())?;
    if let Some(addr) = args.addr.filter(|addr| !addr.trim().is_empty()) {
        settings.server_addr = addr;
    }
    let key = providers::resolve_key(args.common.key.as_deref())?;
    let pipeline = llm_doc_translator::build_pipeline(&settings, key);
    llm_doc_translator::server::run_server(settings, pipeline).await
}

async fn translate(args: TranslateArgs) -> Result<()> {
    llm_doc_translator::logging::init(args.common.verbose)?;
    let settings = settings::load_settings(args.common.settings.as_deref())?;
    let languages = LanguagePair::new(
        args.source_lang
            .unwrap_or_else(|| settings.languages.source.clone()),
        args.target_lang
            .unwrap_or_else(|| settings.languages.target.clone()),
    );
    languages.validate()?;

    let input = args.file;
    if !input.is_file() {
        return Err(anyhow!("input file not found: {}", input.display()));
    }
    if SourceKind::from_path(&input).is_none() {
        return Err(anyhow!(
            "unsupported file type: {} (expected .pdf or .docx)",
            input.display()
        ));
    }
    let file_name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let key = providers::resolve_key(args.common.key.as_deref())?;
    let pipeline = llm_doc_translator::build_pipeline(&settings, key).keep_input();
    let job = Arc::new(JobHandle::new(
        uuid::Uuid::new_v4().to_string(),
        file_name,
        languages,
    ));

    let watcher = {
        let job = job.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling...");
                job.request_cancel();
            }
        })
    };
    pipeline.run(&job, &input).await;
    watcher.abort();

    let snapshot = job.snapshot();
    if snapshot.status == JobStatus::Done {
        if let (Some(out), Some(output)) = (args.out.as_deref(), snapshot.output_path.as_deref()) {
            copy_output(Path::new(output), out).await?;
        }
    }
    println!("{}", llm_doc_translator::format_summary(&snapshot));

    match snapshot.status {
        JobStatus::Done => Ok(()),
        JobStatus::Cancelled => std::process::exit(130),
        _ => std::process::exit(1),
    }
}

async fn copy_output(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("failed to copy output to {}", to.display()))?;
    Ok(())
}

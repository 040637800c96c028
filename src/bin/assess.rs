#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use assessment_orchestrator::catalog::Catalog;
use assessment_orchestrator::config::AssessConfig;
use assessment_orchestrator::evidence::EvidenceFile;
use assessment_orchestrator::gateway::{ProviderGateway, TracingUsageSink};
use assessment_orchestrator::records::ScopeSummary;
use assessment_orchestrator::scope::AssessmentScope;
use assessment_orchestrator::{server, Orchestrator};

#[derive(Parser)]
#[command(name = "assess", version, about = "Compliance evidence assessment orchestrator")]
struct Cli {
    /// TOML config file (defaults to $ASSESS_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List baselines, control families and scope templates
    Catalog,
    /// Resolve a scope and print its cost/time estimate
    Estimate {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Run a full assessment over local evidence files
    Run {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Evidence files (glob patterns supported)
        #[arg(required = true)]
        evidence: Vec<String>,
        /// Write results JSON here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
        /// Also write the OSCAL export here
        #[arg(long)]
        oscal_out: Option<PathBuf>,
    },
    /// Serve the HTTP and WebSocket API
    Serve {
        /// Overrides server.bind
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Args)]
struct ScopeArgs {
    /// low, moderate, high or custom
    #[arg(long, default_value = "moderate")]
    baseline: String,
    /// quick, smart or deep
    #[arg(long, default_value = "smart")]
    mode: String,
    /// Control family code (repeatable)
    #[arg(long = "family")]
    families: Vec<String>,
    /// Explicit control ID (repeatable)
    #[arg(long = "control")]
    controls: Vec<String>,
    /// Named scope template
    #[arg(long)]
    template: Option<String>,
    /// Scope as a JSON file; replaces every other scope flag
    #[arg(long)]
    scope_json: Option<PathBuf>,
}

impl ScopeArgs {
    fn into_scope(self) -> Result<AssessmentScope, Box<dyn std::error::Error>> {
        if let Some(path) = self.scope_json {
            let raw = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&raw)?);
        }
        let scope = serde_json::from_value(json!({
            "baseline": self.baseline.to_ascii_lowercase(),
            "mode": self.mode.to_ascii_lowercase(),
            "control_families": self.families,
            "specific_controls": self.controls,
            "predefined_scope": self.template,
        }))?;
        Ok(scope)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("assessment_orchestrator=info,assess=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();
    let config = AssessConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Catalog => print_catalog(),
        Commands::Estimate { scope } => {
            let request = scope.into_scope()?;
            let (resolved, estimate) =
                assessment_orchestrator::estimate::estimate_scope(&request, &config.estimator)?;
            let body = json!({
                "scope": ScopeSummary::from(&resolved),
                "controls": resolved.controls,
                "estimate": estimate,
            });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Commands::Run {
            scope,
            evidence,
            out,
            oscal_out,
        } => {
            let request = scope.into_scope()?;
            let files = load_evidence(&evidence)?;
            let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink))?;
            let orchestrator = Orchestrator::new(Arc::new(gateway), config);

            let submission = orchestrator.submit(&request, files)?;
            let id = submission.session_id;
            eprintln!(
                "[run] session {id}: {} controls, ~{} tokens, ~{} min, ~${}",
                submission.scope.controls_in_scope,
                submission.estimate.estimated_tokens,
                submission.estimate.estimated_minutes,
                submission.estimate.estimated_cost_usd,
            );

            let mut updates = Box::pin(orchestrator.subscribe(&id)?);
            let mut last = submission.status;
            while let Some(snapshot) = updates.next().await {
                if snapshot.stage != last.stage || snapshot.progress != last.progress {
                    eprintln!("[run] {:>3}% {}: {}", snapshot.progress, snapshot.stage, snapshot.current_step);
                }
                last = snapshot;
            }
            if let Some(error) = &last.error {
                eprintln!("[run] {error}");
            }

            let results = orchestrator.results(&id)?;
            write_json(out.as_deref(), &results)?;
            if let Some(path) = oscal_out {
                let export = orchestrator.export_oscal(&id)?;
                write_json(Some(&path), &export)?;
                eprintln!("[run] OSCAL export written to {}", path.display());
            }
            if last.error.is_some() {
                return Err(format!("assessment {id} did not complete").into());
            }
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink))?;
            let orchestrator = Orchestrator::new(Arc::new(gateway), config);

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });
            server::serve(orchestrator, &bind, shutdown).await?;
        }
    }
    Ok(())
}

fn print_catalog() {
    let catalog = Catalog::global();
    println!("baselines:");
    for b in catalog.baseline_summaries() {
        println!("  {:<10} {:>4}  {}", b.id.as_str(), b.control_count, b.name);
    }
    println!("families:");
    for f in catalog.family_summaries() {
        let marker = if f.technical { "technical" } else { "" };
        println!("  {:<4} {:>4}  {:<45} {marker}", f.code.code(), f.control_count, f.name);
    }
    println!("templates:");
    for t in catalog.templates() {
        let families: Vec<_> = t.families.iter().map(|f| f.code()).collect();
        println!("  {:<18} {}  [{}]", t.id, t.name, families.join(", "));
    }
}

fn expand_evidence_globs(patterns: &[String]) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        if pattern.contains(['*', '?', '[']) {
            for entry in glob::glob(pattern)? {
                let path = entry?;
                if path.is_file() {
                    paths.push(path);
                }
            }
        } else {
            paths.push(PathBuf::from(pattern));
        }
    }
    if paths.is_empty() {
        return Err("no evidence files matched".into());
    }
    Ok(paths)
}

fn load_evidence(patterns: &[String]) -> Result<Vec<EvidenceFile>, Box<dyn std::error::Error>> {
    let paths = expand_evidence_globs(patterns)?;
    eprintln!("[run] loading {} evidence files...", paths.len());
    paths
        .iter()
        .map(|path| -> Result<EvidenceFile, Box<dyn std::error::Error>> {
            let bytes = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(EvidenceFile::new(filename, content_type_for(path), bytes))
        })
        .collect()
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "json" => "application/json",
        "yaml" | "yml" => "application/x-yaml",
        _ => "text/plain",
    }
}

fn write_json<T: serde::Serialize>(path: Option<&Path>, value: &T) -> Result<(), Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let mut file = File::create(path)?;
            serde_json::to_writer_pretty(&mut file, value)?;
            writeln!(file)?;
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            serde_json::to_writer_pretty(&mut lock, value)?;
            writeln!(lock)?;
        }
    }
    Ok(())
}

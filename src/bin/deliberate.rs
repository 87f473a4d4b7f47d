//! Minimal CLI deliberation runner
//!
//! Runs the full pipeline on one case archive without the HTTP surface:
//! extract → resolve → compose → normalize attachments → deliberate, then
//! print the score vector and justification. Useful for smoke-testing a jury
//! configuration (provider credentials come from the environment, as for the
//! API server).
//!
//! Usage:
//!   deliberate --archive case.zip [--addendum 2009.67] [--justifier OpenAI:gpt-4o]
//!   deliberate --cid QmCase[,QmSecondary...] [--addendum ...]

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use verdikta::archive;
use verdikta::attach;
use verdikta::caps::CapabilityMatrix;
use verdikta::compose;
use verdikta::jury::{JuryConfig, JuryEngine};
use verdikta::manifest::{ManifestResolver, ResolvedManifest};
use verdikta::provider::{Anthropic, OpenAiCompatible, ProviderRegistry};
use verdikta::store::{StoreClient, StoreConfig};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn build_registry(matrix: &Arc<CapabilityMatrix>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        registry.insert(Arc::new(OpenAiCompatible::new(
            "OpenAI",
            env_string("OPENAI_API_URL", "https://api.openai.com/v1"),
            key,
            matrix.clone(),
        )));
    }
    if let Ok(key) = std::env::var("XAI_API_KEY") {
        registry.insert(Arc::new(OpenAiCompatible::new(
            "xAI",
            env_string("XAI_API_URL", "https://api.x.ai/v1"),
            key,
            matrix.clone(),
        )));
    }
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        registry.insert(Arc::new(Anthropic::new(
            env_string("ANTHROPIC_API_URL", "https://api.anthropic.com"),
            key,
            matrix.clone(),
        )));
    }
    if let Ok(url) = std::env::var("OLLAMA_URL") {
        registry.insert(Arc::new(OpenAiCompatible::new(
            "Ollama",
            url,
            String::new(),
            matrix.clone(),
        )));
    }
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let archive_path = parse_flag(&args, "--archive").map(PathBuf::from);
    let cid_list = parse_flag(&args, "--cid");
    let addendum = parse_flag(&args, "--addendum");

    if archive_path.is_none() && cid_list.is_none() {
        eprintln!("usage: deliberate (--archive case.zip | --cid Qm...[,Qm...]) [--addendum value] [--justifier provider:model]");
        std::process::exit(2);
    }

    let matrix = Arc::new(CapabilityMatrix::builtin().clone());
    let store = StoreClient::new(StoreConfig {
        pin_token: env_string("IPFS_PINNING_KEY", ""),
        ..StoreConfig::default()
    });
    let registry = build_registry(&matrix);
    anyhow::ensure!(
        !registry.names().is_empty(),
        "no provider credentials in the environment (set OPENAI_API_KEY / ANTHROPIC_API_KEY / XAI_API_KEY / OLLAMA_URL)"
    );

    let jury_cfg = JuryConfig::default()
        .with_justifier(&env_string("JUSTIFIER_MODEL", "OpenAI:gpt-4o"));
    let engine = JuryEngine::new(registry, jury_cfg);

    let scratch = tempfile::Builder::new().prefix("verdikta_cli_").tempdir()?;
    let resolver = ManifestResolver::new(&store, scratch.path());

    let mut resolved: Vec<ResolvedManifest> = Vec::new();
    if let Some(path) = &archive_path {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("read archive {}: {e}", path.display()))?;
        let root = archive::extract(bytes, scratch.path(), &path.display().to_string()).await?;
        resolved.push(resolver.resolve(&root).await?);
    } else if let Some(list) = &cid_list {
        for cid in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let bytes = store.fetch(cid).await?;
            let root = archive::extract(bytes, scratch.path(), cid).await?;
            resolved.push(resolver.resolve(&root).await?);
        }
    }

    let mut job = compose::compose(&resolved, addendum.as_deref())?;
    let processed = attach::process(&resolved, &job.jury[0], &matrix).await?;
    for skip in &processed.skipped {
        eprintln!("skipped attachment {}: {}", skip.name, skip.reason);
    }
    job.attachments = processed.attachments;

    eprintln!(
        "deliberating: {} outcome(s), {} juror(s), {} iteration(s)",
        job.outcomes.len(),
        job.jury.len(),
        job.iterations
    );

    let result = engine.deliberate(&job).await?;

    println!("Scores:");
    for s in &result.scores {
        println!("  {:<24} {}", s.outcome, s.score);
    }
    println!();
    println!("Justification:");
    println!("{}", result.justification);

    for slot in &result.slots {
        if slot.failed {
            eprintln!(
                "note: juror {}:{} failed ({})",
                slot.provider,
                slot.model,
                slot.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }
    drop(scratch);
    Ok(())
}

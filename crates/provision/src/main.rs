use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imagegen_artifacts::audit::{audit_cache, inspect_links, LinkStatus};
use imagegen_artifacts::populate::{PopulateOptions, PopulateReport, Populator};
use imagegen_artifacts::provision::{ConsumerLayout, ProvisionMode, ProvisionReport, Provisioner};
use imagegen_artifacts::registry::{CivitaiRegistry, CIVITAI_BASE_URL};
use imagegen_core::artifact::ArtifactManifest;

/// Populate the shared model cache and link it into the engine directories.
#[derive(Parser)]
#[command(name = "imagegen-provision")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Artifact manifest (JSON)
    #[arg(long, global = true, env = "ARTIFACT_MANIFEST", default_value = "/etc/imagegen/artifacts.json")]
    manifest: PathBuf,

    /// Shared cache directory
    #[arg(long, global = true, env = "CACHE_ROOT", default_value = "/cache")]
    cache_root: PathBuf,

    /// ComfyUI install root; consumer directories are derived from it
    #[arg(long, global = true, env = "COMFY_ROOT", default_value = "/root/comfy/ComfyUI")]
    comfy_root: PathBuf,

    /// Exit non-zero if any artifact failed
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download missing artifacts into the cache
    Populate(PopulateArgs),

    /// Create or repair consumer symlinks
    Link {
        #[arg(long, value_enum, default_value_t = Mode::Runtime)]
        mode: Mode,
    },

    /// Report cache contents and link state without changing anything
    Audit {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Populate, then link in build mode
    Sync(PopulateArgs),
}

#[derive(clap::Args)]
struct PopulateArgs {
    /// Re-download artifacts that are already cached
    #[arg(long)]
    overwrite: bool,

    /// Downloads in flight
    #[arg(long, env = "POPULATE_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Only this artifact, failing on the first error
    #[arg(long)]
    only: Option<String>,

    /// Registry base URL
    #[arg(long, env = "CIVITAI_BASE_URL", default_value = CIVITAI_BASE_URL)]
    registry_url: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Build,
    Runtime,
}

impl From<Mode> for ProvisionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Build => ProvisionMode::Build,
            Mode::Runtime => ProvisionMode::Runtime,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagegen_provision=info,imagegen_artifacts=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let manifest = load_manifest(&cli.manifest)?;
    tracing::info!(
        manifest = %cli.manifest.display(),
        artifacts = manifest.artifacts.len(),
        "Loaded manifest",
    );

    match &cli.command {
        Command::Populate(args) => {
            let ok = populate(&cli, &manifest, args).await?;
            finish(&cli, ok)
        }
        Command::Link { mode } => {
            let report = link(&cli, &manifest, (*mode).into()).await?;
            finish(&cli, report.is_success())
        }
        Command::Audit { json } => audit(&cli, &manifest, *json),
        Command::Sync(args) => {
            let populated = populate(&cli, &manifest, args).await?;
            let report = link(&cli, &manifest, ProvisionMode::Build).await?;
            finish(&cli, populated && report.is_success())
        }
    }
}

fn load_manifest(path: &Path) -> Result<ArtifactManifest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    ArtifactManifest::from_json(&text)
        .with_context(|| format!("invalid manifest {}", path.display()))
}

fn layout(cli: &Cli, manifest: &ArtifactManifest) -> ConsumerLayout {
    ConsumerLayout::comfyui(&cli.comfy_root).with_overrides(&manifest.targets)
}

fn finish(cli: &Cli, ok: bool) -> Result<()> {
    if cli.strict && !ok {
        anyhow::bail!("provisioning finished with failures");
    }
    Ok(())
}

/// Returns whether every artifact ended up in the cache.
async fn populate(cli: &Cli, manifest: &ArtifactManifest, args: &PopulateArgs) -> Result<bool> {
    let token = std::env::var(imagegen_artifacts::registry::CIVITAI_TOKEN_ENV).ok();
    let registry = CivitaiRegistry::new(&args.registry_url, token)?;
    let populator = Populator::new(Arc::new(registry), &cli.cache_root).with_options(PopulateOptions {
        overwrite: args.overwrite,
        concurrency: args.concurrency,
    });

    if let Some(name) = &args.only {
        let descriptor = manifest
            .artifacts
            .iter()
            .find(|d| &d.filename == name)
            .with_context(|| format!("{name} is not in the manifest"))?;
        let outcome = populator.populate_one(descriptor).await?;
        println!("{name}: {outcome:?}");
        return Ok(true);
    }

    let report = populator.populate(&manifest.artifacts).await;
    print_populate(&report);
    Ok(report.is_success())
}

async fn link(cli: &Cli, manifest: &ArtifactManifest, mode: ProvisionMode) -> Result<ProvisionReport> {
    let provisioner = Provisioner::new(&cli.cache_root, layout(cli, manifest));
    let artifacts = manifest.artifacts.clone();
    let report =
        tokio::task::spawn_blocking(move || provisioner.provision(&artifacts, mode)).await??;
    print_provision(&report);
    Ok(report)
}

fn audit(cli: &Cli, manifest: &ArtifactManifest, json: bool) -> Result<()> {
    let cache = audit_cache(&cli.cache_root, &manifest.artifacts)?;
    let links = inspect_links(&layout(cli, manifest), &cli.cache_root, &manifest.artifacts)?;
    let broken = links
        .iter()
        .filter(|l| !matches!(l.status, LinkStatus::Linked { .. }))
        .count();

    if json {
        let report = serde_json::json!({ "cache": cache, "links": links });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("cache {}", cli.cache_root.display());
        for file in &cache.present {
            println!("  present  {} ({} bytes)", file.filename, file.size);
        }
        for name in &cache.missing {
            println!("  missing  {name}");
        }
        for name in &cache.extra {
            println!("  extra    {name}");
        }
        for name in &cache.partials {
            println!("  partial  {name}");
        }
        println!("links");
        for inspection in &links {
            println!(
                "  {:<12} {} -> {:?}",
                inspection.artifact_type.as_str(),
                inspection.link.display(),
                inspection.status
            );
        }
    }

    finish(cli, cache.is_complete() && cache.partials.is_empty() && broken == 0)
}

fn print_populate(report: &PopulateReport) {
    for name in &report.downloaded {
        println!("downloaded  {name}");
    }
    for name in &report.cached {
        println!("cached      {name}");
    }
    for failure in &report.failed {
        println!("failed      {}: {}", failure.filename, failure.error);
    }
}

fn print_provision(report: &ProvisionReport) {
    println!("mode: {}", report.mode);
    for linked in &report.linked {
        println!("{:<10} {}", format!("{:?}", linked.change).to_lowercase(), linked.link.display());
    }
    for name in &report.missing_source {
        println!("missing    {name}");
    }
    for link in &report.pruned {
        println!("pruned     {}", link.display());
    }
    for failure in &report.verify_failed {
        println!("failed     {}: {}", failure.link.display(), failure.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn link_defaults_to_runtime_mode() {
        let cli = Cli::try_parse_from(["imagegen-provision", "link"]).unwrap();
        assert!(matches!(cli.command, Command::Link { mode: Mode::Runtime }));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "imagegen-provision",
            "sync",
            "--overwrite",
            "--cache-root",
            "/vol/cache",
            "--strict",
        ])
        .unwrap();
        assert!(cli.strict);
        assert_eq!(cli.cache_root, PathBuf::from("/vol/cache"));
        let Command::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert!(args.overwrite);
        assert_eq!(args.concurrency, 2);
    }
}

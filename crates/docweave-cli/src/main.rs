use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use docweave_core::{Config, Report, Severity};
use docweave_dag::{Manifest, ResolvedManifest};
use docweave_engine::{build_report, Project, RunError, RunOptions, RunResult};
use docweave_store::{DocumentStore, MemoryStore};

/// docweave - build document-store models in dependency order
#[derive(Parser)]
#[command(name = "docweave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: docweave.toml)
    #[arg(short, long, global = true, env = "DOCWEAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Selection {
    /// Only this model and its dependencies (repeatable)
    #[arg(short, long = "target")]
    targets: Vec<String>,

    /// Leave this model out (repeatable)
    #[arg(short, long)]
    exclude: Vec<String>,
}

impl Selection {
    fn options(&self) -> RunOptions {
        RunOptions::new()
            .targets(self.targets.iter().cloned())
            .exclude(self.exclude.iter().cloned())
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check the model graph for cycles and disconnected groups
    Validate {
        /// Path to the project manifest (default: from config)
        #[arg(short = 'f', long)]
        manifest: Option<PathBuf>,
    },

    /// Show execution stages
    Plan {
        #[arg(short = 'f', long)]
        manifest: Option<PathBuf>,

        #[command(flatten)]
        selection: Selection,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render the dependency graph as a Mermaid diagram
    Graph {
        #[arg(short = 'f', long)]
        manifest: Option<PathBuf>,

        /// Write the diagram to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the project against an in-memory store seeded from the manifest
    Run {
        #[arg(short = 'f', long)]
        manifest: Option<PathBuf>,

        #[command(flatten)]
        selection: Selection,

        /// Validate and plan only
        #[arg(long)]
        dry_run: bool,

        /// Models of one stage that may run at once (default: from config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Output file for report.json (default: from config)
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref(), cli.verbose)?;
    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Validate { manifest } => validate_command(&config, manifest.as_deref()),
        Commands::Plan {
            manifest,
            selection,
            json,
        } => plan_command(&config, manifest.as_deref(), &selection, json),
        Commands::Graph { manifest, output } => {
            graph_command(&config, manifest.as_deref(), output.as_deref(), cli.verbose)
        }
        Commands::Run {
            manifest,
            selection,
            dry_run,
            concurrency,
            report,
        } => {
            let options = selection
                .options()
                .dry_run(dry_run)
                .max_concurrency(concurrency.unwrap_or(config.max_concurrency));
            run_command(&config, manifest.as_deref(), options, report.as_deref(), cli.verbose).await
        }
    }
}

fn load_config(path: Option<&Path>, verbose: bool) -> Result<Config> {
    if let Some(path) = path {
        return Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    let default_path = Path::new("docweave.toml");
    if default_path.exists() {
        return Ok(Config::from_file(default_path)?);
    }

    if verbose {
        eprintln!("{}", "No config file found, using defaults".yellow());
    }
    Ok(Config::default())
}

/// RUST_LOG wins, then --verbose, then the config's log_level
fn init_tracing(config: &Config, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            config.log_level.as_deref().unwrap_or("info")
        };
        EnvFilter::new(level)
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_manifest(config: &Config, manifest: Option<&Path>) -> Result<ResolvedManifest> {
    let path = manifest
        .map(|path| path.to_path_buf())
        .unwrap_or_else(|| config.manifest_path());

    tracing::debug!(path = %path.display(), "Loading manifest");

    let manifest = Manifest::from_file(&path)
        .with_context(|| format!("Failed to load manifest from {}", path.display()))?;
    Ok(manifest.resolve()?)
}

/// Validate command - report cycles and warnings
fn validate_command(config: &Config, manifest: Option<&Path>) -> Result<()> {
    let resolved = load_manifest(config, manifest)?;
    let project = Project::from_manifest(&resolved);
    let graph = project.graph()?;
    let validation = project.validate()?;

    println!(
        "{} {} models, {} collections, {} dependencies",
        "Graph:".bold(),
        graph.models().count(),
        graph.len() - graph.models().count(),
        graph.edge_count()
    );

    for error in &validation.errors {
        println!("  [{}] {}", "ERROR".red().bold(), error);
    }
    for warning in &validation.warnings {
        println!(
            "  [{}] disconnected groups, roots: {}",
            "WARN".yellow().bold(),
            warning.models.join(", ")
        );
    }

    if !validation.valid {
        std::process::exit(1);
    }

    println!("{}", "✓ Graph is valid".green().bold());
    Ok(())
}

/// Plan command - print execution stages
fn plan_command(
    config: &Config,
    manifest: Option<&Path>,
    selection: &Selection,
    json: bool,
) -> Result<()> {
    let resolved = load_manifest(config, manifest)?;
    let project = Project::from_manifest(&resolved);
    let plan = project.plan_for(&selection.options())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("{}", format!("Execution plan for {}", project.name()).bold());
    for (index, stage) in plan.stages.iter().enumerate() {
        println!("  {} {}", format!("Stage {}:", index + 1).cyan(), stage.join(", "));
    }
    println!("{} models in {} stages", plan.model_count(), plan.stages.len());

    Ok(())
}

/// Graph command - Mermaid diagram of the project
fn graph_command(
    config: &Config,
    manifest: Option<&Path>,
    output: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    let resolved = load_manifest(config, manifest)?;
    let diagram = Project::from_manifest(&resolved).to_mermaid()?;

    match output {
        Some(path) => {
            std::fs::write(path, &diagram)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if verbose {
                eprintln!("{} {}", "Diagram saved to:".green(), path.display());
            }
        }
        None => print!("{diagram}"),
    }

    Ok(())
}

/// Run command - execute the project against a seeded in-memory store
async fn run_command(
    config: &Config,
    manifest: Option<&Path>,
    options: RunOptions,
    report_path: Option<&Path>,
    verbose: bool,
) -> Result<()> {
    if config.store.kind != "memory" {
        anyhow::bail!(
            "Unsupported store type '{}': only 'memory' is available",
            config.store.kind
        );
    }

    let resolved = load_manifest(config, manifest)?;
    let project = Project::from_manifest(&resolved);

    let store = MemoryStore::builder()
        .with_default_database(config.store.default_database.clone())
        .build();
    for (name, documents) in &resolved.seeds {
        store.seed(resolved.seed_namespace(name), documents.clone()).await;
    }
    store.test_connection().await?;

    let options = if verbose {
        options
            .on_model_start(|name| eprintln!("{} {}", "Running".cyan(), name))
            .on_model_complete(|name, stats| {
                eprintln!(
                    "{} {} ({} ms, {} documents)",
                    "Done".green(),
                    name,
                    stats.duration_ms,
                    stats.documents_written
                )
            })
    } else {
        options
    };

    let result = match project.run(Arc::new(store), &options).await {
        Ok(result) => result,
        Err(RunError::InvalidGraph { errors }) => {
            eprintln!("{}", "Graph is invalid, nothing was run:".red().bold());
            for error in &errors {
                eprintln!("  {error}");
            }
            std::process::exit(1);
        }
        Err(other) => return Err(other.into()),
    };

    let report = build_report(
        project.name(),
        &*project.graph()?,
        &project.validate()?,
        Some(&result),
    );

    let report_path = report_path
        .map(Path::to_path_buf)
        .or_else(|| config.report.as_deref().map(|path| config.resolve(path)));
    if let Some(path) = &report_path {
        report.save_to_file(path)?;
        if verbose {
            eprintln!("{} {}", "Report saved to:".green(), path.display());
        }
    }

    print_run_summary(&result, &report, options.dry_run);

    if !result.success {
        std::process::exit(1);
    }

    Ok(())
}

fn print_run_summary(result: &RunResult, report: &Report, dry_run: bool) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", format!("Run Report: {}", report.project).bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    if dry_run {
        println!("{}", "Dry run: nothing was executed".yellow());
        println!();
    }

    println!("{}", "Summary:".bold());
    println!("  Run:      {}", result.models_run.len().to_string().green());

    if result.models_failed.is_empty() {
        println!("  Failed:   {}", "0".green());
    } else {
        println!("  Failed:   {}", result.models_failed.len().to_string().red().bold());
    }

    if result.models_skipped.is_empty() {
        println!("  Skipped:  {}", "0".green());
    } else {
        println!("  Skipped:  {}", result.models_skipped.len().to_string().yellow());
    }

    println!("  Duration: {} ms", result.total_duration_ms);
    println!();

    if report.diagnostics.is_empty() {
        if let Some(banner) = success_banner(result, dry_run) {
            println!("{}", banner.green().bold());
        }
        return;
    }

    println!("{}", "Diagnostics:".bold());
    for diag in &report.diagnostics {
        let severity = match diag.severity {
            Severity::Error => "ERROR".red().bold(),
            Severity::Warn => "WARN".yellow().bold(),
            Severity::Info => "INFO".cyan(),
        };
        println!("  [{}] {}: {}", severity, diag.code, diag.message);
        if !diag.impact.is_empty() {
            println!("    impact: {}", diag.impact.join(", "));
        }
    }
}

/// Closing line for a clean run; a dry run built nothing
fn success_banner(result: &RunResult, dry_run: bool) -> Option<&'static str> {
    (result.success && !dry_run).then_some("✓ All models built")
}

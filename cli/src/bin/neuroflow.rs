use clap::{Parser, Subcommand};
use cli::StudyConfig;
use color_eyre::eyre::{Result, eyre};
use derivatives::AtlasRegistry;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the derivatives of the configured sessions
    Run {
        /// Path to the TOML or JSON study configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Only process this subject
        #[arg(long)]
        subject: Option<String>,
        /// Only process this session
        #[arg(long)]
        session: Option<String>,
        /// Delete and recompute existing outputs
        #[arg(long)]
        force: bool,
    },
    /// List the built-in atlas catalog
    Atlases {
        /// Root directory of the atlas files
        #[arg(long)]
        atlas_root: PathBuf,
    },
    /// Print the JSON schema of the study configuration
    Schema,
    /// Write a skeleton study configuration
    Init {
        /// Destination (.toml or .json)
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Run {
            config,
            subject,
            session,
            force,
        } => run(config, subject.as_deref(), session.as_deref(), *force),
        Commands::Atlases { atlas_root } => list_atlases(atlas_root),
        Commands::Schema => {
            let schema = schemars::schema_for!(StudyConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::Init { output } => {
            StudyConfig::skeleton().to_file(output)?;
            info!("Skeleton configuration written to {:?}", output);
            Ok(())
        }
    }
}

fn run(config_path: &Path, subject: Option<&str>, session: Option<&str>, force: bool) -> Result<()> {
    let config = StudyConfig::from_file(config_path)?;
    let sessions = config.session_contexts(subject, session)?;
    let pipeline = config.pipeline(force)?;
    info!(
        "Processing {} session(s) into {:?}",
        sessions.len(),
        pipeline.output_directory()
    );

    let mut failed = Vec::new();
    for ctx in &sessions {
        match pipeline.run(ctx) {
            Ok(report) => {
                info!(
                    "{}: {} output(s) computed, {} parcellation table(s), covariates at {:?}",
                    ctx.file_prefix(),
                    report.computed(),
                    report.parcellations.len(),
                    report.covariates_path
                );
                for (atlas, reason) in &report.registration_failures {
                    error!("{}: atlas {} failed: {}", ctx.file_prefix(), atlas, reason);
                }
                for failure in &report.parcellation_failures {
                    error!(
                        "{}: parcellation of {} by {} failed: {}",
                        ctx.file_prefix(),
                        failure.metric,
                        failure.atlas,
                        failure.error
                    );
                }
            }
            Err(e) => {
                error!("{}: {}", ctx.file_prefix(), e);
                failed.push(ctx.file_prefix());
            }
        }
    }

    if !failed.is_empty() {
        return Err(eyre!("{} of {} session(s) failed: {}", failed.len(), sessions.len(), failed.join(", ")));
    }
    info!("All sessions processed");
    Ok(())
}

fn list_atlases(atlas_root: &Path) -> Result<()> {
    let registry = AtlasRegistry::builtin(atlas_root)?;
    for record in registry.records() {
        let marker = if record.reference().exists() { "" } else { " (missing)" };
        println!("{}\t{}{}", record.id(), record.reference().display(), marker);
    }
    info!("{} atlases under {:?}", registry.len(), atlas_root);
    Ok(())
}

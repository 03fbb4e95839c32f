use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tcmsync::{ExistingResultPolicy, ObjectId, UserPolicy};

mod commands;

#[derive(Parser)]
#[command(name = "tcmsync")]
#[command(about = "Synchronize test plans, cases and results with a TCMS")]
#[command(version)]
struct Cli {
    /// Configuration file (default: $TCMSYNC_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// TCMS store snapshot (default: tcms.store-path, then the user data dir)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON for machine consumption
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportKind {
    Plan,
    Case,
    Product,
}

#[derive(Subcommand)]
enum Commands {
    /// Import an entity or result container into TCMS
    Import {
        /// Container file (.toml, .json, .yaml)
        file: PathBuf,

        /// Show what would happen without changing TCMS
        #[arg(long)]
        dry_run: bool,

        /// Create missing master data where the type allows it
        #[arg(long)]
        auto_create: bool,

        /// Upload attachments shipped with the container
        #[arg(long)]
        include_attachments: bool,

        /// Import environments too
        #[arg(long)]
        include_environments: bool,

        /// How user references are resolved
        #[arg(long, value_enum)]
        user_references: Option<UserPolicy>,

        /// What to do with runs and executions that already exist
        #[arg(long, value_enum)]
        existing_results: Option<ExistingResultPolicy>,

        /// Build results are recorded against (result containers only)
        #[arg(long)]
        build: Option<String>,
    },

    /// Export a plan, case or product from TCMS into a container
    Export {
        #[arg(value_enum)]
        kind: ExportKind,

        /// TCMS object ID
        id: ObjectId,

        /// Output file (default: <kind>_<id>.toml)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Include child plans
        #[arg(long)]
        descendants: bool,

        /// Download attachments next to the container
        #[arg(long)]
        include_attachments: bool,

        /// Include environments
        #[arg(long)]
        include_environments: bool,

        /// Collect everything but write nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the automated cases of a plan or case
    Run {
        /// Container file to run from
        file: Option<PathBuf>,

        /// Export this plan from TCMS and run it
        #[arg(long, conflicts_with = "file")]
        plan: Option<ObjectId>,

        /// Run a single case of the container
        #[arg(long)]
        case: Option<ObjectId>,

        /// Report what would run without executing anything
        #[arg(long)]
        dry_run: bool,

        /// Store the results in TCMS
        #[arg(long, requires = "build")]
        store_result: bool,

        /// Build results are recorded against
        #[arg(long)]
        build: Option<String>,

        /// Environment (by name) whose properties span the matrix
        #[arg(long)]
        environment: Option<String>,

        /// Also run child plans
        #[arg(long)]
        descendants: bool,

        /// Tester recorded with the results (default: current TCMS user)
        #[arg(long)]
        tester: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: logging unavailable: {}", e);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let ctx = commands::Context::load(cli.config.as_deref(), cli.store, cli.json)?;

    match cli.command {
        Commands::Import {
            file,
            dry_run,
            auto_create,
            include_attachments,
            include_environments,
            user_references,
            existing_results,
            build,
        } => commands::import::run(
            &ctx,
            &file,
            &commands::import::ImportArgs {
                dry_run,
                auto_create,
                include_attachments,
                include_environments,
                user_references,
                existing_results,
                build,
            },
        ),
        Commands::Export {
            kind,
            id,
            output,
            descendants,
            include_attachments,
            include_environments,
            dry_run,
        } => {
            let target = match kind {
                ExportKind::Plan => tcmsync::ExportTarget::Plan(id),
                ExportKind::Case => tcmsync::ExportTarget::Case(id),
                ExportKind::Product => tcmsync::ExportTarget::Product(id),
            };
            commands::export::run(
                &ctx,
                target,
                output.as_deref(),
                &commands::export::ExportArgs {
                    descendants,
                    include_attachments,
                    include_environments,
                    dry_run,
                },
            )
        }
        Commands::Run {
            file,
            plan,
            case,
            dry_run,
            store_result,
            build,
            environment,
            descendants,
            tester,
        } => commands::run::run(
            &ctx,
            &commands::run::RunArgs {
                file,
                plan,
                case,
                dry_run,
                store_result,
                build,
                environment,
                descendants,
                tester,
            },
        ),
    }
}

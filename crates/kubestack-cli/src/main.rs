//! kubestack CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use kubestack_config::STACK_FILE_NAME;
use kubestack_reconciler::ReconcilerConfig;

mod commands;

#[derive(Parser)]
#[command(name = "kubestack")]
#[command(about = "Deploy Kubernetes platform stacks in dependency order", long_about = None)]
struct Cli {
    /// Stack file
    #[arg(long, short, env = "KUBESTACK_FILE", default_value = STACK_FILE_NAME, global = true)]
    file: PathBuf,

    /// Directory holding recorded stack state
    #[arg(long, env = "KUBESTACK_STATE_DIR", default_value = ".kubestack/state", global = true)]
    state_dir: PathBuf,

    /// Executable provisioning clusters, IAM policies and DNS records
    #[arg(long, env = "KUBESTACK_PROVISIONER", global = true)]
    provisioner: Option<String>,

    /// Path to helm binary
    #[arg(long, env = "HELM_BIN", default_value = "helm", global = true)]
    helm_bin: String,

    /// Timeout in seconds for each external call
    #[arg(long, default_value = "600", global = true)]
    timeout: u64,

    /// Record what would be done without touching anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a stack and the stacks it depends on
    DeployUnit {
        /// Stack name
        name: String,
    },
    /// Destroy a stack and the stacks that depend on it
    DestroyUnit {
        /// Stack name
        name: String,
    },
    /// Show the changes a deploy would make
    Plan {
        /// Stack name
        name: String,
    },
    /// Print stacks and their node order
    Graph {
        /// Only this stack
        name: Option<String>,
    },
    /// Parse and validate the stack file
    Validate,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let reconciler = ReconcilerConfig {
        state_dir: cli.state_dir.clone(),
        helm_bin: cli.helm_bin.clone(),
        provisioner: cli.provisioner.clone(),
        timeout: Duration::from_secs(cli.timeout),
        dry_run: cli.dry_run,
    };

    match cli.command {
        Commands::DeployUnit { name } => {
            commands::run::deploy_unit(&cli.file, &reconciler, &name).await?;
        }
        Commands::DestroyUnit { name } => {
            commands::run::destroy_unit(&cli.file, &reconciler, &name).await?;
        }
        Commands::Plan { name } => {
            commands::run::plan(&cli.file, &reconciler, &name).await?;
        }
        Commands::Graph { name } => {
            commands::graph(&cli.file, name.as_deref())?;
        }
        Commands::Validate => {
            commands::validate(&cli.file)?;
        }
    }

    Ok(())
}

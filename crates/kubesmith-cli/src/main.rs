//! kubesmith CLI - bring up Kubernetes clusters over SSH.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use commands::GlobalArgs;

#[derive(Parser)]
#[command(name = "kubesmith")]
#[command(about = "Install Kubernetes clusters on plain Linux hosts")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the whole cluster described by the configuration
    Install,

    /// Add resources to a running cluster
    Add {
        #[command(subcommand)]
        resource: AddResource,
    },
}

#[derive(Subcommand)]
enum AddResource {
    /// Join one node from the configuration to the cluster
    Node {
        /// Hostname of the node, as listed in the configuration
        #[arg(long)]
        hostname: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.global);

    let result: Result<(), anyhow::Error> = match cli.command {
        Commands::Install => commands::install::run(&cli.global).await,
        Commands::Add {
            resource: AddResource::Node { hostname },
        } => commands::add::run(&cli.global, &hostname).await,
    };

    if let Err(e) = result {
        eprintln!("{}", format!("Error: {e:#}").red());
        std::process::exit(1);
    }
}

fn init_tracing(global: &GlobalArgs) {
    let level = if global.trace {
        "trace"
    } else if global.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kubesmith={level}")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

use omni_kernel::cli;
use omni_kernel::config::Config;
use omni_kernel::logs;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "omni", version, about = "Agentic developer-assistant kernel")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Router utilities
    Route {
        #[command(subcommand)]
        action: RouteCmd,
    },
    /// Vector store maintenance
    Db {
        #[command(subcommand)]
        action: DbCmd,
    },
    /// Skill marketplace operations
    Skill {
        #[command(subcommand)]
        action: SkillCmd,
    },
}

#[derive(Subcommand, Debug)]
enum RouteCmd {
    /// Route a query against the tool index and print the selection
    Test {
        /// Free-text query to route
        query: String,
        /// Run against the local index (default; kept for parity)
        #[arg(long)]
        local: bool,
        /// Print the canonical omni.router.route_test.v1 JSON
        #[arg(long)]
        json: bool,
        /// Override the active confidence profile
        #[arg(long)]
        confidence_profile: Option<String>,
        /// Show raw and final scores per row
        #[arg(long)]
        debug: bool,
    },
    /// Print fusion weights, RRF k, field boosts and the active profile
    Stats,
    /// Export or print the router search settings schema
    Schema {
        /// Write the schema file and print its path as JSON
        #[arg(long)]
        json: bool,
        /// Print the schema to stdout instead of writing a file
        #[arg(long)]
        stdout: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DbCmd {
    /// Audit the tool-search collection for legacy `keywords` rows
    ValidateSchema,
}

#[derive(Subcommand, Debug)]
enum SkillCmd {
    /// Search the external skills index
    Discover {
        /// Keyword query (omit to list everything)
        query: Option<String>,
        /// Maximum results
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Suggest the best indexed skill for a task
    Suggest {
        /// Task description
        task: String,
    },
    /// Install an indexed skill into the skills root
    JitInstall {
        /// Skill id from the index
        id: String,
    },
    /// List the full skills index
    ListIndex,
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let logs_tx = logs::init_broadcast();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("omni_kernel=info")
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(logs::BroadcastLayer::new(logs_tx))
        .init();

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let mut cfg = match Config::load(&config_path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e:#}");
            std::process::exit(cli::EXIT_RUNTIME);
        }
    };

    let outcome = match args.command {
        Command::Route { action } => match action {
            RouteCmd::Test {
                query,
                local: _,
                json,
                confidence_profile,
                debug,
            } => cli::route_test(&mut cfg, &query, json, debug, confidence_profile).await,
            RouteCmd::Stats => Ok(cli::route_stats(&cfg)),
            RouteCmd::Schema { json, stdout } => cli::route_schema(json, stdout),
        },
        Command::Db { action } => match action {
            DbCmd::ValidateSchema => cli::db_validate_schema(&cfg),
        },
        Command::Skill { action } => match action {
            SkillCmd::Discover { query, limit } => cli::skill_discover(query.as_deref(), limit),
            SkillCmd::Suggest { task } => cli::skill_suggest(&task),
            SkillCmd::JitInstall { id } => cli::skill_jit_install(&cfg, &id).await,
            SkillCmd::ListIndex => cli::skill_list_index(),
        },
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(cli::EXIT_RUNTIME);
        }
    }
}

//! `lmem` - admin CLI for the LivingMemory engine.
//!
//! Every subcommand maps onto one host admin operation and prints its
//! structured response. The engine is opened against the data directory
//! (platform default or `--data-dir`), with embedding and chat served by an
//! OpenAI-compatible endpoint configured through the environment.

mod providers;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use directories::ProjectDirs;
use livingmemory_core::{AdminResponse, LivingMemory, LivingMemoryConfig};

/// LivingMemory - long-term memory admin console
#[derive(Parser)]
#[command(name = "lmem")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Admin CLI for the LivingMemory long-term memory engine")]
struct Cli {
    /// Data directory holding livingmemory.db and livingmemory.index
    #[arg(long, env = "LMEM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON config file; defaults apply to anything omitted
    #[arg(long, env = "LMEM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show memory-store status
    Status,

    /// Search memories with the active recall pipeline
    Search {
        /// Query text
        query: String,
        /// Number of results
        #[arg(short, long, default_value_t = 3)]
        k: usize,
    },

    /// Delete one memory by id
    Forget {
        /// Memory id
        id: i64,
    },

    /// Manually trigger one forgetting (decay + prune) pass
    RunForgettingAgent,

    /// Rebuild the sparse full-text mirror
    SparseRebuild,

    /// Switch the retrieval mode
    SearchMode {
        /// One of: hybrid, dense, sparse
        mode: String,
    },

    /// Edit one field of a memory
    Edit {
        /// Memory id
        id: i64,
        /// Field: content, importance, type, or status
        field: String,
        /// New value
        value: String,
        /// Reason recorded in the update history
        reason: Option<String>,
    },

    /// Show a memory's update history
    History {
        /// Memory id
        id: i64,
    },

    /// Show one memory in full
    Show {
        /// Memory id
        id: i64,
    },

    /// Show or switch the result-fusion strategy
    Fusion {
        /// Strategy name; omit to show the current configuration
        strategy: Option<String>,
        /// Optional key=value parameter for the strategy
        param: Option<String>,
    },

    /// Show the active configuration
    Config,

    /// Delete every memory
    Wipe {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "livingmemory", "livingmemory")
        .ok_or_else(|| anyhow::anyhow!("could not determine a platform data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<LivingMemoryConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(LivingMemoryConfig::default()),
    }
}

fn print_response(response: &AdminResponse) {
    if response.success {
        println!("{} {}", "ok:".green().bold(), response.message);
    } else {
        eprintln!("{} {}", "error:".red().bold(), response.message);
    }
}

fn print_search_results(response: &AdminResponse) {
    print_response(response);
    let Some(serde_json::Value::Array(hits)) = &response.data else {
        return;
    };
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{} {} {} {}",
            format!("{}.", i + 1).bold(),
            format!("[id {}]", hit["id"]).cyan(),
            format!(
                "score {:.4}  importance {:.2}  {}",
                hit["similarity"].as_f64().unwrap_or(0.0),
                hit["importance"].as_f64().unwrap_or(0.0),
                hit["event_type"].as_str().unwrap_or("other"),
            )
            .dimmed(),
            hit["content"].as_str().unwrap_or(""),
        );
    }
}

fn print_data(response: &AdminResponse) {
    print_response(response);
    if let Some(data) = &response.data {
        match serde_json::to_string_pretty(data) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{data}"),
        }
    }
}

fn confirm(question: &str) -> bool {
    use std::io::Write;
    print!("{question} [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    tracing::debug!("using data dir {data_dir:?}");
    let config = load_config(cli.config.as_ref())?;

    let host = LivingMemory::new(config, &data_dir)?;
    let (embedder, chatter) = providers::from_env()?;
    host.initialize(embedder, chatter).await?;

    let exit_ok = match cli.command {
        Commands::Status => {
            let response = host.status();
            print_data(&response);
            response.success
        }
        Commands::Search { query, k } => {
            let response = host.search_memories(&query, k).await;
            print_search_results(&response);
            response.success
        }
        Commands::Forget { id } => {
            let response = host.delete_memory(id).await;
            print_response(&response);
            response.success
        }
        Commands::RunForgettingAgent => {
            let response = host.run_forgetting().await;
            print_response(&response);
            response.success
        }
        Commands::SparseRebuild => {
            let response = host.rebuild_sparse_index();
            print_response(&response);
            response.success
        }
        Commands::SearchMode { mode } => {
            let response = host.set_search_mode(&mode);
            print_response(&response);
            response.success
        }
        Commands::Edit {
            id,
            field,
            value,
            reason,
        } => {
            let response = host
                .edit_memory(id, &field, &value, reason.as_deref().unwrap_or(""))
                .await;
            print_response(&response);
            response.success
        }
        Commands::History { id } => {
            let response = host.memory_history(id);
            print_data(&response);
            response.success
        }
        Commands::Show { id } => {
            let response = host.memory_details(id);
            print_data(&response);
            response.success
        }
        Commands::Fusion { strategy, param } => {
            let response = match strategy {
                None => host.fusion_show(),
                Some(strategy) => host.set_fusion(&strategy, param.as_deref()),
            };
            print_data(&response);
            response.success
        }
        Commands::Config => {
            let response = host.config_summary();
            print_data(&response);
            response.success
        }
        Commands::Wipe { yes } => {
            if !yes && !confirm("Delete ALL memories? This cannot be undone.") {
                println!("aborted");
                host.shutdown().await;
                return Ok(());
            }
            let response = host.wipe_all().await;
            print_response(&response);
            response.success
        }
    };

    host.shutdown().await;
    if !exit_ok {
        std::process::exit(1);
    }
    Ok(())
}

//! # Review Context CLI (`rcx`)
//!
//! Operator interface over the context engine: build and cache repository
//! indexes, query them with free text or a diff, and manage the cache.
//!
//! ## Usage
//!
//! ```bash
//! rcx --config ./config/rcx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rcx index <repo_url>` | Clone or update the repository and build its index |
//! | `rcx query <repo_url> "<text>"` | Print context relevant to a free-text query |
//! | `rcx diff <repo_url>` | Print context relevant to a diff (file or stdin) |
//! | `rcx clear-cache` | Remove one repository's cache, or the whole cache |
//! | `rcx status` | Show configuration and cached indexes |
//! | `rcx completions <shell>` | Print shell completions |
//!
//! Logs go to stderr and honour `RUST_LOG`; results go to stdout.

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use review_context::config::{self, Config};
use review_context::progress::ProgressMode;
use review_context::retriever;
use review_context::{clear_cache_at, ContextEngine};

/// Review Context CLI: repository-aware context retrieval for code review.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rcx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rcx",
    about = "Repository-aware context retrieval for automated code review",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/rcx.toml")]
    config: PathBuf,

    /// Progress output while indexing: off, human or json.
    #[arg(long, global = true, value_parser = parse_progress)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone or update a repository and build its index.
    Index {
        repo_url: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Discard any cached index and working copy first.
        #[arg(long)]
        force: bool,
    },

    /// Print context relevant to a free-text query.
    Query {
        repo_url: String,

        query: String,

        #[arg(long, default_value = "main")]
        branch: String,
    },

    /// Print context relevant to a unified diff.
    Diff {
        repo_url: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Read the diff from this file instead of stdin.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Remove cached indexes and working copies.
    ClearCache {
        /// Only clear this repository; clears everything when omitted.
        #[arg(long)]
        repo_url: Option<String>,

        #[arg(long, default_value = "main")]
        branch: String,
    },

    /// Show configuration summary and cached indexes.
    Status,

    /// Print shell completions.
    Completions { shell: Shell },
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    ProgressMode::parse(s).ok_or_else(|| format!("invalid progress mode '{}': use off, human or json", s))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "rcx", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match &cli.command {
        Commands::Status => {
            print_status(&cfg)?;
            return Ok(());
        }
        Commands::ClearCache { repo_url, branch } => {
            let cache_dir = &cfg.storage.cache_dir;
            clear_cache_at(cache_dir, repo_url.as_deref(), branch)?;
            match repo_url {
                Some(url) => println!("cleared cache for {} ({})", url, branch),
                None => println!("cleared cache at {}", cache_dir.display()),
            }
            return Ok(());
        }
        Commands::Index { .. } | Commands::Query { .. } | Commands::Diff { .. }
            if !cfg.rag.enabled =>
        {
            println!("context retrieval is disabled in configuration");
            return Ok(());
        }
        _ => {}
    }

    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let mut engine = ContextEngine::from_config(cfg)?;
    engine.set_progress(progress.reporter());

    match cli.command {
        Commands::Index {
            repo_url,
            branch,
            force,
        } => {
            if force {
                engine.clear_cache(Some(&repo_url), &branch)?;
            }
            if engine.prepare_context(&repo_url, &branch)? {
                println!("indexed {} ({})", repo_url, branch);
            } else {
                bail!("failed to index {} ({})", repo_url, branch);
            }
        }
        Commands::Query {
            repo_url,
            query,
            branch,
        } => {
            if !engine.prepare_context(&repo_url, &branch)? {
                bail!("failed to index {} ({})", repo_url, branch);
            }
            print_context(&engine.context_for_query(&query, &repo_url, &branch)?);
        }
        Commands::Diff {
            repo_url,
            branch,
            file,
        } => {
            let diff = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read diff file: {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read diff from stdin")?;
                    buf
                }
            };
            if !engine.prepare_context(&repo_url, &branch)? {
                bail!("failed to index {} ({})", repo_url, branch);
            }
            print_context(&engine.context_for_diff(&diff, &repo_url, &branch)?);
        }
        Commands::Status | Commands::ClearCache { .. } | Commands::Completions { .. } => {
            // Handled above
        }
    }

    Ok(())
}

fn print_context(context: &str) {
    if context.is_empty() {
        println!("no relevant context");
    } else {
        println!("{}", context);
    }
}

fn print_status(cfg: &Config) -> anyhow::Result<()> {
    println!("enabled:        {}", cfg.rag.enabled);
    println!(
        "embedding:      {} ({})",
        cfg.embedding.provider,
        cfg.embedding.model_name()
    );
    println!("top_k:          {}", cfg.retrieval.top_k);
    println!("threshold:      {}", cfg.retrieval.similarity_threshold);
    println!(
        "chunking:       {} x {} (overlap {})",
        cfg.chunking.split_by, cfg.chunking.chunk_size, cfg.chunking.chunk_overlap
    );
    println!("cache_dir:      {}", cfg.storage.cache_dir.display());
    let cached = if cfg.storage.cache_dir.is_dir() {
        retriever::cached_keys(&cfg.storage.cache_dir)
            .with_context(|| {
                format!(
                    "Failed to read cache directory: {}",
                    cfg.storage.cache_dir.display()
                )
            })?
            .len()
    } else {
        0
    };
    println!("cached indexes: {}", cached);
    Ok(())
}

//! racache - maintenance tool for random access cache files
//!
//! Inspects and edits the cache sets under a cache root. Keys and values are
//! JSON documents, matching the default serializer.
//!
//! ```text
//! racache list
//! racache stats [--prometheus]
//! racache get <cache> <set> <key> [--tag <tag>]
//! racache organise <cache> <set> --check-integrity
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use racache::config::FileSettings;
use racache::{naming, CacheConfig, JsonSerializer, RaCacheService, SetStats, StatsExporter};

type Service = RaCacheService<Value, Value, JsonSerializer>;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Inspect and maintain random access cache files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache root directory (overrides the settings file)
    #[arg(long, env = "MINERVA_CACHE_PATH")]
    cache_root: Option<PathBuf>,

    /// Settings file (default: discovered like other minerva tools)
    #[arg(long, env = "MINERVA_SETTINGS_FILE")]
    settings_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List cache types and their sets
    List,

    /// Print statistics for every set
    Stats {
        /// Only this cache type
        cache: Option<String>,

        /// Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
    },

    /// Print every key of a set, across all tags unless one is given
    Keys {
        cache: String,
        set: String,
        #[arg(long)]
        tag: Option<String>,
    },

    /// Print the value stored under a key
    Get {
        cache: String,
        set: String,
        /// Key as JSON
        key: String,
        #[arg(long)]
        tag: Option<String>,
    },

    /// Store a value
    Put {
        cache: String,
        set: String,
        /// Key as JSON
        key: String,
        /// Value as JSON
        value: String,
        #[arg(long)]
        tag: Option<String>,
    },

    /// Delete a key from every tag of a set
    Delete {
        cache: String,
        set: String,
        /// Key as JSON
        key: String,
    },

    /// Compact every tag of a set
    Organise {
        cache: String,
        set: String,
        /// Verify that every kept package deserializes
        #[arg(long)]
        check_integrity: bool,
    },

    /// Remove every entry from every tag of a set
    Empty { cache: String, set: String },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    info!(root = %config.root.display(), "Using cache root");
    let service: Service = RaCacheService::new(config, JsonSerializer);

    match args.command {
        Command::List => list(&service)?,
        Command::Stats { cache, prometheus } => stats(&service, cache.as_deref(), prometheus)?,
        Command::Keys { cache, set, tag } => {
            let keys = match tag {
                Some(tag) => service
                    .cache(&cache)
                    .tagged_set(&set, Some(tag.as_str()))
                    .map(|s| s.get_all_keys())
                    .unwrap_or_default(),
                None => service.get_keys(&cache, &set),
            };
            for key in keys {
                println!("{}", serde_json::to_string(&key)?);
            }
        }
        Command::Get {
            cache,
            set,
            key,
            tag,
        } => {
            service.set_cache_tag(&cache, tag, false);
            match service.get(&cache, &set, &parse_json(&key)?) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&*value)?),
                None => bail!("no entry for {} in {}/{}", key, cache, set),
            }
        }
        Command::Put {
            cache,
            set,
            key,
            value,
            tag,
        } => {
            service.set_cache_tag(&cache, tag, false);
            service.put(&cache, &set, parse_json(&key)?, parse_json(&value)?);
        }
        Command::Delete { cache, set, key } => {
            if !service.delete(&cache, &set, &parse_json(&key)?) {
                bail!("failed to delete {} from {}/{}", key, cache, set);
            }
        }
        Command::Organise {
            cache,
            set,
            check_integrity,
        } => {
            let report = service.cache(&cache).clean_all_sets(&set, check_integrity);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Empty { cache, set } => service.delete_set(&cache, &set),
    }

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let settings = match &args.settings_file {
        Some(path) => FileSettings::load(path),
        None => FileSettings::discover("minerva"),
    }
    .context("failed to load settings")?;
    debug!(file = ?settings.path(), "Settings loaded");

    let mut config = CacheConfig::from_settings(&settings).context("invalid cache settings")?;
    if let Some(root) = &args.cache_root {
        std::fs::create_dir_all(root)
            .with_context(|| format!("cannot create cache root {}", root.display()))?;
        config.root = root.clone();
    }
    // A one-shot command has no use for periodic dumps
    config.stats_interval = None;
    Ok(config)
}

fn parse_json(text: &str) -> anyhow::Result<Value> {
    serde_json::from_str(text).with_context(|| format!("not valid JSON: {}", text))
}

// =============================================================================
// Commands
// =============================================================================

/// Register every cache type found under the root
fn discover_caches(service: &Service) -> anyhow::Result<Vec<String>> {
    let root = &service.config().root;
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root).with_context(|| format!("cannot read {}", root.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = naming::desanitize(&entry.file_name().to_string_lossy());
            service.cache(&name);
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn list(service: &Service) -> anyhow::Result<()> {
    for name in discover_caches(service)? {
        let cache = service.cache(&name);
        for set_name in cache.set_names() {
            for set in cache.all_sets(&set_name) {
                match set.tag_name() {
                    Some(tag) => println!("{}\t{}\t{}", name, set_name, tag),
                    None => println!("{}\t{}", name, set_name),
                }
            }
        }
    }
    Ok(())
}

fn stats(service: &Service, only: Option<&str>, prometheus: bool) -> anyhow::Result<()> {
    let names = match only {
        Some(name) => vec![name.to_string()],
        None => discover_caches(service)?,
    };
    let stats: Vec<SetStats> = names
        .iter()
        .flat_map(|name| service.cache(name).stats())
        .collect();

    if prometheus {
        let exporter = StatsExporter::new()?;
        exporter.observe(&stats);
        print!("{}", exporter.render()?);
    } else {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so command output stays parseable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

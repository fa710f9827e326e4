//! SliceKV CLI - store administration and data access

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::fs;
use std::ops::Bound;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use slicekv_common::{Mutation, MutationResult, OrderSource, SetPolicy, StoreConfig, StoreKey};
use slicekv_store::KeyValueStore;

#[derive(Parser)]
#[command(name = "slicekv", about = "SliceKV store administration", version)]
struct Args {
    /// Backing data file (repeat once per file, in format order)
    #[arg(short, long = "file", value_name = "PATH")]
    files: Vec<PathBuf>,

    /// TOML config file; command-line flags override it
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Total cache budget, e.g. 64M or 2G
    #[arg(long, value_name = "SIZE")]
    cache_max_size: Option<String>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a new store over the configured files
    Create {
        /// Number of data shards
        #[arg(short = 'n', long, default_value_t = 4)]
        shards: u32,
    },
    /// Probe whether the configured files hold an openable store
    Check,
    /// Read one key
    Get { key: String },
    /// Write one key
    Set { key: String, value: String },
    /// Delete one key
    Del { key: String },
    /// Ordered scan over a key range
    Scan {
        /// Lowest key of the range
        #[arg(long)]
        from: Option<String>,
        /// Upper end of the range
        #[arg(long)]
        to: Option<String>,
        /// Leave out the --from key itself
        #[arg(long)]
        from_exclusive: bool,
        /// Leave out the --to key itself
        #[arg(long)]
        to_exclusive: bool,
    },
    /// Store metadata records
    Meta {
        #[command(subcommand)]
        command: MetaCommand,
    },
    /// Operation counters and latencies
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MetaCommand {
    /// Read a metadata record
    Get { name: String },
    /// Write a metadata record
    Set { name: String, value: String },
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with(fmt::layer())
        .init();
    let config = load_config(&args)?;

    match args.command {
        Command::Create { shards } => {
            KeyValueStore::create(&config, shards)?;
            println!(
                "formatted {} data shard(s) over {} file(s)",
                shards,
                config.files.len()
            );
        }
        Command::Check => {
            let (tx, rx) = std::sync::mpsc::channel();
            KeyValueStore::check_existing(&config.files, move |ok| {
                let _ = tx.send(ok);
            });
            if rx.recv()? {
                println!("valid store");
            } else {
                println!("no valid store");
                std::process::exit(1);
            }
        }
        Command::Get { key } => {
            let store = KeyValueStore::open(&config)?;
            let mut source = OrderSource::new(1);
            let got = store.get(
                &StoreKey::new(key.into_bytes())?,
                source.check_in().with_read_mode(),
            )?;
            store.shutdown();
            match got {
                Some(result) => println!("{}", display_bytes(&result.value)),
                None => {
                    println!("not found");
                    std::process::exit(1);
                }
            }
        }
        Command::Set { key, value } => {
            let store = KeyValueStore::open(&config)?;
            let mut source = OrderSource::new(1);
            let mutation = Mutation::Set {
                key: StoreKey::new(key.into_bytes())?,
                value: value.into_bytes(),
                policy: SetPolicy::Upsert,
            };
            let result = store.change(mutation, source.check_in())?;
            store.shutdown();
            println!("{result:?}");
        }
        Command::Del { key } => {
            let store = KeyValueStore::open(&config)?;
            let mut source = OrderSource::new(1);
            let mutation = Mutation::Delete {
                key: StoreKey::new(key.into_bytes())?,
            };
            let result = store.change(mutation, source.check_in())?;
            store.shutdown();
            match result {
                MutationResult::Deleted => println!("deleted"),
                MutationResult::NotFound => {
                    println!("not found");
                    std::process::exit(1);
                }
                other => println!("{other:?}"),
            }
        }
        Command::Scan {
            from,
            to,
            from_exclusive,
            to_exclusive,
        } => {
            let left = scan_bound(from, from_exclusive)?;
            let right = scan_bound(to, to_exclusive)?;
            let store = KeyValueStore::open(&config)?;
            let mut source = OrderSource::new(1);
            let scan = store.rget(left, right, source.check_in().with_read_mode())?;
            let mut entries = 0usize;
            for (key, value) in scan {
                println!(
                    "{}\t{}",
                    display_bytes(key.as_bytes()),
                    display_bytes(&value)
                );
                entries += 1;
            }
            store.shutdown();
            eprintln!("{entries} entries");
        }
        Command::Meta { command } => {
            let store = KeyValueStore::open(&config)?;
            match command {
                MetaCommand::Get { name } => {
                    let got = store.get_meta(&name)?;
                    store.shutdown();
                    match got {
                        Some(value) => println!("{}", display_bytes(&value)),
                        None => {
                            println!("not found");
                            std::process::exit(1);
                        }
                    }
                }
                MetaCommand::Set { name, value } => {
                    store.set_meta(&name, value.as_bytes())?;
                    store.shutdown();
                    println!("stored");
                }
            }
        }
        Command::Stats { json } => {
            let store = KeyValueStore::open(&config)?;
            let snapshot = store.metrics();
            store.shutdown();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("gets:            {}", snapshot.gets);
                println!("rgets:           {}", snapshot.rgets);
                println!(
                    "changes:         {} (mean {} us, max {} us)",
                    snapshot.changes.count,
                    snapshot.changes.mean_micros,
                    snapshot.changes.max_micros
                );
                println!(
                    "relayed changes: {} (mean {} us, max {} us)",
                    snapshot.relayed_changes.count,
                    snapshot.relayed_changes.mean_micros,
                    snapshot.relayed_changes.max_micros
                );
            }
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => StoreConfig::default(),
    };
    if !args.files.is_empty() {
        config.files = args.files.clone();
    }
    if let Some(size) = &args.cache_max_size {
        config.cache.max_size = parse_size(size)?;
        config.cache.max_dirty_size = config.cache.max_size / 2;
        config.cache.flush_dirty_size = config.cache.max_size / 4;
    }
    if config.files.is_empty() {
        bail!("no data files given; use --file or a config file");
    }
    Ok(config)
}

/// Maps one end of a scan range onto a key bound. Named keys are part
/// of the range unless `exclusive`; an absent key leaves that side
/// open.
fn scan_bound(key: Option<String>, exclusive: bool) -> Result<Bound<StoreKey>> {
    match key {
        Some(k) => {
            let k = StoreKey::new(k.into_bytes())?;
            Ok(if exclusive {
                Bound::Excluded(k)
            } else {
                Bound::Included(k)
            })
        }
        None => Ok(Bound::Unbounded),
    }
}

fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    let (number, multiplier) = match input.chars().last() {
        Some('K' | 'k') => (&input[..input.len() - 1], 1024u64),
        Some('M' | 'm') => (&input[..input.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&input[..input.len() - 1], 1024 * 1024 * 1024),
        _ => (input, 1),
    };
    let value: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid size: {input}"))?;
    Ok(value * multiplier)
}

/// Shows printable UTF-8 as-is and everything else as hex.
fn display_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if !s.chars().any(char::is_control) => s.to_string(),
        _ => format!("0x{}", hex::encode(bytes)),
    }
}

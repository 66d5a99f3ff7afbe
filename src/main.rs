//! # Context Sync CLI (`ctx-sync`)
//!
//! Thin command-line front end over the `context_sync` library.
//!
//! ## Usage
//!
//! ```bash
//! ctx-sync --config ./config/ctx-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctx-sync index <kind>:<name>` | Index a configured source (full or incremental) |
//! | `ctx-sync list` | List stored indexes |
//! | `ctx-sync delete <key>` | Delete a local index |
//! | `ctx-sync search <index> <query>` | Search an index |
//! | `ctx-sync ls <index> [dir]` | List files in the indexed snapshot |
//! | `ctx-sync cat <index> <path>` | Print a file from the indexed snapshot |
//!
//! Read commands accept `--index <spec>` (repeatable) to query indexes
//! outside the default store: `path:/srv/indexes/docs` or
//! `s3://bucket/prefix/docs`.
//!
//! Logs go to stderr; set `RUST_LOG` or pass `--verbose` for more detail.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use context_sync::clients::IndexClientCache;
use context_sync::config::{self, Config, Credentials};
use context_sync::indexer::Indexer;
use context_sync::source::{Source, SourceOptions};
use context_sync::store_composite::{CompositeStoreReader, RemoteAccess};
use context_sync::store_fs::FilesystemStore;
use context_sync::store_layered::{LayeredStore, ReadOnlyLayeredStore};
use context_sync::store_s3::ObjectStore;
use context_sync_core::engine::LocalEngineFactory;
use context_sync_core::index_spec::IndexSpec;
use context_sync_core::models::FileType;
use context_sync_core::store::{IndexStore, IndexStoreReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_CONFIG: &str = "./config/ctx-sync.toml";

/// Context Sync: keep context-engine indexes in step with remote sources.
#[derive(Parser)]
#[command(
    name = "ctx-sync",
    about = "Sync GitHub, GitLab, Bitbucket, and website content into durable context indexes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ctx-sync.toml`; built-in defaults are used
    /// when that file does not exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a configured source.
    ///
    /// The first run for a key is a full index. Later runs apply only the
    /// files that changed since the stored commit, falling back to a full
    /// rebuild when that is not safe.
    Index {
        /// Source as `<kind>:<name>`, e.g. `github:widgets`.
        source: String,

        /// Store key (defaults to the source name).
        #[arg(long)]
        key: Option<String>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List stored indexes.
    List {
        #[command(flatten)]
        indexes: IndexArgs,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete an index from the local store.
    ///
    /// Indexes that exist only in the remote store cannot be deleted.
    Delete {
        key: String,
    },

    /// Search an index.
    Search {
        index: String,
        query: String,

        /// Ask a question about the results instead of listing them.
        #[arg(long)]
        ask: Option<String>,

        /// Truncate output to this many characters.
        #[arg(long)]
        max_output: Option<usize>,

        #[command(flatten)]
        indexes: IndexArgs,
    },

    /// List files in an index's source at the indexed revision.
    Ls {
        index: String,

        #[arg(default_value = "")]
        directory: String,

        #[command(flatten)]
        indexes: IndexArgs,
    },

    /// Print a file from an index's source at the indexed revision.
    Cat {
        index: String,
        path: String,

        #[command(flatten)]
        indexes: IndexArgs,
    },
}

#[derive(clap::Args)]
struct IndexArgs {
    /// Index spec: a name, `path:<dir>`, or `s3://bucket/prefix/name`.
    /// Repeatable; restricts the command to these indexes.
    #[arg(long = "index", value_name = "SPEC")]
    specs: Vec<String>,
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();
}

fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                config::load_config(default)
            } else {
                Ok(Config::minimal())
            }
        }
    }
}

struct App {
    config: Config,
    credentials: Credentials,
    local: Arc<FilesystemStore>,
    remote: Option<Arc<ObjectStore>>,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let credentials = Credentials::from_env();
        let local = Arc::new(FilesystemStore::new(config.store.indexes_dir()));
        let remote = match &config.store.remote {
            Some(remote) => Some(Arc::new(ObjectStore::new(
                remote.clone(),
                credentials.aws.clone(),
            )?)),
            None => None,
        };
        Ok(Self {
            config,
            credentials,
            local,
            remote,
        })
    }

    fn options(&self) -> SourceOptions {
        SourceOptions::from_config(&self.config, self.credentials.clone())
    }

    /// Local store, layered over the remote one when configured.
    fn writer(&self) -> Arc<dyn IndexStore> {
        match &self.remote {
            Some(remote) => Arc::new(LayeredStore::new(
                self.local.clone(),
                remote.clone(),
            )),
            None => self.local.clone(),
        }
    }

    fn reader(&self) -> Arc<dyn IndexStoreReader> {
        match &self.remote {
            Some(remote) => Arc::new(ReadOnlyLayeredStore::new(
                self.local.clone(),
                remote.clone(),
            )),
            None => self.local.clone(),
        }
    }

    /// Client cache over the default store, or over `--index` specs.
    async fn clients(&self, args: &IndexArgs) -> Result<IndexClientCache> {
        let engines = Arc::new(LocalEngineFactory);
        if args.specs.is_empty() {
            return IndexClientCache::new(self.reader(), engines, self.options(), None).await;
        }

        let specs = IndexSpec::parse_all(&args.specs)?;
        let access = RemoteAccess {
            template: self.config.store.remote.clone(),
            creds: self.credentials.aws.clone(),
        };
        let composite = CompositeStoreReader::from_specs(&specs, self.reader(), &access)?;
        let names = composite.display_names().to_vec();
        IndexClientCache::new(Arc::new(composite), engines, self.options(), Some(names)).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let app = App::new(load(cli.config.as_deref())?)?;

    match cli.command {
        Commands::Index { source, key, json } => {
            let source_config = app.config.source(&source)?;
            let key = match key {
                Some(key) => key,
                None => source
                    .split_once(':')
                    .map(|(_, name)| name.to_string())
                    .context("source must be <kind>:<name>")?,
            };
            let source = Source::from_config(&source_config, &app.options())?;
            let indexer = Indexer::new(Arc::new(LocalEngineFactory));
            let store = app.writer();
            let result = indexer.index(&source, store.as_ref(), &key).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "{} index of '{}': {} indexed, {} removed, {} uploaded, {} unchanged ({} ms)",
                    result.kind.as_str(),
                    key,
                    result.files_indexed,
                    result.files_removed,
                    result.files_new_or_modified,
                    result.files_unchanged,
                    result.duration_ms
                );
            }
        }
        Commands::List { indexes, json } => {
            let cache = app.clients(&indexes).await?;
            let list = cache.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if list.is_empty() {
                println!("No indexes found.");
            } else {
                for info in list {
                    println!(
                        "{:<24} {:<10} {:<40} {}",
                        info.name,
                        info.source_type.as_str(),
                        info.identifier,
                        info.synced_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        Commands::Delete { key } => {
            app.writer().delete(&key).await?;
            println!("Deleted index '{}'.", key);
        }
        Commands::Search {
            index,
            query,
            ask,
            max_output,
            indexes,
        } => {
            let mut cache = app.clients(&indexes).await?;
            let client = cache.get_client(&index).await?;
            let out = match ask {
                Some(question) => client.search_and_ask(&query, &question).await?,
                None => client.search(&query, max_output).await?,
            };
            println!("{}", out);
        }
        Commands::Ls {
            index,
            directory,
            indexes,
        } => {
            let mut cache = app.clients(&indexes).await?;
            let client = cache.get_client(&index).await?;
            for entry in client.list_files(&directory).await? {
                match entry.file_type {
                    FileType::Directory => println!("{}/", entry.path),
                    FileType::File => println!("{}", entry.path),
                }
            }
        }
        Commands::Cat {
            index,
            path,
            indexes,
        } => {
            let mut cache = app.clients(&indexes).await?;
            let client = cache.get_client(&index).await?;
            match client.read_file(&path).await? {
                Some(text) => print!("{}", text),
                None => anyhow::bail!(context_sync_core::SyncError::not_found(format!(
                    "'{}' in index '{}'",
                    path, index
                ))),
            }
        }
    }

    Ok(())
}

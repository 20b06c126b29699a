use std::{path::PathBuf, sync::Arc, time::Duration as StdDuration};

use anyhow::{Context, anyhow, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Table, presets::UTF8_FULL};
use keyset_core::{
    FileEventLog, FileMaterialVault, KeysetAlgorithm, KeysetCache, KeysetCriteria, KeysetManager,
    KeysetMetadata, KeysetMetadataDefinition, KeysetQuery, KeysetSort, KeysetState,
    LocalCryptoEngine, NamespaceDirectory, OperationGateway, PurgePolicy, PurgeSweeper,
    RetentionPurgePolicy, SqliteKeysetStore,
};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::time::{MissedTickBehavior, interval as tick_interval};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

type Manager = KeysetManager<SqliteKeysetStore, LocalCryptoEngine, FileEventLog>;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Keyset registry administration",
    propagate_version = true
)]
struct Cli {
    /// SQLite database holding keyset metadata and namespaces.
    #[arg(long, env = "KEYSET_DATABASE", default_value = "data/keysets.sqlite")]
    database: PathBuf,

    /// Directory for sealed key material.
    #[arg(long, env = "KEYSET_MATERIAL_DIR", default_value = "data/material")]
    material_dir: PathBuf,

    /// Hash-chained lifecycle event log.
    #[arg(long, env = "KEYSET_EVENT_LOG", default_value = "data/events.log")]
    event_log: PathBuf,

    /// Base64 encoded 32 byte key sealing material at rest.
    #[arg(long, env = "KEYSET_MASTER_KEY", hide_env_values = true)]
    master_key: Option<String>,

    /// Base64 encoded 32 byte key authenticating sealed material.
    #[arg(long, env = "KEYSET_HMAC_KEY", hide_env_values = true)]
    hmac_key: Option<String>,

    /// Metadata cache time-to-live in seconds; 0 disables the cache.
    #[arg(long, default_value_t = 30)]
    cache_ttl_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage tenant namespaces.
    Namespace {
        #[command(subcommand)]
        action: NamespaceCommands,
    },
    /// Create a keyset.
    Create {
        #[arg(long)]
        namespace: String,
        name: String,
        #[arg(value_parser = parse_algorithm)]
        algorithm: KeysetAlgorithm,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Rotation interval hint in days.
        #[arg(long)]
        rotation_days: Option<u32>,
    },
    /// List keysets.
    List {
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long, value_parser = parse_algorithm)]
        algorithm: Option<KeysetAlgorithm>,
        #[arg(long, value_parser = parse_state)]
        state: Option<KeysetState>,
        /// Case-insensitive match against name and description.
        #[arg(long)]
        term: Option<String>,
        #[arg(long, value_enum, default_value_t = SortArg::Created)]
        sort: SortArg,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, value_name = "COUNT", default_value_t = 50)]
        per_page: u32,
    },
    /// Show one keyset.
    Get {
        id: Uuid,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Replace description and tags of an active keyset.
    Update {
        id: Uuid,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Move a keyset to ACTIVE, INACTIVE or PENDING_DESTRUCTION.
    Transition {
        id: Uuid,
        #[arg(value_parser = parse_state)]
        state: KeysetState,
    },
    /// Add a new primary key version.
    Rotate { id: Uuid },
    /// Irreversibly delete a keyset and its key material.
    Delete {
        id: Uuid,
        #[arg(long)]
        yes: bool,
    },
    /// Encrypt with an AEAD keyset; prints base64 ciphertext.
    Encrypt {
        id: Uuid,
        plaintext: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long, default_value = "")]
        aad: String,
        /// Treat the plaintext as base64.
        #[arg(long)]
        base64: bool,
    },
    /// Decrypt base64 ciphertext produced by `encrypt`.
    Decrypt {
        id: Uuid,
        ciphertext_b64: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long, default_value = "")]
        aad: String,
    },
    /// Sign a payload with a signature keyset; prints base64 signature.
    Sign {
        id: Uuid,
        payload: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        base64: bool,
    },
    /// Verify a base64 signature produced by `sign`.
    Verify {
        id: Uuid,
        payload: String,
        signature_b64: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        base64: bool,
    },
    /// Show recent lifecycle events.
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Recompute the hash chain before printing.
        #[arg(long)]
        verify: bool,
    },
    /// Delete PENDING_DESTRUCTION keysets whose grace period has elapsed.
    Reap {
        /// Retention policy file (YAML, or JSON by extension).
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Grace period when no policy file is given.
        #[arg(long, default_value_t = 30)]
        grace_days: u32,
        /// Keep sweeping on this interval instead of running once.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum NamespaceCommands {
    Add { name: String },
    List,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SortArg {
    Created,
    Name,
    NameDesc,
}

impl From<SortArg> for KeysetSort {
    fn from(value: SortArg) -> KeysetSort {
        match value {
            SortArg::Created => KeysetSort::Created,
            SortArg::Name => KeysetSort::NameAsc,
            SortArg::NameDesc => KeysetSort::NameDesc,
        }
    }
}

fn parse_algorithm(value: &str) -> Result<KeysetAlgorithm, String> {
    value.parse().map_err(|err: keyset_core::KeysetError| err.to_string())
}

fn parse_state(value: &str) -> Result<KeysetState, String> {
    value.parse().map_err(|err: keyset_core::KeysetError| err.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let (manager, store, events) = open_registry(&cli)?;

    match cli.command {
        Commands::Namespace { action } => match action {
            NamespaceCommands::Add { name } => {
                store
                    .register(&name)
                    .with_context(|| format!("registering namespace {name}"))?;
                println!("namespace {name} registered");
            }
            NamespaceCommands::List => {
                for namespace in store.list()? {
                    println!("{namespace}");
                }
            }
        },
        Commands::Create {
            namespace,
            name,
            algorithm,
            description,
            tags,
            rotation_days,
        } => {
            let definition = KeysetMetadataDefinition::new(
                namespace,
                algorithm,
                name,
                description,
                tags,
                rotation_days.map(|days| Duration::days(i64::from(days))),
            )?;
            let metadata = manager.create(definition).context("creating keyset")?;
            print_keyset(&metadata, 1);
        }
        Commands::List {
            namespace,
            algorithm,
            state,
            term,
            sort,
            page,
            per_page,
        } => {
            let query = KeysetQuery {
                criteria: KeysetCriteria {
                    namespace,
                    algorithm,
                    state,
                    id: None,
                },
                term,
                sort: sort.into(),
                page,
                per_page,
            };
            list_keysets(&manager, &query)?;
        }
        Commands::Get { id, namespace } => {
            let metadata = match namespace.as_deref() {
                Some(namespace) => manager.get_in(namespace, &id),
                None => manager.get(&id),
            }
            .with_context(|| format!("loading keyset {id}"))?;
            let versions = manager.version_count(&id)?;
            print_keyset(&metadata, versions);
        }
        Commands::Update {
            id,
            description,
            tags,
        } => {
            let metadata = manager
                .update(&id, description, tags)
                .with_context(|| format!("updating keyset {id}"))?;
            print_keyset(&metadata, manager.version_count(&id)?);
        }
        Commands::Transition { id, state } => {
            let metadata = manager
                .transition(&id, state)
                .with_context(|| format!("transitioning keyset {id} to {state}"))?;
            println!("keyset {id} is {}", metadata.state);
        }
        Commands::Rotate { id } => {
            manager
                .rotate(&id)
                .with_context(|| format!("rotating keyset {id}"))?;
            println!(
                "keyset {id} rotated; {} versions retained",
                manager.version_count(&id)?
            );
        }
        Commands::Delete { id, yes } => {
            if !yes {
                bail!("refusing to destroy keyset {id} without --yes");
            }
            manager
                .delete(&id)
                .with_context(|| format!("deleting keyset {id}"))?;
            println!("keyset {id} and its key material destroyed");
        }
        Commands::Encrypt {
            id,
            plaintext,
            namespace,
            aad,
            base64,
        } => {
            let gateway = resolve(&manager, namespace.as_deref(), &id)?;
            let plaintext = payload_bytes(&plaintext, base64)?;
            let ciphertext = gateway.encrypt(&plaintext, aad.as_bytes())?;
            println!("{}", B64.encode(ciphertext));
        }
        Commands::Decrypt {
            id,
            ciphertext_b64,
            namespace,
            aad,
        } => {
            let gateway = resolve(&manager, namespace.as_deref(), &id)?;
            let ciphertext = B64
                .decode(ciphertext_b64.trim())
                .context("ciphertext is not valid base64")?;
            let plaintext = gateway.decrypt(&ciphertext, aad.as_bytes())?;
            match String::from_utf8(plaintext) {
                Ok(text) => println!("{text}"),
                Err(err) => println!("{}", B64.encode(err.into_bytes())),
            }
        }
        Commands::Sign {
            id,
            payload,
            namespace,
            base64,
        } => {
            let gateway = resolve(&manager, namespace.as_deref(), &id)?;
            let signature = gateway.sign(&payload_bytes(&payload, base64)?)?;
            println!("{}", B64.encode(signature));
        }
        Commands::Verify {
            id,
            payload,
            signature_b64,
            namespace,
            base64,
        } => {
            let gateway = resolve(&manager, namespace.as_deref(), &id)?;
            let signature = B64
                .decode(signature_b64.trim())
                .context("signature is not valid base64")?;
            gateway.verify(&payload_bytes(&payload, base64)?, &signature)?;
            println!("signature valid");
        }
        Commands::Events { limit, verify } => {
            if verify {
                let checked = events.verify_chain().context("event log verification")?;
                println!("event chain intact ({checked} entries)");
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Occurred", "Kind", "Namespace", "Keyset", "Hash"]);
            for entry in events.tail(limit)? {
                table.add_row(vec![
                    format_time(entry.event.occurred_at),
                    entry.event.kind.to_string(),
                    entry.event.namespace.clone(),
                    entry.event.keyset_id.to_string(),
                    entry.hash.chars().take(16).collect(),
                ]);
            }
            println!("{table}");
        }
        Commands::Reap {
            policy,
            grace_days,
            interval_secs,
        } => {
            let policy: Arc<dyn PurgePolicy> = match policy {
                Some(path) => Arc::new(
                    RetentionPurgePolicy::from_path(&path)
                        .with_context(|| format!("loading retention policy {}", path.display()))?,
                ),
                None => Arc::new(RetentionPurgePolicy::with_grace(Duration::days(i64::from(
                    grace_days,
                )))),
            };
            let sweeper = PurgeSweeper::new(Arc::new(manager), policy);
            match interval_secs {
                Some(secs) => run_reaper(sweeper, StdDuration::from_secs(secs.max(1))).await?,
                None => {
                    let report = sweeper.run_once(OffsetDateTime::now_utc())?;
                    println!(
                        "examined {} pending keysets, purged {}, skipped {}, failed {}",
                        report.examined,
                        report.purged.len(),
                        report.skipped.len(),
                        report.failed.len()
                    );
                    for (id, reason) in &report.failed {
                        println!("  {id}: {reason}");
                    }
                }
            }
        }
    }
    Ok(())
}

fn open_registry(
    cli: &Cli,
) -> anyhow::Result<(Manager, Arc<SqliteKeysetStore>, Arc<FileEventLog>)> {
    if let Some(parent) = cli.database.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(
        SqliteKeysetStore::new(&cli.database)
            .with_context(|| format!("opening {}", cli.database.display()))?,
    );
    let vault = Arc::new(
        FileMaterialVault::new(&cli.material_dir)
            .with_context(|| format!("opening {}", cli.material_dir.display()))?,
    );
    let master_key = decode_key("master key", cli.master_key.as_deref())?;
    let hmac_key = decode_key("hmac key", cli.hmac_key.as_deref())?;
    let engine = Arc::new(LocalCryptoEngine::new(vault, master_key, hmac_key));
    let events = Arc::new(FileEventLog::new(&cli.event_log)?);

    let mut manager = KeysetManager::new(store.clone(), engine, events.clone(), store.clone())?;
    if cli.cache_ttl_secs > 0 {
        manager =
            manager.with_cache(Arc::new(KeysetCache::new(StdDuration::from_secs(cli.cache_ttl_secs))));
    }
    Ok((manager, store, events))
}

fn decode_key(label: &str, value: Option<&str>) -> anyhow::Result<[u8; 32]> {
    let value = value.ok_or_else(|| {
        anyhow!("{label} is required (--{} or environment)", label.replace(' ', "-"))
    })?;
    let bytes = B64
        .decode(value.trim())
        .with_context(|| format!("{label} is not valid base64"))?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow!("{label} must be 32 bytes, got {}", bytes.len()))
}

fn resolve(
    manager: &Manager,
    namespace: Option<&str>,
    id: &Uuid,
) -> anyhow::Result<OperationGateway<LocalCryptoEngine>> {
    match namespace {
        Some(namespace) => manager.operations_in(namespace, id),
        None => manager.operations(id),
    }
    .with_context(|| format!("resolving keyset {id}"))
}

fn payload_bytes(input: &str, base64: bool) -> anyhow::Result<Vec<u8>> {
    if base64 {
        B64.decode(input.trim())
            .context("payload is not valid base64")
    } else {
        Ok(input.as_bytes().to_vec())
    }
}

fn list_keysets(manager: &Manager, query: &KeysetQuery) -> anyhow::Result<()> {
    let page = manager.find(query)?;
    let now = OffsetDateTime::now_utc();
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "ID",
        "Namespace",
        "Name",
        "Algorithm",
        "State",
        "Updated",
        "Rotation due",
    ]);
    for keyset in &page.items {
        table.add_row(vec![
            keyset.id.to_string(),
            keyset.namespace.clone(),
            keyset.name.clone(),
            keyset.algorithm.to_string(),
            keyset.state.to_string(),
            format_time(keyset.updated_at),
            if keyset.rotation_due(now) { "yes" } else { "" }.to_string(),
        ]);
    }
    println!("{table}");
    println!(
        "Showing page {} ({} items per page) - total {}{}",
        page.page,
        page.per_page,
        page.total,
        if page.has_more {
            ", more results available"
        } else {
            ""
        }
    );
    Ok(())
}

fn print_keyset(metadata: &KeysetMetadata, versions: usize) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    let tags = metadata.tags.iter().cloned().collect::<Vec<_>>().join(",");
    let rows = [
        ("ID", metadata.id.to_string()),
        ("Namespace", metadata.namespace.clone()),
        ("Name", metadata.name.clone()),
        ("Algorithm", metadata.algorithm.to_string()),
        ("State", metadata.state.to_string()),
        ("Description", metadata.description.clone().unwrap_or_default()),
        ("Tags", tags),
        ("Key versions", versions.to_string()),
        (
            "Rotation period",
            metadata
                .rotation_period
                .map(|period| format!("{} days", period.whole_days()))
                .unwrap_or_default(),
        ),
        ("Created", format_time(metadata.created_at)),
        ("Updated", format_time(metadata.updated_at)),
        (
            "Last rotated",
            metadata.last_rotated_at.map(format_time).unwrap_or_default(),
        ),
    ];
    for (field, value) in rows {
        table.add_row(vec![field.to_string(), value]);
    }
    println!("{table}");
}

fn format_time(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

async fn run_reaper(
    sweeper: PurgeSweeper<SqliteKeysetStore, LocalCryptoEngine, FileEventLog>,
    interval: StdDuration,
) -> anyhow::Result<()> {
    let mut ticker = tick_interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_secs = interval.as_secs(), "purge reaper started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sweeper = sweeper.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || sweeper.run_once(OffsetDateTime::now_utc()))
                    .await
                    .context("purge task join")
                    .and_then(|res| res.map_err(anyhow::Error::from))
                {
                    error!("purge sweep failed: {err:#}");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for shutdown signal")?;
                info!("purge reaper stopping");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_with_tags_and_rotation() {
        let cli = Cli::try_parse_from([
            "keysetctl",
            "create",
            "--namespace",
            "tenant-a",
            "payments",
            "aes256-gcm",
            "--tags",
            "pci,prod",
            "--rotation-days",
            "90",
        ])
        .unwrap();
        match cli.command {
            Commands::Create {
                algorithm,
                tags,
                rotation_days,
                ..
            } => {
                assert_eq!(algorithm, KeysetAlgorithm::Aes256Gcm);
                assert_eq!(tags, vec!["pci", "prod"]);
                assert_eq!(rotation_days, Some(90));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_state() {
        let id = Uuid::new_v4().to_string();
        assert!(Cli::try_parse_from(["keysetctl", "transition", id.as_str(), "retired"]).is_err());
    }

    #[test]
    fn decodes_keys_of_exact_length() {
        let key = B64.encode([7u8; 32]);
        assert_eq!(decode_key("master key", Some(&key)).unwrap(), [7u8; 32]);
        assert!(decode_key("master key", Some(&B64.encode([7u8; 16]))).is_err());
        assert!(decode_key("master key", None).is_err());
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use deckhive_adapters::{FixtureFetcher, JsonRecordParser};
use deckhive_storage::{BlobStore, LocalBlobStore};
use deckhive_sync::{rebuild_dedup_registry, ExportPass, ExtractionPipeline, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "deckhive-cli")]
#[command(about = "Deck corpus extraction runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay a fixture manifest through the extraction pipeline.
    Extract {
        #[command(flatten)]
        store: StoreArgs,
        /// JSON manifest of captured pages.
        #[arg(long)]
        manifest: PathBuf,
        /// Source id stamped on records that do not carry one.
        #[arg(long)]
        source: String,
    },
    /// Flatten changed records into JSONL and Parquet.
    Export {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Rebuild the dedup registry from stored records.
    Dedup {
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// Root of the local blob store (defaults to DECKHIVE_DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Dataset prefix inside the store (defaults to DECKHIVE_PREFIX).
    #[arg(long)]
    prefix: Option<String>,
}

impl StoreArgs {
    fn open(self) -> (SyncConfig, Arc<dyn BlobStore>) {
        let env = SyncConfig::from_env();
        let data_dir = self.data_dir.unwrap_or_else(|| env.data_dir.clone());
        let prefix = self.prefix.unwrap_or_else(|| env.prefix.clone());
        let config = env.for_local_store(data_dir, prefix);
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(config.data_dir.clone()));
        (config, store)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received Ctrl+C, cancelling run");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Extract {
            store,
            manifest,
            source,
        } => {
            let (config, store) = store.open();
            let fetcher = FixtureFetcher::from_manifest(&manifest)?;
            let urls = fetcher.urls();
            let pipeline = ExtractionPipeline::new(
                config,
                store,
                Arc::new(fetcher),
                Arc::new(JsonRecordParser::new(source)),
            )?;
            let summary = pipeline.run(&cancel, urls).await?;
            println!(
                "extract complete: run_id={} succeeded={} failed={} duplicates={} skipped={}",
                summary.run_id,
                summary.report.succeeded,
                summary.report.failed,
                summary.stats.duplicates,
                summary.stats.skipped
            );
        }
        Commands::Export { store } => {
            let (config, store) = store.open();
            let summary = ExportPass::new(config, store).run(&cancel).await?;
            println!(
                "export complete: run_id={} exported={} skipped={} rows={} jsonl={} parquet={}",
                summary.run_id,
                summary.exported,
                summary.skipped,
                summary.rows,
                summary.jsonl_key.as_deref().unwrap_or("-"),
                summary
                    .parquet_path
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Commands::Dedup { store } => {
            let (config, store) = store.open();
            let rebuild = rebuild_dedup_registry(&cancel, store, &config).await?;
            println!(
                "dedup rebuilt: records={} signatures={} duplicates={}",
                rebuild.records, rebuild.signatures, rebuild.duplicates
            );
        }
    }

    Ok(())
}

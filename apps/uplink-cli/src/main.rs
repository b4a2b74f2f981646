//! Command-line uploader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use uplink_engine::{EngineConfig, UploadEngine, UploadEvent};
use uplink_protocol::UploadStatus;
use uplink_transfer::{ChunkPlan, ChunkingConfig, SessionId};

#[derive(Parser)]
#[command(name = "uplink")]
#[command(about = "Resumable chunked uploads to S3 and Azure Blob Storage")]
#[command(version)]
struct Cli {
    /// Config file path (default: ~/.config/uplink/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Concurrent chunk requests per file (1-6)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Resume interrupted uploads of the same files
        #[arg(long, default_value_t = false)]
        resume: bool,
    },
    /// Show how a file would be split into chunks
    Plan {
        file: PathBuf,
        /// Part size in bytes (overrides config)
        #[arg(long)]
        part_size: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Upload {
            files,
            concurrency,
            resume,
        } => {
            if let Some(n) = concurrency {
                config.max_in_flight = n;
            }
            config.resume.enabled = resume;
            upload(config, files).await
        }
        Commands::Plan { file, part_size } => {
            let mut chunking = config.chunking.clone();
            if let Some(size) = part_size {
                chunking.part_size = size;
            }
            plan(&file, &chunking)
        }
    }
}

async fn upload(config: EngineConfig, files: Vec<PathBuf>) -> Result<()> {
    let resume = config.resume_path().is_some();
    let mut engine = UploadEngine::from_config(&config).context("invalid configuration")?;
    let mut events = engine.take_events().context("event receiver already taken")?;
    let engine = Arc::new(engine);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let mut ids = Vec::with_capacity(files.len());
    for file in &files {
        let submitted = if resume {
            let id = resume_id(file).await?;
            engine.submit_with_id(id, file, None).await
        } else {
            engine.submit(file, None).await
        };
        ids.push(submitted.with_context(|| format!("cannot upload {}", file.display()))?);
    }

    let mut uploads = JoinSet::new();
    for id in ids.iter().cloned() {
        let engine = Arc::clone(&engine);
        uploads.spawn(async move {
            let result = engine.upload(&id).await;
            (id, result)
        });
    }

    let mut failed = 0usize;
    loop {
        tokio::select! {
            joined = uploads.join_next() => {
                let Some(joined) = joined else { break };
                let (id, result) = joined.context("upload task panicked")?;
                match result {
                    Ok(outcome) => println!(
                        "{} -> {}/{} ({} bytes, {} parts)",
                        id, outcome.container, outcome.key, outcome.bytes, outcome.parts
                    ),
                    Err(e) if e.is_cancelled() => {
                        failed += 1;
                        if resume {
                            println!("{id}: interrupted, rerun with --resume to continue");
                        } else {
                            println!("{id}: cancelled");
                        }
                    }
                    Err(e) => {
                        failed += 1;
                        error!(session = %id, error = %e, "upload failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => stop_all(&engine, &ids, resume).await,
        }
    }

    drop(engine);
    let _ = printer.await;

    if failed > 0 {
        bail!("{failed} of {} uploads did not complete", files.len());
    }
    Ok(())
}

/// Stops every upload. With resume enabled the remote transactions and the
/// resume state are kept for the next run; otherwise uploads are cancelled
/// and cleaned up.
async fn stop_all(engine: &UploadEngine, ids: &[SessionId], resume: bool) {
    if resume {
        warn!("interrupted, keeping resume state for the next run");
    } else {
        warn!("interrupted, cancelling uploads");
    }
    for id in ids {
        let stopped = if resume {
            engine.suspend(id).await
        } else {
            engine.cancel(id).await
        };
        if let Err(e) = stopped {
            debug!(session = %id, error = %e, "stop skipped");
        }
    }
}

/// Session id derived from the file's absolute path and size, so a rerun
/// picks up the state an interrupted run persisted.
async fn resume_id(path: &Path) -> Result<SessionId> {
    let absolute = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("cannot access {}", path.display()))?;
    let size = tokio::fs::metadata(&absolute).await?.len();
    Ok(derive_id(&absolute, size))
}

fn derive_id(path: &Path, size: u64) -> SessionId {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(size.to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    SessionId::new(&digest[..32])
}

fn print_event(event: &UploadEvent) {
    match event {
        UploadEvent::ChunkAcked {
            session,
            chunk,
            acked,
            total,
        } => info!(session = %session, chunk, "{acked}/{total} chunks"),
        UploadEvent::StatusChanged { session, status } => match status {
            UploadStatus::Pending | UploadStatus::Complete => {
                debug!(session = %session, status = %status, "status")
            }
            _ => info!(session = %session, status = %status, "status"),
        },
        UploadEvent::Reset { session, reason } => {
            warn!(session = %session, reason = %reason, "upload restarted")
        }
        UploadEvent::ChunkProgress { .. } => {}
        other => debug!(session = %other.session(), event = ?other, "event"),
    }
}

fn plan(file: &Path, chunking: &ChunkingConfig) -> Result<()> {
    let size = std::fs::metadata(file)
        .with_context(|| format!("cannot access {}", file.display()))?
        .len();
    let plan = ChunkPlan::compute(size, chunking)?;

    println!("{}: {} bytes, {:?}", file.display(), size, plan.mode());
    for d in plan.descriptors() {
        println!("  chunk {:>5}  {:>12}..{:<12}  {} bytes", d.index, d.start, d.end, d.size());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use uplink_engine::{BackendConfig, S3Config};
    use uplink_protocol::{ChunkReceipt, PersistedState, ReceiptStatus};
    use uplink_transfer::{JsonFileStore, PersistenceAdapter};

    use super::*;

    #[test]
    fn derived_id_is_stable_per_path_and_size() {
        let a = derive_id(Path::new("/data/a.bin"), 10);
        assert_eq!(a, derive_id(Path::new("/data/a.bin"), 10));
        assert_ne!(a, derive_id(Path::new("/data/a.bin"), 11));
        assert_ne!(a, derive_id(Path::new("/data/b.bin"), 10));
        assert_eq!(a.as_str().len(), 32);
    }

    #[tokio::test]
    async fn resume_id_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        let id = resume_id(&path).await.unwrap();
        let absolute = std::fs::canonicalize(&path).unwrap();
        assert_eq!(id, derive_id(&absolute, 5));
    }

    #[test]
    fn cli_parses_upload() {
        let cli = Cli::parse_from(["uplink", "upload", "a.bin", "b.bin", "--concurrency", "4", "--resume"]);
        match cli.command {
            Commands::Upload {
                files,
                concurrency,
                resume,
            } => {
                assert_eq!(files.len(), 2);
                assert_eq!(concurrency, Some(4));
                assert!(resume);
            }
            _ => panic!("expected upload"),
        }
    }

    #[tokio::test]
    async fn interrupt_with_resume_keeps_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, [7u8; 12]).unwrap();
        let state_path = dir.path().join("resume.json");
        let id = SessionId::from("a");
        JsonFileStore::new(state_path.clone())
            .unwrap()
            .save(
                &id,
                &PersistedState {
                    remote_handle: Some("up-1".into()),
                    key: Some("k/a.bin".into()),
                    receipts: vec![ChunkReceipt {
                        index: 0,
                        token: "\"e1\"".into(),
                        status: ReceiptStatus::Acked,
                    }],
                    file_size: 12,
                    chunk_size: 5,
                    container: "bucket".into(),
                },
            )
            .unwrap();

        let mut config = EngineConfig::default();
        config.backend = BackendConfig::S3(S3Config {
            endpoint: "https://bucket.s3.amazonaws.com".into(),
            bucket: "bucket".into(),
            ..S3Config::default()
        });
        config.signature.url = "http://127.0.0.1:9/sign".into();
        config.chunking = ChunkingConfig {
            enabled: true,
            part_size: 5,
            min_file_size: 0,
        };
        config.resume.enabled = true;
        config.resume.path = Some(state_path.clone());

        let engine = UploadEngine::from_config(&config).unwrap();
        engine.submit_with_id(id.clone(), &file, None).await.unwrap();
        stop_all(&engine, std::slice::from_ref(&id), true).await;

        assert!(engine.sessions().is_empty());
        let reopened = JsonFileStore::new(state_path).unwrap();
        let state = reopened.load(&id).unwrap().unwrap();
        assert_eq!(state.remote_handle.as_deref(), Some("up-1"));
        assert_eq!(state.receipts.len(), 1);
    }
}

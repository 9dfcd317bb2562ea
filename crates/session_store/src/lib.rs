use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{mpsc, oneshot};

/// Blob store for session snapshots, one file per user id. The snapshot
/// content is opaque here; the registry owns the serialized form. Writes are
/// full replacements via tmp + fsync + rename, so a crash never leaves a
/// half-written snapshot behind.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context("create snapshot dir")?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_slug(user_id)))
    }

    pub fn save_blob(&self, user_id: &str, bytes: &[u8]) -> Result<()> {
        let target = self.path_for(user_id);
        let tmp = target.with_extension("json.tmp");

        {
            let mut file = File::create(&tmp).context("create snapshot tmp")?;
            file.write_all(bytes).context("write snapshot tmp")?;
            file.sync_all().context("sync snapshot tmp")?;
        }

        if let Err(err) = fs::rename(&tmp, &target) {
            if target.exists() {
                let _ = fs::remove_file(&target);
                fs::rename(&tmp, &target).context("replace snapshot file")?;
            } else {
                return Err(err).context("rename snapshot tmp");
            }
        }
        Ok(())
    }

    pub fn load_blob(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(user_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("read snapshot"),
        }
    }

    pub fn delete(&self, user_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(user_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("delete snapshot"),
        }
    }

    /// Archive a snapshot that failed to decode and remove the live file, so
    /// the next load starts clean while the bad bytes stay available for
    /// diagnosis. Returns the archive path when a file existed.
    pub fn quarantine(&self, user_id: &str) -> Result<Option<PathBuf>> {
        let source = self.path_for(user_id);
        let bytes = match fs::read(&source) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read snapshot for quarantine"),
        };

        let stamp = Utc::now().timestamp_millis();
        let archive = self
            .dir
            .join(format!("{}.corrupt-{stamp}.json.gz", file_slug(user_id)));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&archive)
            .context("open quarantine archive")?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(&bytes)
            .context("write quarantine archive")?;
        encoder.finish().context("finalize quarantine archive")?;

        fs::remove_file(&source).context("remove corrupt snapshot")?;
        Ok(Some(archive))
    }

    /// Delete snapshots whose last write is older than `max_age`. Returns the
    /// number of files removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir).context("list snapshot dir")? {
            let entry = entry.context("snapshot dir entry")?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let age = modified.elapsed().unwrap_or_default();
            if age >= max_age {
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn file_slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

enum StoreMsg {
    Save { user_id: String, bytes: Vec<u8> },
    Delete { user_id: String },
    Flush(oneshot::Sender<()>),
}

/// Handle into the write-behind worker. Submissions never block the caller;
/// the worker coalesces per user and flushes on a timer.
#[derive(Clone)]
pub struct FlushHandle {
    tx: mpsc::UnboundedSender<StoreMsg>,
}

impl FlushHandle {
    pub fn submit(&self, user_id: impl Into<String>, bytes: Vec<u8>) {
        let _ = self.tx.send(StoreMsg::Save {
            user_id: user_id.into(),
            bytes,
        });
    }

    pub fn delete(&self, user_id: impl Into<String>) {
        let _ = self.tx.send(StoreMsg::Delete {
            user_id: user_id.into(),
        });
    }

    /// Force all pending snapshots to disk. Used at shutdown and in tests.
    pub async fn flush_now(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(StoreMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the background flush worker. Store failures are logged and retried
/// on the next tick; they never propagate to the foreground.
pub fn spawn_flush_worker(store: Arc<SnapshotStore>, interval: Duration) -> FlushHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<StoreMsg>();

    tokio::spawn(async move {
        let mut pending: HashMap<String, Vec<u8>> = HashMap::new();
        let mut failures: HashMap<String, u32> = HashMap::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(StoreMsg::Save { user_id, bytes }) => {
                            pending.insert(user_id, bytes);
                        }
                        Some(StoreMsg::Delete { user_id }) => {
                            pending.remove(&user_id);
                            failures.remove(&user_id);
                            if let Err(err) = store.delete(&user_id) {
                                tracing::warn!(user_id, error = %err, "snapshot delete failed");
                            }
                        }
                        Some(StoreMsg::Flush(ack)) => {
                            flush_pending(&store, &mut pending, &mut failures);
                            let _ = ack.send(());
                        }
                        None => {
                            flush_pending(&store, &mut pending, &mut failures);
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    flush_pending(&store, &mut pending, &mut failures);
                }
            }
        }
    });

    FlushHandle { tx }
}

/// Repeated failures past this count escalate from warn to error so an
/// operator notices a dead disk while sessions keep running in memory.
const FLUSH_FAILURE_ALARM: u32 = 5;

fn flush_pending(
    store: &SnapshotStore,
    pending: &mut HashMap<String, Vec<u8>>,
    failures: &mut HashMap<String, u32>,
) {
    pending.retain(|user_id, bytes| match store.save_blob(user_id, bytes) {
        Ok(()) => {
            failures.remove(user_id);
            false
        }
        Err(err) => {
            metrics::counter!("store.flush_failures").increment(1);
            let count = failures.entry(user_id.clone()).or_insert(0);
            *count += 1;
            if *count >= FLUSH_FAILURE_ALARM {
                tracing::error!(
                    user_id,
                    failures = *count,
                    error = %err,
                    "snapshot flushes keep failing; session state is memory-only"
                );
            } else {
                tracing::warn!(user_id, error = %err, "snapshot flush failed, will retry");
            }
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_roundtrip_keeps_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path()).expect("open");

        store.save_blob("A100", b"first").expect("save");
        store.save_blob("A100", b"second").expect("overwrite");
        let loaded = store.load_blob("A100").expect("load").expect("present");
        assert_eq!(loaded, b"second");

        assert!(store.load_blob("missing").expect("load").is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path()).expect("open");
        store.save_blob("A100", b"x").expect("save");
        store.delete("A100").expect("delete");
        store.delete("A100").expect("delete again");
        assert!(store.load_blob("A100").expect("load").is_none());
    }

    #[test]
    fn quarantine_archives_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path()).expect("open");
        store.save_blob("A100", b"not json at all").expect("save");

        let archive = store
            .quarantine("A100")
            .expect("quarantine")
            .expect("had a file");
        assert!(archive.exists());
        assert!(store.load_blob("A100").expect("load").is_none());

        // Quarantining a missing snapshot is a no-op.
        assert!(store.quarantine("A100").expect("again").is_none());
    }

    #[test]
    fn slug_keeps_ids_filesystem_safe() {
        assert_eq!(file_slug("A100-X_9"), "A100-X_9");
        assert_eq!(file_slug("../evil"), "___evil");
    }

    #[test]
    fn cleanup_removes_aged_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::open(dir.path()).expect("open");
        store.save_blob("A100", b"x").expect("save");
        store.save_blob("B200", b"y").expect("save");

        let removed = store.cleanup_older_than(Duration::ZERO).expect("cleanup");
        assert_eq!(removed, 2);
        assert!(store.load_blob("A100").expect("load").is_none());
    }

    #[tokio::test]
    async fn worker_coalesces_per_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SnapshotStore::open(dir.path()).expect("open"));
        let handle = spawn_flush_worker(store.clone(), Duration::from_secs(3600));

        handle.submit("A100", b"v1".to_vec());
        handle.submit("A100", b"v2".to_vec());
        handle.submit("B200", b"w1".to_vec());
        handle.flush_now().await;

        assert_eq!(
            store.load_blob("A100").expect("load").expect("present"),
            b"v2"
        );
        assert_eq!(
            store.load_blob("B200").expect("load").expect("present"),
            b"w1"
        );
    }

    #[tokio::test]
    async fn worker_delete_wins_over_pending_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(SnapshotStore::open(dir.path()).expect("open"));
        let handle = spawn_flush_worker(store.clone(), Duration::from_secs(3600));

        handle.submit("A100", b"v1".to_vec());
        handle.delete("A100");
        handle.flush_now().await;

        assert!(store.load_blob("A100").expect("load").is_none());
    }
}

//! Consumer side of the download/ingest handoff.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempPath;
use thinimage_core::error::ThinError;
use tokio::sync::mpsc;

use crate::store::StorePublisher;

/// Layer blob downloaded and decompressed, waiting to be ingested.
#[derive(Debug)]
pub struct DownloadedLayer {
    /// Hex digest of the layer
    pub digest: String,
    /// Destination inside the repository
    pub subpath: String,
    /// Uncompressed tarball, removed when dropped
    pub tar: TempPath,
}

/// What the consumer did before the channel closed.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Hex digests ingested, in order
    pub ingested: Vec<String>,
    pub error: Option<ThinError>,
    pub interrupted: bool,
}

/// Flags shared between producer and consumer.
#[derive(Debug, Clone, Default)]
pub struct StopFlags {
    /// Set by the user (Ctrl-C)
    pub interrupt: Arc<AtomicBool>,
    /// Set by the consumer when it gives up; the producer stops downloading
    pub stop: Arc<AtomicBool>,
}

impl StopFlags {
    pub fn new(interrupt: Arc<AtomicBool>) -> Self {
        Self {
            interrupt,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.interrupt.load(Ordering::SeqCst)
    }
}

/// Ingest layers from `rx` until it closes.
///
/// Blocking: runs on a blocking thread. After a failure or an interrupt the
/// remaining layers are drained and their temp files removed, so the
/// producer never blocks on a full channel.
pub fn ingest_layers(
    store: &dyn StorePublisher,
    repo: &str,
    mut rx: mpsc::Receiver<DownloadedLayer>,
    flags: &StopFlags,
) -> IngestReport {
    let mut report = IngestReport::default();

    while let Some(layer) = rx.blocking_recv() {
        if flags.interrupt.load(Ordering::SeqCst) {
            tracing::info!(layer = %layer.digest, "Interrupted, not starting further ingests");
            report.interrupted = true;
            flags.stop.store(true, Ordering::SeqCst);
            break;
        }

        tracing::info!(repo = %repo, layer = %layer.digest, "Ingesting layer");
        match store.ingest_tar(repo, &layer.tar, &layer.subpath) {
            Ok(()) => report.ingested.push(layer.digest.clone()),
            Err(e) => {
                tracing::error!(repo = %repo, layer = %layer.digest, error = %e, "Layer ingest failed");
                cleanup_failed(store, repo, &layer.subpath);
                flags.stop.store(true, Ordering::SeqCst);
                report.error = Some(ThinError::Ingest {
                    layer: layer.digest.clone(),
                    message: e.to_string(),
                });
                break;
            }
        }
    }

    let mut drained = 0usize;
    while let Some(layer) = rx.blocking_recv() {
        drop(layer);
        drained += 1;
    }
    if drained > 0 {
        tracing::debug!(count = drained, "Discarded downloaded layers");
    }

    tracing::info!(
        repo = %repo,
        ingested = report.ingested.len(),
        failed = report.error.is_some(),
        "Finished ingesting layers"
    );
    report
}

/// Best-effort: abort the open transaction, then delete the partial layer.
fn cleanup_failed(store: &dyn StorePublisher, repo: &str, subpath: &str) {
    tracing::info!(repo = %repo, path = %subpath, "Cleaning up partially ingested layer");
    if let Err(e) = store.abort(repo) {
        tracing::warn!(repo = %repo, error = %e, "Abort during cleanup failed");
    }
    if let Err(e) = store.delete(repo, subpath) {
        tracing::warn!(repo = %repo, path = %subpath, error = %e, "Delete during cleanup failed");
    }
}

/// Whether `path` starts with the gzip magic.
pub fn is_gzip(path: &Path) -> std::io::Result<bool> {
    use std::io::Read;
    let mut magic = [0u8; 2];
    let mut file = std::fs::File::open(path)?;
    let n = file.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

/// Decompress `blob` into `out`. Uncompressed blobs are copied as they are.
pub fn decompress_blob(blob: &Path, out: &Path) -> std::io::Result<u64> {
    let mut writer = std::fs::File::create(out)?;
    let reader = std::fs::File::open(blob)?;
    let copied = if is_gzip(blob)? {
        std::io::copy(&mut flate2::read::GzDecoder::new(reader), &mut writer)?
    } else {
        std::io::copy(&mut std::io::BufReader::new(reader), &mut writer)?
    };
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{FakeStore, StoreCall};
    use std::io::Write;
    use tempfile::TempDir;

    fn layer_tar(dir: &Path, name: &str) -> DownloadedLayer {
        let path = dir.join(format!("{}.tar", name));
        let mut builder = tar::Builder::new(std::fs::File::create(&path).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}.txt", name), b"x".as_slice())
            .unwrap();
        builder.finish().unwrap();
        DownloadedLayer {
            digest: name.to_string(),
            subpath: format!("layers/{}", name),
            tar: TempPath::from_path(path),
        }
    }

    fn run(store: &FakeStore, layers: Vec<DownloadedLayer>, flags: &StopFlags) -> IngestReport {
        let (tx, rx) = mpsc::channel(layers.len().max(1));
        for layer in layers {
            tx.try_send(layer).unwrap();
        }
        drop(tx);
        ingest_layers(store, "repo.org", rx, flags)
    }

    #[test]
    fn test_ingests_in_order() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(&dir.path().join("cvmfs"));
        let layers = vec![layer_tar(dir.path(), "a"), layer_tar(dir.path(), "b")];
        let report = run(&store, layers, &StopFlags::default());
        assert_eq!(report.ingested, vec!["a", "b"]);
        assert!(report.error.is_none());
        assert!(dir.path().join("cvmfs/repo.org/layers/b/b.txt").exists());
    }

    #[test]
    fn test_failure_cleans_up_and_drains() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(&dir.path().join("cvmfs"));
        store.fail_ingest.lock().insert("layers/b".to_string());
        let layers = vec![
            layer_tar(dir.path(), "a"),
            layer_tar(dir.path(), "b"),
            layer_tar(dir.path(), "c"),
        ];
        let flags = StopFlags::default();
        let report = run(&store, layers, &flags);

        assert_eq!(report.ingested, vec!["a"]);
        assert!(matches!(report.error, Some(ThinError::Ingest { ref layer, .. }) if layer == "b"));
        assert!(flags.stop.load(Ordering::SeqCst));
        assert!(!store.ingested().contains(&"layers/c".to_string()));
        let calls = store.calls();
        assert!(calls.contains(&StoreCall::Abort("repo.org".to_string())));
        assert!(calls.contains(&StoreCall::Delete {
            repo: "repo.org".to_string(),
            subpath: "layers/b".to_string()
        }));
        assert!(!dir.path().join("c.tar").exists());
    }

    #[test]
    fn test_interrupt_stops_before_next_layer() {
        let dir = TempDir::new().unwrap();
        let store = FakeStore::new(&dir.path().join("cvmfs"));
        let flags = StopFlags::default();
        flags.interrupt.store(true, Ordering::SeqCst);
        let report = run(&store, vec![layer_tar(dir.path(), "a")], &flags);
        assert!(report.interrupted);
        assert!(report.ingested.is_empty());
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_decompress_gzip_and_plain() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("blob.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(std::fs::File::create(&gz).unwrap(), flate2::Compression::default());
        encoder.write_all(b"hello tar").unwrap();
        encoder.finish().unwrap();

        let out = dir.path().join("out.tar");
        assert!(is_gzip(&gz).unwrap());
        assert_eq!(decompress_blob(&gz, &out).unwrap(), 9);
        assert_eq!(std::fs::read(&out).unwrap(), b"hello tar");

        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"raw").unwrap();
        assert!(!is_gzip(&plain).unwrap());
        assert_eq!(decompress_blob(&plain, &out).unwrap(), 3);
    }
}

//! Content-addressed fetch map: given an archive descriptor, ensures a blob
//! with the declared content hash is present in the local CAS, trying in
//! order the local CAS itself, configured dist-directories, then a
//! network fetch with digest verification.

use crate::asyncmap::AsyncMap;
use crate::config::ArchiveDescriptor;
use crate::error::MapError;
use crate::hash::ContentHash;
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_futures::Instrument as _;

/// A filesystem-backed key-value store keyed by content hash, one file per
/// entry named by its hex digest.
pub struct LocalCas {
    root: PathBuf,
}

impl LocalCas {
    pub async fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create CAS root '{}'", root.display()))?;
        Ok(Self { root })
    }

    fn entry_path(&self, hash: ContentHash) -> PathBuf {
        self.root.join(hash.to_hex())
    }

    pub async fn contains(&self, hash: ContentHash) -> anyhow::Result<bool> {
        Ok(tokio::fs::metadata(self.entry_path(hash)).await.is_ok())
    }

    /// Reads back a previously inserted entry. Callers are expected to have
    /// called `contains`/`insert` (directly or via [`ContentCas::ensure`])
    /// first; a missing entry is a plain I/O error, not a special case.
    pub async fn read(&self, hash: ContentHash) -> anyhow::Result<Vec<u8>> {
        let path = self.entry_path(hash);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read CAS entry '{}'", path.display()))
    }

    /// Appends `bytes` under `hash`. Idempotent: a concurrent insert of the
    /// same hash writes identical content, so last-writer-wins is safe.
    pub async fn insert(&self, hash: ContentHash, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.entry_path(hash);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write CAS entry '{}'", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to finalize CAS entry '{}'", path.display()))?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// A configured dist-dir search path, checked in order for a file matching
/// an archive's declared basename.
pub struct DistDirs {
    dirs: Vec<PathBuf>,
}

impl DistDirs {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Looks for `basename` in each configured directory in order. Returns
    /// the first match whose content hashes to `expected`; a present but
    /// mismatched file is a non-fatal miss, not an error — the caller
    /// falls through to the network fetch.
    async fn find_matching(&self, basename: &str, expected: ContentHash) -> Option<Vec<u8>> {
        for dir in &self.dirs {
            let candidate = dir.join(basename);
            match tokio::fs::read(&candidate).await {
                Ok(bytes) if ContentHash::digest(&bytes) == expected => return Some(bytes),
                Ok(_) => {
                    tracing::warn!(path = %candidate.display(), "dist-dir file present but hash mismatch, skipping");
                }
                Err(_) => {}
            }
        }
        None
    }
}

/// Deduplicated acquisition of archive content by hash.
pub struct ContentCas {
    map: AsyncMap<ContentHash, ()>,
    local: Arc<LocalCas>,
    dist_dirs: DistDirs,
    client: reqwest::Client,
}

impl ContentCas {
    pub fn new(local: Arc<LocalCas>, dist_dirs: DistDirs, client: reqwest::Client) -> Self {
        Self {
            map: AsyncMap::new(),
            local,
            dist_dirs,
            client,
        }
    }

    pub fn local(&self) -> &LocalCas {
        &self.local
    }

    /// Ensures `descriptor.content` is present in the local CAS. Failure is
    /// fatal only once every source has been exhausted.
    pub async fn ensure(&self, descriptor: &ArchiveDescriptor) -> Result<(), MapError> {
        let hash = descriptor.content;
        let local = self.local.as_ref();
        let dist_dirs = &self.dist_dirs;
        let client = &self.client;
        let descriptor = descriptor.clone();
        let span = tracing::debug_span!("content_cas_ensure", hash = %hash);

        self.map
            .get_or_try_init(hash, move || {
                async move {
                    if local.contains(hash).await.map_err(MapError::from)? {
                        return Ok(());
                    }

                    let basename = descriptor
                        .distfile
                        .clone()
                        .unwrap_or_else(|| basename_of(&descriptor.fetch));

                    if let Some(bytes) = dist_dirs.find_matching(&basename, hash).await {
                        local.insert(hash, &bytes).await.map_err(MapError::from)?;
                        return Ok(());
                    }

                    let bytes = fetch_and_verify(client, &descriptor, hash).await?;
                    local.insert(hash, &bytes).await.map_err(MapError::from)?;
                    Ok(())
                }
                .instrument(span)
            })
            .await
    }
}

pub(crate) fn basename_of(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|segs| segs.filter(|s| !s.is_empty()).last())
        .unwrap_or("download")
        .to_owned()
}

async fn fetch_and_verify(
    client: &reqwest::Client,
    descriptor: &ArchiveDescriptor,
    expected: ContentHash,
) -> Result<Vec<u8>, MapError> {
    let response = client
        .get(descriptor.fetch.clone())
        .send()
        .await
        .map_err(|e| MapError::non_fatal(format!("fetch request failed: {}", e)))?;

    let response = response
        .error_for_status()
        .map_err(|e| MapError::non_fatal(format!("fetch returned error status: {}", e)))?;

    let bytes = response
        .bytes()
        .await
        .map_err(|e| MapError::fatal(format!("failed to read fetch body: {}", e)))?;

    let digest = ContentHash::digest(&bytes);
    if digest != expected {
        return Err(MapError::fatal(format!(
            "content hash mismatch for '{}': expected {}, got {}",
            descriptor.fetch, expected, digest
        )));
    }

    if let Some(sha256) = &descriptor.sha256 {
        verify_hex_digest::<sha2::Sha256>(&bytes, sha256, "sha256")?;
    }
    if let Some(sha512) = &descriptor.sha512 {
        verify_hex_digest::<sha2::Sha512>(&bytes, sha512, "sha512")?;
    }

    Ok(bytes.to_vec())
}

fn verify_hex_digest<D: sha2::Digest>(bytes: &[u8], expected_hex: &str, label: &str) -> Result<(), MapError> {
    let mut hasher = D::new();
    hasher.update(bytes);
    let observed = crate::hash::hex_encode(&hasher.finalize());
    if observed.eq_ignore_ascii_case(expected_hex) {
        Ok(())
    } else {
        Err(MapError::fatal(format!(
            "{} mismatch: expected {}, got {}",
            label, expected_hex, observed
        )))
    }
}

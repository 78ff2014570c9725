//! Hash and path utilities shared by the Git store and the content-CAS.

use anyhow::{bail, Context as _, Error};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

/// A 40-hex-character Git tree/commit object id, kept in raw 20-byte form.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TreeId([u8; 20]);

impl TreeId {
    pub fn from_raw(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_raw(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeId({})", self.to_hex())
    }
}

impl FromStr for TreeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            bail!("tree id '{}' is not 40 hex characters long", s);
        }

        let bytes = hex_decode(s).with_context(|| format!("invalid hex in tree id '{}'", s))?;
        let mut raw = [0u8; 20];
        raw.copy_from_slice(&bytes);
        Ok(Self(raw))
    }
}

impl TryFrom<String> for TreeId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TreeId> for String {
    fn from(id: TreeId) -> Self {
        id.to_hex()
    }
}

impl From<git2::Oid> for TreeId {
    fn from(oid: git2::Oid) -> Self {
        let mut raw = [0u8; 20];
        raw.copy_from_slice(oid.as_bytes());
        Self(raw)
    }
}

impl From<TreeId> for git2::Oid {
    fn from(id: TreeId) -> Self {
        // Raw bytes always form a valid Oid, the only failure mode of
        // `from_bytes` is a slice of the wrong length.
        git2::Oid::from_bytes(&id.0).expect("TreeId is always a valid 20-byte oid")
    }
}

/// A SHA-256 content hash, as used by the content-addressed archive store.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn digest(bytes: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&digest);
        Self(raw)
    }

    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            bail!("content hash '{}' is not 64 hex characters long", s);
        }

        let bytes = hex_decode(s).with_context(|| format!("invalid hex in content hash '{}'", s))?;
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&bytes);
        Ok(Self(raw))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.to_hex()
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn hex_decode(s: &str) -> Result<Vec<u8>, Error> {
    hex::decode(s).context("invalid hex string")
}

/// Resolves `.`/`..` components and symlinks. Unlike `std::fs::canonicalize`
/// this does not require the path to exist; missing trailing components are
/// appended back onto the canonicalized existing prefix.
pub fn canonical_path(path: &Path) -> Result<PathBuf, Error> {
    let mut existing = path;
    let mut tail = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(mut base) => {
                for component in tail.into_iter().rev() {
                    base.push(component);
                }
                return Ok(base);
            }
            Err(_) => {
                let file_name = existing
                    .file_name()
                    .with_context(|| format!("cannot canonicalize '{}'", path.display()))?;
                tail.push(file_name.to_owned());
                existing = existing
                    .parent()
                    .with_context(|| format!("cannot canonicalize '{}'", path.display()))?;
            }
        }
    }
}

/// A typed temporary directory factory: the directory is created eagerly
/// and removed when the last owner drops it. Used by the generator step of
/// the tree-fetch pipeline to stage a scratch workspace for an external
/// command.
pub struct ScopedTempDir {
    inner: tempfile::TempDir,
}

impl ScopedTempDir {
    pub fn new() -> Result<Self, Error> {
        let inner = tempfile::tempdir().context("failed to create scoped temp directory")?;
        Ok(Self { inner })
    }

    pub fn new_in(base: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(base)
            .with_context(|| format!("failed to create temp-dir parent '{}'", base.display()))?;
        let inner = tempfile::tempdir_in(base)
            .with_context(|| format!("failed to create temp directory under '{}'", base.display()))?;
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Detaches the directory from automatic cleanup, returning its path.
    pub fn into_path(self) -> PathBuf {
        self.inner.into_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_id_round_trips_through_hex() {
        let id = TreeId::from_raw([0xab; 20]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        let parsed: TreeId = hex.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn tree_id_rejects_wrong_length() {
        assert!("abcd".parse::<TreeId>().is_err());
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        let h = ContentHash::digest(b"hello world");
        assert_eq!(
            h.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde"
        );
    }

    #[test]
    fn scoped_temp_dir_cleans_up_on_drop() {
        let path = {
            let dir = ScopedTempDir::new().unwrap();
            let p = dir.path().to_path_buf();
            assert!(p.exists());
            p
        };
        assert!(!path.exists());
    }
}

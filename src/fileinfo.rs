//! Canonical descriptor of one remote, content-addressed file (C2).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, PathReason, Result};
use crate::path_safety::clean_relative;

/// Checksum strength order, strongest first. Used both to pick the
/// strongest shared checksum for [`FileInfo::same`] and to order the
/// by-hash fallback chain in the fetcher.
pub const HASH_STRENGTH: [HashAlgo; 4] = [
    HashAlgo::Sha512,
    HashAlgo::Sha256,
    HashAlgo::Sha1,
    HashAlgo::Md5,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Md5 => "MD5",
            HashAlgo::Sha1 => "SHA1",
            HashAlgo::Sha256 => "SHA256",
            HashAlgo::Sha512 => "SHA512",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `info.json` (spec.md §6) records each checksum as a hex string, not
/// a raw byte array: `serde`'s built-in array support only covers
/// lengths up to 32, which `sha512sum`'s 64 bytes exceeds, and a bare
/// array would serialize as a JSON integer list rather than the
/// documented digest encoding anyway. Every checksum field goes through
/// this `with` module so the wire format is a hex string regardless of
/// length.
mod hex_digest {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(
        value: &Option<[u8; N]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, const N: usize>(
        deserializer: D,
    ) -> Result<Option<[u8; N]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        opt.map(|s| {
            let bytes = hex::decode(&s).map_err(D::Error::custom)?;
            let len = bytes.len();
            <[u8; N]>::try_from(bytes)
                .map_err(|_| D::Error::custom(format!("expected a {N}-byte digest, got {len}")))
        })
        .transpose()
    }
}

/// The identity of a content-addressed file: a repository-relative path,
/// a size, and up to four checksums. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default, with = "hex_digest")]
    pub md5sum: Option<[u8; 16]>,
    #[serde(skip_serializing_if = "Option::is_none", default, with = "hex_digest")]
    pub sha1sum: Option<[u8; 20]>,
    #[serde(skip_serializing_if = "Option::is_none", default, with = "hex_digest")]
    pub sha256sum: Option<[u8; 32]>,
    #[serde(skip_serializing_if = "Option::is_none", default, with = "hex_digest")]
    pub sha512sum: Option<[u8; 64]>,
}

impl FileInfo {
    /// Builds a `FileInfo`, cleaning and validating `path`.
    ///
    /// At least one checksum must be present, unless `allow_no_checksum`
    /// is set (used only to build reuse-lookup placeholders).
    pub fn new(path: &str, size: u64, allow_no_checksum: bool) -> Result<Self> {
        let path = clean_relative(path)?;
        let info = FileInfo {
            path,
            size,
            md5sum: None,
            sha1sum: None,
            sha256sum: None,
            sha512sum: None,
        };
        if !allow_no_checksum && !info.has_checksum() {
            return Err(MirrorError::Checksum {
                path: info.path,
                reason: "no checksum present".into(),
            });
        }
        Ok(info)
    }

    pub fn no_checksum_placeholder(path: &str) -> Result<Self> {
        Self::new(path, 0, true)
    }

    pub fn has_checksum(&self) -> bool {
        self.md5sum.is_some() || self.sha1sum.is_some() || self.sha256sum.is_some() || self.sha512sum.is_some()
    }

    pub fn with_md5(mut self, digest: [u8; 16]) -> Self {
        self.md5sum = Some(digest);
        self
    }

    pub fn with_sha1(mut self, digest: [u8; 20]) -> Self {
        self.sha1sum = Some(digest);
        self
    }

    pub fn with_sha256(mut self, digest: [u8; 32]) -> Self {
        self.sha256sum = Some(digest);
        self
    }

    pub fn with_sha512(mut self, digest: [u8; 64]) -> Self {
        self.sha512sum = Some(digest);
        self
    }

    /// Merges checksums and path from `other` into `self` in place.
    ///
    /// Used when a Release file's hash sections repeat the same relative
    /// path across `MD5Sum`/`SHA256`/etc — all sightings accumulate onto
    /// one `FileInfo`. A size mismatch between sightings is always fatal.
    pub fn merge(&mut self, other: &FileInfo) -> Result<()> {
        if self.size != other.size {
            return Err(MirrorError::Checksum {
                path: self.path.clone(),
                reason: format!(
                    "size mismatch across hash sections: {} vs {}",
                    self.size, other.size
                ),
            });
        }
        if other.md5sum.is_some() {
            self.md5sum = other.md5sum;
        }
        if other.sha1sum.is_some() {
            self.sha1sum = other.sha1sum;
        }
        if other.sha256sum.is_some() {
            self.sha256sum = other.sha256sum;
        }
        if other.sha512sum.is_some() {
            self.sha512sum = other.sha512sum;
        }
        Ok(())
    }

    /// The strongest checksum present, used both for `same` comparisons
    /// and to pick the by-hash alias with the best available algorithm.
    pub fn strongest(&self) -> Option<(HashAlgo, &[u8])> {
        for algo in HASH_STRENGTH {
            if let Some(bytes) = self.digest(algo) {
                return Some((algo, bytes));
            }
        }
        None
    }

    pub fn digest(&self, algo: HashAlgo) -> Option<&[u8]> {
        match algo {
            HashAlgo::Md5 => self.md5sum.as_deref(),
            HashAlgo::Sha1 => self.sha1sum.as_deref(),
            HashAlgo::Sha256 => self.sha256sum.as_deref(),
            HashAlgo::Sha512 => self.sha512sum.as_deref(),
        }
    }

    /// Two `FileInfo`s are *Same* iff their strongest shared checksum
    /// matches and sizes are equal.
    pub fn same(&self, other: &FileInfo) -> bool {
        if self.size != other.size {
            return false;
        }
        for algo in HASH_STRENGTH {
            if let (Some(a), Some(b)) = (self.digest(algo), other.digest(algo)) {
                return a == b;
            }
        }
        false
    }

    /// The directory component of `path` (empty string if `path` has none).
    pub fn dir(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[..idx],
            None => "",
        }
    }

    /// Derives the by-hash alias path for `algo`, or `None` if that
    /// checksum isn't present: `<dir(path)>/by-hash/<ALGO>/<hex>`.
    pub fn by_hash_path(&self, algo: HashAlgo) -> Option<String> {
        let digest = self.digest(algo)?;
        let dir = self.dir();
        let hex = hex::encode(digest);
        Some(if dir.is_empty() {
            format!("by-hash/{}/{}", algo.name(), hex)
        } else {
            format!("{}/by-hash/{}/{}", dir, algo.name(), hex)
        })
    }

    /// All by-hash alias paths whose checksum is present, strongest first.
    pub fn by_hash_paths(&self) -> Vec<(HashAlgo, String)> {
        HASH_STRENGTH
            .into_iter()
            .filter_map(|algo| self.by_hash_path(algo).map(|p| (algo, p)))
            .collect()
    }
}

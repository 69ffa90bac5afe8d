//! APT metadata codec (C1): `Release`/`InRelease`/`Packages`/`Sources`.
//!
//! Dispatch is driven entirely by the final path component, after
//! stripping a trailing compression extension. Compressed inputs are
//! transparently decompressed with `flate2`/`bzip2`/`xz2`, mirroring
//! how the teacher picks a decoder by extension in `scan::determine_format`.

mod packages;
mod release;
mod sources;

use std::collections::HashMap;
use std::io::Read;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

use crate::error::{MirrorError, Result};
use crate::fileinfo::FileInfo;

pub use release::ReleaseFields;

/// Outcome of [`extract_file_info`]: every file the document enumerates,
/// plus (for Release documents) the raw header fields.
#[derive(Debug, Default)]
pub struct ExtractResult {
    pub files: Vec<FileInfo>,
    pub fields: ReleaseFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Release,
    Packages,
    Sources,
}

/// Strips a known compression suffix off the final path component,
/// returning the stem and the detected compression (if any).
pub(crate) fn strip_compression(basename: &str) -> (&str, Compression) {
    if let Some(stem) = basename.strip_suffix(".gz") {
        (stem, Compression::Gzip)
    } else if let Some(stem) = basename.strip_suffix(".bz2") {
        (stem, Compression::Bzip2)
    } else if let Some(stem) = basename.strip_suffix(".xz") {
        (stem, Compression::Xz)
    } else {
        (basename, Compression::None)
    }
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dialect_of(path: &str) -> Option<Dialect> {
    let (stem, _) = strip_compression(basename(path));
    match stem {
        "Release" | "InRelease" => Some(Dialect::Release),
        "Packages" => Some(Dialect::Packages),
        "Sources" => Some(Dialect::Sources),
        _ => None,
    }
}

/// True for the three dialects this codec understands.
pub fn is_supported(path: &str) -> bool {
    dialect_of(path).is_some()
}

/// True for Release-family names (`Release`, `InRelease`, and their
/// signature/compressed siblings), used by the pipeline to decide which
/// downloaded release-candidate file carries the metadata to parse.
pub fn is_meta(path: &str) -> bool {
    let name = basename(path);
    let (stem, _) = strip_compression(name);
    stem == "Release" || stem == "InRelease" || name == "Release.gpg"
}

fn decompress(compression: Compression, stream: Box<dyn Read>) -> Box<dyn Read> {
    match compression {
        Compression::None => stream,
        Compression::Gzip => Box::new(GzDecoder::new(stream)),
        Compression::Bzip2 => Box::new(BzDecoder::new(stream)),
        Compression::Xz => Box::new(XzDecoder::new(stream)),
    }
}

/// Parses `path`/`stream` according to the dialect selected by `path`'s
/// final component, returning every file it enumerates.
pub fn extract_file_info(path: &str, stream: impl Read + 'static) -> Result<ExtractResult> {
    let Some(dialect) = dialect_of(path) else {
        return Err(MirrorError::StorageCorrupt(format!(
            "unsupported metadata file: {path}"
        )));
    };
    let (_, compression) = strip_compression(basename(path));
    let mut reader = decompress(compression, Box::new(stream));
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .map_err(|e| MirrorError::StorageCorrupt(format!("{path}: not valid UTF-8 text: {e}")))?;

    match dialect {
        Dialect::Release => release::parse(&text, path),
        Dialect::Packages => packages::parse(&text).map(|files| ExtractResult {
            files,
            fields: HashMap::new(),
        }),
        Dialect::Sources => sources::parse(&text, path).map(|files| ExtractResult {
            files,
            fields: HashMap::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_detection_strips_compression() {
        assert!(is_supported("dists/stable/Release.gz"));
        assert!(is_supported("dists/stable/InRelease"));
        assert!(is_supported("dists/stable/main/binary-amd64/Packages.xz"));
        assert!(is_supported("dists/stable/main/source/Sources.bz2"));
        assert!(!is_supported("dists/stable/Contents-amd64.gz"));
    }

    #[test]
    fn is_meta_detects_release_family() {
        assert!(is_meta("dists/stable/Release"));
        assert!(is_meta("dists/stable/InRelease"));
        assert!(is_meta("dists/stable/Release.gpg"));
        assert!(is_meta("dists/stable/Release.gz"));
        assert!(!is_meta("dists/stable/main/binary-amd64/Packages"));
    }
}

//! `Packages` parsing: one [`FileInfo`] per paragraph.

use crate::error::{MirrorError, Result};
use crate::fileinfo::FileInfo;
use crate::parser::Paragraph;

fn field<'a>(paragraph: &'a Paragraph, key: &str) -> Option<&'a str> {
    paragraph.get(key).map(|f| f.value.as_str())
}

fn decode_hash(hex_digest: &str, len: usize) -> Option<Vec<u8>> {
    let bytes = hex::decode(hex_digest).ok()?;
    (bytes.len() == len).then_some(bytes)
}

pub(super) fn parse(text: &str) -> Result<Vec<FileInfo>> {
    let paragraphs = crate::parser::parse_paragraphs(text);
    let mut files = Vec::with_capacity(paragraphs.len());

    for paragraph in &paragraphs {
        let filename = field(paragraph, "Filename").ok_or_else(|| {
            MirrorError::StorageCorrupt("Packages paragraph missing Filename".into())
        })?;
        let size: u64 = field(paragraph, "Size")
            .ok_or_else(|| MirrorError::StorageCorrupt("Packages paragraph missing Size".into()))?
            .trim()
            .parse()
            .map_err(|_| MirrorError::StorageCorrupt(format!("bad Size for {filename}")))?;

        let mut info = FileInfo::new(filename, size, true)?;
        if filename.is_empty() {
            continue;
        }
        if let Some(v) = field(paragraph, "MD5sum") {
            if let Some(d) = decode_hash(v, 16) {
                info = info.with_md5(d.try_into().unwrap());
            }
        }
        if let Some(v) = field(paragraph, "SHA1") {
            if let Some(d) = decode_hash(v, 20) {
                info = info.with_sha1(d.try_into().unwrap());
            }
        }
        if let Some(v) = field(paragraph, "SHA256") {
            if let Some(d) = decode_hash(v, 32) {
                info = info.with_sha256(d.try_into().unwrap());
            }
        }
        if let Some(v) = field(paragraph, "SHA512") {
            if let Some(d) = decode_hash(v, 64) {
                info = info.with_sha512(d.try_into().unwrap());
            }
        }
        if !info.has_checksum() {
            return Err(MirrorError::Checksum {
                path: info.path,
                reason: "Packages paragraph has no usable checksum".into(),
            });
        }
        files.push(info);
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_paragraph() {
        let text = "Package: zsync\nVersion: 0.6.2-1\nFilename: pool/z/zsync_0.6.2-1_amd64.deb\nSize: 123\nSHA256: e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\n\n";
        let files = parse(text).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "pool/z/zsync_0.6.2-1_amd64.deb");
        assert_eq!(files[0].size, 123);
        assert!(files[0].sha256sum.is_some());
    }

    #[test]
    fn rejects_path_traversal_filename() {
        let text = "Package: evil\nFilename: ../../etc/passwd\nSize: 1\nSHA256: e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\n\n";
        let err = parse(text).unwrap_err();
        assert!(format!("{err:?}").to_lowercase().contains("traversal"));
    }

    #[test]
    fn missing_filename_is_error() {
        let text = "Package: evil\nSize: 1\n\n";
        assert!(parse(text).is_err());
    }
}

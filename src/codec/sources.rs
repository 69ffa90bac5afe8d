//! `Sources` parsing: per paragraph, a `Directory` plus one or more
//! `<hash> <size> <basename>` lists (`Files:`, `Checksums-Sha256:`,
//! `Checksums-Sha512:`). Emits one [`FileInfo`] per basename.

use std::collections::HashMap;

use crate::error::{MirrorError, Result};
use crate::fileinfo::{FileInfo, HashAlgo};
use crate::parser::Paragraph;
use crate::path_safety::clean_relative;

const LIST_SECTIONS: &[(&str, HashAlgo)] = &[
    ("Files", HashAlgo::Md5),
    ("Checksums-Sha256", HashAlgo::Sha256),
    ("Checksums-Sha512", HashAlgo::Sha512),
];

fn parse_list_line(line: &str, algo: HashAlgo, directory: &str) -> Result<Option<(String, FileInfo)>> {
    let mut parts = line.split_whitespace();
    let (Some(hex_digest), Some(size), Some(basename)) = (parts.next(), parts.next(), parts.next())
    else {
        return Ok(None);
    };
    let basename_clean = clean_relative(basename)?;
    if basename_clean.is_empty() {
        return Ok(None);
    }
    let size: u64 = size
        .parse()
        .map_err(|_| MirrorError::StorageCorrupt(format!("bad size in Sources list line: {line}")))?;
    let digest = hex::decode(hex_digest)
        .map_err(|_| MirrorError::StorageCorrupt(format!("bad hex digest in Sources: {line}")))?;
    if digest.len() != algo.digest_len() {
        return Err(MirrorError::StorageCorrupt(format!(
            "{algo} digest has wrong length in Sources: {line}"
        )));
    }

    let path = if directory.is_empty() {
        basename_clean.clone()
    } else {
        format!("{directory}/{basename_clean}")
    };
    let mut info = FileInfo::new(&path, size, true)?;
    info = match algo {
        HashAlgo::Md5 => info.with_md5(digest.try_into().unwrap()),
        HashAlgo::Sha1 => info.with_sha1(digest.try_into().unwrap()),
        HashAlgo::Sha256 => info.with_sha256(digest.try_into().unwrap()),
        HashAlgo::Sha512 => info.with_sha512(digest.try_into().unwrap()),
    };
    Ok(Some((basename_clean, info)))
}

pub(super) fn parse(text: &str, _sources_path: &str) -> Result<Vec<FileInfo>> {
    let paragraphs = crate::parser::parse_paragraphs(text);
    let mut files = Vec::new();

    for paragraph in &paragraphs {
        let directory = paragraph
            .get("Directory")
            .map(|f| f.value.as_str())
            .ok_or_else(|| MirrorError::StorageCorrupt("Sources paragraph missing Directory".into()))?;
        let directory = clean_relative(directory)?;

        let mut by_basename: HashMap<String, FileInfo> = HashMap::new();
        for (key, field) in paragraph {
            let Some(&(_, algo)) = LIST_SECTIONS.iter().find(|(name, _)| name == key) else {
                continue;
            };
            for line in field.lines() {
                if let Some((basename, info)) = parse_list_line(line, algo, &directory)? {
                    match by_basename.get_mut(&basename) {
                        Some(existing) => existing.merge(&info)?,
                        None => {
                            by_basename.insert(basename, info);
                        }
                    }
                }
            }
        }

        let mut entries: Vec<FileInfo> = by_basename.into_values().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        files.extend(entries);
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_directory_and_files_list() {
        let text = "Package: foo\nDirectory: pool/main/f/foo\nFiles:\n d41d8cd98f00b204e9800998ecf8427e 100 foo_1.0.dsc\n d8e8fca2dc0f896fd7cb4cb0031ba249 200 foo_1.0.tar.xz\n\n";
        let files = parse(text, "dists/stable/main/source/Sources").unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.path == "pool/main/f/foo/foo_1.0.dsc"));
    }

    #[test]
    fn merges_checksums_across_sections() {
        let text = "Directory: pool/main/f/foo\nFiles:\n d41d8cd98f00b204e9800998ecf8427e 100 foo_1.0.dsc\nChecksums-Sha256:\n e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 100 foo_1.0.dsc\n\n";
        let files = parse(text, "x").unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].md5sum.is_some());
        assert!(files[0].sha256sum.is_some());
    }

    #[test]
    fn missing_directory_is_error() {
        let text = "Files:\n d41d8cd98f00b204e9800998ecf8427e 1 a\n\n";
        assert!(parse(text, "x").is_err());
    }
}

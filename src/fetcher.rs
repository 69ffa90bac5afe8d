//! Bounded-concurrency HTTP downloader (C4): retry with backoff, checksum
//! enforcement, by-hash fallback, temp-file discipline, cancellation.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use md5::Md5;
use reqwest::{Certificate, Client, Identity, StatusCode, Url};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::TlsConfig;
use crate::error::MirrorError;
use crate::fileinfo::FileInfo;
use crate::storage::Storage;

const USER_AGENT: &str = "Debian APT-HTTP/1.3 (mirrorctl)";
const HTTP_RETRIES: u32 = 5;
const MAX_ATTEMPTS: u32 = 15;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Transport,
    RetryableStatus,
}

/// Outcome of a single-file download attempt chain.
pub struct DlResult {
    pub relpath: String,
    pub status: u16,
    pub file_info: Option<FileInfo>,
    pub temp_file: Option<NamedTempFile>,
    pub error: Option<MirrorError>,
}

impl DlResult {
    fn terminal_error(relpath: &str, status: u16, error: MirrorError) -> Self {
        DlResult {
            relpath: relpath.to_string(),
            status,
            file_info: None,
            temp_file: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.status == 200
    }
}

fn parse_tls_version(s: &str) -> anyhow::Result<reqwest::tls::Version> {
    match s {
        "1.2" => Ok(reqwest::tls::Version::TLS_1_2),
        "1.3" => Ok(reqwest::tls::Version::TLS_1_3),
        other => anyhow::bail!("unsupported tls version {other:?}, expected \"1.2\" or \"1.3\""),
    }
}

/// Builds the `reqwest::Client` every fetcher downloads through, applying
/// whatever TLS policy the effective mirror/global config supplies. Cipher
/// suite selection and SNI override aren't exposed by reqwest's client
/// builder, so those two fields are policy-only: accepted in config, not
/// enforced here.
fn build_client(tls: Option<&TlsConfig>) -> anyhow::Result<Client> {
    let mut builder = Client::builder().timeout(None);

    let Some(tls) = tls else {
        return Ok(builder.build()?);
    };

    if let Some(v) = &tls.min_version {
        builder = builder.min_tls_version(parse_tls_version(v)?);
    }
    if let Some(v) = &tls.max_version {
        builder = builder.max_tls_version(parse_tls_version(v)?);
    }
    if tls.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(path) = &tls.ca_cert_file {
        let pem = fs::read(path).with_context(|| format!("reading ca_cert_file {path}"))?;
        builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
    }
    if let (Some(cert_path), Some(key_path)) = (&tls.client_cert_file, &tls.client_key_file) {
        let mut pem = fs::read(cert_path)
            .with_context(|| format!("reading client_cert_file {cert_path}"))?;
        let mut key = fs::read(key_path)
            .with_context(|| format!("reading client_key_file {key_path}"))?;
        pem.append(&mut key);
        builder = builder.identity(Identity::from_pem(&pem)?);
    } else if tls.client_cert_file.is_some() != tls.client_key_file.is_some() {
        anyhow::bail!("tls.client_cert_file and tls.client_key_file must be set together");
    }
    if !tls.cipher_suites.is_empty() {
        warn!("tls.cipher_suites is accepted but not enforced by the HTTP client in use");
    }
    if tls.server_name.is_some() {
        warn!("tls.server_name is accepted but not enforced by the HTTP client in use");
    }

    Ok(builder.build()?)
}

/// Gates every outbound request behind a counting semaphore of capacity
/// `max_conns`, shared by all downloader tasks for one mirror.
pub struct Fetcher {
    client: Client,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Fetcher {
    pub fn new(
        max_conns: usize,
        cancel: CancellationToken,
        tls: Option<&TlsConfig>,
    ) -> anyhow::Result<Self> {
        let client = build_client(tls)?;
        Ok(Fetcher {
            client,
            semaphore: Arc::new(Semaphore::new(max_conns.max(1))),
            cancel,
        })
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Builds the candidate URL list: the canonical URL first, then (if
    /// `byhash` and `expect` is given) the by-hash URLs in order SHA512,
    /// SHA256, SHA1, MD5, for whichever checksums `expect` actually has.
    fn candidate_urls(
        base_url: &Url,
        relpath: &str,
        expect: Option<&FileInfo>,
        byhash: bool,
    ) -> anyhow::Result<Vec<Url>> {
        let mut urls = vec![base_url.join(relpath)?];
        if byhash {
            if let Some(expect) = expect {
                for (_, alias) in expect.by_hash_paths() {
                    urls.push(base_url.join(&alias)?);
                }
            }
        }
        Ok(urls)
    }

    async fn backoff(failure: Failure, target_attempt: u32) {
        let delay = match failure {
            Failure::Transport => Duration::from_secs(1u64 << target_attempt.min(6)),
            Failure::RetryableStatus => Duration::from_secs(1),
        };
        tokio::time::sleep(delay).await;
    }

    /// Downloads one logical file, following the by-hash fallback chain
    /// on checksum mismatch. Never panics; every outcome, including
    /// transport failures, is reported through the returned [`DlResult`].
    pub async fn download(
        &self,
        storage: &Storage,
        base_url: &Url,
        relpath: &str,
        expect: Option<&FileInfo>,
        byhash: bool,
    ) -> DlResult {
        let targets = match Self::candidate_urls(base_url, relpath, expect, byhash) {
            Ok(t) => t,
            Err(e) => {
                return DlResult::terminal_error(relpath, 0, MirrorError::Config(e.to_string()))
            }
        };

        let _permit = match self.semaphore.acquire().await {
            Ok(p) => p,
            Err(_) => return DlResult::terminal_error(relpath, 0, MirrorError::Cancelled),
        };

        let mut total_attempts: u32 = 0;

        for (target_idx, url) in targets.iter().enumerate() {
            let mut target_attempt: u32 = 0;
            let mut last_failure = Failure::Transport;

            loop {
                if self.cancel.is_cancelled() {
                    return DlResult::terminal_error(relpath, 0, MirrorError::Cancelled);
                }
                if total_attempts >= MAX_ATTEMPTS {
                    return DlResult::terminal_error(
                        relpath,
                        0,
                        MirrorError::Network {
                            url: url.to_string(),
                            message: "exhausted maximum attempt budget".into(),
                        },
                    );
                }
                if target_attempt > 0 {
                    Self::backoff(last_failure, target_attempt).await;
                }
                total_attempts += 1;
                target_attempt += 1;

                let response = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        return DlResult::terminal_error(relpath, 0, MirrorError::Cancelled);
                    }
                    resp = self
                        .client
                        .get(url.clone())
                        .header("Cache-Control", "max-age=0")
                        .header("User-Agent", USER_AGENT)
                        .send() => resp,
                };

                let response = match response {
                    Ok(r) => r,
                    Err(e) => {
                        if target_attempt <= HTTP_RETRIES {
                            debug!("{relpath}: transport error on attempt {target_attempt}: {e}");
                            last_failure = Failure::Transport;
                            continue;
                        }
                        return DlResult::terminal_error(
                            relpath,
                            0,
                            MirrorError::Network {
                                url: url.to_string(),
                                message: e.to_string(),
                            },
                        );
                    }
                };

                let status = response.status();
                if status.is_server_error() {
                    if target_attempt <= HTTP_RETRIES {
                        last_failure = Failure::RetryableStatus;
                        continue;
                    }
                    return DlResult::terminal_error(
                        relpath,
                        status.as_u16(),
                        MirrorError::HttpStatus {
                            url: url.to_string(),
                            status: status.as_u16(),
                        },
                    );
                }
                if status == StatusCode::NOT_FOUND {
                    return DlResult {
                        relpath: relpath.to_string(),
                        status: 404,
                        file_info: None,
                        temp_file: None,
                        error: None,
                    };
                }
                if status != StatusCode::OK {
                    return DlResult::terminal_error(
                        relpath,
                        status.as_u16(),
                        MirrorError::HttpStatus {
                            url: url.to_string(),
                            status: status.as_u16(),
                        },
                    );
                }

                // 200: stream into a fresh temp file while hashing.
                let tmp = match storage.temp_file() {
                    Ok(t) => t,
                    Err(e) => return DlResult::terminal_error(relpath, 200, e),
                };
                match stream_and_hash(response, &tmp, relpath).await {
                    Ok(candidate) => {
                        if let Some(expect) = expect {
                            if !candidate.same(expect) {
                                warn!(
                                    "{relpath}: checksum mismatch fetching {url}, trying next candidate if any"
                                );
                                if target_idx + 1 < targets.len() {
                                    break; // advance to next target
                                }
                                return DlResult::terminal_error(
                                    relpath,
                                    200,
                                    MirrorError::Checksum {
                                        path: relpath.to_string(),
                                        reason: "no candidate URL matched expected checksum".into(),
                                    },
                                );
                            }
                        }
                        return DlResult {
                            relpath: relpath.to_string(),
                            status: 200,
                            file_info: Some(candidate),
                            temp_file: Some(tmp),
                            error: None,
                        };
                    }
                    Err(e) => return DlResult::terminal_error(relpath, 200, e),
                }
            }
        }

        DlResult::terminal_error(
            relpath,
            0,
            MirrorError::Checksum {
                path: relpath.to_string(),
                reason: "exhausted all candidate URLs".into(),
            },
        )
    }
}

async fn stream_and_hash(
    mut response: reqwest::Response,
    tmp: &NamedTempFile,
    relpath: &str,
) -> crate::error::Result<FileInfo> {
    let mut file = tokio::fs::File::from_std(tmp.reopen()?);
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    let mut size: u64 = 0;

    loop {
        let chunk = response.chunk().await.map_err(|e| MirrorError::Network {
            url: relpath.to_string(),
            message: e.to_string(),
        })?;
        let Some(chunk) = chunk else { break };
        md5.update(&chunk);
        sha1.update(&chunk);
        sha256.update(&chunk);
        sha512.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;

    // `generic-array`'s `GenericArray<u8, N> -> [u8; N]` conversion only
    // covers N up to 32, so SHA-512's 64-byte digest needs an explicit
    // slice round-trip rather than `.into()`.
    let sha512_digest: [u8; 64] = sha512
        .finalize()
        .as_slice()
        .try_into()
        .expect("sha512 digest is always 64 bytes");

    let info = FileInfo::new(relpath, size, true)?
        .with_md5(md5.finalize().into())
        .with_sha1(sha1.finalize().into())
        .with_sha256(sha256.finalize().into())
        .with_sha512(sha512_digest);
    Ok(info)
}

/// Result of reusing a file from a previous generation's storage, or
/// downloading it fresh. `batch` turns every entry in `files` into one
/// of these, without ever blocking a reuse on network I/O.
enum Outcome {
    Reused,
    Downloaded(DlResult),
}

/// Fetches `files` into `new_storage`, reusing bit-identical content
/// already present in `current` (if any) by hard-linking rather than
/// downloading. Runs the reuse lookups and the spawned downloads
/// concurrently through a bounded channel; the first error seen by the
/// consumer is remembered and returned after every producer has
/// finished, so a failing file never deadlocks the others.
pub async fn batch(
    fetcher: Arc<Fetcher>,
    current: Option<Arc<Storage>>,
    new_storage: Arc<Storage>,
    base_url: &Url,
    files: &[FileInfo],
    allow_missing: bool,
    byhash: bool,
) -> crate::error::Result<Vec<FileInfo>> {
    let (tx, mut rx) = mpsc::channel::<(FileInfo, Outcome)>(64);
    let mut joins: JoinSet<()> = JoinSet::new();

    for fi in files {
        if let Some(current) = current.as_deref() {
            if let Ok(Some((stored, path))) = current.lookup(fi, byhash) {
                match new_storage.store_link_with_hash(&stored, &path) {
                    Ok(()) => {
                        let _ = tx.send((stored, Outcome::Reused)).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("{}: failed to reuse linked copy: {e}", fi.path);
                    }
                }
            }
        }

        let fi = fi.clone();
        let fetcher = fetcher.clone();
        let base_url = base_url.clone();
        let tx = tx.clone();
        let new_storage = new_storage.clone();

        joins.spawn(async move {
            let result = fetcher
                .download(&new_storage, &base_url, &fi.path, Some(&fi), byhash)
                .await;
            let _ = tx.send((fi, Outcome::Downloaded(result))).await;
        });
    }
    drop(tx);

    let mut reused_or_fetched = Vec::with_capacity(files.len());
    let mut first_error: Option<MirrorError> = None;

    while let Some((fi, outcome)) = rx.recv().await {
        match outcome {
            Outcome::Reused => reused_or_fetched.push(fi),
            Outcome::Downloaded(dl) => {
                if let Some(e) = dl.error {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    continue;
                }
                if dl.status == 404 {
                    if allow_missing {
                        continue;
                    }
                    if first_error.is_none() {
                        first_error = Some(MirrorError::NotFound { path: fi.path.clone() });
                    }
                    continue;
                }
                if dl.status != 200 {
                    if first_error.is_none() {
                        first_error = Some(MirrorError::HttpStatus {
                            url: fi.path.clone(),
                            status: dl.status,
                        });
                    }
                    continue;
                }
                let (Some(file_info), Some(tmp)) = (dl.file_info, dl.temp_file) else {
                    continue;
                };
                match new_storage.store_link_with_hash(&file_info, tmp.path()) {
                    Ok(()) => reused_or_fetched.push(file_info),
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }
    }

    while joins.join_next().await.is_some() {}

    match first_error {
        Some(e) => Err(e),
        None => {
            info!("batch: {} reused/fetched of {} requested", reused_or_fetched.len(), files.len());
            Ok(reused_or_fetched)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_durations_grow_for_transport_failures() {
        // exercised indirectly via download() integration tests in pipeline.rs;
        // this just locks in the constant budget contract.
        assert_eq!(HTTP_RETRIES, 5);
        assert_eq!(MAX_ATTEMPTS, 15);
    }

    #[test]
    fn dl_result_is_ok_requires_200_and_no_error() {
        let ok = DlResult {
            relpath: "x".into(),
            status: 200,
            file_info: None,
            temp_file: None,
            error: None,
        };
        assert!(ok.is_ok());

        let missing = DlResult {
            relpath: "x".into(),
            status: 404,
            file_info: None,
            temp_file: None,
            error: None,
        };
        assert!(!missing.is_ok());
    }

    #[test]
    fn build_client_accepts_no_tls_config() {
        assert!(build_client(None).is_ok());
    }

    #[test]
    fn build_client_rejects_unknown_tls_version() {
        let tls = TlsConfig {
            min_version: Some("1.1".into()),
            ..Default::default()
        };
        assert!(build_client(Some(&tls)).is_err());
    }

    #[test]
    fn build_client_accepts_known_tls_versions_and_insecure_flag() {
        let tls = TlsConfig {
            min_version: Some("1.2".into()),
            max_version: Some("1.3".into()),
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(build_client(Some(&tls)).is_ok());
    }

    #[test]
    fn build_client_rejects_lone_client_cert_without_key() {
        let tls = TlsConfig {
            client_cert_file: Some("/nonexistent/cert.pem".into()),
            ..Default::default()
        };
        assert!(build_client(Some(&tls)).is_err());
    }
}

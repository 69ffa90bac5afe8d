//! PGP signature verification wrapping `sequoia-openpgp`.
//!
//! Generalizes the teacher's `sign.rs` (which only ever *produces*
//! signatures for locally-generated Release files) into a verifier:
//! the structure of the verification helper below follows
//! `paultag-deb-rs`'s `control::openpgp::OpenPgpValidator`, adapted to
//! support both `InRelease` clear-signing and `Release`/`Release.gpg`
//! detached signatures.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use openpgp::cert::Cert;
use openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper, VerifierBuilder,
};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::{Fingerprint, KeyHandle};
use sequoia_openpgp as openpgp;

use crate::error::{MirrorError, Result};

/// A loaded public-key ring, used to verify one mirror's Release
/// signatures. Keyed by fingerprint (primary and every subkey) so a
/// signature made by any subkey of the configured certificate is
/// accepted.
pub struct Verifier {
    keys: HashMap<Fingerprint, Cert>,
}

struct Helper<'a> {
    keys: &'a HashMap<Fingerprint, Cert>,
    verified: bool,
}

impl VerificationHelper for &mut Helper<'_> {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.keys.values().cloned().collect())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                for result in results {
                    if result.is_ok() {
                        self.verified = true;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Verifier {
    /// Loads the ASCII-armored public key at `key_path` (a mirror's
    /// `pgp_key_path`).
    pub fn load(key_path: &Path) -> Result<Self> {
        let cert = Cert::from_file(key_path)
            .map_err(|e| MirrorError::Pgp(format!("loading {}: {e}", key_path.display())))?;
        let mut keys = HashMap::new();
        keys.insert(cert.fingerprint(), cert.clone());
        for key in cert.keys() {
            keys.insert(key.key().fingerprint(), cert.clone());
        }
        Ok(Verifier { keys })
    }

    /// Verifies `message` as a clear-signed `InRelease` document,
    /// returning the signed (decoded) content on success.
    pub fn verify_clearsigned(&self, message: &[u8]) -> Result<Vec<u8>> {
        let policy = StandardPolicy::new();
        let mut helper = Helper {
            keys: &self.keys,
            verified: false,
        };
        let mut verifier = VerifierBuilder::from_bytes(message)
            .map_err(|e| MirrorError::Pgp(e.to_string()))?
            .with_policy(&policy, None, &mut helper)
            .map_err(|e| MirrorError::Pgp(e.to_string()))?;
        let mut content = Vec::new();
        verifier
            .read_to_end(&mut content)
            .map_err(|e| MirrorError::Pgp(e.to_string()))?;
        if !helper.verified {
            return Err(MirrorError::Pgp("no valid signature over InRelease".into()));
        }
        Ok(content)
    }

    /// Verifies `signature` (the contents of `Release.gpg`) as a
    /// detached signature over `content` (the contents of `Release`).
    pub fn verify_detached(&self, signature: &[u8], content: &[u8]) -> Result<()> {
        let policy = StandardPolicy::new();
        let mut helper = Helper {
            keys: &self.keys,
            verified: false,
        };
        let mut verifier = DetachedVerifierBuilder::from_bytes(signature)
            .map_err(|e| MirrorError::Pgp(e.to_string()))?
            .with_policy(&policy, None, &mut helper)
            .map_err(|e| MirrorError::Pgp(e.to_string()))?;
        verifier
            .verify_bytes(content)
            .map_err(|e| MirrorError::Pgp(e.to_string()))?;
        if !helper.verified {
            return Err(MirrorError::Pgp("no valid signature over Release".into()));
        }
        Ok(())
    }
}

/// Strips the clear-sign armor from `message` without checking any
/// signature, returning the enclosed content verbatim. Used when a
/// mirror has `no_pgp_check` set but still published an `InRelease`
/// document: the control-format text underneath still needs unwrapping
/// even though nobody is asked to trust it.
pub fn extract_clearsigned(message: &[u8]) -> Result<Vec<u8>> {
    let empty = HashMap::new();
    let policy = StandardPolicy::new();
    let mut helper = Helper {
        keys: &empty,
        verified: false,
    };
    let mut verifier = VerifierBuilder::from_bytes(message)
        .map_err(|e| MirrorError::Pgp(e.to_string()))?
        .with_policy(&policy, None, &mut helper)
        .map_err(|e| MirrorError::Pgp(e.to_string()))?;
    let mut content = Vec::new();
    verifier
        .read_to_end(&mut content)
        .map_err(|e| MirrorError::Pgp(e.to_string()))?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_file_is_a_pgp_error() {
        let err = Verifier::load(Path::new("/nonexistent/key.asc"));
        assert!(err.is_err());
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use appinst_core::PrivilegeLevel;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::checksum::reference_digest;
use crate::ed25519::PublicKey;

pub const SIGNATURE_FILE_NAME: &str = "signatures.toml";

const MAX_DISTRIBUTORS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureRole {
    Author,
    Distributor,
}

impl SignatureRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Author => "author",
            Self::Distributor => "distributor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub role: SignatureRole,
    pub public_key: String,
    pub digest: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFile {
    #[serde(default, rename = "signature")]
    pub signatures: Vec<SignatureEntry>,
}

impl SignatureFile {
    pub fn from_toml_str(input: &str) -> Result<Self, SignatureError> {
        toml::from_str(input).map_err(|err| SignatureError::Malformed(err.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, SignatureError> {
        toml::to_string(self).map_err(|err| SignatureError::Malformed(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub fingerprint: String,
    pub encoded: String,
}

impl CertificateInfo {
    fn from_key(key: &PublicKey) -> Self {
        Self {
            fingerprint: key.fingerprint(),
            encoded: key.to_base64(),
        }
    }
}

/// Author certificate plus at most two distributor certificates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateBundle {
    pub author: Option<CertificateInfo>,
    pub distributors: Vec<CertificateInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutcome {
    pub privilege_level: PrivilegeLevel,
    pub certificates: CertificateBundle,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("malformed signature data: {0}")]
    Malformed(String),

    #[error("author signature not found")]
    AuthorMissing,

    #[error("too many distributor signatures: {0} (at most 2 allowed)")]
    TooManyDistributors(usize),

    #[error("{role} certificate has been revoked (fingerprint={fingerprint})")]
    Revoked {
        role: &'static str,
        fingerprint: String,
    },

    #[error("{role} signature reference does not match package content")]
    ReferenceMismatch { role: &'static str },

    #[error("{role} signature is invalid")]
    InvalidSignature { role: &'static str },

    #[error("privilege level could not be determined: no distributor signature")]
    PrivilegeNotFound,

    #[error("failed to read package content: {0}")]
    Io(String),
}

pub trait SignatureValidator {
    fn validate(
        &self,
        base_path: &Path,
        check_reference: bool,
    ) -> Result<SignatureOutcome, SignatureError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignaturePolicy {
    pub allow_unsigned: bool,
    pub revoked_keys: BTreeSet<String>,
    pub distributor_levels: BTreeMap<String, PrivilegeLevel>,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyValidator {
    policy: SignaturePolicy,
}

impl PolicyValidator {
    pub fn new(policy: SignaturePolicy) -> Self {
        Self { policy }
    }

    fn verify_entry(
        &self,
        entry: &SignatureEntry,
        expected_digest: Option<&str>,
    ) -> Result<PublicKey, SignatureError> {
        let role = entry.role.as_str();
        let key = PublicKey::from_hex(&entry.public_key)
            .map_err(|err| SignatureError::Malformed(format!("{role} public key: {err:#}")))?;

        let fingerprint = key.fingerprint();
        if self.policy.revoked_keys.contains(&fingerprint) {
            return Err(SignatureError::Revoked { role, fingerprint });
        }

        if let Some(expected) = expected_digest {
            if !entry.digest.trim().eq_ignore_ascii_case(expected) {
                return Err(SignatureError::ReferenceMismatch { role });
            }
        }

        let verified = key
            .verify_hex(entry.digest.trim().as_bytes(), &entry.signature)
            .map_err(|err| SignatureError::Malformed(format!("{role} signature: {err:#}")))?;
        if !verified {
            return Err(SignatureError::InvalidSignature { role });
        }
        Ok(key)
    }
}

impl SignatureValidator for PolicyValidator {
    fn validate(
        &self,
        base_path: &Path,
        check_reference: bool,
    ) -> Result<SignatureOutcome, SignatureError> {
        let path = base_path.join(SIGNATURE_FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if self.policy.allow_unsigned {
                    debug!(path = %base_path.display(), "accepting unsigned package");
                    return Ok(SignatureOutcome {
                        privilege_level: PrivilegeLevel::Untrusted,
                        certificates: CertificateBundle::default(),
                    });
                }
                return Err(SignatureError::Missing(path));
            }
            Err(err) => return Err(SignatureError::Io(format!("{}: {err}", path.display()))),
        };
        let file = SignatureFile::from_toml_str(&raw)?;

        let mut authors = file
            .signatures
            .iter()
            .filter(|entry| entry.role == SignatureRole::Author);
        let author = authors.next().ok_or(SignatureError::AuthorMissing)?;
        if authors.next().is_some() {
            return Err(SignatureError::Malformed(
                "more than one author signature".to_string(),
            ));
        }
        let distributors = file
            .signatures
            .iter()
            .filter(|entry| entry.role == SignatureRole::Distributor)
            .collect::<Vec<_>>();
        if distributors.len() > MAX_DISTRIBUTORS {
            return Err(SignatureError::TooManyDistributors(distributors.len()));
        }

        let expected_digest = if check_reference {
            Some(reference_digest(base_path).map_err(|err| SignatureError::Io(format!("{err:#}")))?)
        } else {
            None
        };

        let author_key = self.verify_entry(author, expected_digest.as_deref())?;
        let mut certificates = CertificateBundle {
            author: Some(CertificateInfo::from_key(&author_key)),
            distributors: Vec::with_capacity(distributors.len()),
        };

        let mut privilege_level = None;
        for entry in distributors {
            let key = self.verify_entry(entry, expected_digest.as_deref())?;
            let info = CertificateInfo::from_key(&key);
            let level = self
                .policy
                .distributor_levels
                .get(&info.fingerprint)
                .copied()
                .unwrap_or(PrivilegeLevel::Public);
            privilege_level = privilege_level.max(Some(level));
            certificates.distributors.push(info);
        }

        let privilege_level = privilege_level.ok_or(SignatureError::PrivilegeNotFound)?;
        debug!(
            path = %base_path.display(),
            level = privilege_level.as_str(),
            "package signatures verified"
        );
        Ok(SignatureOutcome {
            privilege_level,
            certificates,
        })
    }
}

use std::fmt;
use std::io;

use thiserror::Error;

/// Flat status taxonomy reported to the package manager daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    ConfigError,
    SignatureError,
    SignatureRevoked,
    AuthorCertNotMatch,
    PrivilegeNotFound,
    ManifestError,
    ManifestNotFound,
    PackageNotFound,
    RegistrationError,
    PrivilegeError,
    AppDirError,
    OutOfSpace,
    RecoveryError,
    DeltaError,
    IconError,
    InvalidValue,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ConfigError => "config_error",
            Self::SignatureError => "signature_error",
            Self::SignatureRevoked => "signature_revoked",
            Self::AuthorCertNotMatch => "author_cert_not_match",
            Self::PrivilegeNotFound => "privilege_not_found",
            Self::ManifestError => "manifest_error",
            Self::ManifestNotFound => "manifest_not_found",
            Self::PackageNotFound => "package_not_found",
            Self::RegistrationError => "registration_error",
            Self::PrivilegeError => "privilege_error",
            Self::AppDirError => "app_dir_error",
            Self::OutOfSpace => "out_of_space",
            Self::RecoveryError => "recovery_error",
            Self::DeltaError => "delta_error",
            Self::IconError => "icon_error",
            Self::InvalidValue => "invalid_value",
            Self::Error => "error",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::ConfigError => 2,
            Self::SignatureError => 3,
            Self::SignatureRevoked => 4,
            Self::AuthorCertNotMatch => 5,
            Self::PrivilegeNotFound => 6,
            Self::ManifestError => 7,
            Self::ManifestNotFound => 8,
            Self::PackageNotFound => 9,
            Self::RegistrationError => 10,
            Self::PrivilegeError => 11,
            Self::AppDirError => 12,
            Self::OutOfSpace => 13,
            Self::RecoveryError => 14,
            Self::DeltaError => 15,
            Self::IconError => 16,
            Self::InvalidValue => 17,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error signal raised by a step phase: a status kind plus an operator-facing
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {message}")]
pub struct StepError {
    pub status: Status,
    pub message: String,
}

impl StepError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Converts a collaborator error, promoting disk-full failures to
    /// `Status::OutOfSpace` regardless of the requested status.
    pub fn from_anyhow(status: Status, err: &anyhow::Error) -> Self {
        let status = if is_out_of_space(err) {
            Status::OutOfSpace
        } else {
            status
        };
        Self::new(status, format!("{err:#}"))
    }
}

pub type StepResult = Result<(), StepError>;

/// Tags a collaborator failure with the status a step reports for it.
pub trait OrStatus<T> {
    fn or_status(self, status: Status) -> Result<T, StepError>;
}

impl<T> OrStatus<T> for anyhow::Result<T> {
    fn or_status(self, status: Status) -> Result<T, StepError> {
        self.map_err(|err| StepError::from_anyhow(status, &err))
    }
}

fn is_out_of_space(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.raw_os_error() == Some(libc::ENOSPC))
    })
}

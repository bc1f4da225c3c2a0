//! Error types for the VM core.
//!
//! Errors fall into three groups:
//!
//! - fatal: identity, configuration, installation and start failures. They
//!   propagate to `main`, which prints the diagnostic and exits.
//! - validation: rejected user input with a stable numeric [`ValidationError::code`].
//! - degradable: never surfaced as errors at all, only logged as warnings.

use std::path::PathBuf;

use thiserror::Error;

use crate::vm::VmState;

/// Rejected input. Each variant carries a distinct reason code.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("boot loader not found: {}", .0.display())]
    BootLoaderMissing(PathBuf),

    #[error("boot loader path is a directory: {}", .0.display())]
    BootLoaderIsDirectory(PathBuf),

    #[error("boot loader {} must have a .{expected} extension", path.display())]
    BootLoaderExtension { path: PathBuf, expected: &'static str },

    #[error("boot loader {} is too small ({size} bytes, minimum {min})", path.display())]
    BootLoaderTooSmall { path: PathBuf, size: u64, min: u64 },

    #[error("boot loader {} is too large ({size} bytes, maximum {max})", path.display())]
    BootLoaderTooLarge { path: PathBuf, size: u64, max: u64 },

    #[error("boot loader {} is not readable: {source}", path.display())]
    BootLoaderUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("display size {width}x{height} is outside 1..={max} pixels")]
    DisplayDimensions { width: u32, height: u32, max: u32 },

    #[error("debug port {0} is outside 1..=65535")]
    DebugPort(u32),

    #[error("CPU count must be at least 1")]
    CpuCount,

    #[error("unknown settings key `{0}`")]
    UnknownKey(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

impl ValidationError {
    /// Stable reason code, distinct per variant.
    pub fn code(&self) -> u32 {
        match self {
            Self::BootLoaderMissing(_) => 1001,
            Self::BootLoaderIsDirectory(_) => 1002,
            Self::BootLoaderExtension { .. } => 1003,
            Self::BootLoaderTooSmall { .. } => 1004,
            Self::BootLoaderTooLarge { .. } => 1005,
            Self::BootLoaderUnreadable { .. } => 1006,
            Self::DisplayDimensions { .. } => 1101,
            Self::DebugPort(_) => 1102,
            Self::CpuCount => 1103,
            Self::UnknownKey(_) => 1201,
            Self::InvalidValue { .. } => 1202,
        }
    }
}

/// Structured error reported by the hypervisor platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not supported on this host: {0}")]
    Unsupported(String),

    #[error("invalid virtual machine configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{operation} failed: {reason}")]
    OperationFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    pub fn failed(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation,
            reason: reason.into(),
        }
    }
}

/// Failure to assemble a bootable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("cannot attach disk image {}: {source}", path.display())]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("auxiliary storage missing at {}; run `hyfervisor install` against this bundle", .0.display())]
    MissingAuxiliaryStorage(PathBuf),

    #[error("virtual machine configuration is invalid: {0}")]
    Invalid(#[source] PlatformError),

    #[error("configuration does not support save/restore: {0}")]
    SaveRestore(#[source] PlatformError),

    #[error("failed to construct virtual machine: {0}")]
    Construction(#[source] PlatformError),
}

/// Missing or unusable identity artifacts. Always fatal in run mode.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(
        "{artifact} not found at {}; run `hyfervisor install <image> {}` first",
        path.display(),
        bundle.display()
    )]
    Missing {
        artifact: &'static str,
        path: PathBuf,
        bundle: PathBuf,
    },

    #[error(
        "{artifact} at {} could not be read ({source}); reinstall into a fresh bundle",
        path.display()
    )]
    Corrupt {
        artifact: &'static str,
        path: PathBuf,
        #[source]
        source: PlatformError,
    },

    #[error("the hardware model in {} is not supported on this host", .0.display())]
    UnsupportedHardwareModel(PathBuf),

    #[error("failed to write {artifact} to {}: {source}", path.display())]
    Persist {
        artifact: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal installation failures. There is no partial-install recovery.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("bundle {} already exists; choose a fresh bundle path", .0.display())]
    BundleExists(PathBuf),

    #[error("failed to create bundle {}: {source}", path.display())]
    BundleCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create disk image {}: {reason}", path.display())]
    DiskImage { path: PathBuf, reason: String },

    #[error("failed to cache restore image into {}: {source}", path.display())]
    CacheRestoreImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load restore image {}: {source}", path.display())]
    RestoreImage {
        path: PathBuf,
        #[source]
        source: PlatformError,
    },

    #[error("no supported configuration is available for this restore image on this host")]
    NoSupportedConfiguration,

    #[error("the restore image's hardware model is not supported on this host")]
    UnsupportedHardwareModel,

    #[error("{resource} of {actual} is below the restore image minimum of {minimum}")]
    InsufficientResources {
        resource: &'static str,
        actual: u64,
        minimum: u64,
    },

    #[error("installer step `{step}` called in state {state}")]
    OutOfOrder { step: &'static str, state: String },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("installation failed: {0}")]
    Install(#[source] PlatformError),
}

/// Lifecycle transition failures.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("cannot {operation} while a {state:?} transition is in flight")]
    Busy {
        operation: &'static str,
        state: VmState,
    },

    #[error("cannot {operation} from state {actual:?}")]
    InvalidState {
        operation: &'static str,
        actual: VmState,
    },

    #[error("save/restore is not supported on this host")]
    SaveRestoreUnsupported,

    #[error("failed to start the virtual machine: {0}")]
    Start(#[source] PlatformError),

    #[error("failed to save the virtual machine: {0}")]
    Save(#[source] PlatformError),

    #[error("{operation} failed: {source}")]
    Platform {
        operation: &'static str,
        #[source]
        source: PlatformError,
    },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Settings persistence failures.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write settings {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_loader_codes_are_distinct() {
        let path = PathBuf::from("/tmp/x.bin");
        let codes = [
            ValidationError::BootLoaderMissing(path.clone()).code(),
            ValidationError::BootLoaderIsDirectory(path.clone()).code(),
            ValidationError::BootLoaderExtension {
                path: path.clone(),
                expected: "bin",
            }
            .code(),
            ValidationError::BootLoaderTooSmall {
                path: path.clone(),
                size: 1,
                min: 1024,
            }
            .code(),
            ValidationError::BootLoaderTooLarge {
                path: path.clone(),
                size: u64::MAX,
                max: 1,
            }
            .code(),
            ValidationError::BootLoaderUnreadable {
                path,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }
            .code(),
        ];

        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn missing_identity_names_remediation() {
        let err = IdentityError::Missing {
            artifact: "MachineIdentifier",
            path: PathBuf::from("/tmp/T1/MachineIdentifier"),
            bundle: PathBuf::from("/tmp/T1"),
        };
        let msg = err.to_string();
        assert!(msg.contains("MachineIdentifier"));
        assert!(msg.contains("hyfervisor install"));
        assert!(msg.contains("/tmp/T1"));
    }
}

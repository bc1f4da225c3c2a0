//! The hypervisor platform seam.
//!
//! Disk image formats, boot, device emulation and guest installation are
//! owned by the host platform. This module describes what the VM core needs
//! from it: a capability set queried once at startup, identity descriptor
//! handling, configuration validation and asynchronous machine operations.
//!
//! Backends: [`crate::vm::simulated`] (in-process) and [`crate::vm::vfkit`].

use std::path::{Path, PathBuf};

use crate::error::PlatformError;
use crate::vm::configuration::VmConfiguration;

// ---------------------------------------------------------------------------
// Host version and capabilities
// ---------------------------------------------------------------------------

/// Host operating system version (`major.minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostVersion {
    pub major: u32,
    pub minor: u32,
}

impl HostVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `sw_vers -productVersion` output such as `14.5` or `26.0.1`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(m) => m.parse().ok()?,
            None => 0,
        };
        Some(Self { major, minor })
    }
}

impl std::fmt::Display for HostVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A host network interface the guest can be bridged onto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedInterface {
    /// BSD name, e.g. `en0`.
    pub identifier: String,
    pub display_name: String,
}

/// Everything the host platform advertises, queried once at startup.
///
/// Optional features are plain flags; builders consult these rather than
/// comparing version numbers.
#[derive(Debug, Clone)]
pub struct HostCapabilities {
    pub version: HostVersion,
    pub host_logical_cores: usize,
    pub min_cpu_count: u32,
    pub max_cpu_count: u32,
    pub min_memory_size: u64,
    pub max_memory_size: u64,
    pub save_restore: bool,
    /// Structured start options with a recovery boot flag.
    pub recovery_start_options: bool,
    /// Older private start path into recovery.
    pub legacy_recovery_boot: bool,
    /// Sparse container (ASIF) disk images.
    pub sparse_disk_images: bool,
    pub console_device: bool,
    pub debug_stub: bool,
    pub panic_device: bool,
    pub bridged_interfaces: Vec<BridgedInterface>,
}

impl HostCapabilities {
    /// Derive the feature flags for a macOS host version.
    ///
    /// Resource bounds default to the platform's documented minimums and to
    /// the host's core count; callers with better information overwrite them.
    pub fn for_host_version(version: HostVersion) -> Self {
        let host_logical_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let major = version.major;

        Self {
            version,
            host_logical_cores,
            min_cpu_count: 1,
            max_cpu_count: host_logical_cores.max(1) as u32,
            min_memory_size: 128 * MIB,
            max_memory_size: 64 * GIB,
            save_restore: major >= 14,
            recovery_start_options: major >= 13,
            legacy_recovery_boot: major == 12,
            sparse_disk_images: major >= 26,
            console_device: major >= 11,
            debug_stub: major >= 12,
            panic_device: major >= 14,
            bridged_interfaces: Vec::new(),
        }
    }
}

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

// ---------------------------------------------------------------------------
// Identity descriptors
// ---------------------------------------------------------------------------

/// Platform identity descriptor, serialized into `HardwareModel`.
///
/// The bytes are owned by the platform; the core only moves them around.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareModel(Vec<u8>);

impl HardwareModel {
    pub fn from_data(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }
}

/// Unique instance descriptor, serialized into `MachineIdentifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineIdentifier(Vec<u8>);

impl MachineIdentifier {
    pub fn from_data(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }
}

/// The most capable guest configuration supported by an image and the host.
#[derive(Debug, Clone)]
pub struct ConfigurationRequirements {
    pub hardware_model: HardwareModel,
    pub minimum_cpu_count: u32,
    pub minimum_memory_size: u64,
}

/// A loaded installer payload.
#[derive(Debug, Clone)]
pub struct RestoreImage {
    pub path: PathBuf,
    pub build_version: String,
    /// `None` when neither the image nor the host offers a usable configuration.
    pub most_featureful_supported_configuration: Option<ConfigurationRequirements>,
}

// ---------------------------------------------------------------------------
// Machine operations
// ---------------------------------------------------------------------------

/// How the guest should boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootMode {
    #[default]
    Normal,
    Recovery(RecoveryMethod),
}

/// The platform mechanism used to reach recovery boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMethod {
    StartOptions,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartOptions {
    pub boot_mode: BootMode,
}

impl StartOptions {
    pub fn recovery(method: RecoveryMethod) -> Self {
        Self {
            boot_mode: BootMode::Recovery(method),
        }
    }
}

/// Execution state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Stopped,
    Running,
    Paused,
    Error,
}

/// The host hypervisor as seen by the installer and lifecycle manager.
#[allow(async_fn_in_trait)]
pub trait Hypervisor {
    type Machine: VirtualMachine;

    fn capabilities(&self) -> &HostCapabilities;

    fn decode_hardware_model(&self, data: &[u8]) -> Result<HardwareModel, PlatformError>;

    fn decode_machine_identifier(&self, data: &[u8]) -> Result<MachineIdentifier, PlatformError>;

    fn is_hardware_model_supported(&self, model: &HardwareModel) -> bool;

    /// Generate a fresh, unique machine identifier.
    fn new_machine_identifier(&self) -> MachineIdentifier;

    /// Create the platform's auxiliary storage blob for `model` at `path`.
    fn create_auxiliary_storage(
        &self,
        path: &Path,
        model: &HardwareModel,
    ) -> Result<(), PlatformError>;

    /// Create a sparse container disk image of `size` bytes.
    fn create_sparse_disk_image(&self, path: &Path, size: u64) -> Result<(), PlatformError>;

    async fn load_restore_image(&self, path: &Path) -> Result<RestoreImage, PlatformError>;

    fn validate(&self, config: &VmConfiguration) -> Result<(), PlatformError>;

    fn validate_save_restore_support(&self, config: &VmConfiguration)
    -> Result<(), PlatformError>;

    fn create_machine(&self, config: VmConfiguration) -> Result<Self::Machine, PlatformError>;
}

/// A constructed guest. Operations complete asynchronously, one at a time.
#[allow(async_fn_in_trait)]
pub trait VirtualMachine {
    fn state(&self) -> MachineState;

    /// Re-query the platform, e.g. to notice a guest-initiated shutdown.
    async fn refresh_state(&mut self) -> MachineState;

    async fn start(&mut self, options: StartOptions) -> Result<(), PlatformError>;

    async fn stop(&mut self) -> Result<(), PlatformError>;

    async fn pause(&mut self) -> Result<(), PlatformError>;

    async fn resume(&mut self) -> Result<(), PlatformError>;

    /// Write a snapshot of a paused machine to `path`.
    async fn save_state(&mut self, path: &Path) -> Result<(), PlatformError>;

    /// Load a snapshot into a stopped machine, leaving it paused.
    async fn restore_state(&mut self, path: &Path) -> Result<(), PlatformError>;

    /// Install the guest from a restore image, reporting fractional progress.
    async fn install(
        &mut self,
        restore_image: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_versions() {
        assert_eq!(HostVersion::parse("14.5"), Some(HostVersion::new(14, 5)));
        assert_eq!(HostVersion::parse("26.0.1\n"), Some(HostVersion::new(26, 0)));
        assert_eq!(HostVersion::parse("13"), Some(HostVersion::new(13, 0)));
        assert_eq!(HostVersion::parse("sonoma"), None);
    }

    #[test]
    fn capabilities_follow_host_version() {
        let monterey = HostCapabilities::for_host_version(HostVersion::new(12, 6));
        assert!(!monterey.save_restore);
        assert!(!monterey.recovery_start_options);
        assert!(monterey.legacy_recovery_boot);
        assert!(!monterey.panic_device);

        let sonoma = HostCapabilities::for_host_version(HostVersion::new(14, 0));
        assert!(sonoma.save_restore);
        assert!(sonoma.recovery_start_options);
        assert!(!sonoma.legacy_recovery_boot);
        assert!(!sonoma.sparse_disk_images);

        let tahoe = HostCapabilities::for_host_version(HostVersion::new(26, 0));
        assert!(tahoe.sparse_disk_images);
        assert!(tahoe.min_cpu_count <= tahoe.max_cpu_count);
        assert!(tahoe.min_memory_size <= tahoe.max_memory_size);
    }
}

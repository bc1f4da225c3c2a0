//! Device descriptors and their builders.
//!
//! Builders turn settings values into plain descriptors the platform
//! consumes. Required devices fail loudly; optional ones degrade to "not
//! attached" with a warning when the host lacks the capability.

use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{ConfigError, ValidationError};
use crate::settings::{VmSettings, validate_display};
use crate::vm::platform::{HostCapabilities, MIB};

/// Pixel density of the guest display.
pub const DISPLAY_PIXELS_PER_INCH: u32 = 80;

/// Extension a custom boot loader image must carry.
pub const BOOT_LOADER_EXTENSION: &str = "bin";
pub const BOOT_LOADER_MIN_SIZE: u64 = 1024;
pub const BOOT_LOADER_MAX_SIZE: u64 = 100 * MIB;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    pub image: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Display {
    pub width: u32,
    pub height: u32,
    pub pixels_per_inch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsDevice {
    pub displays: Vec<Display>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkAttachment {
    Bridged { interface: String },
    Nat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub attachment: NetworkAttachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStream {
    HostInput,
    HostOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    pub streams: Vec<AudioStream>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardDevice {
    Mac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointingDevice {
    Trackpad,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootLoader {
    Default,
    Custom(PathBuf),
}

/// Serial console bound to the process's stdin/stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugStub {
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanicDevice;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionalDevices {
    pub console: Option<ConsoleDevice>,
    pub debug_stub: Option<DebugStub>,
    pub panic_device: Option<PanicDevice>,
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Attach the bundle's disk image. The image must open read/write.
pub fn build_disk_device(disk_image: &Path) -> Result<StorageDevice, ConfigError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(disk_image)
        .map_err(|source| ConfigError::Attachment {
            path: disk_image.to_path_buf(),
            source,
        })?;

    Ok(StorageDevice {
        image: disk_image.to_path_buf(),
        read_only: false,
    })
}

/// A single display. Out-of-range sizes are rejected, never clamped.
pub fn build_graphics_device(width: u32, height: u32) -> Result<GraphicsDevice, ValidationError> {
    validate_display(width, height)?;
    Ok(GraphicsDevice {
        displays: vec![Display {
            width,
            height,
            pixels_per_inch: DISPLAY_PIXELS_PER_INCH,
        }],
    })
}

/// Bridge onto `interface` when the host offers it, otherwise NAT.
pub fn build_network_device(interface: Option<&str>, caps: &HostCapabilities) -> NetworkDevice {
    let bridged = interface.and_then(|wanted| {
        caps.bridged_interfaces
            .iter()
            .find(|candidate| candidate.identifier == wanted)
    });

    let attachment = match (interface, bridged) {
        (_, Some(found)) => {
            info!(interface = %found.identifier, name = %found.display_name, "bridged networking");
            NetworkAttachment::Bridged {
                interface: found.identifier.clone(),
            }
        }
        (Some(wanted), None) => {
            warn!(interface = wanted, "bridgeable interface not found, using NAT");
            NetworkAttachment::Nat
        }
        (None, None) => NetworkAttachment::Nat,
    };

    NetworkDevice { attachment }
}

pub fn build_audio_device() -> AudioDevice {
    AudioDevice {
        streams: vec![AudioStream::HostInput, AudioStream::HostOutput],
    }
}

/// Check a custom boot loader image, reporting the first failed check.
pub fn validate_boot_loader_path(path: &Path) -> Result<(), ValidationError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return Err(ValidationError::BootLoaderMissing(path.to_path_buf())),
    };

    if metadata.is_dir() {
        return Err(ValidationError::BootLoaderIsDirectory(path.to_path_buf()));
    }

    let extension_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(BOOT_LOADER_EXTENSION));
    if !extension_ok {
        return Err(ValidationError::BootLoaderExtension {
            path: path.to_path_buf(),
            expected: BOOT_LOADER_EXTENSION,
        });
    }

    let size = metadata.len();
    if size < BOOT_LOADER_MIN_SIZE {
        return Err(ValidationError::BootLoaderTooSmall {
            path: path.to_path_buf(),
            size,
            min: BOOT_LOADER_MIN_SIZE,
        });
    }
    if size > BOOT_LOADER_MAX_SIZE {
        return Err(ValidationError::BootLoaderTooLarge {
            path: path.to_path_buf(),
            size,
            max: BOOT_LOADER_MAX_SIZE,
        });
    }

    let mut probe = [0u8; 1];
    std::fs::File::open(path)
        .and_then(|mut f| f.read(&mut probe))
        .map_err(|source| ValidationError::BootLoaderUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(())
}

/// Select the boot loader. An invalid custom image falls back to the default.
pub fn build_boot_loader(custom: Option<&Path>) -> BootLoader {
    let Some(path) = custom else {
        return BootLoader::Default;
    };

    match validate_boot_loader_path(path) {
        Ok(()) => {
            info!(path = %path.display(), "using custom boot loader");
            BootLoader::Custom(path.to_path_buf())
        }
        Err(e) => {
            warn!(code = e.code(), error = %e, "custom boot loader rejected, using default");
            BootLoader::Default
        }
    }
}

/// Attach each enabled optional device the host supports.
pub fn build_optional_devices(settings: &VmSettings, caps: &HostCapabilities) -> OptionalDevices {
    let mut devices = OptionalDevices::default();

    if settings.console_enabled {
        if caps.console_device {
            devices.console = Some(ConsoleDevice);
        } else {
            warn!("console device not available on this host, not attached");
        }
    }

    if settings.debug_enabled {
        match u16::try_from(settings.debug_port) {
            Ok(port) if port != 0 && caps.debug_stub => {
                info!(port, "debug stub attached");
                devices.debug_stub = Some(DebugStub { port });
            }
            Ok(port) if port != 0 => {
                warn!(port, "debug stub not available on this host, not attached");
            }
            _ => {
                warn!(port = settings.debug_port, "invalid debug port, debug stub not attached");
            }
        }
    }

    if settings.panic_device_enabled {
        if caps.panic_device {
            devices.panic_device = Some(PanicDevice);
        } else {
            warn!("panic device not available on this host, not attached");
        }
    }

    devices
}

//! The VM settings record and its on-disk store.
//!
//! `VmSettings` is a flat key/value record serialized to TOML at
//! `~/.config/hyfervisor/config.toml`. Missing keys take their defaults, so a
//! partial or absent file is never an error. Every mutation through
//! [`SettingsStore::update`] is validated and written back immediately.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SettingsError, ValidationError};
use crate::vm::platform::{GIB, MIB};

/// Largest accepted display width or height, in pixels.
pub const MAX_DISPLAY_DIMENSION: u32 = 4096;

/// The VM configuration record consumed by the installer and lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub cpu_count: u32,
    /// Bytes. Zero selects the default size.
    pub memory_size: u64,
    pub display_width: u32,
    pub display_height: u32,
    pub debug_port: u32,
    pub debug_enabled: bool,
    pub console_enabled: bool,
    pub panic_device_enabled: bool,
    pub audio_enabled: bool,
    pub network_enabled: bool,
    /// Host interface to bridge onto; empty selects NAT.
    pub network_interface: String,
    /// Bytes. Fixed once the bundle is installed.
    pub disk_size: u64,
    /// Alternate boot loader image; empty selects the platform default.
    pub boot_loader_path: String,
    pub vm_bundle_path: String,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            cpu_count: 4,
            memory_size: 4 * GIB,
            display_width: 1920,
            display_height: 1200,
            debug_port: 8000,
            debug_enabled: false,
            console_enabled: false,
            panic_device_enabled: false,
            audio_enabled: true,
            network_enabled: true,
            network_interface: String::new(),
            disk_size: 64 * GIB,
            boot_loader_path: String::new(),
            vm_bundle_path: "~/VM.bundle".to_string(),
        }
    }
}

impl VmSettings {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check the fields whose ranges are enforced on input.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cpu_count == 0 {
            return Err(ValidationError::CpuCount);
        }
        validate_display(self.display_width, self.display_height)?;
        if !(1..=u32::from(u16::MAX)).contains(&self.debug_port) {
            return Err(ValidationError::DebugPort(self.debug_port));
        }
        Ok(())
    }

    pub fn network_interface(&self) -> Option<&str> {
        non_empty(&self.network_interface)
    }

    pub fn boot_loader_path(&self) -> Option<&Path> {
        non_empty(&self.boot_loader_path).map(Path::new)
    }

    pub fn vm_bundle_path(&self) -> Option<&str> {
        non_empty(&self.vm_bundle_path)
    }

    /// Set one field from its textual form, as typed at the command line.
    ///
    /// Sizes accept a plain byte count or a `K`/`M`/`G` suffix (binary units).
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<(), ValidationError> {
        let invalid = || ValidationError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let value = value.trim();

        match key {
            "cpu_count" => self.cpu_count = value.parse().map_err(|_| invalid())?,
            "memory_size" => self.memory_size = parse_size(value).ok_or_else(invalid)?,
            "display_width" => self.display_width = value.parse().map_err(|_| invalid())?,
            "display_height" => self.display_height = value.parse().map_err(|_| invalid())?,
            "debug_port" => self.debug_port = value.parse().map_err(|_| invalid())?,
            "debug_enabled" => self.debug_enabled = parse_bool(value).ok_or_else(invalid)?,
            "console_enabled" => self.console_enabled = parse_bool(value).ok_or_else(invalid)?,
            "panic_device_enabled" => {
                self.panic_device_enabled = parse_bool(value).ok_or_else(invalid)?
            }
            "audio_enabled" => self.audio_enabled = parse_bool(value).ok_or_else(invalid)?,
            "network_enabled" => self.network_enabled = parse_bool(value).ok_or_else(invalid)?,
            "network_interface" => self.network_interface = value.to_string(),
            "disk_size" => self.disk_size = parse_size(value).ok_or_else(invalid)?,
            "boot_loader_path" => self.boot_loader_path = value.to_string(),
            "vm_bundle_path" => self.vm_bundle_path = value.to_string(),
            other => return Err(ValidationError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

/// Reject display sizes outside `1..=MAX_DISPLAY_DIMENSION`.
pub fn validate_display(width: u32, height: u32) -> Result<(), ValidationError> {
    let range = 1..=MAX_DISPLAY_DIMENSION;
    if range.contains(&width) && range.contains(&height) {
        Ok(())
    } else {
        Err(ValidationError::DisplayDimensions {
            width,
            height,
            max: MAX_DISPLAY_DIMENSION,
        })
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_size(s: &str) -> Option<u64> {
    let upper = s.to_ascii_uppercase();
    let trimmed = upper
        .strip_suffix("IB")
        .or_else(|| upper.strip_suffix('B'))
        .unwrap_or(&upper);
    let (digits, unit) = match trimmed.char_indices().last()? {
        (i, 'K') => (&trimmed[..i], 1024),
        (i, 'M') => (&trimmed[..i], MIB),
        (i, 'G') => (&trimmed[..i], GIB),
        _ => (trimmed, 1),
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(unit)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Settings bound to their file on disk.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: VmSettings,
}

impl SettingsStore {
    /// Load from `path`. A missing file yields defaults; missing keys too.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let settings = match std::fs::read_to_string(&path) {
            Ok(content) => VmSettings::from_toml(&content).map_err(|source| {
                SettingsError::Parse {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                VmSettings::default()
            }
            Err(source) => return Err(SettingsError::Read { path, source }),
        };
        Ok(Self { path, settings })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &VmSettings {
        &self.settings
    }

    /// Write the current settings, creating the parent directory if needed.
    pub fn save(&self) -> Result<(), SettingsError> {
        let content = self.settings.to_toml()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.path, content).map_err(|source| SettingsError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }

    /// Apply `mutate` to a copy, validate it, then commit and save.
    ///
    /// A rejected mutation leaves both memory and disk untouched.
    pub fn update<F>(&mut self, mutate: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&mut VmSettings) -> Result<(), ValidationError>,
    {
        let mut next = self.settings.clone();
        mutate(&mut next)?;
        next.validate()?;
        self.settings = next;
        self.save()
    }

    pub fn reset_to_defaults(&mut self) -> Result<(), SettingsError> {
        self.settings = VmSettings::default();
        info!(path = %self.path.display(), "settings reset to defaults");
        self.save()
    }
}

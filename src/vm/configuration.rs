//! Assembled virtual machine configuration.

use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::ConfigError;
use crate::settings::VmSettings;
use crate::vm::bundle::VmBundle;
use crate::vm::devices::{
    self, AudioDevice, BootLoader, GraphicsDevice, KeyboardDevice, NetworkDevice,
    OptionalDevices, PointingDevice, StorageDevice,
};
use crate::vm::identity::VmIdentity;
use crate::vm::platform::{HostCapabilities, Hypervisor};
use crate::vm::resources;

/// Platform section: identity plus the auxiliary storage that goes with it.
#[derive(Debug, Clone)]
pub struct MacPlatform {
    pub identity: VmIdentity,
    pub auxiliary_storage: PathBuf,
}

/// A complete machine description, ready for platform validation.
#[derive(Debug, Clone)]
pub struct VmConfiguration {
    pub cpu_count: u32,
    pub memory_size: u64,
    pub platform: MacPlatform,
    pub boot_loader: BootLoader,
    pub storage: Vec<StorageDevice>,
    pub graphics: GraphicsDevice,
    pub network: Option<NetworkDevice>,
    pub audio: Option<AudioDevice>,
    pub keyboard: KeyboardDevice,
    pub pointing: PointingDevice,
    pub optional: OptionalDevices,
}

/// Compose a configuration from the settings record and host capabilities.
///
/// Does not consult the platform; see [`build_validated`] for that.
pub fn assemble(
    settings: &VmSettings,
    caps: &HostCapabilities,
    bundle: &VmBundle,
    identity: VmIdentity,
) -> Result<VmConfiguration, ConfigError> {
    let cpu_count = resources::effective_cpu_count(settings.cpu_count, caps);
    let memory_size = resources::compute_memory_size(settings.memory_size, caps);
    debug!(cpu_count, memory_size, "resources resolved");

    let graphics = devices::build_graphics_device(settings.display_width, settings.display_height)?;
    let storage = vec![devices::build_disk_device(&bundle.disk_image())?];

    let network = settings
        .network_enabled
        .then(|| devices::build_network_device(settings.network_interface(), caps));
    let audio = settings.audio_enabled.then(devices::build_audio_device);

    Ok(VmConfiguration {
        cpu_count,
        memory_size,
        platform: MacPlatform {
            identity,
            auxiliary_storage: bundle.auxiliary_storage(),
        },
        boot_loader: devices::build_boot_loader(settings.boot_loader_path()),
        storage,
        graphics,
        network,
        audio,
        keyboard: KeyboardDevice::Mac,
        pointing: PointingDevice::Trackpad,
        optional: devices::build_optional_devices(settings, caps),
    })
}

/// Assemble for run mode and validate the result as a unit.
///
/// On hosts with save/restore, the configuration must also support it.
pub fn build_validated<H: Hypervisor>(
    hypervisor: &H,
    settings: &VmSettings,
    bundle: &VmBundle,
    identity: VmIdentity,
) -> Result<VmConfiguration, ConfigError> {
    let aux = bundle.auxiliary_storage();
    if !aux.is_file() {
        return Err(ConfigError::MissingAuxiliaryStorage(aux));
    }

    let caps = hypervisor.capabilities();
    let config = assemble(settings, caps, bundle, identity)?;

    hypervisor.validate(&config).map_err(ConfigError::Invalid)?;
    if caps.save_restore {
        hypervisor
            .validate_save_restore_support(&config)
            .map_err(ConfigError::SaveRestore)?;
    }

    info!(
        cpus = config.cpu_count,
        memory = config.memory_size,
        network = ?config.network.as_ref().map(|n| &n.attachment),
        "configuration validated"
    );
    Ok(config)
}

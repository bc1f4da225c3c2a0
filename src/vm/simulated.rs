//! In-process hypervisor backed by plain files.
//!
//! Behaves like the real platform from the core's point of view: identity
//! blobs round-trip, auxiliary storage and snapshots are written to disk,
//! operations enforce the platform's state preconditions. Faults can be
//! injected and every machine operation is recorded in a shared journal.
//! Used by the test suite and by `--simulate` dry runs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::PlatformError;
use crate::vm::configuration::VmConfiguration;
use crate::vm::devices::BootLoader;
use crate::vm::platform::{
    BootMode, ConfigurationRequirements, GIB, HardwareModel, HostCapabilities, HostVersion,
    Hypervisor, MIB, MachineIdentifier, MachineState, RecoveryMethod, RestoreImage, StartOptions,
    VirtualMachine,
};

const HARDWARE_MODEL_MAGIC: &[u8] = b"hyfervisor-sim/hardware-model/";
const AUXILIARY_MAGIC: &[u8] = b"hyfervisor-sim/auxiliary-storage\n";
const SNAPSHOT_MAGIC: &[u8] = b"hyfervisor-sim/snapshot\n";

/// Hardware model generation the simulated host supports.
pub const SUPPORTED_GENERATION: u32 = 2;

/// Failures to inject into simulated operations.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub start: bool,
    pub save: bool,
    pub restore: bool,
    pub install: bool,
    /// Install succeeds without ever reporting completion.
    pub partial_progress: bool,
    pub recovery_start_options: bool,
    pub legacy_recovery: bool,
    /// Restore images offer no supported configuration.
    pub no_supported_configuration: bool,
    /// Restore images carry a hardware model this host cannot run.
    pub unsupported_hardware_model: bool,
    pub invalid_configuration: bool,
}

/// One recorded machine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Start(StartOptions),
    Stop,
    Pause,
    Resume,
    Save,
    Restore,
    Install,
}

pub type Journal = Arc<Mutex<Vec<Operation>>>;

#[derive(Debug, Clone)]
pub struct SimulatedHypervisor {
    caps: HostCapabilities,
    faults: Faults,
    journal: Journal,
}

impl SimulatedHypervisor {
    /// A host with every optional capability present.
    pub fn new() -> Self {
        let mut caps = HostCapabilities::for_host_version(HostVersion::new(15, 0));
        caps.host_logical_cores = 8;
        caps.min_cpu_count = 1;
        caps.max_cpu_count = 8;
        caps.min_memory_size = 512 * MIB;
        caps.max_memory_size = 32 * GIB;
        caps.panic_device = true;
        Self::with_capabilities(caps)
    }

    pub fn with_capabilities(caps: HostCapabilities) -> Self {
        Self {
            caps,
            faults: Faults::default(),
            journal: Journal::default(),
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn capabilities_mut(&mut self) -> &mut HostCapabilities {
        &mut self.caps
    }

    /// Operations performed by every machine this hypervisor created.
    pub fn journal(&self) -> Journal {
        Arc::clone(&self.journal)
    }

    fn hardware_model(generation: u32) -> HardwareModel {
        let mut data = HARDWARE_MODEL_MAGIC.to_vec();
        data.extend_from_slice(generation.to_string().as_bytes());
        HardwareModel::from_data(data)
    }

    fn generation(model: &HardwareModel) -> Option<u32> {
        let rest = model.data().strip_prefix(HARDWARE_MODEL_MAGIC)?;
        std::str::from_utf8(rest).ok()?.parse().ok()
    }
}

impl Default for SimulatedHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for SimulatedHypervisor {
    type Machine = SimulatedMachine;

    fn capabilities(&self) -> &HostCapabilities {
        &self.caps
    }

    fn decode_hardware_model(&self, data: &[u8]) -> Result<HardwareModel, PlatformError> {
        let model = HardwareModel::from_data(data.to_vec());
        match Self::generation(&model) {
            Some(_) => Ok(model),
            None => Err(PlatformError::failed(
                "decode hardware model",
                "unrecognised data representation",
            )),
        }
    }

    fn decode_machine_identifier(&self, data: &[u8]) -> Result<MachineIdentifier, PlatformError> {
        if data.len() != 16 {
            return Err(PlatformError::failed(
                "decode machine identifier",
                format!("expected 16 bytes, found {}", data.len()),
            ));
        }
        Ok(MachineIdentifier::from_data(data.to_vec()))
    }

    fn is_hardware_model_supported(&self, model: &HardwareModel) -> bool {
        Self::generation(model).is_some_and(|g| g <= SUPPORTED_GENERATION)
    }

    fn new_machine_identifier(&self) -> MachineIdentifier {
        MachineIdentifier::from_data(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    fn create_auxiliary_storage(
        &self,
        path: &Path,
        model: &HardwareModel,
    ) -> Result<(), PlatformError> {
        let mut blob = AUXILIARY_MAGIC.to_vec();
        blob.extend_from_slice(model.data());
        std::fs::write(path, blob)?;
        Ok(())
    }

    fn create_sparse_disk_image(&self, path: &Path, size: u64) -> Result<(), PlatformError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(())
    }

    async fn load_restore_image(&self, path: &Path) -> Result<RestoreImage, PlatformError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(PlatformError::failed(
                "load restore image",
                format!("{} is not a file", path.display()),
            ));
        }
        tokio::task::yield_now().await;

        let generation = if self.faults.unsupported_hardware_model {
            SUPPORTED_GENERATION + 1
        } else {
            SUPPORTED_GENERATION
        };
        let requirements = (!self.faults.no_supported_configuration).then(|| {
            ConfigurationRequirements {
                hardware_model: Self::hardware_model(generation),
                minimum_cpu_count: 2,
                minimum_memory_size: 2 * GIB,
            }
        });

        Ok(RestoreImage {
            path: path.to_path_buf(),
            build_version: "sim-1".to_string(),
            most_featureful_supported_configuration: requirements,
        })
    }

    fn validate(&self, config: &VmConfiguration) -> Result<(), PlatformError> {
        if self.faults.invalid_configuration {
            return Err(PlatformError::InvalidConfiguration(
                "injected validation failure".to_string(),
            ));
        }
        let caps = &self.caps;
        if !(caps.min_cpu_count..=caps.max_cpu_count).contains(&config.cpu_count) {
            return Err(PlatformError::InvalidConfiguration(format!(
                "CPU count {} outside {}..={}",
                config.cpu_count, caps.min_cpu_count, caps.max_cpu_count
            )));
        }
        if !(caps.min_memory_size..=caps.max_memory_size).contains(&config.memory_size) {
            return Err(PlatformError::InvalidConfiguration(format!(
                "memory size {} outside {}..={}",
                config.memory_size, caps.min_memory_size, caps.max_memory_size
            )));
        }
        if config.storage.is_empty() {
            return Err(PlatformError::InvalidConfiguration(
                "no storage devices".to_string(),
            ));
        }
        if !self.is_hardware_model_supported(&config.platform.identity.hardware_model) {
            return Err(PlatformError::InvalidConfiguration(
                "unsupported hardware model".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_save_restore_support(
        &self,
        config: &VmConfiguration,
    ) -> Result<(), PlatformError> {
        if matches!(config.boot_loader, BootLoader::Custom(_)) {
            return Err(PlatformError::Unsupported(
                "save/restore with a custom boot loader".to_string(),
            ));
        }
        Ok(())
    }

    fn create_machine(&self, config: VmConfiguration) -> Result<SimulatedMachine, PlatformError> {
        Ok(SimulatedMachine {
            config,
            state: MachineState::Stopped,
            faults: self.faults.clone(),
            journal: Arc::clone(&self.journal),
        })
    }
}

/// A simulated guest.
#[derive(Debug)]
pub struct SimulatedMachine {
    config: VmConfiguration,
    state: MachineState,
    faults: Faults,
    journal: Journal,
}

impl SimulatedMachine {
    pub fn configuration(&self) -> &VmConfiguration {
        &self.config
    }

    /// Simulate the guest powering itself off.
    pub fn guest_shutdown(&mut self) {
        self.state = MachineState::Stopped;
    }

    fn record(&self, op: Operation) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(op);
        }
    }

    fn require(&self, operation: &'static str, expected: MachineState) -> Result<(), PlatformError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PlatformError::failed(
                operation,
                format!("machine is {:?}, expected {:?}", self.state, expected),
            ))
        }
    }
}

impl VirtualMachine for SimulatedMachine {
    fn state(&self) -> MachineState {
        self.state
    }

    async fn refresh_state(&mut self) -> MachineState {
        self.state
    }

    async fn start(&mut self, options: StartOptions) -> Result<(), PlatformError> {
        self.require("start", MachineState::Stopped)?;
        self.record(Operation::Start(options));
        tokio::task::yield_now().await;

        let injected = match options.boot_mode {
            BootMode::Normal => self.faults.start,
            BootMode::Recovery(RecoveryMethod::StartOptions) => self.faults.recovery_start_options,
            BootMode::Recovery(RecoveryMethod::Legacy) => self.faults.legacy_recovery,
        };
        if injected {
            return Err(PlatformError::failed("start", "injected start failure"));
        }

        self.state = MachineState::Running;
        debug!(boot_mode = ?options.boot_mode, "simulated machine running");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PlatformError> {
        if self.state == MachineState::Stopped {
            return Err(PlatformError::failed("stop", "machine is already stopped"));
        }
        self.record(Operation::Stop);
        tokio::task::yield_now().await;
        self.state = MachineState::Stopped;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), PlatformError> {
        self.require("pause", MachineState::Running)?;
        self.record(Operation::Pause);
        tokio::task::yield_now().await;
        self.state = MachineState::Paused;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), PlatformError> {
        self.require("resume", MachineState::Paused)?;
        self.record(Operation::Resume);
        tokio::task::yield_now().await;
        self.state = MachineState::Running;
        Ok(())
    }

    async fn save_state(&mut self, path: &Path) -> Result<(), PlatformError> {
        self.require("save", MachineState::Paused)?;
        self.record(Operation::Save);
        if self.faults.save {
            return Err(PlatformError::failed("save", "injected save failure"));
        }
        let mut snapshot = SNAPSHOT_MAGIC.to_vec();
        snapshot.extend_from_slice(self.config.platform.identity.machine_identifier.data());
        tokio::fs::write(path, snapshot).await?;
        Ok(())
    }

    async fn restore_state(&mut self, path: &Path) -> Result<(), PlatformError> {
        self.require("restore", MachineState::Stopped)?;
        self.record(Operation::Restore);
        let snapshot = tokio::fs::read(path).await?;
        if self.faults.restore {
            return Err(PlatformError::failed("restore", "injected restore failure"));
        }

        let identifier = snapshot.strip_prefix(SNAPSHOT_MAGIC).ok_or_else(|| {
            PlatformError::failed("restore", "snapshot is not a saved machine state")
        })?;
        if identifier != self.config.platform.identity.machine_identifier.data() {
            return Err(PlatformError::failed(
                "restore",
                "snapshot belongs to a different machine",
            ));
        }

        self.state = MachineState::Paused;
        Ok(())
    }

    async fn install(
        &mut self,
        restore_image: &Path,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), PlatformError> {
        self.require("install", MachineState::Stopped)?;
        self.record(Operation::Install);
        if !restore_image.is_file() {
            return Err(PlatformError::failed(
                "install",
                format!("restore image {} vanished", restore_image.display()),
            ));
        }

        let last_step: u32 = if self.faults.partial_progress { 9 } else { 10 };
        for step in 0..=last_step {
            if self.faults.install && step == 5 {
                return Err(PlatformError::failed("install", "injected install failure"));
            }
            progress(f64::from(step) / 10.0);
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

//! One-shot installation of a new bundle from a restore image.
//!
//! Steps run strictly in order, tracked by the installer state machine:
//! create the bundle, create the disk, load the restore image, build the
//! configuration (persisting fresh identity artifacts), install. Every
//! failure is fatal and leaves the bundle for the operator to discard.

use std::path::Path;

use statig::prelude::*;
use tracing::info;

use crate::error::{ConfigError, InstallError};
use crate::settings::VmSettings;
use crate::state_machine::install_sm::{InstallEvent, InstallMachine, State};
use crate::vm::bundle::VmBundle;
use crate::vm::configuration::{self, VmConfiguration};
use crate::vm::filesystem::{self, DiskFormat};
use crate::vm::identity::VmIdentity;
use crate::vm::platform::{Hypervisor, RestoreImage, VirtualMachine};

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Copy the restore image into the bundle as `RestoreImage.ipsw`.
    pub cache_restore_image: bool,
}

pub struct Installer<H: Hypervisor> {
    hypervisor: H,
    settings: VmSettings,
    bundle: VmBundle,
    options: InstallOptions,
    machine: StateMachine<InstallMachine>,
    restore_image: Option<RestoreImage>,
    configuration: Option<VmConfiguration>,
}

impl<H: Hypervisor> Installer<H> {
    pub fn new(hypervisor: H, settings: VmSettings, bundle: VmBundle) -> Self {
        Self {
            hypervisor,
            settings,
            bundle,
            options: InstallOptions::default(),
            machine: InstallMachine::default().state_machine(),
            restore_image: None,
            configuration: None,
        }
    }

    pub fn with_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> &State {
        self.machine.state()
    }

    pub fn bundle(&self) -> &VmBundle {
        &self.bundle
    }

    fn expect_state(&self, step: &'static str, expected: State) -> Result<(), InstallError> {
        if self.machine.state() == &expected {
            Ok(())
        } else {
            Err(InstallError::OutOfOrder {
                step,
                state: format!("{:?}", self.machine.state()),
            })
        }
    }

    /// Create the bundle directory. Fails if it already exists.
    pub fn set_up_artifacts(&mut self) -> Result<(), InstallError> {
        self.expect_state("set up artifacts", State::Idle {})?;
        filesystem::create_bundle_dir(self.bundle.root())?;
        info!(bundle = %self.bundle.root().display(), "bundle created");
        self.machine.handle(&InstallEvent::BundleCreated);
        Ok(())
    }

    /// Create `Disk.img` at the configured size.
    pub fn create_disk_image(&mut self) -> Result<DiskFormat, InstallError> {
        self.expect_state("create disk image", State::BundleCreated {})?;
        let format = filesystem::create_disk_image(
            &self.hypervisor,
            &self.bundle.disk_image(),
            self.settings.disk_size,
        )?;
        self.machine.handle(&InstallEvent::DiskCreated);
        Ok(format)
    }

    /// Load the restore image and pick the most capable supported configuration.
    pub async fn load_restore_image(&mut self, image: &Path) -> Result<(), InstallError> {
        self.expect_state("load restore image", State::DiskCreated {})?;

        if self.options.cache_restore_image {
            let cached = self.bundle.restore_image();
            tokio::fs::copy(image, &cached)
                .await
                .map_err(|source| InstallError::CacheRestoreImage {
                    path: cached.clone(),
                    source,
                })?;
            info!(path = %cached.display(), "restore image cached");
        }

        let restore_image = self
            .hypervisor
            .load_restore_image(image)
            .await
            .map_err(|source| InstallError::RestoreImage {
                path: image.to_path_buf(),
                source,
            })?;
        info!(build = %restore_image.build_version, "restore image loaded");

        self.restore_image = Some(restore_image);
        self.machine.handle(&InstallEvent::RestoreImageLoaded);
        Ok(())
    }

    /// Generate and persist identity, then assemble and validate the configuration.
    pub fn build_configuration(&mut self) -> Result<(), InstallError> {
        self.expect_state("build configuration", State::RestoreImageLoaded {})?;
        let requirements = self
            .restore_image
            .as_ref()
            .and_then(|image| image.most_featureful_supported_configuration.clone())
            .ok_or(InstallError::NoSupportedConfiguration)?;

        if !self
            .hypervisor
            .is_hardware_model_supported(&requirements.hardware_model)
        {
            return Err(InstallError::UnsupportedHardwareModel);
        }

        let identity = VmIdentity {
            hardware_model: requirements.hardware_model.clone(),
            machine_identifier: self.hypervisor.new_machine_identifier(),
        };
        identity.persist(&self.bundle)?;
        self.hypervisor
            .create_auxiliary_storage(&self.bundle.auxiliary_storage(), &identity.hardware_model)
            .map_err(InstallError::Install)?;

        let config = configuration::assemble(
            &self.settings,
            self.hypervisor.capabilities(),
            &self.bundle,
            identity,
        )?;

        if config.cpu_count < requirements.minimum_cpu_count {
            return Err(InstallError::InsufficientResources {
                resource: "CPU count",
                actual: u64::from(config.cpu_count),
                minimum: u64::from(requirements.minimum_cpu_count),
            });
        }
        if config.memory_size < requirements.minimum_memory_size {
            return Err(InstallError::InsufficientResources {
                resource: "memory size",
                actual: config.memory_size,
                minimum: requirements.minimum_memory_size,
            });
        }

        self.hypervisor
            .validate(&config)
            .map_err(|e| InstallError::Config(ConfigError::Invalid(e)))?;

        self.configuration = Some(config);
        self.machine.handle(&InstallEvent::ConfigurationBuilt);
        Ok(())
    }

    /// Run the platform installer, reporting monotonically increasing progress.
    pub async fn install<F>(&mut self, mut progress: F) -> Result<(), InstallError>
    where
        F: FnMut(f64),
    {
        self.expect_state("install", State::ConfigurationBuilt {})?;
        let (config, image) = match (self.configuration.take(), self.restore_image.as_ref()) {
            (Some(config), Some(image)) => (config, image.path.clone()),
            _ => {
                return Err(InstallError::OutOfOrder {
                    step: "install",
                    state: format!("{:?}", self.machine.state()),
                });
            }
        };

        let mut vm = self
            .hypervisor
            .create_machine(config)
            .map_err(|e| InstallError::Config(ConfigError::Construction(e)))?;
        self.machine.handle(&InstallEvent::InstallStarted);

        let mut high_water = 0.0_f64;
        let mut last_percent = None;
        let mut report = |fraction: f64| {
            let fraction = fraction.clamp(0.0, 1.0);
            if fraction < high_water {
                return;
            }
            high_water = fraction;
            let percent = (fraction * 100.0).floor() as u32;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                info!(target: "install", percent, "installation progress");
            }
            progress(fraction);
        };

        vm.install(&image, &mut report)
            .await
            .map_err(InstallError::Install)?;
        report(1.0);

        self.machine.handle(&InstallEvent::InstallFinished);
        info!(bundle = %self.bundle.root().display(), "installation succeeded");
        Ok(())
    }

    /// All steps in order.
    pub async fn run<F>(&mut self, image: &Path, progress: F) -> Result<(), InstallError>
    where
        F: FnMut(f64),
    {
        self.set_up_artifacts()?;
        self.create_disk_image()?;
        self.load_restore_image(image).await?;
        self.build_configuration()?;
        self.install(progress).await
    }
}

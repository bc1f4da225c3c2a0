//! Run-mode lifecycle of an installed bundle.
//!
//! ```text
//! Unconfigured ─configure()─► Stopped
//! Stopped ─start()─► Starting ─► Running
//! Stopped ─restore_or_start()─► Restoring ─► Running   (or cold start)
//! Running ─pause_and_save()─► Pausing ─► Paused ─► Saving ─► Stopped
//! Running ─restart()─► Stopping ─► Stopped ─► Starting ─► Running
//! ```
//!
//! Transient states (`Starting`, `Pausing`, `Saving`, ...) only exist while
//! an operation is in flight. Finding one on entry means an earlier
//! operation was abandoned mid-way, and the new request is rejected as busy.
//!
//! Nothing here locks the bundle; two processes on the same bundle path
//! corrupt each other's save state.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, PlatformError};
use crate::settings::VmSettings;
use crate::vm::bundle::VmBundle;
use crate::vm::configuration;
use crate::vm::identity;
use crate::vm::platform::{
    Hypervisor, MachineState, RecoveryMethod, StartOptions, VirtualMachine,
};

/// Pause between stopping and starting again on restart.
pub const RESTART_SETTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle state of the single VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Unconfigured,
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Saving,
    Restoring,
    Stopping,
}

impl VmState {
    /// `true` while an operation is in flight.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Pausing | Self::Saving | Self::Restoring | Self::Stopping
        )
    }
}

/// How `restore_or_start` brought the machine up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    Restored,
    ColdStart,
    /// A snapshot existed but could not be restored.
    ColdStartAfterFailedRestore,
}

/// What `terminate` did before the process may exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Saved,
    Immediate,
}

pub struct LifecycleManager<H: Hypervisor> {
    hypervisor: H,
    settings: VmSettings,
    bundle: VmBundle,
    machine: Option<H::Machine>,
    state: VmState,
    settle_interval: Duration,
}

impl<H: Hypervisor> LifecycleManager<H> {
    pub fn new(hypervisor: H, settings: VmSettings, bundle: VmBundle) -> Self {
        Self {
            hypervisor,
            settings,
            bundle,
            machine: None,
            state: VmState::Unconfigured,
            settle_interval: RESTART_SETTLE_INTERVAL,
        }
    }

    pub fn with_settle_interval(mut self, interval: Duration) -> Self {
        self.settle_interval = interval;
        self
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn bundle(&self) -> &VmBundle {
        &self.bundle
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn machine(&self) -> Option<&H::Machine> {
        self.machine.as_ref()
    }

    pub fn machine_mut(&mut self) -> Option<&mut H::Machine> {
        self.machine.as_mut()
    }

    fn save_restore_supported(&self) -> bool {
        self.hypervisor.capabilities().save_restore
    }

    /// Reject `operation` while another is in flight or from the wrong state.
    fn guard(&self, operation: &'static str, allowed: &[VmState]) -> Result<(), LifecycleError> {
        if self.state.is_transient() {
            return Err(LifecycleError::Busy {
                operation,
                state: self.state,
            });
        }
        if !allowed.contains(&self.state) {
            return Err(LifecycleError::InvalidState {
                operation,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: VmState) {
        debug!(from = ?self.state, to = ?next, "lifecycle transition");
        self.state = next;
    }

    fn machine_or_err(&mut self, operation: &'static str) -> Result<&mut H::Machine, LifecycleError> {
        let state = self.state;
        self.machine.as_mut().ok_or(LifecycleError::InvalidState {
            operation,
            actual: state,
        })
    }

    /// Load identity, assemble and validate the configuration, build the machine.
    ///
    /// Every failure here is fatal for run mode; no machine is constructed.
    pub fn configure(&mut self) -> Result<(), LifecycleError> {
        self.guard("configure", &[VmState::Unconfigured])?;

        let identity = identity::load_identity(&self.hypervisor, &self.bundle)?;
        let config =
            configuration::build_validated(&self.hypervisor, &self.settings, &self.bundle, identity)?;
        let machine = self
            .hypervisor
            .create_machine(config)
            .map_err(crate::error::ConfigError::Construction)?;

        self.machine = Some(machine);
        self.transition(VmState::Stopped);
        info!(bundle = %self.bundle.root().display(), "virtual machine configured");
        Ok(())
    }

    /// Cold start. A failure leaves the manager `Stopped`; callers treat it as fatal.
    ///
    /// Any `SaveFile` still in the bundle is deleted first.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        self.start_with(StartOptions::default()).await
    }

    async fn start_with(&mut self, options: StartOptions) -> Result<(), LifecycleError> {
        self.guard("start", &[VmState::Stopped])?;
        self.machine_or_err("start")?;
        self.discard_stale_snapshot();
        self.transition(VmState::Starting);

        let result = self.machine_or_err("start")?.start(options).await;
        match result {
            Ok(()) => {
                self.transition(VmState::Running);
                info!(boot_mode = ?options.boot_mode, "virtual machine started");
                Ok(())
            }
            Err(e) => {
                self.transition(VmState::Stopped);
                error!(error = %e, "virtual machine failed to start");
                Err(LifecycleError::Start(e))
            }
        }
    }

    /// A cold boot moves the disk past any saved state, so the snapshot must go.
    fn discard_stale_snapshot(&self) {
        let save_file = self.bundle.save_file();
        if !save_file.is_file() {
            return;
        }
        warn!(path = %save_file.display(), "discarding snapshot before a cold boot");
        if let Err(e) = std::fs::remove_file(&save_file) {
            warn!(path = %save_file.display(), error = %e, "failed to delete snapshot");
        }
    }

    /// Pause, then snapshot into `SaveFile`, replacing any previous one atomically.
    pub async fn pause_and_save(&mut self) -> Result<(), LifecycleError> {
        self.guard("pause and save", &[VmState::Running])?;
        if !self.save_restore_supported() {
            return Err(LifecycleError::SaveRestoreUnsupported);
        }
        self.machine_or_err("pause")?;

        self.transition(VmState::Pausing);
        let paused = self.machine_or_err("pause")?.pause().await;
        if let Err(source) = paused {
            self.transition(VmState::Running);
            return Err(LifecycleError::Platform {
                operation: "pause",
                source,
            });
        }
        self.transition(VmState::Paused);

        self.transition(VmState::Saving);
        let staging = self.bundle.save_file_staging();
        let saved = self.machine_or_err("save")?.save_state(&staging).await;
        let committed = saved.and_then(|()| {
            std::fs::rename(&staging, self.bundle.save_file()).map_err(PlatformError::from)
        });
        if let Err(e) = committed {
            let _ = std::fs::remove_file(&staging);
            error!(error = %e, "failed to save virtual machine state");
            self.resume_after_failed_save().await;
            return Err(LifecycleError::Save(e));
        }
        info!(path = %self.bundle.save_file().display(), "virtual machine state saved");

        if let Some(machine) = self.machine.as_mut() {
            if let Err(e) = machine.stop().await {
                warn!(error = %e, "stopping the saved machine failed");
            }
        }
        self.transition(VmState::Stopped);
        Ok(())
    }

    async fn resume_after_failed_save(&mut self) {
        let resumed = match self.machine.as_mut() {
            Some(machine) => machine.resume().await,
            None => Err(PlatformError::failed("resume", "no machine configured")),
        };
        match resumed {
            Ok(()) => self.transition(VmState::Running),
            Err(e) => {
                warn!(error = %e, "machine left paused after failed save");
                self.transition(VmState::Paused);
            }
        }
    }

    /// Restore from `SaveFile` when present, otherwise cold start.
    ///
    /// The snapshot is deleted after any restore attempt, successful or not,
    /// and a failed restore falls back to a cold start. On hosts without
    /// save/restore the snapshot is discarded by the cold start.
    pub async fn restore_or_start(&mut self) -> Result<Launch, LifecycleError> {
        self.guard("restore or start", &[VmState::Stopped])?;

        let save_file = self.bundle.save_file();
        if !self.save_restore_supported() || !save_file.is_file() {
            self.start().await?;
            return Ok(Launch::ColdStart);
        }

        self.transition(VmState::Restoring);
        let restored = self.restore_from(&save_file).await;

        if let Err(e) = std::fs::remove_file(&save_file) {
            warn!(path = %save_file.display(), error = %e, "failed to delete consumed snapshot");
        }

        match restored {
            Ok(()) => {
                self.transition(VmState::Running);
                info!("virtual machine restored from snapshot");
                Ok(Launch::Restored)
            }
            Err(e) => {
                warn!(error = %e, "restore failed, falling back to a cold start");
                self.recover_to_stopped().await;
                self.start().await?;
                Ok(Launch::ColdStartAfterFailedRestore)
            }
        }
    }

    async fn restore_from(&mut self, save_file: &std::path::Path) -> Result<(), PlatformError> {
        let machine = match self.machine.as_mut() {
            Some(m) => m,
            None => return Err(PlatformError::failed("restore", "no machine configured")),
        };
        machine.restore_state(save_file).await?;
        machine.resume().await
    }

    /// After a failed restore the platform may leave the machine paused.
    async fn recover_to_stopped(&mut self) {
        if let Some(machine) = self.machine.as_mut() {
            if machine.state() != MachineState::Stopped {
                if let Err(e) = machine.stop().await {
                    warn!(error = %e, "failed to stop machine after restore failure");
                }
            }
        }
        self.transition(VmState::Stopped);
    }

    /// Stop and start again, optionally into recovery. No-op unless `Running`.
    ///
    /// Returns whether a restart happened.
    pub async fn restart(&mut self, recovery_mode: bool) -> Result<bool, LifecycleError> {
        if self.state != VmState::Running {
            debug!(state = ?self.state, recovery_mode, "restart ignored");
            return Ok(false);
        }
        self.machine_or_err("restart")?;

        self.transition(VmState::Stopping);
        let stopped = self.machine_or_err("stop")?.stop().await;
        if let Err(source) = stopped {
            self.transition(VmState::Running);
            return Err(LifecycleError::Platform {
                operation: "stop",
                source,
            });
        }
        self.transition(VmState::Stopped);

        tokio::time::sleep(self.settle_interval).await;

        if recovery_mode {
            self.start_recovery().await?;
        } else {
            self.start().await?;
        }
        Ok(true)
    }

    /// Best-effort recovery boot: structured start options, then the legacy
    /// path, then a normal boot.
    pub async fn start_recovery(&mut self) -> Result<(), LifecycleError> {
        let caps = self.hypervisor.capabilities();
        let mut methods = Vec::new();
        if caps.recovery_start_options {
            methods.push(RecoveryMethod::StartOptions);
        }
        if caps.legacy_recovery_boot {
            methods.push(RecoveryMethod::Legacy);
        }

        for method in methods {
            match self.start_with(StartOptions::recovery(method)).await {
                Ok(()) => return Ok(()),
                Err(LifecycleError::Start(e)) => {
                    warn!(method = ?method, error = %e, "recovery boot failed");
                }
                Err(other) => return Err(other),
            }
        }

        warn!("recovery boot unavailable, starting normally");
        self.start().await
    }

    /// Poll the platform for a guest-initiated shutdown.
    pub async fn poll_guest(&mut self) -> VmState {
        if self.state != VmState::Running {
            return self.state;
        }
        if let Some(machine) = self.machine.as_mut() {
            if machine.refresh_state().await == MachineState::Stopped {
                info!("guest stopped");
                self.transition(VmState::Stopped);
            }
        }
        self.state
    }

    /// Prepare for process exit, saving a resumable snapshot when possible.
    pub async fn terminate(&mut self) -> Termination {
        if self.state == VmState::Running && self.save_restore_supported() {
            match self.pause_and_save().await {
                Ok(()) => return Termination::Saved,
                Err(e) => error!(error = %e, "could not save before exit"),
            }
        }
        Termination::Immediate
    }
}

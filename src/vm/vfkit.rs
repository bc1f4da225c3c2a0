//! Run-mode backend driving `vfkit` (a Virtualization.framework front end).
//!
//! ## Architecture
//!
//! ```text
//! VfkitHypervisor::detect()
//!     └─► create_machine(VmConfiguration)  →  VfkitMachine (command line only)
//!             ├─► start()   tokio::process::Command  →  vfkit child
//!             ├─► pause() / resume() / stop()   PUT /vm/state
//!             └─► refresh_state()               GET /vm/state + try_wait
//! ```
//!
//! vfkit cannot install guests, save or restore machine state, or boot into
//! recovery; those capabilities are reported as absent and the lifecycle
//! degrades accordingly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::error::PlatformError;
use crate::vm::configuration::VmConfiguration;
use crate::vm::devices::{BootLoader, NetworkAttachment};
use crate::vm::platform::{
    BootMode, HardwareModel, HostCapabilities, Hypervisor, MachineIdentifier, MachineState,
    RestoreImage, StartOptions, VirtualMachine,
};

/// Default TCP port for the vfkit REST management API.
pub const DEFAULT_REST_PORT: u16 = 7788;

const STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct VfkitHypervisor {
    vfkit: PathBuf,
    rest_port: u16,
    caps: HostCapabilities,
}

impl VfkitHypervisor {
    /// Locate vfkit and query the host. macOS only.
    #[cfg(target_os = "macos")]
    pub fn detect(rest_port: u16) -> Result<Self, PlatformError> {
        use crate::vm::platform::HostVersion;

        let vfkit = find_vfkit()?;
        info!(path = %vfkit.display(), "Found vfkit binary");

        let version_text = command_output("sw_vers", &["-productVersion"])?;
        let version = HostVersion::parse(&version_text).ok_or_else(|| {
            PlatformError::failed("detect host", format!("unparsable version {version_text:?}"))
        })?;

        let mut caps = HostCapabilities::for_host_version(version);
        if let Some(memsize) = command_output("sysctl", &["-n", "hw.memsize"])
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            caps.max_memory_size = memsize;
        }

        // vfkit exposes none of these.
        caps.save_restore = false;
        caps.recovery_start_options = false;
        caps.legacy_recovery_boot = false;
        caps.debug_stub = false;
        caps.panic_device = false;
        caps.bridged_interfaces.clear();

        info!(version = %version, cores = caps.host_logical_cores, "host detected");
        Ok(Self {
            vfkit,
            rest_port,
            caps,
        })
    }

    /// Non-macOS stub.
    #[cfg(not(target_os = "macos"))]
    pub fn detect(_rest_port: u16) -> Result<Self, PlatformError> {
        Err(PlatformError::Unsupported(
            "vfkit requires macOS (Virtualization.framework)".to_string(),
        ))
    }
}

/// Resolve the path to the `vfkit` binary: `$PATH` first, then Homebrew.
pub fn find_vfkit() -> Result<PathBuf, PlatformError> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join("vfkit");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    for path in ["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"] {
        if Path::new(path).is_file() {
            return Ok(PathBuf::from(path));
        }
    }

    Err(PlatformError::Unsupported(
        "vfkit binary not found; install it with `brew install vfkit`".to_string(),
    ))
}

#[cfg(target_os = "macos")]
fn command_output(program: &str, args: &[&str]) -> Result<String, PlatformError> {
    let output = std::process::Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(PlatformError::failed(
            "detect host",
            format!("{program} exited with {}", output.status),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl Hypervisor for VfkitHypervisor {
    type Machine = VfkitMachine;

    fn capabilities(&self) -> &HostCapabilities {
        &self.caps
    }

    fn decode_hardware_model(&self, data: &[u8]) -> Result<HardwareModel, PlatformError> {
        if data.is_empty() {
            return Err(PlatformError::failed("decode hardware model", "empty file"));
        }
        Ok(HardwareModel::from_data(data.to_vec()))
    }

    fn decode_machine_identifier(&self, data: &[u8]) -> Result<MachineIdentifier, PlatformError> {
        if data.is_empty() {
            return Err(PlatformError::failed("decode machine identifier", "empty file"));
        }
        Ok(MachineIdentifier::from_data(data.to_vec()))
    }

    /// vfkit checks the model itself when the machine boots.
    fn is_hardware_model_supported(&self, _model: &HardwareModel) -> bool {
        true
    }

    fn new_machine_identifier(&self) -> MachineIdentifier {
        MachineIdentifier::from_data(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    fn create_auxiliary_storage(
        &self,
        _path: &Path,
        _model: &HardwareModel,
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported(
            "vfkit cannot create auxiliary storage".to_string(),
        ))
    }

    fn create_sparse_disk_image(&self, path: &Path, size: u64) -> Result<(), PlatformError> {
        crate::vm::filesystem::create_asif_disk(path, size)
            .map_err(|e| PlatformError::failed("create disk image", format!("{e:#}")))
    }

    async fn load_restore_image(&self, _path: &Path) -> Result<RestoreImage, PlatformError> {
        Err(PlatformError::Unsupported(
            "vfkit cannot install from restore images".to_string(),
        ))
    }

    fn validate(&self, config: &VmConfiguration) -> Result<(), PlatformError> {
        if let BootLoader::Custom(path) = &config.boot_loader {
            return Err(PlatformError::InvalidConfiguration(format!(
                "vfkit cannot load the custom boot loader {}",
                path.display()
            )));
        }
        if config.cpu_count == 0 || config.memory_size == 0 {
            return Err(PlatformError::InvalidConfiguration(
                "CPU count and memory size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_save_restore_support(
        &self,
        _config: &VmConfiguration,
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("save/restore".to_string()))
    }

    fn create_machine(&self, config: VmConfiguration) -> Result<VfkitMachine, PlatformError> {
        Ok(VfkitMachine {
            vfkit: self.vfkit.clone(),
            args: build_vfkit_args(&config, self.rest_port),
            rest_port: self.rest_port,
            child: None,
            state: MachineState::Stopped,
            client: reqwest::Client::new(),
        })
    }
}

/// Build the vfkit command line for `config`.
pub fn build_vfkit_args(config: &VmConfiguration, rest_port: u16) -> Vec<String> {
    let bundle_file = |p: &Path| p.display().to_string();
    let mut args = Vec::new();

    args.push("--cpus".to_string());
    args.push(config.cpu_count.to_string());
    args.push("--memory".to_string());
    args.push((config.memory_size / (1024 * 1024)).to_string());

    // Identity artifacts live next to the auxiliary storage in the bundle.
    let aux = &config.platform.auxiliary_storage;
    let bundle = aux.parent().unwrap_or(Path::new("."));
    args.push("--bootloader".to_string());
    args.push(format!(
        "macos,machineIdentifierPath={},hardwareModelPath={},auxImagePath={}",
        bundle_file(&bundle.join(crate::vm::bundle::MACHINE_IDENTIFIER)),
        bundle_file(&bundle.join(crate::vm::bundle::HARDWARE_MODEL)),
        bundle_file(aux),
    ));

    for disk in &config.storage {
        args.push("--device".to_string());
        let mut spec = format!("virtio-blk,path={}", bundle_file(&disk.image));
        if disk.read_only {
            spec.push_str(",readonly");
        }
        args.push(spec);
    }

    if let Some(network) = &config.network {
        if let NetworkAttachment::Bridged { interface } = &network.attachment {
            warn!(interface = %interface, "vfkit cannot bridge, using NAT");
        }
        args.push("--device".to_string());
        args.push("virtio-net,nat".to_string());
    }

    for display in &config.graphics.displays {
        args.push("--device".to_string());
        args.push(format!(
            "virtio-gpu,width={},height={}",
            display.width, display.height
        ));
    }
    args.push("--device".to_string());
    args.push("virtio-input,keyboard".to_string());
    args.push("--device".to_string());
    args.push("virtio-input,pointing".to_string());

    if config.optional.console.is_some() {
        args.push("--device".to_string());
        args.push("virtio-serial,stdio".to_string());
    }

    args.push("--device".to_string());
    args.push("virtio-rng".to_string());

    args.push("--restful-uri".to_string());
    args.push(format!("tcp://localhost:{rest_port}"));

    args
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

fn parse_vfkit_state(state: &str) -> MachineState {
    match state.trim_start_matches("VirtualMachineState") {
        "Running" | "Starting" | "Resuming" | "Pausing" => MachineState::Running,
        "Paused" => MachineState::Paused,
        "Stopped" | "Stopping" => MachineState::Stopped,
        _ => MachineState::Error,
    }
}

/// A vfkit-backed guest. Dropping it kills the child process.
pub struct VfkitMachine {
    vfkit: PathBuf,
    args: Vec<String>,
    rest_port: u16,
    child: Option<Child>,
    state: MachineState,
    client: reqwest::Client,
}

impl VfkitMachine {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn state_url(&self) -> String {
        format!("http://localhost:{}/vm/state", self.rest_port)
    }

    async fn put_state(&self, operation: &'static str, target: &str) -> Result<(), PlatformError> {
        let resp = self
            .client
            .put(self.state_url())
            .json(&serde_json::json!({ "state": target }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| PlatformError::failed(operation, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(PlatformError::failed(
                operation,
                format!("HTTP {}", resp.status().as_u16()),
            ));
        }
        info!(port = self.rest_port, state = target, "VM state request sent");
        Ok(())
    }

    async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill().await;
        }
    }
}

impl VirtualMachine for VfkitMachine {
    fn state(&self) -> MachineState {
        self.state
    }

    async fn refresh_state(&mut self) -> MachineState {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(exit_status)) => {
                    info!(exit_status = ?exit_status, "VM process exited");
                    self.child = None;
                    self.state = MachineState::Stopped;
                    return self.state;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "try_wait error"),
            }
        } else {
            self.state = MachineState::Stopped;
            return self.state;
        }

        let polled = match self.client.get(self.state_url()).send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<StateResponse>().await.ok(),
            Ok(resp) => {
                warn!(http_status = resp.status().as_u16(), "VM state poll non-2xx");
                None
            }
            Err(e) => {
                // The REST endpoint may not be up yet while the guest boots.
                debug!(error = %e, "VM state poll failed");
                None
            }
        };
        if let Some(body) = polled {
            self.state = parse_vfkit_state(&body.state);
        }
        self.state
    }

    async fn start(&mut self, options: StartOptions) -> Result<(), PlatformError> {
        if let BootMode::Recovery(method) = options.boot_mode {
            return Err(PlatformError::Unsupported(format!(
                "recovery boot via {method:?}"
            )));
        }
        if self.child.is_some() {
            return Err(PlatformError::failed("start", "vfkit is already running"));
        }

        let mut cmd = Command::new(&self.vfkit);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| PlatformError::failed("start", format!("spawn vfkit: {e}")))?;
        info!(port = self.rest_port, pid = ?child.id(), "VM spawned");

        self.child = Some(child);
        self.state = MachineState::Running;
        Ok(())
    }

    /// Request a stop over REST, wait for exit, kill on failure or timeout.
    async fn stop(&mut self) -> Result<(), PlatformError> {
        if self.child.is_none() {
            self.state = MachineState::Stopped;
            return Ok(());
        }

        if let Err(e) = self.put_state("stop", "Stop").await {
            warn!(port = self.rest_port, error = %e, "REST stop failed, killing child process");
            self.kill().await;
        }

        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        loop {
            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(exit_status = ?status, "VM process exited");
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "Error waiting for VM process");
                        self.child = None;
                        self.state = MachineState::Stopped;
                        return Err(e.into());
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!("VM did not exit within {} s, killing", STOP_TIMEOUT.as_secs());
                self.kill().await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        self.child = None;
        self.state = MachineState::Stopped;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), PlatformError> {
        self.put_state("pause", "Pause").await?;
        self.state = MachineState::Paused;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), PlatformError> {
        self.put_state("resume", "Resume").await?;
        self.state = MachineState::Running;
        Ok(())
    }

    async fn save_state(&mut self, _path: &Path) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("save/restore".to_string()))
    }

    async fn restore_state(&mut self, _path: &Path) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("save/restore".to_string()))
    }

    async fn install(
        &mut self,
        _restore_image: &Path,
        _progress: &mut dyn FnMut(f64),
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("installation".to_string()))
    }
}

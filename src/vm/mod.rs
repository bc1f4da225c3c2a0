//! VM core: bundle layout, identity, configuration, installation and the
//! run-mode lifecycle, all generic over a [`platform::Hypervisor`] backend.

pub mod bundle;
pub mod configuration;
pub mod devices;
pub mod filesystem;
pub mod identity;
pub mod installer;
pub mod lifecycle;
pub mod platform;
pub mod resources;
pub mod simulated;
pub mod vfkit;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use bundle::VmBundle;
pub use configuration::VmConfiguration;
pub use identity::VmIdentity;
pub use installer::{InstallOptions, Installer};
pub use lifecycle::{Launch, LifecycleManager, Termination, VmState};
pub use platform::{HostCapabilities, Hypervisor, VirtualMachine};
pub use simulated::SimulatedHypervisor;
pub use vfkit::VfkitHypervisor;

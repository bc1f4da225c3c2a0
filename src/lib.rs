//! hyfervisor: installs macOS guests into VM bundles and runs them.
//!
//! The binary in `main.rs` is a thin CLI over this library. Everything that
//! talks to the host hypervisor goes through [`vm::platform::Hypervisor`].

pub mod error;
pub mod logging;
pub mod paths;
pub mod settings;
pub mod state_machine;
pub mod vm;

//! Identity artifacts: the `HardwareModel` and `MachineIdentifier` blobs that
//! bind a bundle to its installed guest.
//!
//! Written once by the installer, read on every launch. Run mode refuses to
//! continue without both.

use std::path::Path;

use tracing::{debug, info};

use crate::error::IdentityError;
use crate::vm::bundle::{HARDWARE_MODEL, MACHINE_IDENTIFIER, VmBundle};
use crate::vm::platform::{HardwareModel, Hypervisor, MachineIdentifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub hardware_model: HardwareModel,
    pub machine_identifier: MachineIdentifier,
}

impl VmIdentity {
    /// Write both artifacts into `bundle`, replacing any existing copies.
    pub fn persist(&self, bundle: &VmBundle) -> Result<(), IdentityError> {
        write_artifact(HARDWARE_MODEL, &bundle.hardware_model(), self.hardware_model.data())?;
        write_artifact(
            MACHINE_IDENTIFIER,
            &bundle.machine_identifier(),
            self.machine_identifier.data(),
        )?;
        info!(bundle = %bundle.root().display(), "identity artifacts written");
        Ok(())
    }
}

/// Read and decode both artifacts, then check the host supports the model.
pub fn load_identity<H: Hypervisor>(
    hypervisor: &H,
    bundle: &VmBundle,
) -> Result<VmIdentity, IdentityError> {
    let hw_path = bundle.hardware_model();
    let hw_data = read_artifact(HARDWARE_MODEL, &hw_path, bundle)?;
    let hardware_model =
        hypervisor
            .decode_hardware_model(&hw_data)
            .map_err(|source| IdentityError::Corrupt {
                artifact: HARDWARE_MODEL,
                path: hw_path.clone(),
                source,
            })?;

    let id_path = bundle.machine_identifier();
    let id_data = read_artifact(MACHINE_IDENTIFIER, &id_path, bundle)?;
    let machine_identifier = hypervisor
        .decode_machine_identifier(&id_data)
        .map_err(|source| IdentityError::Corrupt {
            artifact: MACHINE_IDENTIFIER,
            path: id_path,
            source,
        })?;

    if !hypervisor.is_hardware_model_supported(&hardware_model) {
        return Err(IdentityError::UnsupportedHardwareModel(hw_path));
    }

    debug!(bundle = %bundle.root().display(), "identity loaded");
    Ok(VmIdentity {
        hardware_model,
        machine_identifier,
    })
}

fn read_artifact(
    artifact: &'static str,
    path: &Path,
    bundle: &VmBundle,
) -> Result<Vec<u8>, IdentityError> {
    match std::fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(IdentityError::Missing {
            artifact,
            path: path.to_path_buf(),
            bundle: bundle.root().to_path_buf(),
        }),
        Err(e) => Err(IdentityError::Corrupt {
            artifact,
            path: path.to_path_buf(),
            source: e.into(),
        }),
    }
}

fn write_artifact(artifact: &'static str, path: &Path, data: &[u8]) -> Result<(), IdentityError> {
    std::fs::write(path, data).map_err(|source| IdentityError::Persist {
        artifact,
        path: path.to_path_buf(),
        source,
    })
}

//! Bundle directory and disk image creation.
//!
//! The disk image is either a sparse container created by the platform (on
//! hosts that support one) or a flat file of the configured size. Sparse
//! files on APFS only consume blocks once the guest writes them.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::info;

use crate::error::InstallError;
use crate::vm::platform::Hypervisor;

/// Disk image format chosen at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    /// Platform sparse container (ASIF).
    Sparse,
    /// Flat file of fixed logical length.
    Raw,
}

/// Create the bundle directory. Fails if anything already exists at `path`.
pub fn create_bundle_dir(path: &Path) -> Result<(), InstallError> {
    if path.exists() {
        return Err(InstallError::BundleExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| InstallError::BundleCreate {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::create_dir(path).map_err(|source| match source.kind() {
        std::io::ErrorKind::AlreadyExists => InstallError::BundleExists(path.to_path_buf()),
        _ => InstallError::BundleCreate {
            path: path.to_path_buf(),
            source,
        },
    })
}

/// Create the guest disk at `path`, returning the format used.
pub fn create_disk_image<H: Hypervisor>(
    hypervisor: &H,
    path: &Path,
    size: u64,
) -> Result<DiskFormat, InstallError> {
    if size == 0 {
        return Err(InstallError::DiskImage {
            path: path.to_path_buf(),
            reason: "disk size must be greater than zero".to_string(),
        });
    }

    let format = if hypervisor.capabilities().sparse_disk_images {
        hypervisor
            .create_sparse_disk_image(path, size)
            .map_err(|e| InstallError::DiskImage {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        DiskFormat::Sparse
    } else {
        create_raw_disk(path, size).map_err(|e| InstallError::DiskImage {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        })?;
        DiskFormat::Raw
    };

    info!(path = %path.display(), size, format = ?format, "disk image created");
    Ok(format)
}

/// Create a flat file of logical length `size`; fails if `path` exists.
pub fn create_raw_disk(path: &Path, size: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("create {}: {}", path.display(), e))?;
    file.set_len(size)
        .map_err(|e| anyhow::anyhow!("resize {} to {} bytes: {}", path.display(), size, e))?;
    Ok(())
}

/// Create an ASIF sparse image with `diskutil image create blank`.
#[cfg(target_os = "macos")]
pub fn create_asif_disk(path: &Path, size: u64) -> Result<()> {
    use std::process::Command;

    let size_arg = format!("{}M", size.div_ceil(1024 * 1024));

    let output = Command::new("diskutil")
        .args(["image", "create", "blank", "--fs", "none", "--format", "ASIF", "--size"])
        .arg(&size_arg)
        .arg(path)
        .output()
        .map_err(|e| anyhow::anyhow!("spawn `diskutil`: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("diskutil failed (exit {}): {}", output.status, stderr.trim());
    }

    Ok(())
}

/// Non-macOS stub.
#[cfg(not(target_os = "macos"))]
pub fn create_asif_disk(_path: &Path, _size: u64) -> Result<()> {
    bail!("ASIF disk images are only supported on macOS")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_disk_has_requested_length() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("Disk.img");
        create_raw_disk(&disk, 8 * 1024 * 1024).unwrap();
        assert_eq!(std::fs::metadata(&disk).unwrap().len(), 8 * 1024 * 1024);
    }

    #[test]
    fn raw_disk_refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = tmp.path().join("Disk.img");
        std::fs::write(&disk, b"guest data").unwrap();
        assert!(create_raw_disk(&disk, 1024).is_err());
        assert_eq!(std::fs::read(&disk).unwrap(), b"guest data");
    }

    #[test]
    fn bundle_dir_is_not_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = tmp.path().join("a").join("VM.bundle");
        create_bundle_dir(&bundle).unwrap();
        assert!(bundle.is_dir());
        assert!(matches!(
            create_bundle_dir(&bundle),
            Err(InstallError::BundleExists(_))
        ));
    }

    #[test]
    fn asif_is_unavailable_off_macos() {
        #[cfg(not(target_os = "macos"))]
        {
            let tmp = tempfile::tempdir().unwrap();
            assert!(create_asif_disk(&tmp.path().join("Disk.img"), 1024).is_err());
        }
    }
}

//! VM bundle location and artifact layout.
//!
//! ```text
//! <bundle>/
//!     AuxiliaryStorage    platform NVRAM blob
//!     Disk.img            guest primary disk
//!     HardwareModel       platform identity descriptor
//!     MachineIdentifier   unique instance descriptor
//!     RestoreImage.ipsw   optional cached installer image
//!     SaveFile            suspended-VM snapshot, only between save and restore
//! ```

use std::path::{Component, Path, PathBuf};

/// Bundle directory name used when no path is supplied.
pub const DEFAULT_BUNDLE_NAME: &str = "VM.bundle";

pub const AUXILIARY_STORAGE: &str = "AuxiliaryStorage";
pub const DISK_IMAGE: &str = "Disk.img";
pub const HARDWARE_MODEL: &str = "HardwareModel";
pub const MACHINE_IDENTIFIER: &str = "MachineIdentifier";
pub const RESTORE_IMAGE: &str = "RestoreImage.ipsw";
pub const SAVE_FILE: &str = "SaveFile";

/// Resolve a user-supplied bundle path against the process environment.
///
/// `None` selects `~/VM.bundle`. See [`resolve_with`] for the rules.
pub fn resolve(raw: Option<&str>) -> PathBuf {
    let home = home_dir();
    let cwd = std::env::current_dir().unwrap_or_else(|_| home.clone());
    resolve_with(raw, &home, &cwd)
}

/// Pure form of [`resolve`].
///
/// Expands a leading `~` (or `~user`, taken as a sibling of `home`), anchors
/// relative paths at `cwd`, drops `.` segments, folds `..` lexically and
/// strips trailing separators. The result is absolute and
/// `resolve_with(Some(resolve_with(p)), ..) == resolve_with(p, ..)`.
pub fn resolve_with(raw: Option<&str>, home: &Path, cwd: &Path) -> PathBuf {
    let raw = match raw {
        Some(r) if !r.is_empty() => r,
        _ => return standardize(&home.join(DEFAULT_BUNDLE_NAME)),
    };

    let expanded = if raw == "~" {
        home.to_path_buf()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home.join(rest)
    } else if let Some(rest) = raw.strip_prefix('~') {
        let (user, tail) = rest.split_once('/').unwrap_or((rest, ""));
        let users = home.parent().unwrap_or(Path::new("/"));
        users.join(user).join(tail)
    } else {
        PathBuf::from(raw)
    };

    let anchored = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };

    standardize(&anchored)
}

/// Lexically normalise an absolute path.
fn standardize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Return the user's home directory, falling back to `/tmp` if `$HOME` is unset.
fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// A resolved bundle root and the fixed artifact names beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmBundle {
    root: PathBuf,
}

impl VmBundle {
    /// Resolve `raw` (see [`resolve`]) and wrap the result.
    pub fn resolve(raw: Option<&str>) -> Self {
        Self { root: resolve(raw) }
    }

    /// Wrap a path that has already been resolved.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn auxiliary_storage(&self) -> PathBuf {
        self.root.join(AUXILIARY_STORAGE)
    }

    pub fn disk_image(&self) -> PathBuf {
        self.root.join(DISK_IMAGE)
    }

    pub fn hardware_model(&self) -> PathBuf {
        self.root.join(HARDWARE_MODEL)
    }

    pub fn machine_identifier(&self) -> PathBuf {
        self.root.join(MACHINE_IDENTIFIER)
    }

    pub fn restore_image(&self) -> PathBuf {
        self.root.join(RESTORE_IMAGE)
    }

    pub fn save_file(&self) -> PathBuf {
        self.root.join(SAVE_FILE)
    }

    /// Staging path a snapshot is written to before it replaces `SaveFile`.
    pub(crate) fn save_file_staging(&self) -> PathBuf {
        self.root.join(format!("{SAVE_FILE}.partial"))
    }

    pub fn has_save_file(&self) -> bool {
        self.save_file().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(raw: Option<&str>) -> PathBuf {
        resolve_with(raw, Path::new("/Users/drew"), Path::new("/work/dir"))
    }

    #[test]
    fn default_is_under_home() {
        assert_eq!(r(None), PathBuf::from("/Users/drew/VM.bundle"));
        assert_eq!(r(Some("")), PathBuf::from("/Users/drew/VM.bundle"));
    }

    #[test]
    fn expands_tilde() {
        assert_eq!(r(Some("~")), PathBuf::from("/Users/drew"));
        assert_eq!(r(Some("~/vms/a.bundle")), PathBuf::from("/Users/drew/vms/a.bundle"));
        assert_eq!(r(Some("~alice/b")), PathBuf::from("/Users/alice/b"));
    }

    #[test]
    fn standardizes_segments() {
        assert_eq!(r(Some("/tmp//T1/")), PathBuf::from("/tmp/T1"));
        assert_eq!(r(Some("/tmp/./a/../T1")), PathBuf::from("/tmp/T1"));
        assert_eq!(r(Some("/../..")), PathBuf::from("/"));
    }

    #[test]
    fn relative_paths_become_absolute() {
        assert_eq!(r(Some("VM.bundle")), PathBuf::from("/work/dir/VM.bundle"));
        assert_eq!(r(Some("../x")), PathBuf::from("/work/x"));
    }

    #[test]
    fn keeps_surrounding_whitespace() {
        assert_eq!(r(Some(" VM.bundle ")), PathBuf::from("/work/dir/ VM.bundle "));
        assert_eq!(r(Some("/tmp/T1 ")), PathBuf::from("/tmp/T1 "));
    }

    #[test]
    fn resolve_is_idempotent() {
        let inputs = [
            None,
            Some("~"),
            Some("~/a/../b/"),
            Some("rel/./path//"),
            Some("/abs/path/.."),
            Some("~bob"),
            Some("/"),
        ];
        for input in inputs {
            let once = r(input);
            let twice = r(Some(once.to_str().unwrap()));
            assert_eq!(once, twice, "input {input:?}");
            assert!(once.is_absolute());
            assert!(!once.to_string_lossy().contains('~'));
            let s = once.to_string_lossy();
            assert!(s == "/" || !s.ends_with('/'));
        }
    }

    #[test]
    fn artifact_paths_hang_off_root() {
        let bundle = VmBundle::at("/tmp/T1");
        assert_eq!(bundle.auxiliary_storage(), PathBuf::from("/tmp/T1/AuxiliaryStorage"));
        assert_eq!(bundle.disk_image(), PathBuf::from("/tmp/T1/Disk.img"));
        assert_eq!(bundle.hardware_model(), PathBuf::from("/tmp/T1/HardwareModel"));
        assert_eq!(bundle.machine_identifier(), PathBuf::from("/tmp/T1/MachineIdentifier"));
        assert_eq!(bundle.restore_image(), PathBuf::from("/tmp/T1/RestoreImage.ipsw"));
        assert_eq!(bundle.save_file(), PathBuf::from("/tmp/T1/SaveFile"));
    }
}

//! Emulator binary discovery.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Environment variable naming the emulator binary to use.
pub const QEMU_BIN_ENV: &str = "VMHARNESS_QEMU_BIN";

/// Locate an emulator binary for `arch` (host architecture when `None`).
///
/// Search order:
/// 1. `$VMHARNESS_QEMU_BIN`
/// 2. `<arch>-softmmu/qemu-system-<arch>` relative to the current directory
///    (an in-tree build)
/// 3. `qemu-system-<arch>` on `PATH`
pub fn find_emulator_binary(arch: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(QEMU_BIN_ENV) {
        let path = PathBuf::from(path);
        if is_executable(&path) {
            return Some(path);
        }
        tracing::warn!(path = %path.display(), "{} is not an executable file", QEMU_BIN_ENV);
    }

    let arch = arch.unwrap_or(std::env::consts::ARCH);
    let binary_name = format!("qemu-system-{}", arch);

    let in_tree = Path::new(&format!("{}-softmmu", arch)).join(&binary_name);
    if is_executable(&in_tree) {
        return Some(in_tree);
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(&binary_name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("qemu-system-test");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        assert!(!is_executable(&script));

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&script));
        assert!(!is_executable(dir.path()));
        assert!(!is_executable(&dir.path().join("missing")));
    }

    #[test]
    fn test_unknown_arch_not_found() {
        if std::env::var_os(QEMU_BIN_ENV).is_none() {
            assert!(find_emulator_binary(Some("no-such-arch-xyz")).is_none());
        }
    }
}

use std::{
    env,
    path::{Path, PathBuf},
};

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::constants::process::{SANDBOX_EXECUTABLE, SANDBOX_PATH_ENV};

/// Build output directories searched below each candidate root.
const BUILD_DIRS: [&str; 4] = ["", "target/debug", "target/release", "target/maxperf"];

static RESOLVED: OnceCell<PathBuf> = OnceCell::new();

/// Locates the sandbox executable.
///
/// The search order is:
/// 1. the `PVM_SANDBOX_PATH` environment variable,
/// 2. the directories in `PATH`,
/// 3. conventional build output directories below the working directory, the running binary's
///    directory and the source tree, and their ancestors,
/// 4. the bare executable name, left for the OS to search when it is executed.
///
/// The result is computed once per process.
pub fn sandbox_executable() -> &'static Path {
    RESOLVED.get_or_init(|| {
        let path = resolve(
            env::var_os(SANDBOX_PATH_ENV).map(PathBuf::from),
            env::var_os("PATH"),
            &candidate_roots(),
        );
        debug!(target: "pvm::process", path = %path.display(), "resolved sandbox executable");
        path
    })
}

/// Directories whose build outputs may contain the sandbox executable.
fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.extend(cwd.ancestors().take(4).map(Path::to_path_buf));
    }
    if let Ok(exe) = env::current_exe() {
        // test binaries live in target/<profile>/deps
        roots.extend(exe.ancestors().skip(1).take(4).map(Path::to_path_buf));
    }
    roots.extend(Path::new(env!("CARGO_MANIFEST_DIR")).ancestors().take(3).map(Path::to_path_buf));
    roots
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata().is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

/// Resolves the executable from the given override, `PATH` value and search roots.
pub fn resolve(
    override_path: Option<PathBuf>,
    search_path: Option<std::ffi::OsString>,
    roots: &[PathBuf],
) -> PathBuf {
    if let Some(path) = override_path.filter(|path| !path.as_os_str().is_empty()) {
        return path;
    }

    let from_path = search_path
        .iter()
        .flat_map(|paths| env::split_paths(paths))
        .map(|dir| dir.join(SANDBOX_EXECUTABLE))
        .find(|candidate| is_executable(candidate));
    if let Some(path) = from_path {
        return path;
    }

    roots
        .iter()
        .flat_map(|root| BUILD_DIRS.iter().map(move |dir| root.join(dir).join(SANDBOX_EXECUTABLE)))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(SANDBOX_EXECUTABLE))
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use tempfile::TempDir;

    use super::*;

    fn install(dir: &Path) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(SANDBOX_EXECUTABLE);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_override_wins() {
        let path = resolve(Some(PathBuf::from("/opt/sandbox")), None, &[]);
        assert_eq!(path, PathBuf::from("/opt/sandbox"));
    }

    #[test]
    fn test_path_lookup_before_build_dirs() {
        let bin = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let in_path = install(bin.path());
        install(&root.path().join("target/debug"));

        let resolved = resolve(None, Some(bin.path().into()), &[root.path().to_path_buf()]);
        assert_eq!(resolved, in_path);
    }

    #[test]
    fn test_build_dirs_below_roots() {
        let root = TempDir::new().unwrap();
        let expected = install(&root.path().join("target/release"));

        let resolved = resolve(None, None, &[root.path().to_path_buf()]);
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_non_executable_files_are_skipped() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join(SANDBOX_EXECUTABLE), "").unwrap();

        let resolved = resolve(Some(PathBuf::new()), None, &[root.path().to_path_buf()]);
        assert_eq!(resolved, PathBuf::from(SANDBOX_EXECUTABLE));
    }
}

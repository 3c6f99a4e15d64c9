//! Native library search paths of the running host.
//!
//! Modules are linked with the directories of every shared library the host
//! has mapped, so a module can link against anything the host itself loaded.

use std::path::{Path, PathBuf};
use tracing::debug;

/// Directories of every shared library mapped into this process.
///
/// Reads `/proc/self/maps` where available. Mappings without a backing file
/// are skipped. When nothing can be determined the directory of the host
/// executable is used.
pub fn host_library_dirs() -> Vec<PathBuf> {
    let mut dirs = std::fs::read_to_string("/proc/self/maps")
        .map(|maps| library_dirs_from_maps(&maps))
        .unwrap_or_default();

    if dirs.is_empty() {
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            dirs.push(exe_dir);
        }
    }

    debug!("Host library directories: {:?}", dirs);
    dirs
}

/// Parses the text of a `/proc/<pid>/maps` file.
pub(crate) fn library_dirs_from_maps(maps: &str) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for line in maps.lines() {
        // address perms offset dev inode [path]
        let Some(path) = line.split_whitespace().nth(5) else {
            continue;
        };
        if !path.starts_with('/') {
            continue;
        }
        let path = Path::new(path);
        let is_library = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(".so") || name.contains(".so."));
        if !is_library {
            continue;
        }
        if let Some(dir) = path.parent() {
            if !dirs.iter().any(|known| known == dir) {
                dirs.push(dir.to_path_buf());
            }
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_parsing_skips_anonymous_and_non_library_mappings() {
        let maps = "\
55d0c0a00000-55d0c0a20000 r--p 00000000 08:01 1234 /usr/local/bin/horizon
7f1c2e000000-7f1c2e021000 rw-p 00000000 00:00 0
7f1c2e200000-7f1c2e228000 r--p 00000000 08:01 5678 /usr/lib/x86_64-linux-gnu/libc.so.6
7f1c2e400000-7f1c2e410000 r-xp 00000000 08:01 9012 /usr/lib/x86_64-linux-gnu/libgcc_s.so.1
7f1c2e500000-7f1c2e510000 r-xp 00000000 08:01 3456 /opt/horizon/lib/libsteam_api.so
7ffd4b5e0000-7ffd4b601000 rw-p 00000000 00:00 0                          [stack]
";
        assert_eq!(
            library_dirs_from_maps(maps),
            vec![
                PathBuf::from("/usr/lib/x86_64-linux-gnu"),
                PathBuf::from("/opt/horizon/lib"),
            ]
        );
    }

    #[test]
    fn test_host_library_dirs_is_never_empty() {
        assert!(!host_library_dirs().is_empty());
    }
}

use std::path::{Path, PathBuf};

/// Bytes of usable space on the file system holding `dir`.
#[cfg(unix)]
pub fn usable_fs_space(dir: &Path) -> u64 {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(path) = CString::new(dir.as_os_str().as_bytes()) else {
        return 0;
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: path is a valid NUL-terminated string and stat is a zeroed
    // out-param of the correct type.
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return 0;
    }
    (stat.f_bavail as u64).saturating_mul(stat.f_bsize as u64)
}

#[cfg(not(unix))]
pub fn usable_fs_space(_dir: &Path) -> u64 {
    u64::MAX
}

/// Path of the mapped log for an IPC publication. Opaque to readers, the
/// path travels in the available-image notification.
pub fn publication_log_path(
    dir: &Path,
    session_id: i32,
    stream_id: i32,
    registration_id: i64,
) -> PathBuf {
    dir.join("publications")
        .join(format!("ipc-{session_id}-{stream_id}-{registration_id}.logbuffer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_shape() {
        let path = publication_log_path(Path::new("/var/run/bus"), 7, 1001, 42);
        assert_eq!(
            path,
            Path::new("/var/run/bus/publications/ipc-7-1001-42.logbuffer")
        );
    }

    #[cfg(unix)]
    #[test]
    fn fs_space_reports_something() {
        assert!(usable_fs_space(Path::new("/")) > 0);
    }
}

/// Zero-filled backing store for the loop device
use crate::config::types::{Result, StressError};
use crate::kernel::control::DeviceControl;
use log::{debug, info, warn};
use std::fs::{self, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Create a zero-filled regular file of `size_bytes` at `path`.
///
/// Free space in the parent directory is checked first. Blocks are reserved
/// with `posix_fallocate`; filesystems without it get a sparse file, which
/// still reads back as zeros. A partially created file is removed on failure.
pub fn allocate_backing_store(
    control: &dyn DeviceControl,
    path: &Path,
    size_bytes: u64,
) -> Result<()> {
    if size_bytes == 0 {
        return Err(StressError::Allocation("backing store size is zero".to_string()));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| {
        StressError::Allocation(format!("cannot create {}: {}", dir.display(), e))
    })?;

    let available = control.available_bytes(dir).map_err(|e| {
        StressError::Allocation(format!("cannot query free space in {}: {}", dir.display(), e))
    })?;
    if available < size_bytes {
        return Err(StressError::Allocation(format!(
            "insufficient free space in {}: need {} bytes, {} available",
            dir.display(),
            size_bytes,
            available
        )));
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| {
            StressError::Allocation(format!("cannot create {}: {}", path.display(), e))
        })?;

    let len = libc::off_t::try_from(size_bytes).map_err(|_| {
        StressError::Allocation(format!("size {} exceeds off_t", size_bytes))
    })?;

    // SAFETY: fd is owned by `file` and open for writing.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len) };
    let outcome = match rc {
        0 => Ok(()),
        libc::EOPNOTSUPP | libc::EINVAL => {
            debug!("posix_fallocate unsupported on {}, using sparse file", dir.display());
            file.set_len(size_bytes).map_err(|e| {
                StressError::Allocation(format!("cannot size {}: {}", path.display(), e))
            })
        }
        libc::ENOSPC => Err(StressError::Allocation(format!(
            "out of space while reserving {} bytes for {}",
            size_bytes,
            path.display()
        ))),
        errno => Err(StressError::Allocation(format!(
            "posix_fallocate {}: {}",
            path.display(),
            std::io::Error::from_raw_os_error(errno)
        ))),
    };

    drop(file);
    if let Err(e) = outcome {
        if let Err(rm) = fs::remove_file(path) {
            warn!("Failed to remove partial backing store {}: {}", path.display(), rm);
        }
        return Err(e);
    }

    info!("Allocated {} byte backing store at {}", size_bytes, path.display());
    Ok(())
}

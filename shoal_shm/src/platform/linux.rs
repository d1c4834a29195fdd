//! Linux-specific shared memory mapping and process liveness checks.

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;

/// Create (or truncate-and-map) the backing file for a segment at `path`
/// and map it read-write.
pub fn create_segment_mmap(path: &str, size: usize) -> Result<MmapMut, ShmError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(path)?;
    file.set_len(size as u64)?;
    let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
    Ok(mmap)
}

/// Map an existing segment's backing file read-write.
pub fn attach_segment_mmap(path: &str) -> ShmResult<MmapMut> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(mmap)
}

/// Check process liveness with `kill(pid, 0)`.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true,
        Err(_) => false,
    }
}

/// Current process id.
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/*!
Serialization of concurrent archive extractions.

Extraction itself lives outside this crate; what lives here is the
on-disk protocol every extractor must follow. A sibling `.lck` file
holds an advisory `flock(2)` lock for the lifetime of one extraction,
and a `.done` marker signals that the archive's contents are already
unpacked. The marker's mtime is refreshed every time it is consulted so
that cache reapers can expire cold entries.
*/

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::debug;

use crate::fd::Fd;

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// RAII guard for the advisory lock that serializes extraction of one
/// archive. Blocks in `acquire` until the lock is held; dropping the
/// guard releases it. The `.lck` file itself is left behind.
pub struct ExtractLock {
    fd: Fd,
}

impl ExtractLock {
    pub fn acquire(archive_tmp_path: &Path) -> io::Result<ExtractLock> {
        let lock_path = sibling(archive_tmp_path, ".lck");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&lock_path)?;
        let fd = Fd::from_file(file);
        fd.set_cloexec()?;
        loop {
            let rc = unsafe { libc::flock(fd.raw(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        Ok(ExtractLock { fd })
    }
}

impl Drop for ExtractLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.fd.raw(), libc::LOCK_UN);
        }
    }
}

/// True if extraction for this archive already completed. A hit also
/// refreshes the marker's mtime.
pub fn is_done(archive_tmp_path: &Path) -> bool {
    let done_path = sibling(archive_tmp_path, ".done");
    if !done_path.exists() {
        return false;
    }
    if let Ok(cpath) = CString::new(done_path.as_os_str().as_bytes()) {
        unsafe {
            libc::utimes(cpath.as_ptr(), std::ptr::null());
        }
    }
    true
}

/// Record that extraction for this archive completed.
pub fn mark_done(archive_tmp_path: &Path) -> io::Result<()> {
    File::create(sibling(archive_tmp_path, ".done"))?;
    Ok(())
}

/// Run `extract` at most once per archive path across cooperating
/// processes. Returns true if this caller performed the extraction and
/// false if a previous one already had.
pub fn extract_once<F>(archive_tmp_path: &Path, extract: F) -> io::Result<bool>
where
    F: FnOnce() -> io::Result<()>,
{
    let _guard = ExtractLock::acquire(archive_tmp_path)?;
    if is_done(archive_tmp_path) {
        debug!("archive already extracted: {}", archive_tmp_path.display());
        return Ok(false);
    }
    extract()?;
    mark_done(archive_tmp_path)?;
    Ok(true)
}

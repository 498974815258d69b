/*!
Thin ownership layer over raw file descriptors.

The interesting descriptors in this crate are pipes, scratch files shared
with concurrent readers, and descriptors handed in by a host that keeps
its own copy, so everything traffics in `Fd` rather than `File`.
Duplication is always explicit via `clone_fd`; dropping an `Fd` closes
the descriptor.
*/

use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};

/// An owned file descriptor, closed on drop.
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    /// Take ownership of a raw descriptor.
    pub fn from_raw(fd: RawFd) -> Fd {
        assert!(fd >= 0);
        Fd(fd)
    }

    /// Take ownership of the descriptor backing a `File`.
    pub fn from_file(file: File) -> Fd {
        Fd(file.into_raw_fd())
    }

    /// The raw descriptor, still owned by this value.
    #[inline]
    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Give up ownership without closing.
    pub fn into_raw(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }

    /// Convert into a `File` for use with std's buffered I/O.
    pub fn into_file(self) -> File {
        unsafe { File::from_raw_fd(self.into_raw()) }
    }

    /// Duplicate the descriptor. This is the only way to get a second
    /// handle on the same open file description; `Fd` is deliberately
    /// not `Clone`.
    pub fn clone_fd(&self) -> io::Result<Fd> {
        let fd = unsafe { libc::dup(self.0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Fd(fd))
    }

    /// Put the descriptor into non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        unsafe {
            let flags = libc::fcntl(self.0, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(self.0, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Set the close-on-exec bit.
    pub fn set_cloexec(&self) -> io::Result<()> {
        unsafe {
            if libc::fcntl(self.0, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// A unidirectional pipe pair from `pipe(2)`.
pub struct Pipe {
    pub read: Fd,
    pub write: Fd,
}

impl Pipe {
    pub fn new() -> io::Result<Pipe> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pipe { read: Fd(fds[0]), write: Fd(fds[1]) })
    }
}

/// `read(2)`, retrying on EINTR.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let rc = unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc as usize);
    }
}

/// `pread(2)`, retrying on EINTR.
pub fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    loop {
        let rc = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc as usize);
    }
}

/// `pwrite(2)`, retrying on EINTR.
pub fn pwrite(fd: RawFd, buf: &[u8], offset: u64) -> io::Result<usize> {
    loop {
        let rc = unsafe {
            libc::pwrite(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc as usize);
    }
}

/// Write all of `buf` at `offset`, coping with short writes.
pub fn pwrite_all(fd: RawFd, buf: &[u8], mut offset: u64) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        let n = pwrite(fd, &buf[written..], offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "pwrite returned zero",
            ));
        }
        written += n;
        offset += n as u64;
    }
    Ok(written)
}

/// `fstat(2)` for the descriptor.
pub fn fstat(fd: RawFd) -> io::Result<libc::stat> {
    unsafe {
        let mut st: libc::stat = mem::zeroed();
        if libc::fstat(fd, &mut st) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(st)
    }
}

/// Whether the descriptor supports seeking. Pipes and sockets report
/// ESPIPE from `lseek(2)`.
pub fn is_seekable(fd: RawFd) -> bool {
    unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) != -1 }
}

#[cfg(test)]
mod tests {
    use super::{fstat, is_seekable, pread, pwrite_all, Fd, Pipe};

    #[test]
    fn pipe_is_not_seekable() {
        let pipe = Pipe::new().unwrap();
        assert!(!is_seekable(pipe.read.raw()));
        assert!(!is_seekable(pipe.write.raw()));
    }

    #[test]
    fn positional_round_trip() {
        let file = tempfile::tempfile().unwrap();
        let fd = Fd::from_file(file);
        pwrite_all(fd.raw(), b"hello", 0).unwrap();
        pwrite_all(fd.raw(), b"world", 5).unwrap();

        let mut buf = [0u8; 10];
        let n = pread(fd.raw(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"helloworld");
        assert_eq!(fstat(fd.raw()).unwrap().st_size, 10);
    }

    #[test]
    fn clone_fd_shares_the_file() {
        let fd = Fd::from_file(tempfile::tempfile().unwrap());
        let dup = fd.clone_fd().unwrap();
        assert_ne!(fd.raw(), dup.raw());
        pwrite_all(dup.raw(), b"x", 0).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(pread(fd.raw(), &mut buf, 0).unwrap(), 1);
        assert_eq!(&buf, b"x");
    }
}

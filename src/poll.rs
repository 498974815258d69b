/*!
`poll(2)` helpers for the host event loop. Workers expose their read
descriptors through `register_poll`-style methods that push entries
into a plain `Vec<libc::pollfd>`; the host polls the whole set and
hands it back for dispatch.
*/

use std::io;
use std::os::unix::io::RawFd;

/// A pollfd primed for readability.
pub fn pollfd_in(fd: RawFd) -> libc::pollfd {
    libc::pollfd { fd, events: libc::POLLIN, revents: 0 }
}

/// Wait for events on the set, retrying on EINTR. A negative timeout
/// blocks indefinitely.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let rc = unsafe {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms)
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

/// True if `fd` polled readable or hung up in the set.
pub fn ready(fds: &[libc::pollfd], fd: RawFd) -> bool {
    fds.iter().any(|pfd| {
        pfd.fd == fd
            && pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
    })
}

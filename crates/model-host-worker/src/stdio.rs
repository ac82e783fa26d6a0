//! Protocol output for the worker process.
//!
//! stdout carries protocol lines only. Native libraries print to fd 1
//! unprompted, so on Unix the worker moves the real stdout to a private
//! descriptor and points fd 1 at stderr before loading anything.

use std::io::{self, Write};

use model_host_types::{encode_line, RequestId, ResponseEnvelope, ResponseMessage};

/// Pre-encoded notice written from the signal handler.
pub const SHUTDOWN_LINE: &str = "{\"type\":\"shutdown\",\"message\":\"worker interrupted\"}\n";

/// Writes one flushed protocol line per message.
pub struct ProtocolWriter<W: Write> {
    out: W,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn send(&mut self, id: Option<RequestId>, message: ResponseMessage) -> io::Result<()> {
        let line = encode_line(&ResponseEnvelope::new(id, message)).map_err(io::Error::other)?;
        self.out.write_all(line.as_bytes())?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::os::fd::FromRawFd;
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::SHUTDOWN_LINE;

    static PROTOCOL_FD: AtomicI32 = AtomicI32::new(libc::STDOUT_FILENO);

    pub fn claim_protocol_stream() -> io::Result<File> {
        // SAFETY: plain descriptor juggling on fds owned by this process.
        let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        PROTOCOL_FD.store(fd, Ordering::SeqCst);
        // SAFETY: `fd` was just returned by dup and nothing else owns it.
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    extern "C" fn on_terminate(signal: libc::c_int) {
        // Only async-signal-safe calls in here.
        let fd = PROTOCOL_FD.load(Ordering::SeqCst);
        unsafe {
            libc::write(fd, SHUTDOWN_LINE.as_ptr().cast(), SHUTDOWN_LINE.len());
            libc::_exit(128 + signal);
        }
    }

    pub fn install_signal_handlers() {
        let handler = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::signal(libc::SIGINT, handler);
            libc::signal(libc::SIGTERM, handler);
        }
    }
}

#[cfg(unix)]
pub use imp::install_signal_handlers;

/// Take exclusive ownership of the protocol stream.
#[cfg(unix)]
pub fn claim_protocol_stream() -> io::Result<Box<dyn Write + Send>> {
    Ok(Box::new(imp::claim_protocol_stream()?))
}

#[cfg(not(unix))]
pub fn claim_protocol_stream() -> io::Result<Box<dyn Write + Send>> {
    Ok(Box::new(io::stdout()))
}

#[cfg(not(unix))]
pub fn install_signal_handlers() {}

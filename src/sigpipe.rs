//! Self-pipe funnel for POSIX signals.
//!
//! Handlers do exactly one thing: write the signal number as a single byte
//! into a non-blocking pipe. The owning event loop reads bytes out and is
//! the sole interpreter, which keeps every handler async-signal-safe. The
//! reader must tolerate receiving fewer bytes than signals delivered.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;
use signal_hook::SigId;
use slog::{debug, Logger};

/// A non-blocking pipe that reifies signals into bytes.
pub struct SignalPipe {
    logger: Logger,
    read_fd: RawFd,
    write_fd: RawFd,
    registered: Vec<SigId>,
}

impl SignalPipe {
    pub fn new(logger: &Logger) -> Result<SignalPipe, nix::Error> {
        let (read_fd, write_fd) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(SignalPipe {
            logger: logger.clone(),
            read_fd,
            write_fd,
            registered: Vec::new(),
        })
    }

    /// Installs a handler for `signal` that forwards it into the pipe.
    /// Accepts realtime signal numbers (`SIGRTMIN + n`) as well as the
    /// standard ones.
    pub fn register(&mut self, signal: i32) -> Result<(), std::io::Error> {
        let fd = self.write_fd;
        let id = unsafe { signal_hook::register(signal, move || Self::raise_on(fd, signal)) }?;
        self.registered.push(id);
        debug!(&self.logger, "Funneling signal into self-pipe"; "signal" => signal);
        Ok(())
    }

    /// Writes `signal` as one byte into the pipe behind `fd`. Safe to call
    /// from a signal handler or another thread; a full pipe drops the byte,
    /// which coalesces with the deliveries already queued.
    pub fn raise_on(fd: RawFd, signal: i32) {
        let byte = [signal as u8];
        let _ = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    }

    /// Reads one pending signal, or `None` when the pipe is drained.
    pub fn try_read(&self) -> Result<Option<i32>, nix::Error> {
        let mut byte = [0u8; 1];
        loop {
            match unistd::read(self.read_fd, &mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(i32::from(byte[0]))),
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(None),
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// The fd the event loop polls for readability.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// The fd handlers and worker threads write into.
    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for id in self.registered.drain(..) {
            signal_hook::unregister(id);
        }
        let _ = unistd::close(self.write_fd);
        let _ = unistd::close(self.read_fd);
    }
}

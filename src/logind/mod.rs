//! Façade over the systemd-logind sleep-inhibition API.
//!
//! See the [logind D-Bus documentation](https://www.freedesktop.org/wiki/Software/systemd/logind/)
//! and `systemd-inhibit(1)` for the underlying contract.

mod bindings;

use std::fmt;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use dbus::arg::OwnedFd;
use dbus::blocking::{Connection, Proxy};
use slog::{debug, o, Logger};
use thiserror::Error;

pub use bindings::OrgFreedesktopLogin1Manager;
pub use bindings::OrgFreedesktopLogin1ManagerPrepareForSleep;

pub const LOGIND_BUS_NAME: &str = "org.freedesktop.login1";
pub const LOGIND_OBJECT_PATH: &str = "/org/freedesktop/login1";

const PROXY_TIMEOUT: Duration = Duration::from_millis(500);

// Only sleep is ever inhibited; shutdown and idle stay untouched.
const INHIBIT_WHAT: &str = "sleep";

#[derive(Error, Debug)]
pub enum LogindError {
    #[error("no bus connection is active; used outside its scope")]
    NotOpened,

    #[error("login manager returned an unusable inhibitor descriptor")]
    BusProtocol,

    #[error("D-Bus operation failed: {source}")]
    DBus {
        #[from]
        source: dbus::Error,
    },
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum InhibitMode {
    /// Prevents sleep entirely until released. Requires root.
    Block,
    /// Delays sleep for a bounded few seconds. Usable unprivileged.
    Delay,
}

impl InhibitMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InhibitMode::Block => "block",
            InhibitMode::Delay => "delay",
        }
    }
}

impl fmt::Display for InhibitMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl slog::Value for InhibitMode {
    fn serialize(
        &self,
        _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_str(key, self.as_str())
    }
}

/// The seam between inhibition scheduling and the real login manager.
/// Production code uses [`SleepLock`]; tests substitute a fake.
pub trait Inhibitor {
    /// Takes the lock if it is not already held. Returns whether a
    /// transition occurred.
    fn inhibit(&mut self) -> Result<bool, LogindError>;

    /// Releases the lock if held. Returns whether a transition occurred.
    fn allow(&mut self) -> Result<bool, LogindError>;

    fn is_inhibiting(&self) -> bool;
}

/// At most one logind inhibitor lock, held as a file descriptor over a
/// blocking system-bus connection that this struct owns.
pub struct SleepLock {
    logger: Logger,
    connection: Connection,
    who: String,
    why: String,
    mode: InhibitMode,
    fd: Option<OwnedFd>,
}

impl SleepLock {
    /// Opens the system-bus connection. Fails fast when the bus is
    /// unreachable; lock acquisition happens later via [`Inhibitor::inhibit`].
    pub fn new(
        parent_logger: &Logger,
        who: &str,
        why: &str,
        mode: InhibitMode,
    ) -> Result<SleepLock, LogindError> {
        let connection = Connection::new_system()?;
        Ok(SleepLock {
            logger: parent_logger.new(o!("component" => "sleep-lock")),
            connection,
            who: who.to_string(),
            why: why.to_string(),
            mode,
            fd: None,
        })
    }

    fn proxy(&self) -> Proxy<'_, &Connection> {
        self.connection
            .with_proxy(LOGIND_BUS_NAME, LOGIND_OBJECT_PATH, PROXY_TIMEOUT)
    }
}

impl Inhibitor for SleepLock {
    fn inhibit(&mut self) -> Result<bool, LogindError> {
        if self.fd.is_some() {
            debug!(&self.logger, "Did not take a new lock, one is already held");
            return Ok(false);
        }
        let fd = self
            .proxy()
            .inhibit(INHIBIT_WHAT, &self.who, &self.why, self.mode.as_str())?;
        if fd.as_raw_fd() < 0 {
            return Err(LogindError::BusProtocol);
        }
        debug!(&self.logger, "Took inhibitor lock"; "fd" => fd.as_raw_fd(), "mode" => self.mode);
        self.fd = Some(fd);
        Ok(true)
    }

    fn allow(&mut self) -> Result<bool, LogindError> {
        match self.fd.take() {
            // Closing the descriptor is what releases the lock
            Some(fd) => {
                debug!(&self.logger, "Releasing inhibitor lock"; "fd" => fd.as_raw_fd());
                drop(fd);
                Ok(true)
            }
            None => {
                debug!(&self.logger, "No inhibitor lock was held");
                Ok(false)
            }
        }
    }

    fn is_inhibiting(&self) -> bool {
        self.fd.is_some()
    }
}

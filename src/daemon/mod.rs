//! The `no-dozed` daemon: a request multiplexer over a per-pid FIFO.
//!
//! Clients write line-delimited JSON messages into the FIFO; the daemon
//! tracks bound clients and drives a [`ScheduledInhibition`] on their
//! behalf. Signals (shutdown, about-to-sleep) arrive as bytes on a
//! self-pipe so the single-threaded loop is their only interpreter.

pub mod scheduled;
pub mod watcher;

pub use scheduled::ScheduledInhibition;
pub use watcher::SleepWatcher;

use std::collections::HashSet;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::stat::Mode;
use nix::unistd;
use signal_hook::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use slog::{debug, info, o, warn, Logger};
use thiserror::Error;

use crate::logind::Inhibitor;
use crate::message::{self, BindMessage, InhibitMessage, Message, FIFO_ATOMIC_WRITE_B};
use crate::sigpipe::SignalPipe;

pub const FIFO_PREFIX: &str = "FIFO_";

/// Identification handed to logind with the block-mode lock.
pub const INHIBITOR_WHO: &str = "No-Doze Service";
pub const INHIBITOR_WHY: &str = "A monitored process/event is in progress.";

const SIGNAL_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("another daemon appears to be running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

/// The daemon's single-threaded request loop.
///
/// Owns the FIFO, the signal pipe, the set of bound client pids, and the
/// scheduled inhibition. The inhibitor type is generic so tests can run the
/// full message path against a fake lock.
pub struct Server<L: Inhibitor + Send + 'static> {
    logger: Logger,
    base_dir: PathBuf,
    fifo_path: PathBuf,
    permissions: u32,
    exe_name: String,
    fifo: Option<File>,
    reader: LineReader,
    inhibition: ScheduledInhibition<L>,
    bound_clients: HashSet<u32>,
    signals: SignalPipe,
    ats_signal: i32,
    unbind_signal: i32,
    run: bool,
}

impl<L: Inhibitor + Send + 'static> Server<L> {
    pub fn new(
        parent_logger: &Logger,
        base_dir: &Path,
        permissions: u32,
        lock: L,
    ) -> Result<Server<L>, DaemonError> {
        let logger = parent_logger.new(o!("component" => "daemon"));
        let fifo_path = base_dir.join(format!("{}{}", FIFO_PREFIX, unistd::getpid()));
        let exe_name = env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "no-dozed".to_string());
        let signals = SignalPipe::new(&logger)?;
        let inhibition = ScheduledInhibition::new(&logger, lock);
        Ok(Server {
            logger,
            base_dir: base_dir.to_path_buf(),
            fifo_path,
            permissions,
            exe_name,
            fifo: None,
            reader: LineReader::new(),
            inhibition,
            bound_clients: HashSet::new(),
            signals,
            ats_signal: libc::SIGRTMIN(),
            unbind_signal: SIGUSR1,
            run: false,
        })
    }

    /// Sweeps stale FIFOs, creates ours, and funnels the signals the loop
    /// listens for into the self-pipe.
    pub fn open(&mut self) -> Result<(), DaemonError> {
        self.sweep_stale_fifos()?;

        debug!(&self.logger, "Creating FIFO"; "path" => %self.fifo_path.display());
        unistd::mkfifo(&self.fifo_path, Mode::from_bits_truncate(self.permissions))?;
        // mkfifo is subject to the umask; re-apply the configured bits
        fs::set_permissions(&self.fifo_path, fs::Permissions::from_mode(self.permissions))?;

        // Read-write so reads never hit EOF when the last writer disconnects
        let fifo = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.fifo_path)?;
        fcntl(fifo.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        self.fifo = Some(fifo);

        for signal in [SIGINT, SIGTERM, SIGHUP, SIGQUIT, self.ats_signal] {
            self.signals.register(signal)?;
        }
        Ok(())
    }

    /// Demultiplexes the FIFO and the signal pipe until a shutdown signal
    /// arrives, then tears down.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        if self.fifo.is_none() {
            self.open()?;
        }
        info!(&self.logger, "Listening"; "fifo" => %self.fifo_path.display());

        self.run = true;
        while self.run {
            let fifo_fd = match &self.fifo {
                Some(fifo) => fifo.as_raw_fd(),
                None => break,
            };
            let mut fds = [
                PollFd::new(fifo_fd, PollFlags::POLLIN),
                PollFd::new(self.signals.read_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(err) => {
                    warn!(&self.logger, "Demultiplexer failed, shutting down"; "error" => %err);
                    break;
                }
            }
            if readable(&fds[1]) {
                self.drain_signals();
            }
            if self.run && readable(&fds[0]) {
                self.receive_messages();
            }
        }
        self.shutdown();
        Ok(())
    }

    /// The fd the sleep watcher writes the about-to-sleep byte into.
    pub fn signal_write_fd(&self) -> RawFd {
        self.signals.write_fd()
    }

    pub fn ats_signal(&self) -> i32 {
        self.ats_signal
    }

    pub fn fifo_path(&self) -> &Path {
        &self.fifo_path
    }

    pub fn bound_to(&self) -> &HashSet<u32> {
        &self.bound_clients
    }

    pub fn inhibited(&self) -> bool {
        self.inhibition.is_inhibiting()
    }

    /// Deletes leftover `FIFO_<pid>` entries whose owning process is gone,
    /// is not a daemon instance, or is this very process. Best effort;
    /// races with concurrent starts are accepted. Finding a live peer
    /// daemon aborts startup instead.
    fn sweep_stale_fifos(&self) -> Result<(), DaemonError> {
        let my_pid = unistd::getpid().as_raw() as u32;
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            // Only FIFO_<digits> entries are sweep candidates
            let pid = match name
                .strip_prefix(FIFO_PREFIX)
                .and_then(|rest| rest.parse::<u32>().ok())
            {
                Some(pid) => pid,
                None => continue,
            };
            let path = entry.path();

            if pid == my_pid {
                info!(&self.logger, "Deleting FIFO left under our own pid"; "path" => %path.display());
                fs::remove_file(&path)?;
                continue;
            }
            match owner_comm(pid) {
                Some(comm) if comm_matches(&comm, &self.exe_name) => {
                    warn!(&self.logger, "Cannot clear FIFO, another daemon appears to be running"; "pid" => pid);
                    return Err(DaemonError::AlreadyRunning { pid });
                }
                _ => {
                    info!(&self.logger, "Deleting stale FIFO"; "path" => %path.display());
                    if let Err(err) = fs::remove_file(&path) {
                        warn!(&self.logger, "Unable to delete stale FIFO"; "path" => %path.display(), "error" => %err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads whatever the FIFO holds and handles every complete line.
    fn receive_messages(&mut self) {
        let fd = match &self.fifo {
            Some(fifo) => fifo.as_raw_fd(),
            None => return,
        };
        let mut buf = [0u8; 4096];
        loop {
            match unistd::read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => self.reader.extend(&buf[..n]),
                Err(nix::Error::Sys(Errno::EAGAIN)) => break,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(err) => {
                    warn!(&self.logger, "Could not read from FIFO"; "error" => %err);
                    break;
                }
            }
        }
        while let Some(line) = self.reader.next_line() {
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, raw: &str) {
        if raw.len() + 1 >= FIFO_ATOMIC_WRITE_B {
            // Writes this long are not atomic on a pipe
            warn!(&self.logger, "Message exceeds the pipe's atomic write size"; "bytes" => raw.len() + 1);
        }
        let message = match message::decode_line(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(&self.logger, "Unable to decode message"; "error" => %err, "raw" => raw);
                return;
            }
        };
        if message.version() > message::API_VERSION {
            warn!(&self.logger, "Message version is newer than this daemon"; "version" => message.version());
        }
        match message {
            Message::BindMessage(bind) => self.handle_bind(bind),
            Message::InhibitMessage(inhibit) => self.handle_inhibit(inhibit),
        }
    }

    fn handle_bind(&mut self, message: BindMessage) {
        if self.bound_clients.contains(&message.pid) {
            info!(&self.logger, "An already bound client sent a bind request, allowing"; "pid" => message.pid);
            return;
        }
        info!(&self.logger, "Bound client"; "pid" => message.pid, "uid" => message.uid);
        self.bound_clients.insert(message.pid);
    }

    fn handle_inhibit(&mut self, message: InhibitMessage) {
        if !self.bound_clients.contains(&message.pid) {
            warn!(&self.logger, "Ignoring message from unbound client"; "pid" => message.pid);
            return;
        }
        let expiry = match message.expiry() {
            Ok(expiry) => expiry,
            Err(err) => {
                warn!(&self.logger, "Ignoring inhibit message"; "error" => %err, "pid" => message.pid);
                return;
            }
        };
        if self.inhibition.set_inhibitor(expiry) {
            debug!(&self.logger, "Sleep inhibited"; "until" => %expiry, "pid" => message.pid, "uid" => message.uid);
        } else {
            debug!(&self.logger, "Message does not extend the current inhibition"; "pid" => message.pid);
        }
    }

    fn drain_signals(&mut self) {
        loop {
            match self.signals.try_read() {
                Ok(Some(signal)) => {
                    self.handle_signal(signal);
                    if !self.run {
                        return;
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(&self.logger, "Signal pipe read failed, treating as shutdown"; "error" => %err);
                    self.run = false;
                    return;
                }
            }
        }
    }

    fn handle_signal(&mut self, signal: i32) {
        if signal == self.ats_signal {
            info!(&self.logger, "System is about to sleep, signaling bound clients");
            self.handle_about_to_sleep();
        } else if [SIGINT, SIGTERM, SIGHUP].contains(&signal) {
            info!(&self.logger, "Received shutdown signal"; "signal" => signal);
            self.run = false;
        } else {
            info!(&self.logger, "Ignoring unexpected signal"; "signal" => signal);
        }
    }

    /// Forwards the about-to-sleep signal to every bound client, dropping
    /// the pids that can no longer be signaled.
    fn handle_about_to_sleep(&mut self) {
        let clients: Vec<u32> = self.bound_clients.drain().collect();
        for pid in clients {
            if self.signal_client(pid, self.ats_signal) {
                self.bound_clients.insert(pid);
            } else {
                info!(&self.logger, "Dropping client that could not be signaled"; "pid" => pid);
            }
        }
    }

    fn signal_client(&self, pid: u32, signal: i32) -> bool {
        // Never pass a non-positive pid to kill; that addresses a group
        let pid = match i32::try_from(pid) {
            Ok(pid) if pid > 0 => pid,
            _ => return false,
        };
        for _ in 0..SIGNAL_ATTEMPTS {
            if unsafe { libc::kill(pid, signal) } == 0 {
                return true;
            }
        }
        false
    }

    fn shutdown(&mut self) {
        info!(&self.logger, "Shutting down");
        self.inhibition.close();
        if self.fifo.take().is_some() {
            if let Err(err) = fs::remove_file(&self.fifo_path) {
                warn!(&self.logger, "Unable to delete FIFO"; "path" => %self.fifo_path.display(), "error" => %err);
            }
        }
        let clients: Vec<u32> = self.bound_clients.drain().collect();
        for pid in clients {
            info!(&self.logger, "Sending unbind signal"; "pid" => pid);
            if !self.signal_client(pid, self.unbind_signal) {
                debug!(&self.logger, "Could not deliver unbind signal"; "pid" => pid);
            }
        }
    }
}

fn readable(fd: &PollFd) -> bool {
    fd.revents()
        .map(|revents| revents.intersects(PollFlags::POLLIN))
        .unwrap_or(false)
}

fn owner_comm(pid: u32) -> Option<String> {
    let pid = i32::try_from(pid).ok()?;
    let process = procfs::process::Process::new(pid).ok()?;
    process.stat().ok().map(|stat| stat.comm)
}

fn comm_matches(comm: &str, exe_name: &str) -> bool {
    // comm is truncated to 15 bytes in /proc
    comm == exe_name || (comm.len() == 15 && exe_name.starts_with(comm))
}

/// Assembles newline-terminated lines out of partial non-blocking reads.
struct LineReader {
    buffer: Vec<u8>,
}

impl LineReader {
    fn new() -> LineReader {
        LineReader { buffer: Vec::new() }
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&byte| byte == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line[..newline]).into_owned())
    }
}

//! The `no-doze-client` loop.
//!
//! Runs registered inhibiting conditions on a priority-queue schedule and
//! reports wanted inhibitions to the daemon over its FIFO. Signals are
//! funneled through a self-pipe, so the loop blocks in exactly one place:
//! the poll with a timeout set to the next scheduled check.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;
use signal_hook::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1};
use slog::{debug, info, o, warn, Logger};
use thiserror::Error;

use crate::condition::InhibitingCondition;
use crate::daemon::FIFO_PREFIX;
use crate::message::{self, BindMessage, InhibitMessage, Message};
use crate::schedule::{PriorityQueue, ScheduledCheck};
use crate::sigpipe::SignalPipe;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot start without any inhibiting conditions; check your configuration")]
    NoConditions,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

pub struct NoDozeClient {
    logger: Logger,
    base_dir: PathBuf,
    retry_delay: Duration,
    startup_delay: Duration,
    conditions: Vec<Rc<RefCell<dyn InhibitingCondition>>>,
    schedule: PriorityQueue<ScheduledCheck>,
    inhibit_until: DateTime<Utc>,
    fifo: Option<File>,
    fifo_path: Option<PathBuf>,
    signals: SignalPipe,
    ats_signal: i32,
    unbind_signal: i32,
    run: bool,
}

impl NoDozeClient {
    /// Sets up the signal funnel. The FIFO is discovered lazily once the
    /// loop runs.
    pub fn new(
        parent_logger: &Logger,
        base_dir: &Path,
        retry_delay: Duration,
        startup_delay: Duration,
    ) -> Result<NoDozeClient, ClientError> {
        let logger = parent_logger.new(o!("component" => "client"));
        let mut signals = SignalPipe::new(&logger)?;
        let ats_signal = libc::SIGRTMIN();
        let unbind_signal = SIGUSR1;
        for signal in [SIGINT, SIGTERM, SIGHUP, SIGQUIT, ats_signal, unbind_signal] {
            signals.register(signal)?;
        }
        Ok(NoDozeClient {
            logger,
            base_dir: base_dir.to_path_buf(),
            retry_delay,
            startup_delay,
            conditions: Vec::new(),
            schedule: PriorityQueue::new(),
            inhibit_until: Utc::now(),
            fifo: None,
            fifo_path: None,
            signals,
            ats_signal,
            unbind_signal,
            run: false,
        })
    }

    /// Registers a condition and schedules its first check after the
    /// configured startup delay. The schedule keeps exactly one entry per
    /// condition for the client's whole lifetime.
    pub fn add_condition(&mut self, condition: Rc<RefCell<dyn InhibitingCondition>>) {
        self.schedule.offer(ScheduledCheck {
            time: Utc::now() + self.startup_delay,
            condition: Rc::clone(&condition),
        });
        self.conditions.push(condition);
    }

    /// The cooperative main loop: wait on the signal pipe until the next
    /// scheduled check (or the retry delay while disconnected), then run
    /// due checks and report any new inhibition to the daemon.
    pub fn run(&mut self) -> Result<(), ClientError> {
        if self.conditions.is_empty() {
            return Err(ClientError::NoConditions);
        }
        self.run = true;
        while self.run {
            let timeout = if self.fifo.is_none() {
                self.open_fifo();
                self.retry_delay
            } else {
                self.time_until_next_check()
            };
            self.wait_for_signals(timeout);
            if !self.run {
                break;
            }
            if self.fifo.is_some() && self.check_due() && self.handle_scheduled_checks() {
                self.send_inhibit();
            }
        }
        self.close_fifo();
        Ok(())
    }

    pub fn stop(&mut self) {
        self.run = false;
    }

    pub fn inhibit_until(&self) -> DateTime<Utc> {
        self.inhibit_until
    }

    pub fn connected(&self) -> bool {
        self.fifo.is_some()
    }

    /// Scans the base directory for the daemon's `FIFO_<pid>`. Anything
    /// other than exactly one candidate means the daemon is not (yet)
    /// unambiguously present.
    fn discover_fifo(&self) -> Option<PathBuf> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(&self.logger, "Could not scan for the daemon FIFO"; "dir" => %self.base_dir.display(), "error" => %err);
                return None;
            }
        };
        let mut candidates: Vec<PathBuf> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name
                .strip_prefix(FIFO_PREFIX)
                .map(|rest| !rest.is_empty() && rest.bytes().all(|byte| byte.is_ascii_digit()))
                .unwrap_or(false)
            {
                candidates.push(entry.path());
            }
        }
        if candidates.len() == 1 {
            candidates.pop()
        } else {
            info!(&self.logger, "Waiting for exactly one connection candidate"; "found" => candidates.len());
            None
        }
    }

    /// Tries to connect and bind. Failure leaves the client disconnected;
    /// the main loop retries after `retry_delay`.
    fn open_fifo(&mut self) {
        let Some(path) = self.discover_fifo() else {
            return;
        };
        // Read-write so the open never blocks waiting for a reader
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(fifo) => {
                info!(&self.logger, "Connected to daemon"; "fifo" => %path.display());
                self.fifo = Some(fifo);
                self.fifo_path = Some(path);
                self.send_bind();
            }
            Err(err) => {
                warn!(&self.logger, "Unable to open FIFO, will retry"; "fifo" => %path.display(), "error" => %err);
            }
        }
    }

    fn close_fifo(&mut self) {
        if let Some(path) = self.fifo_path.take() {
            info!(&self.logger, "Closing FIFO"; "fifo" => %path.display());
        }
        self.fifo = None;
    }

    fn send_bind(&mut self) {
        let bind = Message::BindMessage(BindMessage::new(
            unistd::getpid().as_raw() as u32,
            unistd::getuid().as_raw(),
        ));
        self.send_message(&bind);
    }

    fn send_inhibit(&mut self) {
        let inhibit = Message::InhibitMessage(InhibitMessage::new(
            unistd::getpid().as_raw() as u32,
            unistd::getuid().as_raw(),
            self.inhibit_until,
        ));
        self.send_message(&inhibit);
    }

    /// Writes one newline-terminated message. A failed write drops the
    /// connection so the next iteration rediscovers and rebinds.
    fn send_message(&mut self, message: &Message) {
        let Some(fifo) = self.fifo.as_mut() else {
            debug!(&self.logger, "Not connected, dropping outgoing message");
            return;
        };
        let line = match message::encode_line(message) {
            Ok(line) => line,
            Err(err) => {
                warn!(&self.logger, "Could not encode message"; "error" => %err);
                return;
            }
        };
        if let Err(err) = fifo.write_all(line.as_bytes()) {
            warn!(&self.logger, "Could not write to FIFO, dropping connection"; "error" => %err);
            self.close_fifo();
        }
    }

    fn check_due(&self) -> bool {
        self.schedule
            .peek()
            .map(|check| Utc::now() >= check.time)
            .unwrap_or(false)
    }

    fn time_until_next_check(&self) -> Duration {
        match self.schedule.peek() {
            Some(check) => (check.time - Utc::now()).max(Duration::zero()),
            None => self.retry_delay,
        }
    }

    /// Pops and runs every due check, reinserting each at its next time.
    /// A check that fell behind (typically after suspend) is reset to
    /// `now + period` so it is polled exactly once, not replayed.
    /// Returns whether `inhibit_until` increased.
    fn handle_scheduled_checks(&mut self) -> bool {
        let mut increased = false;
        loop {
            let now = Utc::now();
            match self.schedule.peek() {
                Some(check) if now >= check.time => {}
                _ => break,
            }
            let Some(check) = self.schedule.poll() else {
                break;
            };
            let period = check.condition.borrow().period();
            let mut next = check.time + period;
            if next < now {
                debug!(
                    &self.logger,
                    "Unable to keep up with the schedule; if the system did not recently sleep there is a problem"
                );
                next = now + period;
            }
            if check.condition.borrow_mut().does_inhibit() {
                if next > self.inhibit_until {
                    debug!(&self.logger, "Condition requires a new or extended inhibition";
                           "condition" => check.condition.borrow().name(), "until" => %next);
                    self.inhibit_until = next;
                    increased = true;
                } else {
                    debug!(&self.logger, "Inhibition already satisfied";
                           "condition" => check.condition.borrow().name());
                }
            }
            self.schedule.offer(ScheduledCheck {
                time: next,
                condition: check.condition,
            });
        }
        increased
    }

    /// The last-gasp pass: polls every condition immediately, without
    /// touching the schedule. Returns whether `inhibit_until` increased.
    fn handle_unscheduled_checks(&mut self) -> bool {
        let now = Utc::now();
        let mut increased = false;
        for condition in &self.conditions {
            if !condition.borrow_mut().does_inhibit() {
                continue;
            }
            let until = now + condition.borrow().period();
            if until > self.inhibit_until {
                debug!(&self.logger, "Last-gasp check extends inhibition";
                       "condition" => condition.borrow().name(), "until" => %until);
                self.inhibit_until = until;
                increased = true;
            }
        }
        increased
    }

    fn wait_for_signals(&mut self, timeout: Duration) {
        let timeout_ms = timeout
            .num_milliseconds()
            .clamp(0, i64::from(i32::MAX)) as i32;
        let mut fds = [PollFd::new(self.signals.read_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout_ms) {
            Ok(0) => {}
            Ok(_) => self.drain_signals(),
            Err(nix::Error::Sys(Errno::EINTR)) => {}
            Err(err) => {
                warn!(&self.logger, "Demultiplexer failed, shutting down"; "error" => %err);
                self.run = false;
            }
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
            info!(&self.logger, "System is about to sleep, running last-gasp checks");
            if self.handle_unscheduled_checks() {
                self.send_inhibit();
            }
        } else if signal == self.unbind_signal {
            info!(&self.logger, "Daemon requested unbind, dropping the connection");
            self.close_fifo();
        } else if [SIGINT, SIGTERM, SIGHUP].contains(&signal) {
            info!(&self.logger, "Received shutdown signal"; "signal" => signal);
            self.run = false;
        } else {
            info!(&self.logger, "Ignoring unexpected signal"; "signal" => signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use std::cell::Cell;
    use std::io::Read;
    use std::os::unix::fs::OpenOptionsExt;

    struct CountingCondition {
        name: String,
        period: Duration,
        inhibits: bool,
        calls: Rc<Cell<u32>>,
    }

    impl CountingCondition {
        fn shared(
            name: &str,
            period: Duration,
            inhibits: bool,
        ) -> (Rc<RefCell<dyn InhibitingCondition>>, Rc<Cell<u32>>) {
            let calls = Rc::new(Cell::new(0));
            let condition = CountingCondition {
                name: name.to_string(),
                period,
                inhibits,
                calls: Rc::clone(&calls),
            };
            (Rc::new(RefCell::new(condition)), calls)
        }
    }

    impl InhibitingCondition for CountingCondition {
        fn name(&self) -> &str {
            &self.name
        }

        fn period(&self) -> Duration {
            self.period
        }

        fn does_inhibit(&mut self) -> bool {
            self.calls.set(self.calls.get() + 1);
            self.inhibits
        }
    }

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn test_client(dir: &Path) -> NoDozeClient {
        NoDozeClient::new(
            &test_logger(),
            dir,
            Duration::milliseconds(100),
            Duration::zero(),
        )
        .unwrap()
    }

    #[test]
    fn run_refuses_to_start_without_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client(dir.path());
        assert!(matches!(client.run(), Err(ClientError::NoConditions)));
    }

    #[test]
    fn schedule_size_is_conserved_across_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client(dir.path());
        for name in ["one", "two", "three"] {
            let (condition, _) = CountingCondition::shared(name, Duration::milliseconds(5), false);
            client.add_condition(condition);
        }
        assert_eq!(client.schedule.len(), 3);

        std::thread::sleep(std::time::Duration::from_millis(10));
        client.handle_scheduled_checks();
        assert_eq!(client.schedule.len(), 3);

        // Every reinserted check is in the future
        let now = Utc::now();
        assert!(client.schedule.iter().all(|check| check.time >= now));
    }

    #[test]
    fn inhibiting_condition_extends_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client(dir.path());
        let (condition, calls) = CountingCondition::shared("busy", Duration::minutes(5), true);
        client.add_condition(condition);

        assert!(client.handle_scheduled_checks());
        assert_eq!(calls.get(), 1);
        assert!(client.inhibit_until() > Utc::now() + Duration::minutes(4));
    }

    #[test]
    fn non_inhibiting_condition_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client(dir.path());
        let (condition, calls) = CountingCondition::shared("idle", Duration::minutes(5), false);
        client.add_condition(condition);

        let before = client.inhibit_until();
        assert!(!client.handle_scheduled_checks());
        assert_eq!(calls.get(), 1);
        assert_eq!(client.inhibit_until(), before);
    }

    #[test]
    fn fallen_behind_check_is_reset_and_polled_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client(dir.path());
        let (condition, calls) = CountingCondition::shared("lagging", Duration::milliseconds(30), false);

        // Head entry far in the past, as after a long suspend
        client.schedule.offer(ScheduledCheck {
            time: Utc::now() - Duration::seconds(10),
            condition: Rc::clone(&condition),
        });
        client.conditions.push(condition);

        client.handle_scheduled_checks();

        assert_eq!(calls.get(), 1);
        let head = client.schedule.peek().unwrap();
        // Reset relative to now, not replayed from the stale slot
        assert!(head.time > Utc::now());
    }

    #[test]
    fn last_gasp_checks_skip_the_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client(dir.path());
        let (condition, calls) =
            CountingCondition::shared("busy", Duration::minutes(10), true);
        client.add_condition(condition);
        let scheduled_head = client.schedule.peek().unwrap().time;

        assert!(client.handle_unscheduled_checks());
        assert_eq!(calls.get(), 1);
        assert!(client.inhibit_until() > Utc::now() + Duration::minutes(9));
        // The scheduled entry is untouched
        assert_eq!(client.schedule.peek().unwrap().time, scheduled_head);
        assert_eq!(client.schedule.len(), 1);
    }

    #[test]
    fn discovery_needs_exactly_one_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let client = test_client(dir.path());
        assert_eq!(client.discover_fifo(), None);

        fs::write(dir.path().join("FIFO_100"), b"").unwrap();
        fs::write(dir.path().join("FIFO_other"), b"").unwrap(); // not a candidate
        assert_eq!(
            client.discover_fifo(),
            Some(dir.path().join("FIFO_100"))
        );

        fs::write(dir.path().join("FIFO_200"), b"").unwrap();
        assert_eq!(client.discover_fifo(), None);
    }

    /// Held open for a whole scenario; a FIFO discards buffered data once
    /// its last descriptor closes.
    fn open_reader(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .unwrap()
    }

    fn drain_lines(reader: &mut File) -> Vec<String> {
        let mut buf = [0u8; 8192];
        let n = reader.read(&mut buf).unwrap_or(0);
        String::from_utf8_lossy(&buf[..n])
            .lines()
            .map(|line| line.to_string())
            .collect()
    }

    #[test]
    fn opening_the_fifo_sends_a_bind_message() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("FIFO_4242");
        unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o666)).unwrap();
        let mut reader = open_reader(&fifo);

        let mut client = test_client(dir.path());
        client.open_fifo();
        assert!(client.connected());

        let lines = drain_lines(&mut reader);
        assert_eq!(lines.len(), 1);
        let Message::BindMessage(bind) = message::decode_line(&lines[0]).unwrap() else {
            panic!("expected a bind message");
        };
        assert_eq!(bind.pid, unistd::getpid().as_raw() as u32);
        assert_eq!(bind.version, message::API_VERSION);
    }

    #[test]
    fn unbind_signal_drops_and_rediscovers_the_same_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("FIFO_4242");
        unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o666)).unwrap();
        let mut reader = open_reader(&fifo);

        let mut client = test_client(dir.path());
        client.run = true;
        client.open_fifo();
        assert!(client.connected());

        client.handle_signal(client.unbind_signal);
        assert!(!client.connected());

        // Next iteration would rediscover the same pipe and rebind
        client.open_fifo();
        assert!(client.connected());
        let lines = drain_lines(&mut reader);
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert!(matches!(
                message::decode_line(&line).unwrap(),
                Message::BindMessage(_)
            ));
        }
    }

    #[test]
    fn shutdown_signals_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = test_client(dir.path());
        client.run = true;
        client.handle_signal(SIGTERM);
        assert!(!client.run);
    }

    #[test]
    fn last_gasp_signal_sends_an_immediate_inhibit() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("FIFO_4242");
        unistd::mkfifo(&fifo, Mode::from_bits_truncate(0o666)).unwrap();
        let mut reader = open_reader(&fifo);

        let mut client = test_client(dir.path());
        client.run = true;
        let (condition, _) = CountingCondition::shared("busy", Duration::minutes(5), true);
        client.add_condition(condition);
        client.open_fifo();

        client.handle_signal(client.ats_signal);

        let lines = drain_lines(&mut reader);
        assert_eq!(lines.len(), 2);
        let Message::InhibitMessage(inhibit) = message::decode_line(&lines[1]).unwrap() else {
            panic!("expected an inhibit message");
        };
        let expiry = inhibit.expiry().unwrap();
        assert!(expiry > Utc::now() + Duration::minutes(4));
    }
}

//! Watches the login manager for imminent suspend.
//!
//! Holds a delay-mode lock so that, when `PrepareForSleep(true)` arrives,
//! the before-sleep callback gets a bounded window to run before suspend
//! proceeds. logind grants only a few seconds of delay, so callbacks must
//! finish well under five.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbus::blocking::Connection;
use dbus::Message;
use slog::{debug, info, o, warn, Logger};

use crate::logind::{
    InhibitMode, Inhibitor, LogindError, OrgFreedesktopLogin1ManagerPrepareForSleep, SleepLock,
    LOGIND_BUS_NAME, LOGIND_OBJECT_PATH,
};

const WHO: &str = "no-doze sleep watcher";
const WHY: &str = "last gasp check";

const MATCH_TIMEOUT: Duration = Duration::from_millis(500);
const PUMP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct SleepWatcher {
    logger: Logger,
    connection: Connection,
    running: Arc<AtomicBool>,
}

impl SleepWatcher {
    /// Takes the delay lock, opens a bus connection, and subscribes to
    /// `PrepareForSleep`. `before_sleep` runs synchronously while the delay
    /// lock still blocks suspend; `awake` runs after the lock has been
    /// retaken on resume.
    pub fn new<F, G>(
        parent_logger: &Logger,
        before_sleep: F,
        awake: G,
    ) -> Result<SleepWatcher, LogindError>
    where
        F: Fn() + Send + 'static,
        G: Fn() + Send + 'static,
    {
        let logger = parent_logger.new(o!("component" => "sleep-watcher"));

        let mut delay_lock = SleepLock::new(&logger, WHO, WHY, InhibitMode::Delay)?;
        delay_lock.inhibit()?;
        let delay_lock = Arc::new(Mutex::new(delay_lock));

        let connection = Connection::new_system()?;
        {
            let proxy = connection.with_proxy(LOGIND_BUS_NAME, LOGIND_OBJECT_PATH, MATCH_TIMEOUT);
            let logger = logger.clone();
            proxy.match_signal(
                move |signal: OrgFreedesktopLogin1ManagerPrepareForSleep,
                      _: &Connection,
                      _: &Message| {
                    let mut lock = match delay_lock.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    if signal.arg0 {
                        info!(&logger, "About to sleep");
                        // The delay lock blocks suspend while the callback runs
                        before_sleep();
                        if let Err(err) = lock.allow() {
                            warn!(&logger, "Could not release delay lock"; "error" => %err);
                        }
                    } else {
                        info!(&logger, "Resumed from sleep");
                        if let Err(err) = lock.inhibit() {
                            warn!(&logger, "Could not retake delay lock"; "error" => %err);
                        }
                        awake();
                    }
                    true
                },
            )?;
        }

        Ok(SleepWatcher {
            logger,
            connection,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Clearing the returned flag makes `run` exit at its next iteration.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Blocks receiving bus signals until the stop flag clears or the
    /// connection dies. Intended to run on its own thread.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.connection.process(PUMP_TIMEOUT) {
                warn!(&self.logger, "Bus receive failed, sleep watcher going down"; "error" => %err);
                break;
            }
        }
        debug!(&self.logger, "Sleep watcher exited");
    }
}

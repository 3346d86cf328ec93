use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use slog::warn;

use no_doze::config::DaemonConfig;
use no_doze::daemon::{Server, SleepWatcher, INHIBITOR_WHO, INHIBITOR_WHY};
use no_doze::logind::{InhibitMode, SleepLock};
use no_doze::root_logger;
use no_doze::sigpipe::SignalPipe;

/// How long clients get to answer an about-to-sleep signal before the
/// watcher lets suspend proceed.
const CLIENT_REPLY_WINDOW: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "no-dozed", about = "Sleep inhibition as a service", version)]
struct Cli {
    /// Path to the YAML config file
    #[arg(short = 'c', long = "config", default_value = "resources/no-dozed.yml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("Could not load config from {}", cli.config.display()))?;
    let logger = root_logger(config.log_level().context("Invalid logging_level")?);
    let permissions = config.permissions().context("Invalid fifo_permissions")?;

    let lock = SleepLock::new(&logger, INHIBITOR_WHO, INHIBITOR_WHY, InhibitMode::Block)
        .context("Could not connect to system D-Bus")?;
    let mut server = Server::new(&logger, &config.base_dir, permissions, lock)
        .context("Could not create daemon")?;
    server.open().context("Could not open FIFO")?;

    // The watcher reports an imminent suspend as a byte in the daemon's
    // signal pipe, then holds its delay lock long enough for clients to
    // answer the fan-out with a final inhibit request.
    let signal_fd = server.signal_write_fd();
    let ats_signal = server.ats_signal();
    let mut watcher = SleepWatcher::new(
        &logger,
        move || {
            SignalPipe::raise_on(signal_fd, ats_signal);
            thread::sleep(CLIENT_REPLY_WINDOW);
        },
        || {},
    )
    .context("Could not start sleep watcher")?;
    let watcher_stop = watcher.stop_flag();
    let watcher_thread = thread::spawn(move || watcher.run());

    let result = server.run().context("Daemon loop failed");

    watcher_stop.store(false, Ordering::SeqCst);
    if watcher_thread.join().is_err() {
        warn!(&logger, "Sleep watcher thread panicked");
    }
    result
}

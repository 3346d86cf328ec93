pub mod client;
pub mod condition;
pub mod config;
pub mod daemon;
pub mod logind;
pub mod message;
pub mod plugins;
pub mod schedule;
pub mod sigpipe;

use slog::{o, Drain, Level, LevelFilter, Logger};
use slog_async::Async;
use slog_term::{FullFormat, TermDecorator};

/// Creates a root logger filtered to the configured level
pub fn root_logger(level: Level) -> Logger {
    let decorator = TermDecorator::new().build();
    let term_drain = FullFormat::new(decorator).build().fuse();
    let drain = LevelFilter::new(term_drain, level).fuse();
    let drain = Async::new(drain).build().fuse();
    Logger::root(
        drain,
        o!("name" => env!("CARGO_PKG_NAME"), "version" => env!("CARGO_PKG_VERSION")),
    )
}

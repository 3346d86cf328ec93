//! Inhibits sleep while a named process is running.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Duration;
use slog::{debug, info, o, warn, Logger};

use super::PluginError;
use crate::condition::{InhibitingCondition, Registrar};
use crate::config::{self, ClientConfig};

pub struct ActiveProcessInhibitor {
    logger: Logger,
    name: String,
    process_name: String,
    period: Duration,
}

impl ActiveProcessInhibitor {
    pub fn new(parent_logger: &Logger, process_name: &str, period: Duration) -> ActiveProcessInhibitor {
        let name = format!("ActiveProcess - {}", process_name);
        ActiveProcessInhibitor {
            logger: parent_logger.new(o!("condition" => name.clone())),
            name,
            process_name: process_name.to_string(),
            period,
        }
    }

    fn process_running(&self) -> bool {
        let processes = match procfs::process::all_processes() {
            Ok(processes) => processes,
            Err(err) => {
                warn!(&self.logger, "Could not list processes"; "error" => %err);
                return false;
            }
        };
        for process in processes.flatten() {
            if let Ok(stat) = process.stat() {
                if comm_matches(&stat.comm, &self.process_name) {
                    return true;
                }
            }
        }
        false
    }
}

fn comm_matches(comm: &str, process_name: &str) -> bool {
    // comm is truncated to 15 bytes in /proc
    comm == process_name || (comm.len() == 15 && process_name.starts_with(comm))
}

impl InhibitingCondition for ActiveProcessInhibitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn does_inhibit(&mut self) -> bool {
        let running = self.process_running();
        debug!(&self.logger, "Checked for process"; "running" => running);
        running
    }
}

pub fn register(
    registrar: &mut Registrar,
    config: &ClientConfig,
    logger: &Logger,
) -> Result<(), PluginError> {
    let Some(section) = &config.active_process else {
        debug!(logger, "Skipping active-process registration, configuration is absent");
        return Ok(());
    };
    for process in &section.processes {
        let period =
            config::period_from_minutes("active_process.processes.period_min", process.period_min)?;
        info!(logger, "Registering active-process watch"; "process" => &process.name, "period_min" => process.period_min);
        registrar.accept(Rc::new(RefCell::new(ActiveProcessInhibitor::new(
            logger,
            &process.name,
            period,
        ))))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActiveProcessConfig, WatchedProcess};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn absent_section_registers_nothing() {
        let mut registrar = Registrar::new(&test_logger());
        register(&mut registrar, &ClientConfig::default(), &test_logger()).unwrap();
        assert!(registrar.is_empty());
    }

    #[test]
    fn each_watched_process_becomes_a_condition() {
        let mut registrar = Registrar::new(&test_logger());
        let config = ClientConfig {
            active_process: Some(ActiveProcessConfig {
                processes: vec![
                    WatchedProcess {
                        name: "ffmpeg".to_string(),
                        period_min: 2.0,
                    },
                    WatchedProcess {
                        name: "rsync".to_string(),
                        period_min: 1.0,
                    },
                ],
            }),
            ..ClientConfig::default()
        };
        register(&mut registrar, &config, &test_logger()).unwrap();
        assert_eq!(registrar.len(), 2);
        assert!(registrar.contains("ActiveProcess - ffmpeg"));
    }

    #[test]
    fn non_positive_periods_are_rejected() {
        let mut registrar = Registrar::new(&test_logger());
        let config = ClientConfig {
            active_process: Some(ActiveProcessConfig {
                processes: vec![WatchedProcess {
                    name: "ffmpeg".to_string(),
                    period_min: 0.0,
                }],
            }),
            ..ClientConfig::default()
        };
        assert!(register(&mut registrar, &config, &test_logger()).is_err());
    }

    #[test]
    fn finds_our_own_process() {
        let comm = procfs::process::Process::myself()
            .unwrap()
            .stat()
            .unwrap()
            .comm;
        let mut inhibitor =
            ActiveProcessInhibitor::new(&test_logger(), &comm, Duration::minutes(1));
        assert!(inhibitor.does_inhibit());
    }

    #[test]
    fn a_fictional_process_does_not_inhibit() {
        let mut inhibitor = ActiveProcessInhibitor::new(
            &test_logger(),
            "no-such-process-zzz",
            Duration::minutes(1),
        );
        assert!(!inhibitor.does_inhibit());
    }

    #[test]
    fn truncated_comm_still_matches() {
        assert!(comm_matches("a-very-long-pro", "a-very-long-process-name"));
        assert!(comm_matches("rsync", "rsync"));
        assert!(!comm_matches("rsync", "rsyncd"));
    }
}

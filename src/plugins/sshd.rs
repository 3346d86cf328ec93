//! Inhibits sleep while an inbound ssh session is active.
//!
//! Only incoming sessions count; outgoing connections from this host do
//! not inhibit. `max_periods` caps how long an idle session can keep the
//! machine awake.

use std::cell::RefCell;
use std::process::Command;
use std::rc::Rc;

use chrono::Duration;
use slog::{debug, info, o, warn, Logger};

use super::PluginError;
use crate::condition::{InhibitingCondition, Registrar};
use crate::config::{self, ClientConfig};

pub struct SshdInhibitor {
    logger: Logger,
    name: String,
    period: Duration,
    max_periods: u32,
    periods_inhibited: u32,
}

impl SshdInhibitor {
    pub fn new(parent_logger: &Logger, period: Duration, max_periods: u32) -> SshdInhibitor {
        let name = "Sshd".to_string();
        SshdInhibitor {
            logger: parent_logger.new(o!("condition" => name.clone())),
            name,
            period,
            max_periods,
            periods_inhibited: 0,
        }
    }

    fn session_active(&self) -> bool {
        let output = match Command::new("last").args(["-p", "now"]).output() {
            Ok(output) => output,
            Err(err) => {
                warn!(&self.logger, "Could not run 'last'"; "error" => %err);
                return false;
            }
        };
        if !output.status.success() {
            warn!(&self.logger, "'last' exited non-zero, could not check condition"; "status" => %output.status);
            return false;
        }
        contains_ssh_session(&String::from_utf8_lossy(&output.stdout))
    }

    /// Advances the consecutive-period counter and reports whether this
    /// period inhibits.
    fn update(&mut self, active: bool) -> bool {
        if active {
            self.periods_inhibited += 1;
        } else {
            self.periods_inhibited = 0;
        }
        self.periods_inhibited > 0 && self.periods_inhibited <= self.max_periods
    }
}

fn contains_ssh_session(last_output: &str) -> bool {
    last_output
        .split_whitespace()
        .any(|field| field == "ssh")
}

impl InhibitingCondition for SshdInhibitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn does_inhibit(&mut self) -> bool {
        let active = self.session_active();
        let inhibits = self.update(active);
        debug!(&self.logger, "Checked ssh sessions"; "active" => active,
               "consecutive_periods" => self.periods_inhibited);
        inhibits
    }
}

pub fn register(
    registrar: &mut Registrar,
    config: &ClientConfig,
    logger: &Logger,
) -> Result<(), PluginError> {
    let Some(section) = &config.sshd else {
        debug!(logger, "Skipping sshd registration, configuration is absent");
        return Ok(());
    };
    let period = config::period_from_minutes("sshd.period_min", section.period_min)?;
    info!(logger, "Registering sshd watch"; "period_min" => section.period_min, "max_periods" => section.max_periods);
    registrar.accept(Rc::new(RefCell::new(SshdInhibitor::new(
        logger,
        period,
        section.max_periods,
    ))))?;
    Ok(())
}

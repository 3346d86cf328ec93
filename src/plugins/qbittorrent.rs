//! Inhibits sleep while qBittorrent transfers at a meaningful rate.
//!
//! Talks to the Web UI API, which must be enabled in qBittorrent. Rates are
//! averaged over the check period rather than testing for merely-active
//! torrents: a transfer stuck at a trickle should not keep the host awake.
//! Short periods make the average noisy; a few minutes works well.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use slog::{debug, info, o, warn, Logger};

use super::PluginError;
use crate::condition::{InhibitingCondition, Registrar};
use crate::config::{self, ClientConfig, QbittorrentConfig, TransferChannelConfig};

const BYTES_PER_KB: f64 = 1024.0;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Channel {
    Downloading,
    Seeding,
}

impl Channel {
    fn as_str(self) -> &'static str {
        match self {
            Channel::Downloading => "downloading",
            Channel::Seeding => "seeding",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply of `/api/v2/transfer/info`, trimmed to the fields consumed here.
#[derive(Debug, Deserialize)]
struct TransferInfo {
    dl_info_data: u64,
    dl_info_speed: u64,
    up_info_data: u64,
    up_info_speed: u64,
}

#[derive(Debug, Copy, Clone)]
struct TimeBytes {
    time: DateTime<Utc>,
    bytes: u64,
}

pub struct QbittorrentInhibitor {
    logger: Logger,
    name: String,
    channel: Channel,
    period: Duration,
    min_bytes_per_sec: f64,
    host_url: String,
    username: Option<String>,
    password: Option<String>,
    agent: ureq::Agent,
    session_cookie: Option<String>,
    baseline: Option<TimeBytes>,
}

impl QbittorrentInhibitor {
    /// One inhibitor monitors one channel; monitor both by constructing two.
    pub fn new(
        parent_logger: &Logger,
        config: &QbittorrentConfig,
        channel: Channel,
        period: Duration,
        min_speed_kbps: f64,
    ) -> QbittorrentInhibitor {
        let name = format!("Qbittorrent - {}", channel);
        QbittorrentInhibitor {
            logger: parent_logger.new(o!("condition" => name.clone())),
            name,
            channel,
            period,
            min_bytes_per_sec: min_speed_kbps * BYTES_PER_KB,
            host_url: config.host_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            agent: ureq::Agent::new(),
            session_cookie: None,
            baseline: None,
        }
    }

    fn fetch_info(&mut self) -> Option<TransferInfo> {
        // One retry after re-authenticating on a 403
        for _ in 0..2 {
            let url = format!("{}/api/v2/transfer/info", self.host_url);
            let request = match &self.session_cookie {
                Some(cookie) => self.agent.get(&url).set("Cookie", cookie),
                None => self.agent.get(&url),
            };
            match request.call() {
                Ok(response) => match response.into_json() {
                    Ok(info) => return Some(info),
                    Err(err) => {
                        warn!(&self.logger, "Unexpected transfer-info payload"; "error" => %err);
                        return None;
                    }
                },
                Err(ureq::Error::Status(403, _)) => {
                    if !self.login() {
                        return None;
                    }
                }
                Err(err) => {
                    debug!(&self.logger, "Could not reach the Web UI"; "error" => %err);
                    return None;
                }
            }
        }
        None
    }

    fn login(&mut self) -> bool {
        let (Some(username), Some(password)) = (self.username.clone(), self.password.clone())
        else {
            warn!(&self.logger, "Web UI requires authentication but no credentials are configured");
            return false;
        };
        let url = format!("{}/api/v2/auth/login", self.host_url);
        match self
            .agent
            .post(&url)
            .send_form(&[("username", username.as_str()), ("password", password.as_str())])
        {
            Ok(response) => match response.header("set-cookie") {
                Some(cookie) => {
                    self.session_cookie =
                        Some(cookie.split(';').next().unwrap_or(cookie).to_string());
                    debug!(&self.logger, "Authenticated with the Web UI");
                    true
                }
                None => {
                    warn!(&self.logger, "Login succeeded but returned no session cookie");
                    false
                }
            },
            Err(err) => {
                warn!(&self.logger, "Could not log in to the Web UI"; "error" => %err);
                false
            }
        }
    }
}

/// Average transfer rate in bytes/sec since the baseline, falling back to
/// the instantaneous speed when there is no usable baseline (first check,
/// or the cumulative counter went backwards after a qBittorrent restart).
fn average_rate(
    baseline: Option<&TimeBytes>,
    now: DateTime<Utc>,
    bytes: u64,
    instantaneous: u64,
) -> f64 {
    match baseline {
        Some(base) if now > base.time && bytes >= base.bytes => {
            let elapsed_sec = (now - base.time).num_milliseconds() as f64 / 1_000.0;
            (bytes - base.bytes) as f64 / elapsed_sec
        }
        _ => instantaneous as f64,
    }
}

impl InhibitingCondition for QbittorrentInhibitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn does_inhibit(&mut self) -> bool {
        let Some(info) = self.fetch_info() else {
            self.baseline = None;
            return false;
        };
        let (bytes, speed) = match self.channel {
            Channel::Downloading => (info.dl_info_data, info.dl_info_speed),
            Channel::Seeding => (info.up_info_data, info.up_info_speed),
        };
        let now = Utc::now();
        let rate = average_rate(self.baseline.as_ref(), now, bytes, speed);
        self.baseline = Some(TimeBytes { time: now, bytes });

        let inhibits = rate >= self.min_bytes_per_sec;
        debug!(&self.logger, "Checked transfer rate"; "bytes_per_sec" => rate, "inhibits" => inhibits);
        inhibits
    }
}

pub fn register(
    registrar: &mut Registrar,
    config: &ClientConfig,
    logger: &Logger,
) -> Result<(), PluginError> {
    let Some(section) = &config.qbittorrent else {
        debug!(logger, "Skipping qbittorrent registration, configuration is absent");
        return Ok(());
    };
    let channels: [(Channel, &Option<TransferChannelConfig>); 2] = [
        (Channel::Downloading, &section.downloading),
        (Channel::Seeding, &section.seeding),
    ];
    for (channel, channel_config) in channels {
        let Some(channel_config) = channel_config else {
            continue;
        };
        let period =
            config::period_from_minutes("qbittorrent.period_min", channel_config.period_min)?;
        info!(logger, "Registering qbittorrent watch"; "channel" => %channel,
              "min_speed_kbps" => channel_config.min_speed_kbps);
        registrar.accept(Rc::new(RefCell::new(QbittorrentInhibitor::new(
            logger,
            section,
            channel,
            period,
            channel_config.min_speed_kbps,
        ))))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn first_check_uses_the_instantaneous_speed() {
        let now = Utc::now();
        assert_eq!(average_rate(None, now, 5_000_000, 2_048), 2_048.0);
    }

    #[test]
    fn later_checks_average_over_the_elapsed_time() {
        let now = Utc::now();
        let baseline = TimeBytes {
            time: now - Duration::seconds(10),
            bytes: 1_000_000,
        };
        let rate = average_rate(Some(&baseline), now, 1_000_000 + 10 * 4_096, 999_999);
        assert!((rate - 4_096.0).abs() < 1.0);
    }

    #[test]
    fn counter_reset_falls_back_to_the_instantaneous_speed() {
        let now = Utc::now();
        let baseline = TimeBytes {
            time: now - Duration::seconds(10),
            bytes: 9_000_000,
        };
        // qBittorrent restarted; cumulative bytes went backwards
        assert_eq!(average_rate(Some(&baseline), now, 100, 512), 512.0);
    }

    fn section(
        downloading: Option<TransferChannelConfig>,
        seeding: Option<TransferChannelConfig>,
    ) -> ClientConfig {
        ClientConfig {
            qbittorrent: Some(QbittorrentConfig {
                host_url: "http://localhost:8080".to_string(),
                username: None,
                password: None,
                downloading,
                seeding,
            }),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn each_configured_channel_becomes_a_condition() {
        let mut registrar = Registrar::new(&test_logger());
        let config = section(
            Some(TransferChannelConfig {
                period_min: 5.0,
                min_speed_kbps: 100.0,
            }),
            Some(TransferChannelConfig {
                period_min: 10.0,
                min_speed_kbps: 50.0,
            }),
        );
        register(&mut registrar, &config, &test_logger()).unwrap();
        assert_eq!(registrar.len(), 2);
        assert!(registrar.contains("Qbittorrent - downloading"));
        assert!(registrar.contains("Qbittorrent - seeding"));
    }

    #[test]
    fn unconfigured_channels_are_skipped() {
        let mut registrar = Registrar::new(&test_logger());
        let config = section(
            Some(TransferChannelConfig {
                period_min: 5.0,
                min_speed_kbps: 100.0,
            }),
            None,
        );
        register(&mut registrar, &config, &test_logger()).unwrap();
        assert_eq!(registrar.len(), 1);
    }

    #[test]
    fn absent_section_registers_nothing() {
        let mut registrar = Registrar::new(&test_logger());
        register(&mut registrar, &ClientConfig::default(), &test_logger()).unwrap();
        assert!(registrar.is_empty());
    }
}

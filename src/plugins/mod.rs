//! Built-in inhibiting conditions.
//!
//! The registry is an explicit list compiled into the binary: each plugin's
//! `register` function constructs conditions from its config section and
//! hands them to the registrar. A plugin whose section is absent from the
//! config is skipped.

pub mod active_process;
pub mod qbittorrent;
pub mod sshd;

use slog::Logger;
use thiserror::Error;

use crate::condition::{Registrar, RegistrarError};
use crate::config::{ClientConfig, ConfigError};

#[derive(Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registrar(#[from] RegistrarError),
}

pub fn register_all(
    registrar: &mut Registrar,
    config: &ClientConfig,
    logger: &Logger,
) -> Result<(), PluginError> {
    active_process::register(registrar, config, logger)?;
    sshd::register(registrar, config, logger)?;
    qbittorrent::register(registrar, config, logger)?;
    Ok(())
}

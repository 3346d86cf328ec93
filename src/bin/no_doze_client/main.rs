use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use no_doze::client::NoDozeClient;
use no_doze::condition::Registrar;
use no_doze::config::ClientConfig;
use no_doze::plugins;
use no_doze::root_logger;

#[derive(Parser, Debug)]
#[command(
    name = "no-doze-client",
    about = "Inhibit sleep based on plugins; communicates with no-dozed",
    version
)]
struct Cli {
    /// Path to the YAML config file
    #[arg(
        short = 'c',
        long = "config",
        default_value = "resources/no-doze-client.yml"
    )]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ClientConfig::load(&cli.config)
        .with_context(|| format!("Could not load config from {}", cli.config.display()))?;
    let logger = root_logger(config.general.log_level().context("Invalid logging_level")?);

    let mut registrar = Registrar::new(&logger);
    plugins::register_all(&mut registrar, &config, &logger)
        .context("Could not register inhibiting conditions")?;

    let retry_delay = config.general.retry_delay().context("Invalid retry_delay_sec")?;
    let startup_delay = config
        .general
        .startup_delay()
        .context("Invalid startup_delay_min")?;
    let mut client = NoDozeClient::new(&logger, &config.general.base_dir, retry_delay, startup_delay)
        .context("Could not create client")?;
    for condition in registrar.into_conditions() {
        client.add_condition(condition);
    }
    client.run().context("Client loop failed")?;
    Ok(())
}

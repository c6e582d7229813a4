//! Device probe binary.
//!
//! Connects to a prompt-driven device on demand, runs each command given on
//! the command line as its own exclusive session, prints the output and closes
//! the connection.

use clap::Parser;
use devlink_idle::OnDemandConnection;
use devlink_session::Link;
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod device;
mod logging;

use config::DeviceConfig;
use device::{run_command, DeviceDialer};
use logging::DevlinkLogFormatter;

/// Run commands against a prompt-driven device
#[derive(Parser, Debug)]
#[command(name = "devlink-probe", version, about = "Run commands on a prompt-driven device")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "devlink.yaml")]
    config: PathBuf,

    /// Device address, e.g. 10.0.0.5:23
    #[arg(long)]
    address: Option<String>,

    /// Dial with TLS at this version (1.0 or 1.2)
    #[arg(long)]
    tls_version: Option<String>,

    /// Dial, write and read timeout, e.g. 5s
    #[arg(long)]
    timeout: Option<humantime::Duration>,

    /// Idle period before the connection is closed, e.g. 30s
    #[arg(long)]
    keep_alive: Option<humantime::Duration>,

    /// Prompt terminating command output (repeatable)
    #[arg(long)]
    prompt: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Commands to run, one session each
    #[arg(required = true)]
    commands: Vec<String>,
}

impl Args {
    /// Command-line flags override file and environment settings
    fn apply_to(&self, config: &mut DeviceConfig) {
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(version) = &self.tls_version {
            config.tls_version = Some(version.clone());
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout.into();
        }
        if let Some(keep_alive) = self.keep_alive {
            config.keep_alive = keep_alive.into();
        }
        if !self.prompt.is_empty() {
            config.prompts = self.prompt.clone();
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("devlink={}", args.log_level).parse()?)
        .add_directive(format!("devlink_idle={}", args.log_level).parse()?)
        .add_directive(format!("devlink_session={}", args.log_level).parse()?);

    let formatter = DevlinkLogFormatter::new("devlink-probe");

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(formatter)
        .init();

    info!("Starting devlink-probe v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DeviceConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let dialer = DeviceDialer::from_config(&config)?;
    let prompts = dialer.prompts().to_vec();
    let conn = OnDemandConnection::new(dialer, Link::failed);
    conn.set_keep_alive(config.keep_alive);

    let run = async {
        let mut failures = 0usize;
        for command in &args.commands {
            let link = conn.connection().await;
            match run_command(&link, command, &prompts).await {
                Ok(output) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&output)?;
                    stdout.write_all(b"\n")?;
                    stdout.flush()?;
                }
                Err(e) => {
                    error!("Command {:?} failed: {}", command, e);
                    failures += 1;
                }
            }
        }
        Ok::<_, anyhow::Error>(failures)
    };

    let outcome = tokio::select! {
        result = run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing connection");
            Ok(0)
        }
    };

    conn.close().await?;
    info!("Connection closed");

    let failures = outcome?;
    if failures > 0 {
        anyhow::bail!("{} of {} commands failed", failures, args.commands.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "devlink-probe",
            "--address",
            "192.0.2.7:23",
            "--keep-alive",
            "2m",
            "--prompt",
            "sw> ",
            "--prompt",
            "sw# ",
            "show version",
        ]);

        let mut config = DeviceConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.address, "192.0.2.7:23");
        assert_eq!(config.keep_alive, Duration::from_secs(120));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.prompts, vec!["sw> ".to_string(), "sw# ".to_string()]);
        assert_eq!(args.commands, vec!["show version".to_string()]);
    }

    #[test]
    fn test_commands_required() {
        assert!(Args::try_parse_from(["devlink-probe", "--address", "host:23"]).is_err());
    }
}

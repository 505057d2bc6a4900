use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use notify_channel::{ChannelConfig, LifecycleEvent, NotificationManager, RetryPolicy};

pub mod output;
pub mod token;

use output::OutputFormat;
use token::TokenSource;

/// Notification listener
///
/// Connects to the notification broker with a bearer token, keeps the
/// subscription alive across failures and token rotation, and prints every
/// notification it receives until Ctrl+C.
#[derive(Parser, Debug)]
#[command(name = "notify-listen")]
#[command(about = "Print notifications from a STOMP-over-WebSocket broker")]
#[command(version)]
pub struct Args {
    /// Base URL of the broker (http/https/ws/wss)
    #[arg(long, env = "NOTIFY_BROKER_URL")]
    pub base_url: String,

    /// Bearer token
    #[arg(long, env = "NOTIFY_TOKEN", hide_env_values = true, conflicts_with = "token_file")]
    pub token: Option<String>,

    /// File holding the bearer token, re-read on every credential poll
    #[arg(long)]
    pub token_file: Option<PathBuf>,

    /// Subscription destination
    #[arg(long, default_value = "/user/queue/notifications")]
    pub destination: String,

    /// Seconds between reconnection attempts
    #[arg(long, default_value = "10")]
    pub retry_secs: u64,

    /// Seconds between credential polls
    #[arg(long, default_value = "5")]
    pub poll_secs: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print notifications as raw JSON, one per line
    #[arg(long)]
    pub json: bool,
}

impl Args {
    /// Validate command line arguments
    pub fn validate(&self) -> Result<()> {
        if self.token.is_none() && self.token_file.is_none() {
            return Err(anyhow::anyhow!(
                "A token is required: pass --token, --token-file or set NOTIFY_TOKEN"
            ));
        }

        if self.retry_secs == 0 {
            return Err(anyhow::anyhow!("Retry interval must be positive"));
        }

        if self.poll_secs == 0 {
            return Err(anyhow::anyhow!("Credential poll interval must be positive"));
        }

        match self.log_level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
                    self.log_level
                ));
            }
        }

        Ok(())
    }

    /// Channel configuration described by these arguments
    pub fn channel_config(&self) -> Result<ChannelConfig> {
        let config = ChannelConfig::new(&self.base_url)
            .with_destination(&self.destination)
            .with_retry_policy(RetryPolicy::Fixed(Duration::from_secs(self.retry_secs)))
            .with_credential_poll_interval(Duration::from_secs(self.poll_secs));
        config
            .validate()
            .with_context(|| format!("Invalid broker configuration for {}", self.base_url))?;
        Ok(config)
    }

    pub fn token_source(&self) -> TokenSource {
        match (&self.token, &self.token_file) {
            (_, Some(path)) => TokenSource::File(path.clone()),
            (Some(token), None) => TokenSource::Fixed(token.clone()),
            (None, None) => TokenSource::Fixed(String::new()),
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

/// Initialize tracing/logging with the specified log level
fn init_tracing(log_level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_lowercase())),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

async fn run(args: Args) -> Result<()> {
    let config = args.channel_config()?;
    let format = args.output_format();

    let manager = NotificationManager::builder(config)
        .credentials(args.token_source())
        .build()
        .context("Failed to build the notification channel")?;

    let _notifications = manager.add_notification_handler(move |payload| {
        println!("{}", output::render(payload, format));
    });
    let _locale = manager.add_locale_update_handler(|payload| async move {
        println!("{}", output::render_locale(&payload));
    });

    // Subscribe before forwarding Ctrl+C so the event cannot be missed.
    let mut lifecycle = manager.lifecycle().subscribe();
    manager.lifecycle().forward_ctrl_c();

    info!(
        base_url = %args.base_url,
        destination = %args.destination,
        "Listening for notifications, press Ctrl+C to stop"
    );
    manager.enable();

    loop {
        match lifecycle.recv().await {
            Ok(LifecycleEvent::Terminating) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed lifecycle events"),
        }
    }

    manager.disable();
    let stats = manager.stats();
    info!(
        delivered = stats.messages_dispatched,
        dropped = stats.messages_dropped,
        reconnects = stats.reconnects,
        "Stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;
    init_tracing(&args.log_level)?;

    run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["notify-listen", "--base-url", "https://api.example.com"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--token", "abc"]);
        assert_eq!(args.destination, "/user/queue/notifications");
        assert_eq!(args.retry_secs, 10);
        assert_eq!(args.poll_secs, 5);
        assert!(!args.json);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_token_and_token_file_conflict() {
        let result = Args::try_parse_from([
            "notify-listen",
            "--base-url",
            "https://api.example.com",
            "--token",
            "abc",
            "--token-file",
            "/tmp/token",
        ]);
        assert!(result.is_err());
    }

    #[rstest]
    #[case(&["--token", "abc", "--retry-secs", "0"])]
    #[case(&["--token", "abc", "--poll-secs", "0"])]
    #[case(&["--token", "abc", "--log-level", "loud"])]
    fn test_invalid_arguments(#[case] extra: &[&str]) {
        assert!(parse(extra).validate().is_err());
    }

    #[test]
    fn test_channel_config_from_arguments() {
        let args = parse(&["--token", "abc", "--retry-secs", "3", "--destination", "/topic/all"]);
        let config = args.channel_config().unwrap();
        assert_eq!(config.destination, "/topic/all");
        assert_eq!(config.retry_policy, RetryPolicy::Fixed(Duration::from_secs(3)));
        assert_eq!(
            config.endpoint_url("abc").unwrap().as_str(),
            "wss://api.example.com/ws?token=abc"
        );
    }

    #[test]
    fn test_token_file_wins_over_fixed_token() {
        let args = parse(&["--token-file", "/run/secrets/token"]);
        assert!(matches!(args.token_source(), TokenSource::File(_)));
    }
}

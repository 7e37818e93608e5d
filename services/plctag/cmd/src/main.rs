//! plctag registry soak binary.
//!
//! Drives the session/request registry with concurrent producers, a reaper and
//! a pending-list walker against one session, then checks that the session's
//! reference count matches its owner plus the requests left attached.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod soak;

use config::SoakConfig;
use logging::PlcLogFormatter;

/// Soak test for the plctag session/request registry
#[derive(Parser, Debug)]
#[command(name = "plctag-soak", version, about = "Soak test for the plctag session/request registry")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Producer threads (overrides config)
    #[arg(long)]
    producers: Option<usize>,

    /// Requests per producer (overrides config)
    #[arg(long)]
    requests_per_producer: Option<usize>,

    /// Keep every n-th request attached, 0 keeps none (overrides config)
    #[arg(long)]
    keep_every: Option<usize>,

    /// Upper bound on live requests (overrides config)
    #[arg(long)]
    max_requests: Option<usize>,

    /// Treat detaching from the wrong session as an error
    #[arg(long)]
    strict_detach: bool,

    /// Pause between pending-list walks, e.g. 1ms
    #[arg(long)]
    walk_interval: Option<humantime::Duration>,

    /// Number of soak passes
    #[arg(long, default_value_t = 1)]
    passes: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply_to(&self, config: &mut SoakConfig) {
        if let Some(n) = self.producers {
            config.producers = n;
        }
        if let Some(n) = self.requests_per_producer {
            config.requests_per_producer = n;
        }
        if let Some(n) = self.keep_every {
            config.keep_every = n;
        }
        if let Some(n) = self.max_requests {
            config.registry.max_requests = Some(n);
        }
        if self.strict_detach {
            config.registry.strict_detach = true;
        }
        if let Some(interval) = self.walk_interval.as_deref() {
            config.walk_interval = *interval;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("plctag_soak={}", args.log_level).parse()?)
        .add_directive(format!("plctag_session={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(PlcLogFormatter::new("plctag"))
        .init();

    info!("Starting plctag soak v{}", env!("CARGO_PKG_VERSION"));

    let mut config = SoakConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config.validate()?;

    for pass in 1..=args.passes {
        let report = soak::run(&config).await?;
        info!(
            "Pass {}/{}: created={} destroyed={} kept={} pool_retries={} walks={} max_depth={} elapsed={:?}",
            pass,
            args.passes,
            report.created,
            report.destroyed,
            report.kept,
            report.pool_retries,
            report.walks,
            report.max_depth,
            report.elapsed
        );
    }

    info!("Soak finished, count parity held on every pass");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "plctag-soak",
            "--producers",
            "2",
            "--max-requests",
            "64",
            "--strict-detach",
            "--walk-interval",
            "3ms",
        ]);

        let mut config = SoakConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.producers, 2);
        assert_eq!(config.requests_per_producer, 100);
        assert_eq!(config.registry.max_requests, Some(64));
        assert!(config.registry.strict_detach);
        assert_eq!(config.walk_interval, std::time::Duration::from_millis(3));
    }
}

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tiersync::{AvifTranscoder, S3Store, SyncConfig, SyncPipeline, ZipDirectory};

#[derive(Debug, PartialEq, Eq)]
struct Args {
    config: PathBuf,
    dry_run: bool,
}

fn print_usage() {
    eprintln!("Usage: tiersync [--config <file>] [--dry-run]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <file>  Sync configuration [default: tiersync.json]");
    eprintln!("  --dry-run        Log remote changes instead of making them");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG         Full tracing filter");
    eprintln!("  TIERSYNC_LOG     Log level when RUST_LOG is unset [default: info]");
    eprintln!("  LOG_FORMAT=json  Emit JSON log lines");
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            print_usage();
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!(error = %format!("{e:#}"), "Sync failed");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut config = PathBuf::from("tiersync.json");
    let mut dry_run = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                config = PathBuf::from(args.get(i).ok_or("--config requires a value")?);
            }
            "--dry-run" | "-n" => dry_run = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Args { config, dry_run })
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TIERSYNC_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        // SDK internals stay at warn.
        EnvFilter::new(format!("warn,tiersync={level},tiersync_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = SyncConfig::load(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if args.dry_run {
        config.dry_run = true;
    }

    tracing::info!(
        bucket = %config.s3.bucket,
        prefix = %config.key_prefix(),
        archive_dir = %config.archive_dir.display(),
        dry_run = config.dry_run,
        "Starting sync"
    );

    let store = S3Store::new(config.s3.clone()).await;
    let pipeline = SyncPipeline::from_config(
        &config,
        Arc::new(ZipDirectory::new(&config.archive_dir)),
        Arc::new(AvifTranscoder),
        Arc::new(store),
    )
    .await
    .context("Failed to set up sync")?;

    let report = pipeline.run().await.context("Sync aborted")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to encode report")?
    );

    if report.failed > 0 || report.archives_failed > 0 {
        anyhow::bail!(
            "{} entries and {} archives failed",
            report.failed,
            report.archives_failed
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("tiersync")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        assert_eq!(
            parse_args(&argv(&[])).unwrap(),
            Args {
                config: PathBuf::from("tiersync.json"),
                dry_run: false,
            }
        );
    }

    #[test]
    fn config_and_dry_run_flags() {
        assert_eq!(
            parse_args(&argv(&["--dry-run", "--config", "/etc/tiersync.json"])).unwrap(),
            Args {
                config: PathBuf::from("/etc/tiersync.json"),
                dry_run: true,
            }
        );
        assert_eq!(
            parse_args(&argv(&["-n", "-c", "sync.json"])).unwrap(),
            Args {
                config: PathBuf::from("sync.json"),
                dry_run: true,
            }
        );
    }

    #[test]
    fn bad_arguments_are_rejected() {
        assert_eq!(
            parse_args(&argv(&["--config"])).unwrap_err(),
            "--config requires a value"
        );
        assert_eq!(
            parse_args(&argv(&["--verbose"])).unwrap_err(),
            "unknown flag: --verbose"
        );
        assert_eq!(
            parse_args(&argv(&["extra"])).unwrap_err(),
            "unexpected argument: extra"
        );
        assert_eq!(parse_args(&argv(&["--help"])).unwrap_err(), "");
    }
}

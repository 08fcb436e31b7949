use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use smart_relay::config::Config;
use smart_relay::service::{wait_for_exit_or_reload, ReloadOrExit, RelayService};

/// Hard ceiling on top of each server's own drain deadline: if a reload or
/// shutdown signal arrives, the process waits at most this long for every
/// listener to release its bind address before moving on.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(25);

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Args {
    config_path: PathBuf,
    log_dir: Option<PathBuf>,
    pidfile: Option<PathBuf>,
    show_version: bool,
}

fn parse_args() -> Args {
    let mut config_path = PathBuf::from("relay.toml");
    let mut log_dir = None;
    let mut pidfile = None;
    let mut show_version = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-config" => {
                if let Some(v) = args.next() {
                    config_path = PathBuf::from(v);
                }
            }
            "-logs" | "-logdir" => {
                if arg == "-logdir" {
                    eprintln!("warning: -logdir is deprecated, use -logs");
                }
                if let Some(v) = args.next() {
                    log_dir = Some(PathBuf::from(v));
                }
            }
            "-pidfile" => {
                if let Some(v) = args.next() {
                    pidfile = Some(PathBuf::from(v));
                }
            }
            "-v" | "-version" => show_version = true,
            other => eprintln!("warning: unrecognized flag {}", other),
        }
    }

    Args {
        config_path,
        log_dir,
        pidfile,
        show_version,
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    if args.show_version {
        println!("smart-relay {}", VERSION);
        return;
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    if let Some(dir) = &args.log_dir {
        tracing::info!(log_dir = %dir.display(), "log directory configured");
    }
    if let Some(pidfile) = &args.pidfile {
        let _ = std::fs::write(pidfile, std::process::id().to_string());
    }

    loop {
        let config = match Config::load_from_file(&args.config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!(error = %e, "failed to load config");
                exit(1);
            }
        };

        let service = match RelayService::new(&config) {
            Ok(service) => service,
            Err(e) => {
                tracing::error!(error = %e, "failed to build relay service");
                exit(1);
            }
        };
        let service = Arc::new(service);

        let mut run_handle = {
            let service = service.clone();
            tokio::spawn(async move { service.run().await })
        };

        tokio::select! {
            result = &mut run_handle => {
                if let Ok(Err(e)) = result {
                    tracing::error!(error = %e, "relay service exited with error");
                    exit(1);
                }
                break;
            }
            reload = wait_for_exit_or_reload() => {
                let action = match reload {
                    Ok(action) => action,
                    Err(e) => {
                        tracing::error!(error = %e, "signal handling failed");
                        exit(1);
                    }
                };

                // Stop accepting new connections and wait for listeners to
                // release their bind addresses before reloading or exiting,
                // bounded so a stuck drain can't wedge the process forever.
                service.shutdown();
                tokio::select! {
                    result = &mut run_handle => {
                        if let Ok(Err(e)) = result {
                            tracing::error!(error = %e, "relay service exited with error during shutdown");
                        }
                    }
                    _ = tokio::time::sleep(SHUTDOWN_DEADLINE) => {
                        tracing::warn!("graceful shutdown deadline exceeded, aborting remaining listeners");
                        run_handle.abort();
                    }
                }

                match action {
                    ReloadOrExit::Reload => {
                        tracing::info!("SIGHUP received, reloading configuration");
                        continue;
                    }
                    ReloadOrExit::Exit => {
                        tracing::info!("shutdown signal received, exiting");
                        break;
                    }
                }
            }
        }
    }
}

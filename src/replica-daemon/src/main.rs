mod daemon;

use log::error;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::daemon::{run_replica_daemon, DaemonRunOptions, DEFAULT_CYCLE_INTERVAL_SECS};

fn usage() -> String {
    format!(
        "usage: replica-daemon <config.json> [--once] [--interval <secs>]\n\
         defaults:\n\
         --interval {}",
        DEFAULT_CYCLE_INTERVAL_SECS
    )
}

fn parse_args(args: &[String]) -> Result<DaemonRunOptions, String> {
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut config_path: Option<PathBuf> = None;
    let mut once = false;
    let mut interval = Duration::from_secs(DEFAULT_CYCLE_INTERVAL_SECS);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--once" => once = true,
            "--interval" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --interval".to_string())?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --interval value: {}", value))?;
                interval = Duration::from_secs(secs);
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
            other => {
                if config_path.is_some() {
                    return Err(format!("unexpected argument: {}\n{}", other, usage()));
                }
                config_path = Some(PathBuf::from(other));
            }
        }
        i += 1;
    }

    Ok(DaemonRunOptions {
        config_path: config_path.ok_or_else(usage)?,
        once,
        interval,
    })
}

fn main() {
    env_logger::init();
    let args = env::args().skip(1).collect::<Vec<String>>();
    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_replica_daemon(options) {
        error!("run replica-daemon failed: {}", err);
        std::process::exit(1);
    }
}

use std::process::ExitCode;

use log::{error, warn};

use urs485d::config::DaemonConfig;
use urs485d::error::DaemonError;
use urs485d::reactor::Daemon;
use urs485d::cli;

fn main() -> ExitCode {
    let args = cli::parse();

    let config = match DaemonConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            env_logger::init();
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if let Some(stream) = args.log_stream.as_deref().or(config.log_stream.as_deref()) {
        builder.target(match stream {
            "stdout" => env_logger::Target::Stdout,
            "stderr" => env_logger::Target::Stderr,
            other => {
                // Syslog and other named streams are not wired up yet;
                // fall back to stderr rather than silently drop logs.
                eprintln!("unsupported log stream {other:?}, using stderr");
                env_logger::Target::Stderr
            }
        });
    }
    builder.init();

    if !args.foreground {
        warn!("daemonizing is not implemented; run under a service supervisor instead");
    }

    match Daemon::new(config).and_then(|mut d| d.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(e),
    }
}

fn report(e: DaemonError) -> ExitCode {
    error!("{e}");
    ExitCode::FAILURE
}

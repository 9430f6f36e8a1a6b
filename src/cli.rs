//! Command-line argument parsing.
//!
//! A small surface: it only points at a config file and offers a couple
//! of overrides.

use std::path::PathBuf;

use bpaf::Bpaf;

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version)]
pub struct Args {
    /// Path to the TOML configuration file
    #[bpaf(long, short('c'), argument("PATH"), fallback(PathBuf::from("/etc/urs485/config.toml")))]
    pub config: PathBuf,

    /// Stay attached to the controlling terminal instead of daemonizing
    #[bpaf(long)]
    pub foreground: bool,

    /// Override the configured log stream (e.g. "stderr", "syslog")
    #[bpaf(long, argument("STREAM"), optional)]
    pub log_stream: Option<String>,
}

pub fn parse() -> Args {
    args().run()
}

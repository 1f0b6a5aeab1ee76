use std::path::PathBuf;

use crate::error::{DaemonError, Result};

pub const USAGE: &str = "\
Play URLs from AMQP messages via mpv, cache URLs

Usage: rpimusicd --config <path> [--debug]

Options:
  --config <path>  path to config file
  --debug          activate debugging output
  -h, --help       print this help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub config: PathBuf,
    pub debug: bool,
}

/// Parse arguments (without the program name). `Ok(None)` means help was
/// requested.
pub fn parse<I>(args: I) -> Result<Option<Cli>>
where
    I: IntoIterator<Item = String>,
{
    let mut config = None;
    let mut debug = false;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--debug" => debug = true,
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| DaemonError::Config("--config needs a path".into()))?;
                config = Some(PathBuf::from(path));
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    config = Some(PathBuf::from(path));
                } else {
                    return Err(DaemonError::Config(format!("unexpected argument {other:?}")));
                }
            }
        }
    }

    let config =
        config.ok_or_else(|| DaemonError::Config("the --config argument is required".into()))?;
    Ok(Some(Cli { config, debug }))
}

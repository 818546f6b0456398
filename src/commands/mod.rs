pub mod config;
pub mod logs;
pub mod run;
pub mod schedule;
pub mod status;
pub mod stop;

use anyhow::Result;
use serde::Serialize;

/// Commands print machine-readable results on stdout; logs go to stderr
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

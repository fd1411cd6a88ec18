use log::LevelFilter;

use crate::error::{DbError, DbResult};

/// Map a textual level (as a CLI layer passes it) onto a filter.
pub fn convert_str_to_level(level: &str) -> DbResult<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::Off),
        "err" | "error" => Ok(LevelFilter::Error),
        "warn" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        other => Err(DbError::binder(format!(
            "unsupported logging level: {}",
            other
        ))),
    }
}

/// Initialize env_logger with file/line prefixes; safe to call more
/// than once.
pub fn init_log() {
    use std::io::Write;

    let mut builder = env_logger::Builder::from_default_env();
    let _ = builder
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} - {}] [{}:{}] {}",
                record.level(),
                record.target(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(convert_str_to_level("info").unwrap(), LevelFilter::Info);
        assert_eq!(convert_str_to_level("ERR").unwrap(), LevelFilter::Error);
        assert!(convert_str_to_level("loud").is_err());
    }
}

//! Config file loading and validation.

use std::path::Path;

use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::types::DaemonConfig;

/// Load the daemon configuration.
///
/// With `path = None` the built-in defaults are used unchanged. Otherwise
/// the file is parsed as TOML over the defaults (`#[serde(default)]` per
/// section) and validated.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed, or if
/// the result fails validation.
pub fn load(path: Option<&Path>) -> ConfigResult<DaemonConfig> {
    let config = match path {
        None => DaemonConfig::default(),
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let config: DaemonConfig =
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            info!(path = %path.display(), "loaded daemon config");
            config
        },
    };
    validate(&config)?;
    Ok(config)
}

/// Validation rules that serde cannot express.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] naming the first violated rule.
pub(crate) fn validate(config: &DaemonConfig) -> ConfigResult<()> {
    if config.completion.workers == 0 {
        return Err(ConfigError::Invalid("completion.workers must be > 0".into()));
    }
    if config.completion.max_concurrent == 0 {
        return Err(ConfigError::Invalid(
            "completion.max_concurrent must be > 0".into(),
        ));
    }
    if config.completion.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "completion.retry.max_attempts must be > 0".into(),
        ));
    }
    if config.transport.inbound_capacity == 0 {
        return Err(ConfigError::Invalid(
            "transport.inbound_capacity must be > 0".into(),
        ));
    }
    if config.transport.outbound_watermark == 0 {
        return Err(ConfigError::Invalid(
            "transport.outbound_watermark must be > 0".into(),
        ));
    }
    if config.session.lock_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "session.lock_timeout_secs must be > 0".into(),
        ));
    }
    if !matches!(config.logging.format.as_str(), "text" | "json") {
        return Err(ConfigError::Invalid(format!(
            "logging.format must be \"text\" or \"json\", got {:?}",
            config.logging.format
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_defaults_without_file() {
        let config = load(None).unwrap();
        assert_eq!(config.completion.workers, 4);
    }

    #[test]
    fn test_load_overrides_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[completion]\nworkers = 2\n\n[transport]\nsocket_path = \"/tmp/k.sock\"\n"
        )
        .unwrap();
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.completion.workers, 2);
        assert_eq!(
            config.transport.socket_path,
            std::path::PathBuf::from("/tmp/k.sock")
        );
        // Untouched sections keep defaults.
        assert_eq!(config.session.lock_timeout_secs, 600);
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[completion]\nworkers = 0\n").unwrap();
        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validation_rejects_unknown_log_format() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nformat = \"xml\"\n").unwrap();
        assert!(load(Some(file.path())).is_err());
    }
}

//! Configuration loading

use anyhow::Result;

use crate::config::{Config, TransportKind};

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub topic: Option<String>,
    pub transport: Option<TransportKind>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(topic) = &self.topic {
            config.upstream.topic.clone_from(topic);
        }
        if let Some(transport) = self.transport {
            config.upstream.transport = transport;
        }
    }
}

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `explicit_path` (from the command line)
/// 2. `STREAMRELAY_CONFIG_PATH` environment variable
/// 3. ./streamrelay.yaml (current working directory)
/// 4. Fall back to environment variables only
///
/// A path given explicitly must exist; only the implicit locations are
/// skipped when missing.
///
/// Logging is not initialised yet when this runs, so progress goes to stderr.
pub fn load_config(explicit_path: Option<&str>, overrides: &ConfigOverrides) -> Result<Config> {
    if let Some(path) = explicit_path {
        if !std::path::Path::new(path).exists() {
            anyhow::bail!("Config file not found: {path}");
        }
    }

    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| {
            std::env::var("STREAMRELAY_CONFIG_PATH")
                .ok()
                .filter(|p| std::path::Path::new(p).exists())
        })
        .or_else(|| {
            let cwd = "streamrelay.yaml";
            std::path::Path::new(cwd).exists().then(|| cwd.to_string())
        });

    let mut config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config from environment: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    overrides.apply(&mut config);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "server:\n  port: 5005\nupstream:\n  topic: from/file\n").unwrap();

        let overrides = ConfigOverrides {
            port: Some(6006),
            topic: None,
            transport: Some(TransportKind::Memory),
        };
        let config = load_config(path.to_str(), &overrides).unwrap();

        assert_eq!(config.server.port, 6006);
        assert_eq!(config.upstream.topic, "from/file");
        assert_eq!(config.upstream.transport, TransportKind::Memory);
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("typo.yaml");

        let err = load_config(missing.to_str(), &ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
        assert!(err.to_string().contains("typo.yaml"));
    }

    #[test]
    fn test_invalid_override_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "relay:\n  buffer_capacity: 10\n").unwrap();

        let overrides = ConfigOverrides {
            topic: Some(String::new()),
            ..ConfigOverrides::default()
        };
        let err = load_config(path.to_str(), &overrides).unwrap_err();
        assert!(err.to_string().contains("upstream.topic"));
    }
}

// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a file (YAML or JSON).
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let extension = path.extension().and_then(|s| s.to_str());
    let config: Config = if matches!(extension, Some("yaml") | Some("yml")) {
        serde_yaml::from_str(&contents).context("failed to parse YAML config")?
    } else {
        serde_json::from_str(&contents).context("failed to parse JSON config")?
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "servers:\n  - host: 127.0.0.1\n    port: 3001\n    weight: 2\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].weight, 2);
    }

    #[test]
    fn loads_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"servers": [{{"host": "a", "port": 1}}]}}"#).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.servers[0].id(), "a:1");
    }

    #[test]
    fn invalid_config_is_rejected_at_load() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"servers": []}}"#).unwrap();
        assert!(load_config(file.path()).is_err());
    }
}

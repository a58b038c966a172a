use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::ConfigError;

/// Resource limits and port range for per-session app containers.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    pub image: String,
    pub memory: String,
    pub cpus: f64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Seconds to wait for the dev servers to answer HTTP after start.
    pub health_check_timeout: u64,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "node:20-slim".to_string(),
            memory: "2g".to_string(),
            cpus: 1.0,
            port_range_start: 5100,
            port_range_end: 5999,
            health_check_timeout: 120,
            env: HashMap::new(),
        }
    }
}

/// Raw TOML structure for `sandbox.toml`
#[derive(Debug, Deserialize)]
struct SandboxToml {
    sandbox: Option<SandboxSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    image: Option<String>,
    memory: Option<String>,
    cpus: Option<f64>,
    port_range: Option<[u16; 2]>,
    health_check_timeout: Option<u64>,
    env: Option<HashMap<String, String>>,
}

impl SandboxConfig {
    /// Load sandbox config from the given `sandbox.toml`.
    /// Returns defaults if the file doesn't exist.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;

        let toml: SandboxToml = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: config_path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut config = Self::default();
        if let Some(section) = toml.sandbox {
            if let Some(image) = section.image {
                config.image = image;
            }
            if let Some(memory) = section.memory {
                config.memory = memory;
            }
            if let Some(cpus) = section.cpus {
                config.cpus = cpus;
            }
            if let Some([start, end]) = section.port_range {
                config.port_range_start = start;
                config.port_range_end = end;
            }
            if let Some(timeout) = section.health_check_timeout {
                config.health_check_timeout = timeout;
            }
            if let Some(env) = section.env {
                config.env = env;
            }
        }

        config.validate(config_path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        if self.port_range_end <= self.port_range_start {
            return Err(invalid(format!(
                "port_range end {} must be above start {}",
                self.port_range_end, self.port_range_start
            )));
        }
        if self.memory_bytes().is_none() {
            return Err(invalid(format!("unrecognised memory size '{}'", self.memory)));
        }
        if self.cpus.is_nan() || self.cpus <= 0.0 {
            return Err(invalid(format!("cpus must be positive, got {}", self.cpus)));
        }
        Ok(())
    }

    /// Memory limit in bytes, parsed from sizes like `512m` or `2g`.
    pub fn memory_bytes(&self) -> Option<i64> {
        let s = self.memory.trim().to_ascii_lowercase();
        let (digits, multiplier) = match s.chars().last()? {
            'k' => (&s[..s.len() - 1], 1024i64),
            'm' => (&s[..s.len() - 1], 1024 * 1024),
            'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
            c if c.is_ascii_digit() => (s.as_str(), 1),
            _ => return None,
        };
        digits.parse::<i64>().ok().map(|n| n * multiplier)
    }

    /// CPU limit in the nano-CPU unit the container engine expects.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.image, "node:20-slim");
        assert_eq!(config.memory, "2g");
        assert_eq!(config.cpus, 1.0);
        assert_eq!((config.port_range_start, config.port_range_end), (5100, 5999));
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_sandbox_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig::load(&dir.path().join("sandbox.toml")).unwrap();
        assert_eq!(config, SandboxConfig::default());
    }

    #[test]
    fn test_sandbox_config_load_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        fs::write(
            &path,
            r#"
[sandbox]
image = "node:22-slim"
memory = "4g"
cpus = 2.0
port_range = [6000, 6100]
health_check_timeout = 30

[sandbox.env]
NODE_ENV = "development"
"#,
        )
        .unwrap();

        let config = SandboxConfig::load(&path).unwrap();
        assert_eq!(config.image, "node:22-slim");
        assert_eq!(config.memory_bytes(), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(config.nano_cpus(), 2_000_000_000);
        assert_eq!((config.port_range_start, config.port_range_end), (6000, 6100));
        assert_eq!(config.health_check_timeout, 30);
        assert_eq!(config.env.get("NODE_ENV").unwrap(), "development");
    }

    #[test]
    fn test_sandbox_config_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        fs::write(&path, "[sandbox]\nimage = \"node:18\"\n").unwrap();

        let config = SandboxConfig::load(&path).unwrap();
        assert_eq!(config.image, "node:18");
        assert_eq!(config.memory, "2g");
        assert_eq!(config.port_range_start, 5100);
    }

    #[test]
    fn test_sandbox_config_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(matches!(SandboxConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_sandbox_config_rejects_inverted_port_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.toml");
        fs::write(&path, "[sandbox]\nport_range = [6000, 5000]\n").unwrap();
        assert!(SandboxConfig::load(&path).is_err());
    }

    #[test]
    fn test_memory_bytes_units() {
        let mut config = SandboxConfig::default();
        config.memory = "512m".into();
        assert_eq!(config.memory_bytes(), Some(512 * 1024 * 1024));
        config.memory = "1024".into();
        assert_eq!(config.memory_bytes(), Some(1024));
        config.memory = "lots".into();
        assert_eq!(config.memory_bytes(), None);
    }
}

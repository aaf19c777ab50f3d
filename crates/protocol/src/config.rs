use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port hosting both WebSocket endpoints (0 = pick a free port)
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9223
}

impl BridgeConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.bind.parse::<std::net::IpAddr>().is_err() {
            issues.push(format!(
                "ERROR: bind address '{}' is not a valid IP address",
                self.server.bind
            ));
        } else if self.server.bind != "127.0.0.1" && self.server.bind != "::1" {
            issues.push(format!(
                "WARNING: binding to '{}' exposes the unauthenticated debug endpoints \
                 beyond localhost",
                self.server.bind
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9223);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: BridgeConfig = toml::from_str("[server]\nport = 9555\n").unwrap();
        assert_eq!(config.server.port, 9555);
        assert_eq!(config.server.bind, "127.0.0.1");
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_garbage_bind() {
        let config: BridgeConfig = toml::from_str("[server]\nbind = \"nonsense\"\n").unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues[0].starts_with("ERROR:"));
    }

    #[test]
    fn validate_warns_on_public_bind() {
        let config: BridgeConfig = toml::from_str("[server]\nbind = \"0.0.0.0\"\n").unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues[0].starts_with("WARNING:"));
    }
}

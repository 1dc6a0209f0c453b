//! Service-surface configuration
//!
//! Pipeline knobs live in `coderunner_core::config`; this covers only the
//! HTTP/WebSocket surface.

/// Server bind and CORS configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the HTTP/WebSocket listener binds
    pub port: u16,

    /// Host to bind to
    pub host: String,

    /// Allowed browser origins; `None` allows any
    pub cors_origins: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_origins: None,
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = ServerConfig::default();

        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            config.port = port;
        }
        if let Ok(host) = std::env::var("HOST") {
            config.host = host;
        }
        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            let origins: Vec<String> = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !origins.is_empty() {
                config.cors_origins = Some(origins);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert!(config.cors_origins.is_none());
    }

    #[test]
    fn test_cors_origins_parsing() {
        std::env::set_var("CORS_ORIGINS", "https://a.example, https://b.example");
        let config = ServerConfig::from_env();
        assert_eq!(
            config.cors_origins,
            Some(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
        std::env::remove_var("CORS_ORIGINS");
    }
}

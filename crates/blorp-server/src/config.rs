use std::time::Duration;

/// Instance configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Application name; every broker key is namespaced by it.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub database: u32,
    pub pool_size: usize,
    pub session_ttl: Duration,
    pub registration_attempts: u32,
}

impl AppConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "blorp".into(),
            host: "localhost".into(),
            port: 6379,
            database: 0,
            pool_size: 10,
            session_ttl: Duration::from_secs(1800),
            registration_attempts: 3,
        }
    }
}

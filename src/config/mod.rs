use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub filter: FilterConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub tenancy: TenancyConfig,
    pub jobs: JobsConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub allow_raw_sql: bool,
    pub max_limit: Option<i32>,
    pub debug_logging: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub connection_timeout: u64,
    pub slow_query_threshold_ms: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    pub max_request_size_bytes: usize,
    pub enable_request_logging: bool,
}

/// Tenant isolation knobs. The cache TTL bounds how long a revoked membership
/// can still authorize requests; jobs never read through the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    pub membership_cache_ttl_secs: u64,
    pub context_refresh_secs: u64,
    pub verify_nested_connect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
    pub enable_audit_logging: bool,
}

impl TenancyConfig {
    pub fn membership_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.membership_cache_ttl_secs)
    }

    pub fn context_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.context_refresh_secs)
    }
}

impl JobsConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Filter overrides
        if let Ok(v) = env::var("FILTER_ALLOW_RAW_SQL") {
            self.filter.allow_raw_sql = v.parse().unwrap_or(self.filter.allow_raw_sql);
        }
        if let Ok(v) = env::var("FILTER_MAX_LIMIT") {
            self.filter.max_limit = v.parse().ok();
        }
        if let Ok(v) = env::var("FILTER_DEBUG_LOGGING") {
            self.filter.debug_logging = v.parse().unwrap_or(self.filter.debug_logging);
        }

        // Database overrides
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }
        if let Ok(v) = env::var("DATABASE_SLOW_QUERY_THRESHOLD_MS") {
            self.database.slow_query_threshold_ms = v.parse().unwrap_or(self.database.slow_query_threshold_ms);
        }
        if let Ok(v) = env::var("DATABASE_RUN_MIGRATIONS") {
            self.database.run_migrations = v.parse().unwrap_or(self.database.run_migrations);
        }

        // API overrides
        if let Some(port) = env::var("ORGSCOPE_API_PORT")
            .ok()
            .or_else(|| env::var("PORT").ok())
            .and_then(|s| s.parse::<u16>().ok())
        {
            self.api.port = port;
        }
        if let Ok(v) = env::var("API_MAX_REQUEST_SIZE_BYTES") {
            self.api.max_request_size_bytes = v.parse().unwrap_or(self.api.max_request_size_bytes);
        }
        if let Ok(v) = env::var("API_ENABLE_REQUEST_LOGGING") {
            self.api.enable_request_logging = v.parse().unwrap_or(self.api.enable_request_logging);
        }

        // Tenancy overrides
        if let Ok(v) = env::var("TENANCY_MEMBERSHIP_CACHE_TTL_SECS") {
            self.tenancy.membership_cache_ttl_secs = v.parse().unwrap_or(self.tenancy.membership_cache_ttl_secs);
        }
        if let Ok(v) = env::var("TENANCY_CONTEXT_REFRESH_SECS") {
            self.tenancy.context_refresh_secs = v.parse().unwrap_or(self.tenancy.context_refresh_secs);
        }
        if let Ok(v) = env::var("TENANCY_VERIFY_NESTED_CONNECT") {
            self.tenancy.verify_nested_connect = v.parse().unwrap_or(self.tenancy.verify_nested_connect);
        }

        // Jobs overrides
        if let Ok(v) = env::var("JOBS_QUEUE_CAPACITY") {
            self.jobs.queue_capacity = v.parse().unwrap_or(self.jobs.queue_capacity);
        }
        if let Ok(v) = env::var("JOBS_MAX_ATTEMPTS") {
            self.jobs.max_attempts = v.parse().unwrap_or(self.jobs.max_attempts);
        }
        if let Ok(v) = env::var("JOBS_RETRY_BACKOFF_MS") {
            self.jobs.retry_backoff_ms = v.parse().unwrap_or(self.jobs.retry_backoff_ms);
        }

        // Security overrides
        if let Ok(v) = env::var("SECURITY_ENABLE_CORS") {
            self.security.enable_cors = v.parse().unwrap_or(self.security.enable_cors);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("SECURITY_ENABLE_AUDIT_LOGGING") {
            self.security.enable_audit_logging = v.parse().unwrap_or(self.security.enable_audit_logging);
        }

        self
    }

    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            filter: FilterConfig {
                allow_raw_sql: true,
                max_limit: Some(1000),
                debug_logging: true,
            },
            database: DatabaseConfig {
                max_connections: 10,
                connection_timeout: 30,
                slow_query_threshold_ms: 100,
                run_migrations: true,
            },
            api: ApiConfig {
                port: 3000,
                max_request_size_bytes: 10 * 1024 * 1024, // 10MB
                enable_request_logging: true,
            },
            tenancy: TenancyConfig {
                membership_cache_ttl_secs: 30,
                context_refresh_secs: 300,
                verify_nested_connect: true,
            },
            jobs: JobsConfig {
                queue_capacity: 256,
                max_attempts: 3,
                retry_backoff_ms: 250,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["http://localhost:3000".to_string(), "http://localhost:5173".to_string()],
                enable_audit_logging: false,
            },
        }
    }

    pub fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            filter: FilterConfig {
                allow_raw_sql: false,
                max_limit: Some(500),
                debug_logging: false,
            },
            database: DatabaseConfig {
                max_connections: 20,
                connection_timeout: 10,
                slow_query_threshold_ms: 500,
                run_migrations: true,
            },
            api: ApiConfig {
                port: 3000,
                max_request_size_bytes: 5 * 1024 * 1024, // 5MB
                enable_request_logging: true,
            },
            tenancy: TenancyConfig {
                membership_cache_ttl_secs: 15,
                context_refresh_secs: 300,
                verify_nested_connect: true,
            },
            jobs: JobsConfig {
                queue_capacity: 1024,
                max_attempts: 5,
                retry_backoff_ms: 1000,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["https://staging.example.com".to_string()],
                enable_audit_logging: true,
            },
        }
    }

    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            filter: FilterConfig {
                allow_raw_sql: false,
                max_limit: Some(100),
                debug_logging: false,
            },
            database: DatabaseConfig {
                max_connections: 50,
                connection_timeout: 5,
                slow_query_threshold_ms: 1000,
                run_migrations: false,
            },
            api: ApiConfig {
                port: 3000,
                max_request_size_bytes: 2 * 1024 * 1024, // 2MB
                enable_request_logging: false,
            },
            tenancy: TenancyConfig {
                membership_cache_ttl_secs: 15,
                context_refresh_secs: 120,
                verify_nested_connect: true,
            },
            jobs: JobsConfig {
                queue_capacity: 4096,
                max_attempts: 5,
                retry_backoff_ms: 2000,
            },
            security: SecurityConfig {
                enable_cors: true,
                cors_origins: vec!["https://app.example.com".to_string()],
                enable_audit_logging: true,
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[macro_export]
macro_rules! is_production {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Production)
    };
}

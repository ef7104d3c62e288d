use std::env;

use serde::Deserialize;

use crate::services::permission::PermissionPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationConfig,
    pub jwt: JwtConfig,
    pub calendar: CalendarConfig,
    pub proxy: ProxyConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    /// Externally reachable base URL of this service, used to build OAuth redirect URIs.
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Key under which the JSON reminder list is stored.
    pub reminder_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Period between two sweeps.
    pub sweep_interval_seconds: u64,
    /// Days after `eventDate` before a reminder is purged.
    pub retention_days: i64,
    /// How long before an imported calendar event its reminder becomes due.
    pub import_lead_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Read from `DESKTOP_NOTIFICATIONS` ("granted", "denied" or "ask").
    pub desktop: PermissionPolicy,
    pub title: String,
    pub icon: Option<String>,
    pub require_interaction: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarConfig {
    pub google: OAuthClientConfig,
    pub outlook: OAuthClientConfig,
    pub outlook_tenant: String,
    pub apple: OAuthClientConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl OAuthClientConfig {
    pub fn is_configured(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub replicate_api_token: Option<String>,
    pub replicate_base_url: String,
    pub remove_bg_api_key: Option<String>,
    pub remove_bg_base_url: String,
    pub fashn_api_key: Option<String>,
    pub fashn_base_url: String,
    pub serper_api_key: Option<String>,
    pub serper_base_url: String,
    /// Upper bound for a single upstream call.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for proxy endpoints
    pub proxy_per_second: u32,
    /// Burst size for proxy endpoints
    pub proxy_burst: u32,
}

fn parse_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn oauth_client(id_var: &str, secret_var: &str) -> OAuthClientConfig {
    OAuthClientConfig {
        client_id: env::var(id_var).ok().filter(|v| !v.is_empty()),
        client_secret: env::var(secret_var).ok().filter(|v| !v.is_empty()),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?;

        let desktop = match env::var("DESKTOP_NOTIFICATIONS") {
            Ok(v) => v
                .parse::<PermissionPolicy>()
                .map_err(|_| ConfigError::InvalidValue("DESKTOP_NOTIFICATIONS".to_string()))?,
            Err(_) => PermissionPolicy::Ask,
        };

        let sweep_interval_seconds: u64 = env::var("REMINDER_SWEEP_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::InvalidValue("REMINDER_SWEEP_INTERVAL_SECONDS".to_string())
            })?;
        if sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "REMINDER_SWEEP_INTERVAL_SECONDS".to_string(),
            ));
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
                public_url: env::var("PUBLIC_URL")
                    .unwrap_or_else(|_| format!("http://localhost:{}", port)),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/app.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            store: StoreConfig {
                reminder_key: env::var("REMINDER_STORE_KEY")
                    .unwrap_or_else(|_| "outfit_reminders".to_string()),
            },
            scheduler: SchedulerConfig {
                sweep_interval_seconds,
                retention_days: env::var("REMINDER_RETENTION_DAYS")
                    .unwrap_or_else(|_| "7".to_string())
                    .parse()
                    .unwrap_or(7),
                import_lead_hours: env::var("REMINDER_IMPORT_LEAD_HOURS")
                    .unwrap_or_else(|_| "24".to_string())
                    .parse()
                    .unwrap_or(24),
            },
            notifications: NotificationConfig {
                desktop,
                title: env::var("NOTIFICATION_TITLE")
                    .unwrap_or_else(|_| "Outfit Reminder".to_string()),
                icon: env::var("NOTIFICATION_ICON").ok().filter(|v| !v.is_empty()),
                require_interaction: parse_bool("NOTIFICATION_REQUIRE_INTERACTION", true),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            calendar: CalendarConfig {
                google: oauth_client("GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_SECRET"),
                outlook: oauth_client("OUTLOOK_CLIENT_ID", "OUTLOOK_CLIENT_SECRET"),
                outlook_tenant: env::var("OUTLOOK_TENANT")
                    .unwrap_or_else(|_| "common".to_string()),
                apple: oauth_client("APPLE_CLIENT_ID", "APPLE_CLIENT_SECRET"),
            },
            proxy: ProxyConfig {
                openai_api_key: env::var("OPENAI_API_KEY").ok(),
                openai_base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com".to_string()),
                replicate_api_token: env::var("REPLICATE_API_TOKEN").ok(),
                replicate_base_url: env::var("REPLICATE_BASE_URL")
                    .unwrap_or_else(|_| "https://api.replicate.com".to_string()),
                remove_bg_api_key: env::var("REMOVE_BG_API_KEY").ok(),
                remove_bg_base_url: env::var("REMOVE_BG_BASE_URL")
                    .unwrap_or_else(|_| "https://api.remove.bg".to_string()),
                fashn_api_key: env::var("FASHN_API_KEY").ok(),
                fashn_base_url: env::var("FASHN_BASE_URL")
                    .unwrap_or_else(|_| "https://api.fashn.ai".to_string()),
                serper_api_key: env::var("SERPER_API_KEY").ok(),
                serper_base_url: env::var("SERPER_BASE_URL")
                    .unwrap_or_else(|_| "https://google.serper.dev".to_string()),
                timeout_seconds: env::var("PROXY_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
            },
            rate_limit: RateLimitConfig {
                proxy_per_second: env::var("RATE_LIMIT_PROXY_PER_SECOND")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                proxy_burst: env::var("RATE_LIMIT_PROXY_BURST")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .unwrap_or(20),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
                public_url: "http://localhost:8080".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/app.db".to_string(),
                max_connections: 5,
            },
            store: StoreConfig {
                reminder_key: "outfit_reminders".to_string(),
            },
            scheduler: SchedulerConfig {
                sweep_interval_seconds: 3600,
                retention_days: 7,
                import_lead_hours: 24,
            },
            notifications: NotificationConfig {
                desktop: PermissionPolicy::Ask,
                title: "Outfit Reminder".to_string(),
                icon: None,
                require_interaction: true,
            },
            jwt: JwtConfig {
                secret: String::new(),
            },
            calendar: CalendarConfig {
                google: OAuthClientConfig::default(),
                outlook: OAuthClientConfig::default(),
                outlook_tenant: "common".to_string(),
                apple: OAuthClientConfig::default(),
            },
            proxy: ProxyConfig {
                openai_api_key: None,
                openai_base_url: "https://api.openai.com".to_string(),
                replicate_api_token: None,
                replicate_base_url: "https://api.replicate.com".to_string(),
                remove_bg_api_key: None,
                remove_bg_base_url: "https://api.remove.bg".to_string(),
                fashn_api_key: None,
                fashn_base_url: "https://api.fashn.ai".to_string(),
                serper_api_key: None,
                serper_base_url: "https://google.serper.dev".to_string(),
                timeout_seconds: 120,
            },
            rate_limit: RateLimitConfig {
                proxy_per_second: 2,
                proxy_burst: 20,
            },
        }
    }
}

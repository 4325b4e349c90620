use std::{env, fmt, net::SocketAddr};

use super::{optional_var, server_bind_address};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://license-sync.db";
pub const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com/";
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: u64 = 300;
pub const DEFAULT_CHECKOUT_LOCALE: &str = "auto";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub billing: BillingConfig,
}

/// Payment provider settings.
///
/// Secrets are optional at startup: a missing webhook secret is reported per
/// request as missing credentials, and missing checkout settings surface as a
/// configuration error on `/checkout`.
#[derive(Clone, Default)]
pub struct BillingConfig {
    pub webhook_secret: Option<String>,
    pub secret_key: Option<String>,
    pub price_id: Option<String>,
    pub public_base_url: Option<String>,
    pub api_base: String,
    pub signature_tolerance_secs: u64,
    pub checkout_locale: String,
}

impl BillingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let signature_tolerance_secs = match optional_var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidTolerance(raw))?,
            None => DEFAULT_SIGNATURE_TOLERANCE_SECS,
        };

        Ok(Self {
            webhook_secret: optional_var("STRIPE_WEBHOOK_SIGNING_SECRET"),
            secret_key: optional_var("STRIPE_SECRET_KEY"),
            price_id: optional_var("STRIPE_PRICE_ID"),
            public_base_url: optional_var("PUBLIC_BASE_URL"),
            api_base: optional_var("STRIPE_API_BASE")
                .unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.to_string()),
            signature_tolerance_secs,
            checkout_locale: optional_var("CHECKOUT_LOCALE")
                .unwrap_or_else(|| DEFAULT_CHECKOUT_LOCALE.to_string()),
        })
    }

    /// Returns `true` when a Stripe secret key is configured for test mode.
    pub fn is_test_mode(&self) -> bool {
        self.secret_key
            .as_deref()
            .is_some_and(|key| key.starts_with("sk_test_"))
    }
}

impl fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BillingConfig")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("price_id", &self.price_id)
            .field("public_base_url", &self.public_base_url)
            .field("api_base", &self.api_base)
            .field("signature_tolerance_secs", &self.signature_tolerance_secs)
            .field("checkout_locale", &self.checkout_locale)
            .finish()
    }
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url =
            optional_var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let billing = BillingConfig::from_env()?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            billing,
        })
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidTolerance(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidTolerance(value) => write!(
                f,
                "STRIPE_WEBHOOK_TOLERANCE_SECS must be a whole number of seconds (got {value})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ENV_GUARD;
    use crate::DEFAULT_BIND_ADDR;

    const BILLING_VARS: [&str; 7] = [
        "STRIPE_WEBHOOK_SIGNING_SECRET",
        "STRIPE_SECRET_KEY",
        "STRIPE_PRICE_ID",
        "PUBLIC_BASE_URL",
        "STRIPE_API_BASE",
        "STRIPE_WEBHOOK_TOLERANCE_SECS",
        "CHECKOUT_LOCALE",
    ];

    fn clear_env() {
        env::remove_var("APP_ENV");
        env::remove_var("APP_BIND_ADDR");
        env::remove_var("DATABASE_URL");
        for name in BILLING_VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert!(config.billing.webhook_secret.is_none());
        assert!(config.billing.price_id.is_none());
        assert_eq!(config.billing.api_base, DEFAULT_STRIPE_API_BASE);
        assert_eq!(
            config.billing.signature_tolerance_secs,
            DEFAULT_SIGNATURE_TOLERANCE_SECS
        );
        assert_eq!(config.billing.checkout_locale, "auto");
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        env::remove_var("APP_ENV");
    }

    #[test]
    fn parses_production_environment_with_billing() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        env::set_var("STRIPE_WEBHOOK_SIGNING_SECRET", "whsec_test");
        env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        env::set_var("STRIPE_PRICE_ID", "price_123");
        env::set_var("STRIPE_WEBHOOK_TOLERANCE_SECS", "120");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.billing.webhook_secret.as_deref(), Some("whsec_test"));
        assert_eq!(config.billing.price_id.as_deref(), Some("price_123"));
        assert_eq!(config.billing.signature_tolerance_secs, 120);
        assert!(config.billing.is_test_mode());

        clear_env();
    }

    #[test]
    fn rejects_non_numeric_tolerance() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("STRIPE_WEBHOOK_TOLERANCE_SECS", "five minutes");

        let err = AppConfig::from_env().expect_err("tolerance should be validated");
        assert!(matches!(err, ConfigError::InvalidTolerance(value) if value == "five minutes"));

        clear_env();
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let billing = BillingConfig {
            webhook_secret: Some("whsec_secret".to_string()),
            secret_key: Some("sk_live_secret".to_string()),
            ..BillingConfig::default()
        };
        let rendered = format!("{billing:?}");
        assert!(!rendered.contains("whsec_secret"));
        assert!(!rendered.contains("sk_live_secret"));
        assert!(rendered.contains("<redacted>"));
    }
}

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DarajaSettings {
    #[serde(default = "default_daraja_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default)]
    pub short_code: String,
    #[serde(default)]
    pub passkey: String,
    /// Public URL the provider posts STK callbacks to.
    #[serde(default)]
    pub callback_url: String,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DarajaSettings {
    fn default() -> Self {
        Self {
            base_url: default_daraja_base_url(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            short_code: String::new(),
            passkey: String::new(),
            callback_url: String::new(),
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AirtelSettings {
    #[serde(default = "default_airtel_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for AirtelSettings {
    fn default() -> Self {
        Self {
            base_url: default_airtel_base_url(),
            client_id: String::new(),
            client_secret: String::new(),
            country: default_country(),
            currency: default_currency(),
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CheckoutSettings {
    /// Checkout-session creation endpoint of the external card processor.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PollerSettings {
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            poll_interval: default_poll_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SimulationSettings {
    /// Demo mode: synthetic gateways that resolve through the callback path.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mpesa_success_rate")]
    pub mpesa_success_rate: f64,
    #[serde(default = "default_airtel_success_rate")]
    pub airtel_success_rate: f64,
    #[serde(default = "default_callback_delay", with = "humantime_serde")]
    pub callback_delay: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mpesa_success_rate: default_mpesa_success_rate(),
            airtel_success_rate: default_airtel_success_rate(),
            callback_delay: default_callback_delay(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub daraja: DarajaSettings,
    #[serde(default)]
    pub airtel: AirtelSettings,
    #[serde(default)]
    pub checkout: CheckoutSettings,
    #[serde(default)]
    pub poller: PollerSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    pub server_port: u16,
    pub database_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daraja: DarajaSettings::default(),
            airtel: AirtelSettings::default(),
            checkout: CheckoutSettings::default(),
            poller: PollerSettings::default(),
            simulation: SimulationSettings::default(),
            server_port: 8080,
            database_path: "data/payments.redb".to_string(),
        }
    }
}

impl Config {
    /// Load from config.toml (if present) and environment variables.
    /// Environment variables override file values.
    /// Supported env keys: DARAJA_BASE_URL, DARAJA_CONSUMER_KEY,
    /// DARAJA_CONSUMER_SECRET, DARAJA_SHORT_CODE, DARAJA_PASSKEY,
    /// DARAJA_CALLBACK_URL, DARAJA_TIMEOUT_MS, AIRTEL_BASE_URL,
    /// AIRTEL_CLIENT_ID, AIRTEL_CLIENT_SECRET, AIRTEL_COUNTRY,
    /// AIRTEL_CURRENCY, CHECKOUT_ENDPOINT, CHECKOUT_API_KEY,
    /// POLL_GRACE_PERIOD, POLL_INTERVAL, POLL_MAX_ATTEMPTS,
    /// SIMULATE_GATEWAYS, SIMULATION_CALLBACK_DELAY, SERVER_PORT,
    /// DATABASE_PATH
    pub fn load() -> Self {
        // 1) Start with defaults + config.toml only if it exists
        let base: Config = Default::default();
        let mut fig = Figment::from(Serialized::defaults(base));
        if std::path::Path::new("config.toml").exists() {
            fig = fig.merge(Toml::file("config.toml"));
        }
        let mut cfg: Config = fig.extract().unwrap_or_default();

        // 2) Overlay environment variables explicitly
        if let Ok(v) = std::env::var("DARAJA_BASE_URL") {
            cfg.daraja.base_url = v;
        }
        if let Ok(v) = std::env::var("DARAJA_CONSUMER_KEY") {
            cfg.daraja.consumer_key = v;
        }
        if let Ok(v) = std::env::var("DARAJA_CONSUMER_SECRET") {
            cfg.daraja.consumer_secret = v;
        }
        if let Ok(v) = std::env::var("DARAJA_SHORT_CODE") {
            cfg.daraja.short_code = v;
        }
        if let Ok(v) = std::env::var("DARAJA_PASSKEY") {
            cfg.daraja.passkey = v;
        }
        if let Ok(v) = std::env::var("DARAJA_CALLBACK_URL") {
            cfg.daraja.callback_url = v;
        }
        if let Ok(v) = std::env::var("DARAJA_TIMEOUT_MS") {
            cfg.daraja.timeout_ms = v.parse().unwrap_or(cfg.daraja.timeout_ms);
        }
        if let Ok(v) = std::env::var("AIRTEL_BASE_URL") {
            cfg.airtel.base_url = v;
        }
        if let Ok(v) = std::env::var("AIRTEL_CLIENT_ID") {
            cfg.airtel.client_id = v;
        }
        if let Ok(v) = std::env::var("AIRTEL_CLIENT_SECRET") {
            cfg.airtel.client_secret = v;
        }
        if let Ok(v) = std::env::var("AIRTEL_COUNTRY") {
            cfg.airtel.country = v;
        }
        if let Ok(v) = std::env::var("AIRTEL_CURRENCY") {
            cfg.airtel.currency = v;
        }
        if let Ok(v) = std::env::var("CHECKOUT_ENDPOINT") {
            cfg.checkout.endpoint = v;
        }
        if let Ok(v) = std::env::var("CHECKOUT_API_KEY") {
            cfg.checkout.api_key = v;
        }
        if let Ok(v) = std::env::var("POLL_GRACE_PERIOD") {
            cfg.poller.grace_period = parse_duration_env(&v, cfg.poller.grace_period);
        }
        if let Ok(v) = std::env::var("POLL_INTERVAL") {
            cfg.poller.poll_interval = parse_duration_env(&v, cfg.poller.poll_interval);
        }
        if let Ok(v) = std::env::var("POLL_MAX_ATTEMPTS") {
            cfg.poller.max_attempts = v.parse().unwrap_or(cfg.poller.max_attempts);
        }
        if let Ok(v) = std::env::var("SIMULATE_GATEWAYS") {
            cfg.simulation.enabled = matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES");
        }
        if let Ok(v) = std::env::var("SIMULATION_CALLBACK_DELAY") {
            cfg.simulation.callback_delay = parse_duration_env(&v, cfg.simulation.callback_delay);
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            cfg.server_port = v.parse().unwrap_or(cfg.server_port);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            cfg.database_path = v;
        }

        cfg
    }

    pub fn from_env() -> Self {
        Self::load()
    }
}

fn parse_duration_env(value: &str, current: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(current)
}

fn default_daraja_base_url() -> String {
    "https://api.safaricom.co.ke".to_string()
}

fn default_airtel_base_url() -> String {
    "https://openapi.airtel.africa".to_string()
}

fn default_country() -> String {
    "KE".to_string()
}

fn default_currency() -> String {
    "KES".to_string()
}

fn default_gateway_timeout_ms() -> u64 {
    15_000
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    30
}

fn default_mpesa_success_rate() -> f64 {
    0.90
}

fn default_airtel_success_rate() -> f64 {
    0.85
}

fn default_callback_delay() -> Duration {
    Duration::from_secs(2)
}

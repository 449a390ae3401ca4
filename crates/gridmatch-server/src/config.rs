//! Environment-style configuration.
//!
//! Every knob has a default; unset or unparseable variables fall back
//! silently so a bare `cargo run` always works.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port (`PORT`).
    pub port: u16,
    /// Static frontend directory (`STATIC_DIR`).
    pub static_dir: String,
    /// Timeout for the tension/morale scoring call (`INFERENCE_TIMEOUT_MS`).
    pub inference_timeout: Duration,
    /// Timeout for the commentary call (`NARRATION_TIMEOUT_MS`). Longer
    /// than the scoring timeout on purpose — narration is lower priority.
    pub narration_timeout: Duration,
    /// How long a dropped seat is held before forfeiture (`RECONNECT_GRACE_MS`).
    pub reconnect_grace: Duration,
    /// Narration kill switch (`NARRATION_ENABLED`).
    pub narration_enabled: bool,
    /// Cleanup sweep interval (`SWEEP_INTERVAL_MS`).
    pub sweep_interval: Duration,
    /// How long a finished room may idle before removal (`FINISHED_ROOM_TTL_MS`).
    pub finished_room_ttl: Duration,
    /// Chat-completions endpoint (`INFERENCE_URL`).
    pub inference_url: String,
    /// API key (`INFERENCE_API_KEY`); unset disables inference entirely.
    pub inference_api_key: Option<String>,
    /// Model name (`INFERENCE_MODEL`).
    pub inference_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            static_dir: "./dist".to_string(),
            inference_timeout: Duration::from_millis(3000),
            narration_timeout: Duration::from_millis(5000),
            reconnect_grace: Duration::from_millis(30_000),
            narration_enabled: true,
            sweep_interval: Duration::from_millis(60_000),
            finished_room_ttl: Duration::from_millis(600_000),
            inference_url: "https://api.openai.com/v1/chat/completions".to_string(),
            inference_api_key: None,
            inference_model: "gpt-4o-mini".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            port: env_parse("PORT", d.port),
            static_dir: env::var("STATIC_DIR").unwrap_or(d.static_dir),
            inference_timeout: env_ms("INFERENCE_TIMEOUT_MS", d.inference_timeout),
            narration_timeout: env_ms("NARRATION_TIMEOUT_MS", d.narration_timeout),
            reconnect_grace: env_ms("RECONNECT_GRACE_MS", d.reconnect_grace),
            narration_enabled: env::var("NARRATION_ENABLED")
                .ok()
                .and_then(|v| parse_bool(&v))
                .unwrap_or(d.narration_enabled),
            sweep_interval: env_ms("SWEEP_INTERVAL_MS", d.sweep_interval),
            finished_room_ttl: env_ms("FINISHED_ROOM_TTL_MS", d.finished_room_ttl),
            inference_url: env::var("INFERENCE_URL").unwrap_or(d.inference_url),
            inference_api_key: env::var("INFERENCE_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            inference_model: env::var("INFERENCE_MODEL").unwrap_or(d.inference_model),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_ms(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeMode {
    Ndjson,
    Sse,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub upstream_base_url: String,
    pub upstream_api_key: Option<String>,
    pub decode_mode: DecodeMode,
    pub model: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub relay_timeout_secs: u64,
    pub max_message_len: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub rate_limit_max_messages: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_cleanup_interval_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TomlConfigRaw {
    upstream_base_url: Option<String>,
    upstream_api_key: Option<String>,
    decode_mode: Option<String>,
    model: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    log_level: Option<String>,
    relay_timeout_secs: Option<u64>,
    max_message_len: Option<usize>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    max_tokens: Option<u32>,
    rate_limit_max_messages: Option<u32>,
    rate_limit_window_secs: Option<u64>,
    rate_limit_cleanup_interval_secs: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let toml_config = read_toml_config("config.toml")?.unwrap_or_default();

        let upstream_base_url = env::var("UPSTREAM_BASE_URL")
            .ok()
            .or(toml_config.upstream_base_url)
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let upstream_api_key = env::var("UPSTREAM_API_KEY")
            .ok()
            .or(toml_config.upstream_api_key)
            .filter(|value| !value.trim().is_empty());

        let decode_mode_raw = env::var("DECODE_MODE").ok().or(toml_config.decode_mode);
        let decode_mode = parse_decode_mode(decode_mode_raw.as_deref())?;

        let model = env::var("MODEL")
            .ok()
            .or(toml_config.model)
            .unwrap_or_else(|| "llama3".to_string());

        let host = env::var("HOST")
            .ok()
            .or(toml_config.host)
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let port = env_u16_with_fallback("PORT", toml_config.port.unwrap_or(3001));
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .or(toml_config.log_level)
            .unwrap_or_else(|| "INFO".to_string());

        let relay_timeout_secs = env_u64_with_fallback(
            "RELAY_TIMEOUT_SECS",
            toml_config.relay_timeout_secs.unwrap_or(60),
        );

        let max_message_len =
            env_usize_with_fallback("MAX_MESSAGE_LEN", toml_config.max_message_len.unwrap_or(2000));

        let temperature =
            env_f32_with_fallback("TEMPERATURE", toml_config.temperature.unwrap_or(0.7));
        let top_p = env_f32_with_fallback("TOP_P", toml_config.top_p.unwrap_or(0.9));
        let top_k = env_u32_with_fallback("TOP_K", toml_config.top_k.unwrap_or(40));
        let max_tokens = env_u32_with_fallback("MAX_TOKENS", toml_config.max_tokens.unwrap_or(1024));

        let rate_limit_max_messages = env_u32_with_fallback(
            "RATE_LIMIT_MAX_MESSAGES",
            toml_config.rate_limit_max_messages.unwrap_or(20),
        );
        let rate_limit_window_secs = env_u64_with_fallback(
            "RATE_LIMIT_WINDOW_SECS",
            toml_config.rate_limit_window_secs.unwrap_or(60),
        );
        let rate_limit_cleanup_interval_secs = env_u64_with_fallback(
            "RATE_LIMIT_CLEANUP_INTERVAL_SECS",
            toml_config.rate_limit_cleanup_interval_secs.unwrap_or(120),
        );

        validate_relay_config(relay_timeout_secs, max_message_len)?;
        validate_rate_limit_config(
            rate_limit_max_messages,
            rate_limit_window_secs,
            rate_limit_cleanup_interval_secs,
        )?;

        Ok(Self {
            upstream_base_url,
            upstream_api_key,
            decode_mode,
            model,
            host,
            port,
            log_level,
            relay_timeout_secs,
            max_message_len,
            temperature,
            top_p,
            top_k,
            max_tokens,
            rate_limit_max_messages,
            rate_limit_window_secs,
            rate_limit_cleanup_interval_secs,
        })
    }

    pub fn decode_mode_name(&self) -> &'static str {
        match self.decode_mode {
            DecodeMode::Ndjson => "ndjson",
            DecodeMode::Sse => "sse",
        }
    }
}

fn validate_relay_config(timeout_secs: u64, max_message_len: usize) -> Result<(), String> {
    if timeout_secs == 0 {
        return Err("RELAY_TIMEOUT_SECS must be > 0".to_string());
    }
    if max_message_len == 0 {
        return Err("MAX_MESSAGE_LEN must be > 0".to_string());
    }

    Ok(())
}

fn validate_rate_limit_config(
    max_messages: u32,
    window_secs: u64,
    cleanup_secs: u64,
) -> Result<(), String> {
    if max_messages == 0 {
        return Err("RATE_LIMIT_MAX_MESSAGES must be > 0".to_string());
    }
    if window_secs == 0 {
        return Err("RATE_LIMIT_WINDOW_SECS must be > 0".to_string());
    }
    if cleanup_secs == 0 {
        return Err("RATE_LIMIT_CLEANUP_INTERVAL_SECS must be > 0".to_string());
    }

    Ok(())
}

fn read_toml_config(path: &str) -> Result<Option<TomlConfigRaw>, String> {
    let config_path = Path::new(path);

    if !config_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(config_path)
        .map_err(|error| format!("Failed to read {}: {}", config_path.display(), error))?;

    let parsed = toml::from_str::<TomlConfigRaw>(&content)
        .map_err(|error| format!("Failed to parse {}: {}", config_path.display(), error))?;

    Ok(Some(parsed))
}

fn parse_decode_mode(value: Option<&str>) -> Result<DecodeMode, String> {
    let Some(raw_value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(DecodeMode::Ndjson);
    };

    match raw_value.to_ascii_lowercase().as_str() {
        "ndjson" => Ok(DecodeMode::Ndjson),
        "sse" => Ok(DecodeMode::Sse),
        _ => Err(format!(
            "Invalid DECODE_MODE value '{raw_value}'. Supported values: ndjson, sse."
        )),
    }
}

fn env_u16_with_fallback(key: &str, fallback: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(fallback)
}

fn env_u32_with_fallback(key: &str, fallback: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(fallback)
}

fn env_u64_with_fallback(key: &str, fallback: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(fallback)
}

fn env_usize_with_fallback(key: &str, fallback: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(fallback)
}

fn env_f32_with_fallback(key: &str, fallback: f32) -> f32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::{parse_decode_mode, validate_rate_limit_config, validate_relay_config, DecodeMode};

    #[test]
    fn parse_decode_mode_accepts_valid_values_case_insensitive() {
        assert_eq!(
            parse_decode_mode(Some("  NDJSON ")).expect("should parse"),
            DecodeMode::Ndjson
        );
        assert_eq!(
            parse_decode_mode(Some("Sse")).expect("should parse"),
            DecodeMode::Sse
        );
    }

    #[test]
    fn parse_decode_mode_defaults_to_ndjson() {
        assert_eq!(parse_decode_mode(None).expect("should parse"), DecodeMode::Ndjson);
        assert_eq!(
            parse_decode_mode(Some("   ")).expect("should parse"),
            DecodeMode::Ndjson
        );
    }

    #[test]
    fn parse_decode_mode_rejects_invalid_values() {
        let error = parse_decode_mode(Some("grpc")).expect_err("should fail");
        assert!(error.contains("Invalid DECODE_MODE value 'grpc'"));
    }

    #[test]
    fn relay_config_rejects_zero_values() {
        assert!(validate_relay_config(0, 2000).is_err());
        assert!(validate_relay_config(60, 0).is_err());
        assert!(validate_relay_config(60, 2000).is_ok());
    }

    #[test]
    fn rate_limit_config_rejects_zero_values() {
        assert!(validate_rate_limit_config(0, 60, 120).is_err());
        assert!(validate_rate_limit_config(20, 0, 120).is_err());
        assert!(validate_rate_limit_config(20, 60, 0).is_err());
        assert!(validate_rate_limit_config(20, 60, 120).is_ok());
    }
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::detection::ImageTransport;
use crate::image_fetcher::{ViewSpec, MAPBOX_SATELLITE_STATIC};
use crate::narrative::{FailurePolicy, NarrativeStrategy};

const DEFAULT_ALLOWED_ORIGINS: &str =
    "http://localhost:3000,http://127.0.0.1:3000,http://localhost:5173,http://127.0.0.1:5173";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ImageryConfig {
    pub base_url: String,
    pub access_token: String,
    pub view: ViewSpec,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub transport: ImageTransport,
    pub kill_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct NarrativeConfig {
    pub strategy: NarrativeStrategy,
    pub on_failure: FailurePolicy,
    pub model: String,
    pub max_tokens: u32,
    pub include_image: bool,
    pub api_key: Option<String>,
}

/// Service configuration, read once at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub imagery: ImageryConfig,
    pub detector: DetectorConfig,
    pub narrative: NarrativeConfig,
    pub request_timeout: Duration,
    /// Include raw tool output in error responses
    pub diagnostics: bool,
    pub archive_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (tests pass a map)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let access_token = get("MAPBOX_TOKEN").ok_or(ConfigError::Missing("MAPBOX_TOKEN"))?;

        let default_view = ViewSpec::default();
        let view = ViewSpec {
            zoom: parse_or(&get, "IMAGERY_ZOOM", default_view.zoom)?,
            width: parse_or(&get, "IMAGERY_WIDTH", default_view.width)?,
            height: parse_or(&get, "IMAGERY_HEIGHT", default_view.height)?,
        };

        let api_key = get("OPENAI_API_KEY");
        let default_strategy = if api_key.is_some() {
            NarrativeStrategy::LanguageModel
        } else {
            NarrativeStrategy::RuleBased
        };
        let strategy = parse_or(&get, "NARRATIVE_STRATEGY", default_strategy)?;
        if strategy == NarrativeStrategy::LanguageModel && api_key.is_none() {
            return Err(ConfigError::Missing("OPENAI_API_KEY"));
        }

        let allowed_origins = get("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            allowed_origins,
            imagery: ImageryConfig {
                base_url: get("IMAGERY_BASE_URL")
                    .unwrap_or_else(|| MAPBOX_SATELLITE_STATIC.to_string()),
                access_token,
                view,
            },
            detector: DetectorConfig {
                program: get("DETECTOR_PROGRAM").unwrap_or_else(|| "python3".to_string()),
                args: get("DETECTOR_ARGS")
                    .unwrap_or_else(|| "scripts/analyze.py".to_string())
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
                working_dir: get("DETECTOR_WORKDIR").map(PathBuf::from),
                transport: parse_or(&get, "DETECTOR_IMAGE_TRANSPORT", ImageTransport::Argument)?,
                kill_grace: Duration::from_millis(parse_or(
                    &get,
                    "DETECTOR_KILL_GRACE_MS",
                    2000u64,
                )?),
            },
            narrative: NarrativeConfig {
                strategy,
                on_failure: parse_or(&get, "NARRATIVE_ON_FAILURE", FailurePolicy::Degrade)?,
                model: get("NARRATIVE_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
                max_tokens: parse_or(&get, "NARRATIVE_MAX_TOKENS", 600u32)?,
                include_image: parse_flag(&get, "NARRATIVE_INCLUDE_IMAGE", true)?,
                api_key,
            },
            request_timeout: Duration::from_secs(parse_or(&get, "ANALYSIS_TIMEOUT_SECS", 120u64)?),
            diagnostics: parse_flag(&get, "ANALYSIS_DIAGNOSTICS", false)?,
            archive_dir: get("ARCHIVE_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<G, T>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: format!("`{}`: {}", raw, e),
        }),
        None => Ok(default),
    }
}

fn parse_flag<G>(get: &G, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                reason: format!("`{}` is not a boolean", v),
            }),
        },
    }
}

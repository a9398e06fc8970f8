use crate::info;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Concurrency knob: a fixed count or a fraction of the machine's cores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parallelism {
    Off,
    Low,
    Mild,
    High,
    Fixed(usize),
}

impl Parallelism {
    /// Concrete concurrency limit, never below 1.
    pub fn concurrency(&self) -> usize {
        match self {
            Parallelism::Off => 1,
            Parallelism::Low => (num_cpus::get() / 8).max(1),
            Parallelism::Mild => (num_cpus::get() / 4).max(1),
            Parallelism::High => (num_cpus::get() / 2).max(1),
            Parallelism::Fixed(n) => (*n).max(1),
        }
    }
}

impl FromStr for Parallelism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<usize>() {
            return Ok(Parallelism::Fixed(n));
        }
        match s.to_lowercase().as_str() {
            "off" => Ok(Parallelism::Off),
            "low" => Ok(Parallelism::Low),
            "mild" => Ok(Parallelism::Mild),
            "high" => Ok(Parallelism::High),
            _ => Err(format!("Invalid value for Parallelism: {}", s)),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Parallelism {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(usize),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Parallelism::Fixed(n)),
            Raw::Text(s) => Parallelism::from_str(&s).map_err(serde::de::Error::custom),
        }
    }
}

fn duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

fn default_throttle() -> Parallelism {
    Parallelism::Fixed(10)
}

fn default_page_size() -> usize {
    100
}

fn default_batch_size() -> usize {
    25
}

fn default_max_retries() -> usize {
    5
}

fn default_delay_increment() -> Duration {
    Duration::from_millis(100)
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuerySettings {
    /// Max physical shard queries in flight for one logical query.
    #[serde(default = "default_throttle")]
    pub throttle: Parallelism,
    /// Page size used when neither the call nor the index names one.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self { throttle: default_throttle(), default_page_size: default_page_size() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchSettings {
    /// Backend-imposed max operations per batch request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Max batch requests in flight at once.
    #[serde(default = "default_throttle")]
    pub throttle: Parallelism,
    /// Re-submissions of unprocessed items before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Base of the exponential backoff between re-submissions.
    #[serde(default = "default_delay_increment", deserialize_with = "duration_from_millis")]
    #[serde(rename = "delay_increment_ms")]
    pub delay_increment: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            throttle: default_throttle(),
            max_retries: default_max_retries(),
            delay_increment: default_delay_increment(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppSettings {
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub batch: BatchSettings,
}

impl AppSettings {
    /// Loads settings from an optional file layered under
    /// `SHARDBIT__`-prefixed environment variables.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("SHARDBIT").try_parsing(true).separator("__"));
        let settings: Result<AppSettings, ConfigError> = builder.build()?.try_deserialize();
        if let Ok(loaded) = &settings {
            info!("settings loaded: {:?}", loaded);
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> AppSettings {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_match_the_documented_knobs() {
        let settings = AppSettings::default();
        assert_eq!(settings.batch.batch_size, 25);
        assert_eq!(settings.batch.max_retries, 5);
        assert_eq!(settings.batch.throttle.concurrency(), 10);
        assert_eq!(settings.batch.delay_increment, Duration::from_millis(100));
        assert_eq!(settings.query.throttle.concurrency(), 10);
        assert_eq!(settings.query.default_page_size, 100);
    }

    #[test]
    fn file_values_override_defaults() {
        let settings = from_toml(
            r#"
            [query]
            throttle = "mild"
            default_page_size = 50

            [batch]
            batch_size = 10
            max_retries = 2
            delay_increment_ms = 250
            "#,
        );
        assert_eq!(settings.query.default_page_size, 50);
        assert_eq!(settings.query.throttle, Parallelism::Mild);
        assert_eq!(settings.batch.batch_size, 10);
        assert_eq!(settings.batch.max_retries, 2);
        assert_eq!(settings.batch.delay_increment, Duration::from_millis(250));
    }

    #[test]
    fn parallelism_accepts_numbers_and_keywords() {
        assert_eq!(Parallelism::from_str("8").unwrap(), Parallelism::Fixed(8));
        assert_eq!(Parallelism::from_str("off").unwrap(), Parallelism::Off);
        assert_eq!(Parallelism::from_str("HIGH").unwrap(), Parallelism::High);
        assert!(Parallelism::from_str("turbo").is_err());
        assert_eq!(Parallelism::Fixed(0).concurrency(), 1, "never below one");
        assert!(Parallelism::Low.concurrency() >= 1);
        let settings = from_toml("[query]\nthrottle = 3\n");
        assert_eq!(settings.query.throttle, Parallelism::Fixed(3));
    }

    #[test]
    fn missing_file_still_yields_defaults() {
        let settings = AppSettings::new("/nonexistent/shardbit").unwrap();
        assert_eq!(settings.batch.batch_size, 25);
    }
}

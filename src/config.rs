use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub video: VideoConfig,
    pub slots: SlotsConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct VideoConfig {
    /// File path or stream URL handed to OpenCV.
    pub path: String,
    /// Per-consumer tick rate. Zero streams as fast as the pipeline runs.
    #[serde(default = "default_stream_fps")]
    pub stream_fps: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
}

fn default_stream_fps() -> u64 {
    30
}

fn default_jpeg_quality() -> i32 {
    90
}

fn fps_to_delay_ms(fps: u64) -> u64 {
    if fps == 0 {
        return 0;
    }
    (1000.0 / fps as f64).round() as u64
}

impl VideoConfig {
    pub fn get_stream_delay_ms(&self) -> u64 {
        fps_to_delay_ms(self.stream_fps)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct SlotsConfig {
    pub layout_file: PathBuf,
    #[serde(default = "default_slot_width")]
    pub width: i32,
    #[serde(default = "default_slot_height")]
    pub height: i32,
}

fn default_slot_width() -> i32 {
    107
}

fn default_slot_height() -> i32 {
    48
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMethod {
    Gaussian,
    Mean,
}

/// Tuning for the occupancy pipeline. The defaults match the reference
/// camera geometry (107x48 slots) and carry no calibration for other feeds.
#[derive(Clone, Deserialize, Debug)]
pub struct DetectorConfig {
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: i32,
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f64,
    #[serde(default = "default_threshold_method")]
    pub threshold_method: ThresholdMethod,
    #[serde(default = "default_block_size")]
    pub block_size: i32,
    #[serde(default = "default_bias")]
    pub bias: f64,
    #[serde(default = "default_median_kernel")]
    pub median_kernel: i32,
    #[serde(default = "default_dilate_kernel")]
    pub dilate_kernel: i32,
    #[serde(default = "default_dilate_iterations")]
    pub dilate_iterations: i32,
    #[serde(default = "default_occupied_threshold")]
    pub occupied_threshold: i32,
}

fn default_blur_kernel() -> i32 {
    3
}

fn default_blur_sigma() -> f64 {
    1.0
}

fn default_threshold_method() -> ThresholdMethod {
    ThresholdMethod::Gaussian
}

fn default_block_size() -> i32 {
    25
}

fn default_bias() -> f64 {
    16.0
}

fn default_median_kernel() -> i32 {
    5
}

fn default_dilate_kernel() -> i32 {
    3
}

fn default_dilate_iterations() -> i32 {
    1
}

fn default_occupied_threshold() -> i32 {
    900
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            blur_kernel: default_blur_kernel(),
            blur_sigma: default_blur_sigma(),
            threshold_method: default_threshold_method(),
            block_size: default_block_size(),
            bias: default_bias(),
            median_kernel: default_median_kernel(),
            dilate_kernel: default_dilate_kernel(),
            dilate_iterations: default_dilate_iterations(),
            occupied_threshold: default_occupied_threshold(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.blur_kernel < 1 || self.blur_kernel % 2 == 0 {
            return Err(format!(
                "blur_kernel must be a positive odd number, got {}",
                self.blur_kernel
            ));
        }
        if self.block_size < 3 || self.block_size % 2 == 0 {
            return Err(format!(
                "block_size must be an odd number >= 3, got {}",
                self.block_size
            ));
        }
        if self.median_kernel < 3 || self.median_kernel % 2 == 0 {
            return Err(format!(
                "median_kernel must be an odd number >= 3, got {}",
                self.median_kernel
            ));
        }
        if self.dilate_kernel < 1 {
            return Err(format!(
                "dilate_kernel must be positive, got {}",
                self.dilate_kernel
            ));
        }
        if self.dilate_iterations < 0 {
            return Err(format!(
                "dilate_iterations must not be negative, got {}",
                self.dilate_iterations
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path =
        std::env::current_dir().map_err(|e| config::ConfigError::Message(e.to_string()))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("PF")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.detector.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fps_to_delay_ms() {
        assert_eq!(fps_to_delay_ms(30), 33);
        assert_eq!(fps_to_delay_ms(60), 17);
        assert_eq!(fps_to_delay_ms(0), 0);
    }

    #[test]
    fn test_detector_defaults_are_valid() {
        let detector = DetectorConfig::default();
        assert_eq!(detector.block_size, 25);
        assert_eq!(detector.bias, 16.0);
        assert_eq!(detector.occupied_threshold, 900);
        assert!(detector.validate().is_ok());
    }

    #[test]
    fn test_detector_rejects_even_kernels() {
        let detector = DetectorConfig {
            block_size: 24,
            ..DetectorConfig::default()
        };
        assert!(detector.validate().is_err());

        let detector = DetectorConfig {
            median_kernel: 1,
            ..DetectorConfig::default()
        };
        assert!(detector.validate().is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        let level: LogLevel = "DEBUG".to_string().try_into().unwrap();
        assert_eq!(level.as_str(), "debug");
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }
}

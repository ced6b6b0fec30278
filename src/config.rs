use serde::Deserialize;

use crate::ranker::Dispersion;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub streams: StreamsConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    pub poll: PollConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub player: PlayerConfig,
    #[serde(default)]
    pub markers: MarkersConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    pub web: WebConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamsConfig {
    /// Number of individual streams, a positive multiple of 4
    pub count: usize,
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    #[serde(default = "default_mix_prefix")]
    pub mix_prefix: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RankingConfig {
    #[serde(default)]
    pub dispersion: Dispersion,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Remote media app server over HTTP
    Http,
    /// In-process motion detector bank fed through the web API
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,
    /// App server base, e.g. http://localhost:8768
    #[serde(default = "default_app_url")]
    pub app_url: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub timeout_ms: u64,
    /// Register streams and mixes again after this many failed fetches in a
    /// row; 0 never does
    #[serde(default = "default_resetup_after")]
    pub resetup_after: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_interval")]
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Playback and cluster labels refresh once every this many ticks
    #[serde(default = "default_refresh_every")]
    pub refresh_every: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlayerConfig {
    pub app_id: String,
    pub app_key: String,
    #[serde(default = "default_media_server")]
    pub play_server: String,
    #[serde(default = "default_media_server")]
    pub publish_server: String,
    /// Wait for a server lookup before running playback commands
    #[serde(default)]
    pub await_server_info: bool,
    /// Give up on the lookup and keep the configured servers after this long
    #[serde(default = "default_server_info_timeout")]
    pub server_info_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarkersConfig {
    #[serde(default = "default_marker_size")]
    pub base_size: f64,
    #[serde(default = "default_cluster_zoom")]
    pub cluster_zoom: u8,
    /// (lat, lng) per stream followed by one per mix
    #[serde(default)]
    pub positions: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_train_set")]
    pub train_set: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_retry_interval(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { refresh_every: default_refresh_every() }
    }
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            base_size: default_marker_size(),
            cluster_zoom: default_cluster_zoom(),
            positions: Vec::new(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self { train_set: default_train_set() }
    }
}

// Default value functions
fn default_stream_prefix() -> String { "crowd".to_string() }
fn default_mix_prefix() -> String { "mix".to_string() }
fn default_source() -> SourceKind { SourceKind::Http }
fn default_app_url() -> String { "http://localhost:8768".to_string() }
fn default_app_name() -> String { "myapp".to_string() }
fn default_poll_interval() -> u64 { 2000 }
fn default_request_timeout() -> u64 { 25_000 }
fn default_resetup_after() -> u64 { 5 }
fn default_max_attempts() -> u32 { 25 }
fn default_retry_interval() -> u64 { 1000 }
fn default_refresh_every() -> u64 { 10 }
fn default_media_server() -> String { "rtmp://ppc.mosami.com/live".to_string() }
fn default_server_info_timeout() -> u64 { 100_000 }
fn default_marker_size() -> f64 { 10.0 }
fn default_cluster_zoom() -> u8 { 16 }
fn default_train_set() -> usize { 20_000 }
fn default_true() -> bool { true }
fn default_web_address() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8080 }

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.session.refresh_every == 0 {
            return Err(anyhow::anyhow!("session.refresh_every must be at least 1"));
        }
        Ok(config)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::parse(
        r#"
        [streams]
        count = 8

        [poll]
        source = "local"

        [retry]
        max_attempts = 3
        interval_ms = 1

        [player]
        app_id = "4457c42e"
        app_key = "secret"

        [markers]
        positions = [
            [42.3583, -71.0946], [42.3591, -71.0934], [42.3588, -71.0946], [42.3587, -71.0936],
            [42.3591, -71.0917], [42.3584, -71.0914], [42.3577, -71.0920], [42.3576, -71.0927],
            [42.3586, -71.0941], [42.3581, -71.0915],
        ]

        [web]
        enabled = false
        "#,
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = test_config();
        assert_eq!(config.streams.stream_prefix, "crowd");
        assert_eq!(config.streams.mix_prefix, "mix");
        assert_eq!(config.ranking.dispersion, Dispersion::Legacy);
        assert_eq!(config.poll.interval_ms, 2000);
        assert_eq!(config.poll.resetup_after, 5);
        assert_eq!(config.session.refresh_every, 10);
        assert_eq!(config.markers.base_size, 10.0);
        assert_eq!(config.detector.train_set, 20_000);
        assert_eq!(config.player.play_server, "rtmp://ppc.mosami.com/live");
    }

    #[test]
    fn test_dispersion_and_positions_parse() {
        let config = Config::parse(
            r#"
            [streams]
            count = 4
            [ranking]
            dispersion = "sample"
            [poll]
            [player]
            app_id = "a"
            app_key = "k"
            [markers]
            positions = [[42.358, -71.094], [42.359, -71.093]]
            [web]
            "#,
        )
        .unwrap();
        assert_eq!(config.ranking.dispersion, Dispersion::Sample);
        assert_eq!(config.poll.source, SourceKind::Http);
        assert_eq!(config.markers.positions.len(), 2);
        assert_eq!(config.markers.positions[1], (42.359, -71.093));
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = Config::parse(include_str!("../crowdwatch.toml")).unwrap();
        assert_eq!(config.streams.count, 8);
        assert_eq!(config.poll.source, SourceKind::Http);
        assert_eq!(config.markers.positions.len(), 10);
        assert!(config.web.enabled);
    }

    #[test]
    fn test_zero_refresh_rejected() {
        let result = Config::parse(
            r#"
            [streams]
            count = 4
            [poll]
            [session]
            refresh_every = 0
            [player]
            app_id = "a"
            app_key = "k"
            [web]
            "#,
        );
        assert!(result.is_err());
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::{PollConfig, SourceKind};
use crate::detector::DetectorBank;
use crate::error::SourceError;
use crate::streams::StreamLayout;

/// Client for the media app server's command endpoint:
/// `GET {app_url}/apps/{app_name}?commandType=..&argString=..`
pub struct AppClient {
    http: reqwest::Client,
    endpoint: String,
}

impl AppClient {
    pub fn new(config: &PollConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        let endpoint = format!("{}/apps/{}", config.app_url.trim_end_matches('/'), config.app_name);
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn command(&self, command: &str, args: &str) -> Result<Map<String, Value>, SourceError> {
        debug!("App command {} [{}]", command, args);
        let body: Value = self
            .http
            .get(&self.endpoint)
            .query(&[("commandType", command), ("argString", args)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        check_response(command, body)
    }

    /// Starts motion tracking for every individual stream
    pub async fn add_videos(&self, layout: &StreamLayout) -> Result<(), SourceError> {
        self.command("addVideo", &layout.detect_args()).await?;
        Ok(())
    }

    /// Creates the mixes one after another, mix 1 first
    pub async fn make_mixes(&self, layout: &StreamLayout) -> Result<(), SourceError> {
        for group in 1..=layout.mix_count() {
            self.command("makeMix", &layout.mix_args(group)).await?;
        }
        Ok(())
    }

    pub async fn anomaly_detect(&self, layout: &StreamLayout) -> Result<HashMap<String, f64>, SourceError> {
        let body = self.command("anomalyDetect", &layout.detect_args()).await?;
        Ok(parse_scores(&body))
    }
}

/// Rejects non-object bodies and replies flagged `wasSuccess: "No"`.
pub fn check_response(command: &str, body: Value) -> Result<Map<String, Value>, SourceError> {
    let map = match body {
        Value::Object(map) => map,
        other => {
            return Err(SourceError::Malformed {
                command: command.to_string(),
                detail: format!("expected a JSON object, got {}", other),
            })
        }
    };
    if let Some(flag) = map.get("wasSuccess") {
        if flag.as_str() != Some("Yes") {
            return Err(SourceError::Rejected {
                command: command.to_string(),
                detail: format!("wasSuccess={}", flag),
            });
        }
    }
    Ok(map)
}

/// Numeric entries only; status fields such as `wasSuccess` drop out.
pub fn parse_scores(body: &Map<String, Value>) -> HashMap<String, f64> {
    body.iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
        .collect()
}

/// Where each tick's scores come from.
pub enum ScoreSource {
    Http(AppClient),
    Local(Arc<DetectorBank>),
}

impl ScoreSource {
    pub fn from_config(config: &PollConfig, bank: Arc<DetectorBank>) -> anyhow::Result<Self> {
        Ok(match config.source {
            SourceKind::Http => {
                let client = AppClient::new(config)?;
                info!("Polling app server at {}", client.endpoint());
                ScoreSource::Http(client)
            }
            SourceKind::Local => {
                info!("Scoring streams with the local detector bank");
                ScoreSource::Local(bank)
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScoreSource::Http(_) => "http",
            ScoreSource::Local(_) => "local",
        }
    }

    /// Registers the streams and mixes with the source
    pub async fn setup(&self, layout: &StreamLayout) -> Result<(), SourceError> {
        match self {
            ScoreSource::Http(client) => {
                client.add_videos(layout).await?;
                client.make_mixes(layout).await
            }
            ScoreSource::Local(bank) => {
                bank.register(&layout.stream_names());
                Ok(())
            }
        }
    }

    pub async fn fetch(&self, layout: &StreamLayout) -> Result<HashMap<String, f64>, SourceError> {
        match self {
            ScoreSource::Http(client) => client.anomaly_detect(layout).await,
            ScoreSource::Local(bank) => Ok(bank.normality_scores(&layout.stream_names())),
        }
    }
}

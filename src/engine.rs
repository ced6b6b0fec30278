use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detector::{DetectorBank, MotionSample};
use crate::error::{RankError, RetryError, SourceError};
use crate::markers::{MarkerBoard, MarkerView};
use crate::player::{CaptureElement, CaptureError, PlayerHub, RecordingSurface, ServerLookup};
use crate::ranker::{AnomalyRanker, Ranking};
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionLabels, TickOutcome};
use crate::source::ScoreSource;
use crate::streams::{StreamLayout, StreamSet};

/// Latest completed tick, as served to the display layer
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub tick: u64,
    pub computed_at: DateTime<Utc>,
    pub ranking: Ranking,
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub ranking: Ranking,
    pub refreshed: bool,
}

#[derive(Default)]
struct TickCounters {
    ticks: AtomicU64,
    refreshes: AtomicU64,
    fetch_failures: AtomicU64,
    /// Failed fetches since the last good one
    fetch_streak: AtomicU64,
    setup_failures: AtomicU64,
    domain_failures: AtomicU64,
    input_shape_failures: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl TickCounters {
    fn record_rank_failure(&self, error: &RankError) {
        debug!("Tick rejected ({})", error.kind());
        match error {
            RankError::Domain(_) => self.domain_failures.fetch_add(1, Ordering::Relaxed),
            RankError::InputShape(_) | RankError::Configuration(_) => {
                self.input_shape_failures.fetch_add(1, Ordering::Relaxed)
            }
        };
        *self.last_error.write() = Some(error.to_string());
    }

    fn record_fetch_failure(&self, error: &SourceError) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
    }
}

/// Core engine - turns each poll tick into a ranking, marker sizes and
/// playback changes
pub struct RankingEngine {
    pub config: Arc<Config>,
    pub layout: StreamLayout,
    pub ranker: AnomalyRanker,
    pub source: ScoreSource,
    pub detectors: Arc<DetectorBank>,
    pub retry: RetryPolicy,
    session: RwLock<Session>,
    markers: RwLock<MarkerBoard>,
    player: Mutex<PlayerHub<RecordingSurface>>,
    captures: DashMap<String, Arc<CaptureElement>>,
    /// Streams and mixes are known to the score source
    registered: AtomicBool,
    latest: RwLock<Option<Snapshot>>,
    counters: TickCounters,
}

impl RankingEngine {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let layout = StreamLayout::from_config(&config.streams)?;
        let ranker = AnomalyRanker::new(layout.clone(), config.ranking.dispersion);
        let detectors = Arc::new(DetectorBank::new(config.detector.train_set));
        let source = ScoreSource::from_config(&config.poll, detectors.clone())?;
        let retry = RetryPolicy::from_config(&config.retry)?;
        let markers = MarkerBoard::new(&layout, &config.markers)?;
        let session = Session::new(&layout, config.session.refresh_every);
        let player = PlayerHub::new(&config.player, RecordingSurface::new(), retry);

        info!(
            "Ranking {} streams in {} mixes ({:?} dispersion, {} source)",
            layout.stream_count(),
            layout.mix_count(),
            ranker.dispersion(),
            source.name()
        );

        Ok(Self {
            config,
            layout,
            ranker,
            source,
            detectors,
            retry,
            session: RwLock::new(session),
            markers: RwLock::new(markers),
            player: Mutex::new(player),
            captures: DashMap::new(),
            registered: AtomicBool::new(false),
            latest: RwLock::new(None),
            counters: TickCounters::default(),
        })
    }

    /// Registers streams and mixes with the score source, retrying transport
    /// failures
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        self.retry
            .run("source setup", |_| self.source.setup(&self.layout), SourceError::is_transient)
            .await
            .map_err(|e| {
                self.counters.setup_failures.fetch_add(1, Ordering::Relaxed);
                *self.counters.last_error.write() = Some(e.to_string());
                anyhow::anyhow!("Failed to set up {} score source: {}", self.source.name(), e)
            })?;
        self.registered.store(true, Ordering::Release);
        info!("Score source ready: {} streams, {} mixes", self.layout.stream_count(), self.layout.mix_count());
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Handle one poll tick's scores
    pub fn handle_tick(&self, scores: &HashMap<String, f64>) -> Result<TickReport, RankError> {
        let ranking = StreamSet::from_scores(&self.layout, scores)
            .and_then(|set| self.ranker.rank(&set))
            .map_err(|e| {
                self.counters.record_rank_failure(&e);
                e
            })?;

        // Session lock serializes ticks
        let mut session = self.session.write();
        self.markers.write().apply(&ranking);

        let outcome = session.advance(&ranking);
        let tick = session.labels().tick;
        let refreshed = match outcome {
            TickOutcome::Refresh(plan) => {
                self.player.lock().apply_plan(&plan);
                self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
                true
            }
            TickOutcome::Quiet => false,
        };

        *self.latest.write() = Some(Snapshot {
            tick,
            computed_at: Utc::now(),
            ranking: ranking.clone(),
        });
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        Ok(TickReport { tick, ranking, refreshed })
    }

    /// Fetch and handle a single tick, setting the source up first if it
    /// has not been (or has lost track of the streams)
    pub async fn poll_once(&self) -> anyhow::Result<TickReport> {
        if !self.is_registered() {
            self.bootstrap().await?;
        }

        let scores = match self.source.fetch(&self.layout).await {
            Ok(scores) => {
                self.counters.fetch_streak.store(0, Ordering::Relaxed);
                scores
            }
            Err(e) => {
                self.counters.record_fetch_failure(&e);
                let streak = self.counters.fetch_streak.fetch_add(1, Ordering::Relaxed) + 1;
                let limit = self.config.poll.resetup_after;
                if limit > 0 && streak >= limit {
                    warn!("{} fetches failed in a row, registering streams again", streak);
                    self.registered.store(false, Ordering::Release);
                    self.counters.fetch_streak.store(0, Ordering::Relaxed);
                }
                return Err(e.into());
            }
        };
        Ok(self.handle_tick(&scores)?)
    }

    /// Poll loop - one tick every `poll.interval_ms`
    pub async fn run_poll_loop(&self) {
        let interval = Duration::from_millis(self.config.poll.interval_ms);
        info!("Poll loop started (interval: {:?})", interval);

        loop {
            tokio::time::sleep(interval).await;
            match self.poll_once().await {
                Ok(report) => debug!(
                    "Tick {}: top3 {:?}, mix {}{}",
                    report.tick,
                    report.ranking.result.top3,
                    report.ranking.result.best_mix.name,
                    if report.refreshed { " (refresh)" } else { "" }
                ),
                Err(e) => warn!("Tick skipped: {}", e),
            }
        }
    }

    /// Opens the player gate with the defaults if no lookup answered in time
    pub async fn run_server_info_timeout(&self) {
        if !self.config.player.await_server_info {
            return;
        }
        tokio::time::sleep(Duration::from_millis(self.config.player.server_info_timeout_ms)).await;
        let mut player = self.player.lock();
        if !player.is_ready() {
            let replayed = player.server_info(ServerLookup::Timeout);
            debug!("Replayed {} player commands after lookup timeout", replayed);
        }
    }

    pub fn server_info(&self, lookup: ServerLookup) -> usize {
        self.player.lock().server_info(lookup)
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.latest.read().clone()
    }

    pub fn session_labels(&self) -> SessionLabels {
        self.session.read().labels().clone()
    }

    pub fn marker_view(&self, zoom: u8) -> Vec<MarkerView> {
        self.markers.read().view(zoom)
    }

    pub fn locate(&self, name: &str) -> Option<(f64, f64)> {
        self.markers.read().locate(name)
    }

    pub fn feed_motion(&self, stream: &str, sample: MotionSample) -> Option<usize> {
        self.detectors.feed(stream, sample)
    }

    /// Capture element for `name`, created on first use
    pub fn capture(&self, name: &str) -> Arc<CaptureElement> {
        self.captures.entry(name.to_string()).or_default().value().clone()
    }

    /// Publishes a capture element to the current publish server, waiting for
    /// the page to report it ready. Returns the publish target.
    pub async fn publish_capture(&self, name: &str) -> Result<String, RetryError<CaptureError>> {
        let publisher = self.player.lock().publisher();
        let mut element = self.capture(name);
        publisher.publish(&mut element, name).await?;
        Ok(format!("{}/{}", publisher.path(), name))
    }

    pub fn player_stats(&self) -> serde_json::Value {
        let player = self.player.lock();
        let mut stats = player.surface().get_stats();
        stats["ready"] = serde_json::json!(player.is_ready());
        stats["queued"] = serde_json::json!(player.queued());
        let captures: HashMap<String, serde_json::Value> = self
            .captures
            .iter()
            .map(|entry| {
                let element = entry.value();
                (
                    entry.key().clone(),
                    serde_json::json!({ "ready": element.is_ready(), "target": element.target() }),
                )
            })
            .collect();
        stats["captures"] = serde_json::json!(captures);
        stats
    }

    /// Get stats for the web API
    pub fn get_stats(&self) -> serde_json::Value {
        let c = &self.counters;
        serde_json::json!({
            "streams": self.layout.stream_count(),
            "mixes": self.layout.mix_count(),
            "source": self.source.name(),
            "dispersion": self.ranker.dispersion(),
            "ticks": c.ticks.load(Ordering::Relaxed),
            "refreshes": c.refreshes.load(Ordering::Relaxed),
            "registered": self.is_registered(),
            "failures": {
                "setup": c.setup_failures.load(Ordering::Relaxed),
                "fetch": c.fetch_failures.load(Ordering::Relaxed),
                "domain": c.domain_failures.load(Ordering::Relaxed),
                "input_shape": c.input_shape_failures.load(Ordering::Relaxed),
            },
            "last_error": *c.last_error.read(),
            "detectors": self.detectors.get_stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::player::PlayerSlot;

    fn engine(refresh_every: u64) -> RankingEngine {
        let mut config = test_config();
        config.session.refresh_every = refresh_every;
        RankingEngine::new(Arc::new(config)).unwrap()
    }

    fn scores(values: &[f64]) -> HashMap<String, f64> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| (format!("crowd{}", i + 1), v))
            .collect()
    }

    const TICK: [f64; 8] = [0.9, 0.91, 0.92, 0.9, 0.1, 0.95, 0.05, 0.99];

    #[test]
    fn test_bad_layout_rejected() {
        let mut config = test_config();
        config.streams.count = 5;
        assert!(RankingEngine::new(Arc::new(config)).is_err());
    }

    #[test]
    fn test_unplaced_markers_rejected() {
        let mut config = test_config();
        config.markers.positions.clear();
        assert!(RankingEngine::new(Arc::new(config)).is_err());
    }

    #[test]
    fn test_tick_updates_snapshot_and_markers() {
        let engine = engine(10);
        let report = engine.handle_tick(&scores(&TICK)).unwrap();
        assert_eq!(report.tick, 1);
        assert!(!report.refreshed);
        assert_eq!(report.ranking.result.best_mix.name, "mix2");

        let snapshot = engine.latest().unwrap();
        assert_eq!(snapshot.tick, 1);
        assert_eq!(engine.session_labels().anomaly_one, "crowd8");

        let view = engine.marker_view(18);
        assert_eq!(view[4].scale, 15.0);
        assert_eq!(view[9].scale, 30.0);
    }

    #[test]
    fn test_refresh_starts_playback() {
        let engine = engine(2);
        engine.handle_tick(&scores(&TICK)).unwrap();
        assert!(engine.handle_tick(&scores(&TICK)).unwrap().refreshed);

        let player = engine.player_stats();
        assert_eq!(player["ready"], true);
        assert_eq!(
            player["slots"]["mix"]["source"],
            "rtmp://ppc.mosami.com/live/4457c42e/mix2"
        );
        assert_eq!(
            engine.player.lock().surface().source(PlayerSlot::First),
            Some("rtmp://ppc.mosami.com/live/4457c42e/crowd8")
        );
        assert_eq!(engine.get_stats()["refreshes"], 1);
    }

    #[test]
    fn test_failed_tick_keeps_previous_snapshot() {
        let engine = engine(10);
        engine.handle_tick(&scores(&TICK)).unwrap();

        let mut partial = scores(&TICK);
        partial.remove("crowd4");
        assert!(matches!(engine.handle_tick(&partial), Err(RankError::InputShape(_))));
        assert!(matches!(engine.handle_tick(&scores(&[0.5; 8])), Err(RankError::Domain(_))));

        assert_eq!(engine.latest().unwrap().tick, 1);
        assert_eq!(engine.session_labels().tick, 1);
        let stats = engine.get_stats();
        assert_eq!(stats["failures"]["input_shape"], 1);
        assert_eq!(stats["failures"]["domain"], 1);
        assert!(stats["last_error"].as_str().unwrap().starts_with("Domain error"));
    }

    #[tokio::test]
    async fn test_capture_publish_waits_for_ready() {
        let engine = Arc::new(engine(10));

        let waiting = engine.clone();
        let publish = tokio::spawn(async move { waiting.publish_capture("cam1").await });
        tokio::task::yield_now().await;
        engine.capture("cam1").mark_ready();

        let target = publish.await.unwrap().unwrap();
        assert_eq!(target, "rtmp://ppc.mosami.com/live/4457c42e/cam1");
        let stats = engine.player_stats();
        assert_eq!(stats["captures"]["cam1"]["ready"], true);
        assert_eq!(stats["captures"]["cam1"]["target"], target.as_str());
    }

    #[tokio::test]
    async fn test_poll_sets_up_unregistered_source() {
        let engine = engine(10);
        assert!(!engine.is_registered());
        assert!(engine.feed_motion("crowd1", MotionSample { n_right: 1.0, n_left: 0.0, n_up: 0.0, n_down: 0.0 }).is_none());

        // Setup runs, then the tick fails for lack of motion history
        assert!(engine.poll_once().await.is_err());
        assert!(engine.is_registered());
        assert!(engine.feed_motion("crowd1", MotionSample { n_right: 1.0, n_left: 0.0, n_up: 0.0, n_down: 0.0 }).is_some());
    }

    #[tokio::test]
    async fn test_failed_fetches_trigger_setup_again() {
        use axum::{extract::Query, routing::get, Json, Router};

        let commands: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log = commands.clone();
        let app = Router::new().route(
            "/apps/myapp",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let log = log.clone();
                async move {
                    let command = params.get("commandType").cloned().unwrap_or_default();
                    log.lock().push(command.clone());
                    // The app has forgotten the streams: detection is refused
                    let ok = if command == "anomalyDetect" { "No" } else { "Yes" };
                    Json(serde_json::json!({ "wasSuccess": ok }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = test_config();
        config.poll.source = crate::config::SourceKind::Http;
        config.poll.app_url = format!("http://{}", addr);
        config.poll.resetup_after = 2;
        let engine = RankingEngine::new(Arc::new(config)).unwrap();

        for _ in 0..3 {
            assert!(engine.poll_once().await.is_err());
        }

        let commands = commands.lock();
        let setups = commands.iter().filter(|c| c.as_str() == "addVideo").count();
        assert_eq!(setups, 2);
        assert_eq!(
            *commands,
            vec![
                "addVideo", "makeMix", "makeMix", "anomalyDetect", "anomalyDetect",
                "addVideo", "makeMix", "makeMix", "anomalyDetect",
            ]
        );
        assert_eq!(engine.get_stats()["failures"]["fetch"], 3);
    }

    #[tokio::test]
    async fn test_unreachable_source_is_counted() {
        let mut config = test_config();
        config.poll.source = crate::config::SourceKind::Http;
        config.poll.app_url = "http://127.0.0.1:1".to_string();
        let engine = RankingEngine::new(Arc::new(config)).unwrap();

        assert!(engine.poll_once().await.is_err());
        assert!(!engine.is_registered());
        let stats = engine.get_stats();
        assert_eq!(stats["failures"]["setup"], 1);
        assert_eq!(stats["registered"], false);
    }

    #[tokio::test]
    async fn test_local_source_poll() {
        let engine = engine(10);
        engine.bootstrap().await.unwrap();

        // No motion yet: every stream is missing from the tick
        assert!(engine.poll_once().await.is_err());

        for i in 0..40 {
            for s in 1..=8 {
                let v = ((i + s) % 7) as f64 + 1.0;
                let sample = MotionSample { n_right: v, n_left: v * 0.5, n_up: 1.0 + (i % 3) as f64, n_down: v };
                engine.feed_motion(&format!("crowd{}", s), sample).unwrap();
            }
        }
        let report = engine.poll_once().await.unwrap();
        assert_eq!(report.tick, 1);
        assert_eq!(report.ranking.weights.len(), 8);
        assert_eq!(engine.get_stats()["failures"]["input_shape"], 1);
    }
}

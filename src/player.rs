use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::PlayerConfig;
use crate::error::RetryError;
use crate::gate::{ReadyGate, Submission};
use crate::retry::RetryPolicy;

/// Playback panes on the front end
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerSlot {
    Mix,
    First,
    Second,
    Third,
}

impl PlayerSlot {
    pub const ALL: [PlayerSlot; 4] = [PlayerSlot::Mix, PlayerSlot::First, PlayerSlot::Second, PlayerSlot::Third];
}

/// Streams to show after a cluster refresh
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackPlan {
    pub assignments: Vec<(PlayerSlot, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCommand {
    Start { slot: PlayerSlot, stream: String },
    Stop { slot: PlayerSlot },
}

/// What a playback element needs to open a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRequest {
    pub source: String,
    pub app_id: String,
    pub app_key: String,
}

/// Anything that can show or clear a stream in a slot.
pub trait PlaybackSurface {
    fn start(&mut self, slot: PlayerSlot, request: &PlayRequest);
    fn stop(&mut self, slot: PlayerSlot);
}

/// Reply from the media server lookup that decides where to play and publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLookup {
    Found { play: String, publish: String },
    Timeout,
}

/// Failure from a capture element asked to publish.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The element exists but its publish entry point is not wired yet
    #[error("capture element not ready")]
    NotReady,
    #[error("capture element failed: {0}")]
    Failed(String),
}

/// A camera capture element that can publish to the media server.
pub trait CaptureHandle {
    fn publish(&mut self, path: &str, name: &str) -> Result<(), CaptureError>;
}

/// Browser-side capture element as seen from the service: the page reports
/// when its publish entry point is wired, and reads back where to publish.
#[derive(Debug, Default)]
pub struct CaptureElement {
    ready: AtomicBool,
    target: Mutex<Option<String>>,
}

impl CaptureElement {
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// `{publish_path}/{name}` once a publish went through
    pub fn target(&self) -> Option<String> {
        self.target.lock().clone()
    }
}

impl CaptureHandle for Arc<CaptureElement> {
    fn publish(&mut self, path: &str, name: &str) -> Result<(), CaptureError> {
        if !self.is_ready() {
            return Err(CaptureError::NotReady);
        }
        *self.target.lock() = Some(format!("{}/{}", path, name));
        Ok(())
    }
}

/// Publish target plus retry policy, taken from the hub so a publish can wait
/// on a slow capture element without holding the hub.
#[derive(Debug, Clone)]
pub struct Publisher {
    path: String,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Publishes `name` from a capture element, retrying while it is not ready.
    pub async fn publish<H: CaptureHandle>(&self, handle: &mut H, name: &str) -> Result<(), RetryError<CaptureError>> {
        let path = self.path.as_str();
        let label = format!("publish {}/{}", path, name);
        self.retry
            .run(
                &label,
                |_| {
                    let result = handle.publish(path, name);
                    async move { result }
                },
                |e| *e == CaptureError::NotReady,
            )
            .await?;
        info!("Published {}/{}", path, name);
        Ok(())
    }
}

/// Routes playback commands to a surface, holding them back until the media
/// server lookup has answered when configured to wait for it.
pub struct PlayerHub<S> {
    surface: S,
    gate: ReadyGate<PlayerCommand>,
    play_base: String,
    publish_base: String,
    app_id: String,
    app_key: String,
    retry: RetryPolicy,
}

impl<S: PlaybackSurface> PlayerHub<S> {
    pub fn new(config: &PlayerConfig, surface: S, retry: RetryPolicy) -> Self {
        let gate = if config.await_server_info {
            debug!("Player commands held until the media server lookup answers");
            ReadyGate::pending()
        } else {
            ReadyGate::ready()
        };
        Self {
            surface,
            gate,
            play_base: config.play_server.clone(),
            publish_base: config.publish_server.clone(),
            app_id: config.app_id.clone(),
            app_key: config.app_key.clone(),
            retry,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn queued(&self) -> usize {
        self.gate.queued()
    }

    pub fn submit(&mut self, command: PlayerCommand) {
        match self.gate.submit(command) {
            Submission::Run(command) => self.execute(command),
            Submission::Queued { position } => debug!("Player command queued at position {}", position),
        }
    }

    pub fn apply_plan(&mut self, plan: &PlaybackPlan) {
        for slot in PlayerSlot::ALL {
            self.submit(PlayerCommand::Stop { slot });
        }
        for (slot, stream) in &plan.assignments {
            self.submit(PlayerCommand::Start { slot: *slot, stream: stream.clone() });
        }
    }

    /// Applies the lookup result, opens the gate and replays everything queued.
    /// Returns how many commands were replayed.
    pub fn server_info(&mut self, lookup: ServerLookup) -> usize {
        match lookup {
            ServerLookup::Found { play, publish } => {
                info!("Media server lookup: play {}, publish {}", play, publish);
                self.play_base = play;
                self.publish_base = publish;
            }
            ServerLookup::Timeout => {
                info!(
                    "Media server lookup timed out, using defaults {}, {}",
                    self.publish_base, self.play_base
                );
            }
        }

        let queued = self.gate.open();
        let replayed = queued.len();
        for command in queued {
            self.execute(command);
        }
        replayed
    }

    /// Play URL for a stream: `{play_base}/{app_id}/{stream}`
    pub fn source_url(&self, stream: &str) -> String {
        if self.play_base.is_empty() {
            stream.to_string()
        } else {
            format!("{}/{}/{}", self.play_base, self.app_id, stream)
        }
    }

    pub fn publish_path(&self) -> String {
        if self.publish_base.is_empty() {
            String::new()
        } else {
            format!("{}/{}", self.publish_base, self.app_id)
        }
    }

    pub fn publisher(&self) -> Publisher {
        Publisher { path: self.publish_path(), retry: self.retry }
    }

    fn execute(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Start { slot, stream } => {
                let request = PlayRequest {
                    source: self.source_url(&stream),
                    app_id: self.app_id.clone(),
                    app_key: self.app_key.clone(),
                };
                self.surface.start(slot, &request);
            }
            PlayerCommand::Stop { slot } => self.surface.stop(slot),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotState {
    pub element_id: String,
    pub source: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// In-memory surface: remembers what each slot shows so the web API can
/// hand it to the browser.
#[derive(Debug, Clone)]
pub struct RecordingSurface {
    slots: BTreeMap<PlayerSlot, SlotState>,
    starts: u64,
    stops: u64,
}

impl RecordingSurface {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let slots = PlayerSlot::ALL
            .into_iter()
            .map(|slot| {
                let element_id = format!("playobj_{}", rng.gen_range(0..100_000_000u32));
                (slot, SlotState { element_id, source: None, started_at: None })
            })
            .collect();
        Self { slots, starts: 0, stops: 0 }
    }

    pub fn source(&self, slot: PlayerSlot) -> Option<&str> {
        self.slots.get(&slot).and_then(|s| s.source.as_deref())
    }

    pub fn get_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "slots": self.slots,
            "starts": self.starts,
            "stops": self.stops,
        })
    }
}

impl Default for RecordingSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSurface for RecordingSurface {
    fn start(&mut self, slot: PlayerSlot, request: &PlayRequest) {
        if let Some(state) = self.slots.get_mut(&slot) {
            state.source = Some(request.source.clone());
            state.started_at = Some(Utc::now());
        }
        self.starts += 1;
    }

    fn stop(&mut self, slot: PlayerSlot) {
        if let Some(state) = self.slots.get_mut(&slot) {
            state.source = None;
            state.started_at = None;
        }
        self.stops += 1;
    }
}

use serde::Serialize;

use crate::config::MarkersConfig;
use crate::error::RankError;
use crate::ranker::Ranking;
use crate::streams::StreamLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    Stream,
    Mix,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerView {
    pub name: String,
    pub kind: MarkerKind,
    pub position: (f64, f64),
    /// Circle radius to draw
    pub scale: f64,
    pub visible: bool,
}

/// Map markers for every stream and mix.
///
/// Zoomed out (cluster mode) only mix markers show; zoomed in only the
/// individual streams do.
#[derive(Debug, Clone)]
pub struct MarkerBoard {
    names: Vec<String>,
    kinds: Vec<MarkerKind>,
    positions: Vec<(f64, f64)>,
    scales: Vec<f64>,
    base_size: f64,
    cluster_zoom: u8,
}

impl MarkerBoard {
    pub fn new(layout: &StreamLayout, config: &MarkersConfig) -> Result<Self, RankError> {
        let names = layout.all_names();
        if config.positions.len() != names.len() {
            return Err(RankError::Configuration(format!(
                "{} marker positions configured, need {} ({} streams + {} mixes)",
                config.positions.len(),
                names.len(),
                layout.stream_count(),
                layout.mix_count()
            )));
        }
        if config.base_size.is_nan() || config.base_size <= 0.0 {
            return Err(RankError::Configuration("markers.base_size must be positive".to_string()));
        }

        let kinds = std::iter::repeat(MarkerKind::Stream)
            .take(layout.stream_count())
            .chain(std::iter::repeat(MarkerKind::Mix).take(layout.mix_count()))
            .collect();

        Ok(Self {
            scales: vec![config.base_size; names.len()],
            names,
            kinds,
            positions: config.positions.clone(),
            base_size: config.base_size,
            cluster_zoom: config.cluster_zoom,
        })
    }

    pub fn cluster_mode_for_zoom(&self, zoom: u8) -> bool {
        zoom <= self.cluster_zoom
    }

    /// Resizes every marker from a tick's weights
    pub fn apply(&mut self, ranking: &Ranking) {
        let stream_count = ranking.weights.len();
        for (i, w) in ranking.weights.iter().enumerate() {
            if let Some(scale) = self.scales.get_mut(i) {
                *scale = w.weight * self.base_size;
            }
        }
        for (j, m) in ranking.mixes.iter().enumerate() {
            if let Some(scale) = self.scales.get_mut(stream_count + j) {
                *scale = m.display_weight * self.base_size;
            }
        }
    }

    pub fn visibility(&self, cluster_mode: bool) -> Vec<bool> {
        self.kinds
            .iter()
            .map(|k| match k {
                MarkerKind::Stream => !cluster_mode,
                MarkerKind::Mix => cluster_mode,
            })
            .collect()
    }

    pub fn view(&self, zoom: u8) -> Vec<MarkerView> {
        let visible = self.visibility(self.cluster_mode_for_zoom(zoom));
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| MarkerView {
                name: name.clone(),
                kind: self.kinds[i],
                position: self.positions[i],
                scale: self.scales[i],
                visible: visible[i],
            })
            .collect()
    }

    /// Position to pan to when jumping to a stream or mix
    pub fn locate(&self, name: &str) -> Option<(f64, f64)> {
        self.names.iter().position(|n| n == name).map(|i| self.positions[i])
    }
}

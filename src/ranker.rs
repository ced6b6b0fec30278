use serde::{Deserialize, Serialize};

use crate::error::RankError;
use crate::streams::{StreamLayout, StreamSet, MIX_SIZE};

/// Lower clamp for a marker weight
pub const WEIGHT_MIN: f64 = 0.5;
/// Upper clamp for a marker weight
pub const WEIGHT_MAX: f64 = 1.5;
/// Mix markers are drawn at half their aggregate weight
pub const MIX_DISPLAY_FACTOR: f64 = 0.5;

/// How the spread of a tick's scores is measured before taking z-scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dispersion {
    /// `sqrt(Σ(v - mean)²) / (n - 1)`, the formula the deployed map front end
    /// has always used. Marker sizes stay comparable with it.
    #[default]
    Legacy,
    /// Sample standard deviation, `sqrt(Σ(v - mean)² / (n - 1))`
    Sample,
}

impl Dispersion {
    fn measure(self, sum_sq: f64, count: usize) -> f64 {
        let denom = (count - 1) as f64;
        match self {
            Dispersion::Legacy => sum_sq.sqrt() / denom,
            Dispersion::Sample => (sum_sq / denom).sqrt(),
        }
    }
}

/// Clamped absolute z-scores, one per input, same order.
///
/// Fails with [`RankError::Domain`] for fewer than two values or when the
/// dispersion is zero (all values equal), where the z-score is undefined.
pub fn normalize(values: &[f64], dispersion: Dispersion) -> Result<Vec<f64>, RankError> {
    let count = values.len();
    if count <= 1 {
        return Err(RankError::Domain(format!(
            "need at least 2 values to normalize, got {}",
            count
        )));
    }

    // A flat tick can leave rounding residue in the mean, so test equality directly
    if values.iter().all(|&v| v == values[0]) {
        return Err(RankError::Domain(format!(
            "all {} values equal {}, z-score undefined",
            count, values[0]
        )));
    }

    let mean = values.iter().sum::<f64>() / count as f64;
    let sum_sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    let sd = dispersion.measure(sum_sq, count);

    if sd == 0.0 || !sd.is_finite() {
        return Err(RankError::Domain(format!(
            "dispersion is {} over {} values, z-score undefined",
            sd, count
        )));
    }

    Ok(values
        .iter()
        .map(|v| ((v - mean) / sd).abs().clamp(WEIGHT_MIN, WEIGHT_MAX))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedStream {
    pub name: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixWeight {
    /// 1-based group index
    pub index: usize,
    pub name: String,
    /// Sum of the four member weights
    pub aggregate: f64,
    /// `aggregate * 0.5`, the mix marker weight
    pub display_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MixId {
    pub index: usize,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingResult {
    /// Ascending by score, most anomalous last
    pub top3: [String; 3],
    pub best_mix: MixId,
}

impl RankingResult {
    /// The single stream ranked most anomalous
    pub fn most_anomalous(&self) -> &str {
        &self.top3[2]
    }
}

/// Everything one tick produces: the result plus per-marker weights.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking {
    pub result: RankingResult,
    pub weights: Vec<WeightedStream>,
    pub mixes: Vec<MixWeight>,
}

/// Aggregate weights per group of four, in group order.
pub fn mix_weights(layout: &StreamLayout, weights: &[f64]) -> Result<Vec<MixWeight>, RankError> {
    if weights.len() != layout.stream_count() {
        return Err(RankError::InputShape(format!(
            "expected {} weights, got {}",
            layout.stream_count(),
            weights.len()
        )));
    }

    Ok(weights
        .chunks_exact(MIX_SIZE)
        .enumerate()
        .map(|(i, group)| {
            let aggregate: f64 = group.iter().sum();
            MixWeight {
                index: i + 1,
                name: layout.mix_name(i + 1),
                aggregate,
                display_weight: aggregate * MIX_DISPLAY_FACTOR,
            }
        })
        .collect())
}

/// Strictly largest aggregate; the lowest index wins a tie.
pub fn best_mix(mixes: &[MixWeight]) -> Option<MixId> {
    let mut best: Option<&MixWeight> = None;
    for mix in mixes {
        if best.map_or(true, |b| mix.aggregate > b.aggregate) {
            best = Some(mix);
        }
    }
    best.map(|m| MixId { index: m.index, name: m.name.clone() })
}

/// Running selection of the three highest scores.
///
/// Slots are kept as low, mid, high. A score only displaces a slot it strictly
/// beats, so the earlier of two equal scores keeps its place.
#[derive(Debug, Default)]
struct TopThree<'a> {
    slots: [Option<(&'a str, f64)>; 3],
}

impl<'a> TopThree<'a> {
    fn offer(&mut self, name: &'a str, value: f64) {
        let beats = |slot: Option<(&str, f64)>| slot.map_or(true, |(_, v)| value > v);
        let entry = Some((name, value));

        if beats(self.slots[2]) {
            self.slots[0] = self.slots[1];
            self.slots[1] = self.slots[2];
            self.slots[2] = entry;
        } else if beats(self.slots[1]) {
            self.slots[0] = self.slots[1];
            self.slots[1] = entry;
        } else if beats(self.slots[0]) {
            self.slots[0] = entry;
        }
    }

    fn names(&self) -> Option<[String; 3]> {
        let [low, mid, high] = self.slots;
        Some([low?.0.to_string(), mid?.0.to_string(), high?.0.to_string()])
    }
}

/// Top-3 stream names ascending by score.
pub fn top_three<'a, I>(scores: I) -> Option<[String; 3]>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut top = TopThree::default();
    for (name, value) in scores {
        top.offer(name, value);
    }
    top.names()
}

/// Ranks one tick of stream scores. Stateless; safe to call every tick.
#[derive(Debug, Clone)]
pub struct AnomalyRanker {
    layout: StreamLayout,
    dispersion: Dispersion,
}

impl AnomalyRanker {
    pub fn new(layout: StreamLayout, dispersion: Dispersion) -> Self {
        Self { layout, dispersion }
    }

    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    pub fn dispersion(&self) -> Dispersion {
        self.dispersion
    }

    pub fn normalize(&self, values: &[f64]) -> Result<Vec<f64>, RankError> {
        normalize(values, self.dispersion)
    }

    pub fn rank(&self, set: &StreamSet) -> Result<Ranking, RankError> {
        let streams = set.streams();
        if streams.len() != self.layout.stream_count() {
            return Err(RankError::InputShape(format!(
                "expected {} stream scores, got {}",
                self.layout.stream_count(),
                streams.len()
            )));
        }

        // Mix entries never take part in normalization
        let weights = self.normalize(&set.values())?;

        let top3 = top_three(streams.iter().map(|s| (s.name.as_str(), s.value)))
            .ok_or_else(|| RankError::InputShape("fewer than 3 streams to rank".to_string()))?;

        let mixes = mix_weights(&self.layout, &weights)?;
        let best = best_mix(&mixes)
            .ok_or_else(|| RankError::InputShape("no mix groups to aggregate".to_string()))?;

        let weights = streams
            .iter()
            .zip(weights)
            .map(|(s, weight)| WeightedStream { name: s.name.clone(), weight })
            .collect();

        Ok(Ranking {
            result: RankingResult { top3, best_mix: best },
            weights,
            mixes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::StreamScore;

    fn ranker(count: usize) -> AnomalyRanker {
        AnomalyRanker::new(StreamLayout::new(count, "crowd", "mix").unwrap(), Dispersion::Legacy)
    }

    fn set(ranker: &AnomalyRanker, values: &[f64]) -> StreamSet {
        let streams = values
            .iter()
            .enumerate()
            .map(|(i, &value)| StreamScore { name: ranker.layout().stream_name(i + 1), value })
            .collect();
        StreamSet::from_streams(ranker.layout(), streams).unwrap()
    }

    #[test]
    fn test_weights_within_bounds() {
        let inputs: [&[f64]; 4] = [
            &[1.0, 5.0, 3.0, 9.0, 2.0, 7.0],
            &[0.1, 0.1, 0.1, 0.9],
            &[0.0, 1000.0],
            &[0.42, 0.43, 0.41, 0.44, 0.40, 0.45, 0.39, 0.46],
        ];
        for values in inputs {
            for dispersion in [Dispersion::Legacy, Dispersion::Sample] {
                let weights = normalize(values, dispersion).unwrap();
                assert_eq!(weights.len(), values.len());
                assert!(weights.iter().all(|w| (WEIGHT_MIN..=WEIGHT_MAX).contains(w)), "{:?}", weights);
            }
        }
    }

    #[test]
    fn test_normalize_is_pure() {
        let values = [0.3, 0.9, 0.5, 0.7, 0.2];
        assert_eq!(
            normalize(&values, Dispersion::Legacy).unwrap(),
            normalize(&values, Dispersion::Legacy).unwrap()
        );
    }

    #[test]
    fn test_clamp_boundaries() {
        // mean 1.5, Σd² = 9, legacy sd = 3 / 3 = 1: raw z = 1.5, 0.5, 0.5, 2.5
        let weights = normalize(&[0.0, 1.0, 1.0, 4.0], Dispersion::Legacy).unwrap();
        assert_eq!(weights, vec![1.5, 0.5, 0.5, 1.5]);
    }

    #[test]
    fn test_small_z_clamped_up() {
        // mean 4.5, the 5.0 sits 0.36 legacy sds away
        let weights = normalize(&[1.0, 5.0, 3.0, 9.0, 2.0, 7.0], Dispersion::Legacy).unwrap();
        assert_eq!(weights[1], 0.5);
        assert_eq!(weights[3], 1.5);
        assert!(weights[2] > 1.0 && weights[2] < 1.2);
    }

    #[test]
    fn test_legacy_and_sample_differ() {
        let values = [0.2, 0.4, 0.6, 0.8, 1.0];
        let legacy = normalize(&values, Dispersion::Legacy).unwrap();
        let sample = normalize(&values, Dispersion::Sample).unwrap();
        // sample sd is larger here, so its z-scores are smaller
        assert!(sample[1] < legacy[1]);
        assert_ne!(legacy, sample);
    }

    #[test]
    fn test_single_value_is_domain_error() {
        assert!(matches!(normalize(&[0.7], Dispersion::Legacy), Err(RankError::Domain(_))));
        assert!(matches!(normalize(&[], Dispersion::Legacy), Err(RankError::Domain(_))));
    }

    #[test]
    fn test_equal_values_is_domain_error() {
        assert!(matches!(normalize(&[0.5, 0.5, 0.5, 0.5], Dispersion::Sample), Err(RankError::Domain(_))));
    }

    #[test]
    fn test_flat_tick_with_inexact_mean_is_domain_error() {
        for v in [0.1, 0.7, 0.93, 0.3, 0.123456789] {
            for n in [3, 4, 8, 12, 16, 20] {
                for dispersion in [Dispersion::Legacy, Dispersion::Sample] {
                    let result = normalize(&vec![v; n], dispersion);
                    assert!(matches!(result, Err(RankError::Domain(_))), "n={} v={}: {:?}", n, v, result);
                }
            }
        }
    }

    #[test]
    fn test_top_three_ascending() {
        let names = ["a", "b", "c", "d", "e", "f"];
        let values = [1.0, 5.0, 3.0, 9.0, 2.0, 7.0];
        let top = top_three(names.iter().copied().zip(values)).unwrap();
        assert_eq!(top, ["b".to_string(), "f".to_string(), "d".to_string()]);
    }

    #[test]
    fn test_top_three_ties_keep_first() {
        let names = ["a", "b", "c", "d"];
        let values = [5.0, 5.0, 5.0, 5.0];
        let top = top_three(names.iter().copied().zip(values)).unwrap();
        // a arrives first into high and is never displaced by an equal score
        assert_eq!(top, ["c".to_string(), "b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_top_three_needs_three() {
        assert!(top_three([("a", 1.0), ("b", 2.0)]).is_none());
    }

    #[test]
    fn test_mix_aggregation() {
        let layout = StreamLayout::new(8, "crowd", "mix").unwrap();
        let mixes = mix_weights(&layout, &[1.0, 1.0, 1.0, 1.0, 0.5, 0.5, 0.5, 0.5]).unwrap();
        assert_eq!(mixes[0].aggregate, 4.0);
        assert_eq!(mixes[1].aggregate, 2.0);
        assert_eq!(mixes[0].display_weight, 2.0);
        assert_eq!(mixes[1].display_weight, 1.0);
        let best = best_mix(&mixes).unwrap();
        assert_eq!(best.index, 1);
        assert_eq!(best.name, "mix1");
    }

    #[test]
    fn test_mix_tie_picks_lower_index() {
        let layout = StreamLayout::new(12, "crowd", "mix").unwrap();
        let weights = [0.5, 0.5, 0.5, 0.5, 1.5, 1.0, 1.0, 0.5, 1.0, 1.0, 1.0, 1.0];
        let mixes = mix_weights(&layout, &weights).unwrap();
        assert_eq!(mixes[1].aggregate, mixes[2].aggregate);
        assert_eq!(best_mix(&mixes).unwrap().index, 2);
    }

    #[test]
    fn test_rank_full_tick() {
        let ranker = ranker(8);
        let tick = set(&ranker, &[0.9, 0.91, 0.92, 0.9, 0.1, 0.95, 0.05, 0.99]);
        let ranking = ranker.rank(&tick).unwrap();

        assert_eq!(
            ranking.result.top3,
            ["crowd3".to_string(), "crowd6".to_string(), "crowd8".to_string()]
        );
        assert_eq!(ranking.result.most_anomalous(), "crowd8");
        // crowd5 and crowd7 sit far below the mean, so the second group dominates
        assert_eq!(ranking.result.best_mix, MixId { index: 2, name: "mix2".to_string() });
        assert_eq!(ranking.weights.len(), 8);
        assert_eq!(ranking.weights[4].name, "crowd5");
        assert_eq!(ranking.weights[4].weight, WEIGHT_MAX);
        assert_eq!(ranking.mixes.len(), 2);
    }

    #[test]
    fn test_rank_degenerate_tick_fails() {
        let small = ranker(4);
        let tick = set(&small, &[1.0, 1.0, 1.0, 1.0]);
        assert!(matches!(small.rank(&tick), Err(RankError::Domain(_))));

        // 0.93 is inexact in binary; every camera reporting it is still a flat tick
        let full = ranker(8);
        let tick = set(&full, &[0.93; 8]);
        assert!(matches!(full.rank(&tick), Err(RankError::Domain(_))));
    }
}

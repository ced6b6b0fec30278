use std::collections::HashMap;

use serde::Serialize;

use crate::config::StreamsConfig;
use crate::error::RankError;

/// Streams per mix group
pub const MIX_SIZE: usize = 4;

/// Fixed naming and grouping of the individual streams and their mixes.
///
/// Individual streams are `{stream_prefix}1..={count}`, mixes are
/// `{mix_prefix}1..={count / 4}`; mix `g` covers streams `4g-3..=4g`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamLayout {
    count: usize,
    stream_prefix: String,
    mix_prefix: String,
}

impl StreamLayout {
    pub fn new(count: usize, stream_prefix: &str, mix_prefix: &str) -> Result<Self, RankError> {
        if count == 0 || count % MIX_SIZE != 0 {
            return Err(RankError::Configuration(format!(
                "stream count {} is not a positive multiple of {}",
                count, MIX_SIZE
            )));
        }
        if stream_prefix.is_empty() || mix_prefix.is_empty() {
            return Err(RankError::Configuration("stream and mix prefixes must not be empty".to_string()));
        }
        if stream_prefix == mix_prefix {
            return Err(RankError::Configuration(format!(
                "stream and mix prefix are both '{}'",
                stream_prefix
            )));
        }
        Ok(Self {
            count,
            stream_prefix: stream_prefix.to_string(),
            mix_prefix: mix_prefix.to_string(),
        })
    }

    pub fn from_config(config: &StreamsConfig) -> Result<Self, RankError> {
        Self::new(config.count, &config.stream_prefix, &config.mix_prefix)
    }

    pub fn stream_count(&self) -> usize {
        self.count
    }

    pub fn mix_count(&self) -> usize {
        self.count / MIX_SIZE
    }

    /// Name of the 1-based stream `index`
    pub fn stream_name(&self, index: usize) -> String {
        format!("{}{}", self.stream_prefix, index)
    }

    /// Name of the 1-based mix `group`
    pub fn mix_name(&self, group: usize) -> String {
        format!("{}{}", self.mix_prefix, group)
    }

    pub fn stream_names(&self) -> Vec<String> {
        (1..=self.count).map(|i| self.stream_name(i)).collect()
    }

    pub fn mix_names(&self) -> Vec<String> {
        (1..=self.mix_count()).map(|g| self.mix_name(g)).collect()
    }

    /// Streams first, then mixes; the marker and StreamSet order
    pub fn all_names(&self) -> Vec<String> {
        let mut names = self.stream_names();
        names.extend(self.mix_names());
        names
    }

    /// Member stream names of the 1-based mix `group`
    pub fn mix_members(&self, group: usize) -> Vec<String> {
        let first = MIX_SIZE * (group - 1) + 1;
        (first..first + MIX_SIZE).map(|i| self.stream_name(i)).collect()
    }

    /// `prepend` followed by `|`-joined stream names `start..=end` (1-based)
    pub fn param_string(&self, start: usize, end: usize, prepend: &str) -> String {
        let names: Vec<String> = (start..=end).map(|i| self.stream_name(i)).collect();
        format!("{}{}", prepend, names.join("|"))
    }

    /// argString for addVideo / anomalyDetect: every individual stream
    pub fn detect_args(&self) -> String {
        self.param_string(1, self.count, "")
    }

    /// argString for makeMix: mix name, then its four members
    pub fn mix_args(&self, group: usize) -> String {
        let prepend = format!("{}|", self.mix_name(group));
        self.param_string(MIX_SIZE * group - 3, MIX_SIZE * group, &prepend)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamScore {
    pub name: String,
    pub value: f64,
}

/// One poll tick's scores, in layout order.
///
/// Individual streams are always present; mix scores are carried when the
/// source reports them but never enter the ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSet {
    streams: Vec<StreamScore>,
    mixes: Vec<(String, Option<f64>)>,
}

impl StreamSet {
    /// Build from a poll-tick mapping. Every individual stream must be present
    /// with a finite, non-negative value; unknown keys are ignored.
    pub fn from_scores(layout: &StreamLayout, scores: &HashMap<String, f64>) -> Result<Self, RankError> {
        let mut missing = Vec::new();
        let mut invalid = Vec::new();
        let mut streams = Vec::with_capacity(layout.stream_count());

        for name in layout.stream_names() {
            match scores.get(&name) {
                Some(&value) if !is_valid_score(value) => invalid.push(format!("{}={}", name, value)),
                Some(&value) => streams.push(StreamScore { name, value }),
                None => missing.push(name),
            }
        }

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing scores for {}", missing.join(", ")));
        }
        if !invalid.is_empty() {
            problems.push(format!(
                "expected finite non-negative scores, got {}",
                invalid.join(", ")
            ));
        }
        if !problems.is_empty() {
            return Err(RankError::InputShape(problems.join("; ")));
        }

        let mut mixes = Vec::with_capacity(layout.mix_count());
        for name in layout.mix_names() {
            let value = scores.get(&name).copied();
            if let Some(v) = value {
                check_value(&name, v)?;
            }
            mixes.push((name, value));
        }

        Ok(Self { streams, mixes })
    }

    /// Direct construction from ordered individual scores, mix entries absent
    pub fn from_streams(layout: &StreamLayout, streams: Vec<StreamScore>) -> Result<Self, RankError> {
        if streams.len() != layout.stream_count() {
            return Err(RankError::InputShape(format!(
                "expected {} stream scores, got {}",
                layout.stream_count(),
                streams.len()
            )));
        }
        for s in &streams {
            check_value(&s.name, s.value)?;
        }
        let mixes = layout.mix_names().into_iter().map(|n| (n, None)).collect();
        Ok(Self { streams, mixes })
    }

    pub fn streams(&self) -> &[StreamScore] {
        &self.streams
    }

    pub fn values(&self) -> Vec<f64> {
        self.streams.iter().map(|s| s.value).collect()
    }

    pub fn mix_score(&self, group: usize) -> Option<f64> {
        self.mixes.get(group.wrapping_sub(1)).and_then(|(_, v)| *v)
    }

    pub fn mix_count(&self) -> usize {
        self.mixes.len()
    }
}

fn is_valid_score(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn check_value(name: &str, value: f64) -> Result<(), RankError> {
    if !is_valid_score(value) {
        return Err(RankError::InputShape(format!(
            "score for {} is {}, expected a finite non-negative number",
            name, value
        )));
    }
    Ok(())
}

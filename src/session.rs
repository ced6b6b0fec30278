use serde::Serialize;
use tracing::{debug, info};

use crate::player::{PlaybackPlan, PlayerSlot};
use crate::ranker::Ranking;
use crate::streams::StreamLayout;

/// Labels the display layer shows between ticks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionLabels {
    pub tick: u64,
    /// Most anomalous stream, then the runners-up
    pub anomaly_one: String,
    pub anomaly_two: String,
    pub anomaly_three: String,
    /// Best mix of the latest tick
    pub anomalous_mix: String,
    /// Mix announced at the latest refresh
    pub displayed_cluster: Option<String>,
    /// Mix announced at the refresh before that
    pub previous_cluster: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Labels updated, nothing to replay
    Quiet,
    /// Cluster announcement changed; restart playback per the plan
    Refresh(PlaybackPlan),
}

/// Cross-tick context, threaded through each poll cycle explicitly.
#[derive(Debug, Clone)]
pub struct Session {
    refresh_every: u64,
    labels: SessionLabels,
}

impl Session {
    pub fn new(layout: &StreamLayout, refresh_every: u64) -> Self {
        Self {
            refresh_every: refresh_every.max(1),
            labels: SessionLabels {
                tick: 0,
                anomaly_one: layout.stream_name(1),
                anomaly_two: layout.stream_name(2),
                anomaly_three: layout.stream_name(3),
                anomalous_mix: layout.mix_name(1),
                displayed_cluster: None,
                previous_cluster: None,
            },
        }
    }

    pub fn labels(&self) -> &SessionLabels {
        &self.labels
    }

    pub fn advance(&mut self, ranking: &Ranking) -> TickOutcome {
        let labels = &mut self.labels;
        labels.tick += 1;

        let [low, mid, high] = &ranking.result.top3;
        labels.anomaly_one = high.clone();
        labels.anomaly_two = mid.clone();
        labels.anomaly_three = low.clone();
        labels.anomalous_mix = ranking.result.best_mix.name.clone();

        if labels.tick % self.refresh_every != 0 {
            debug!("Tick {}: top {} / mix {}", labels.tick, labels.anomaly_one, labels.anomalous_mix);
            return TickOutcome::Quiet;
        }

        labels.previous_cluster = labels.displayed_cluster.take();
        labels.displayed_cluster = Some(labels.anomalous_mix.clone());
        info!(
            "Tick {}: anomalous cluster {} (previous {})",
            labels.tick,
            labels.anomalous_mix,
            labels.previous_cluster.as_deref().unwrap_or("-")
        );

        TickOutcome::Refresh(PlaybackPlan {
            assignments: vec![
                (PlayerSlot::First, labels.anomaly_one.clone()),
                (PlayerSlot::Second, labels.anomaly_two.clone()),
                (PlayerSlot::Third, labels.anomaly_three.clone()),
                (PlayerSlot::Mix, labels.anomalous_mix.clone()),
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranker::{MixId, RankingResult};

    fn layout() -> StreamLayout {
        StreamLayout::new(8, "crowd", "mix").unwrap()
    }

    fn ranking(top3: [&str; 3], mix: usize) -> Ranking {
        Ranking {
            result: RankingResult {
                top3: top3.map(String::from),
                best_mix: MixId { index: mix, name: format!("mix{}", mix) },
            },
            weights: Vec::new(),
            mixes: Vec::new(),
        }
    }

    #[test]
    fn test_initial_labels() {
        let session = Session::new(&layout(), 10);
        let labels = session.labels();
        assert_eq!(labels.tick, 0);
        assert_eq!(labels.anomaly_one, "crowd1");
        assert_eq!(labels.anomaly_three, "crowd3");
        assert_eq!(labels.anomalous_mix, "mix1");
        assert!(labels.previous_cluster.is_none());
    }

    #[test]
    fn test_labels_follow_every_tick() {
        let mut session = Session::new(&layout(), 10);
        let outcome = session.advance(&ranking(["crowd4", "crowd2", "crowd7"], 2));
        assert_eq!(outcome, TickOutcome::Quiet);
        let labels = session.labels();
        assert_eq!(labels.tick, 1);
        assert_eq!(labels.anomaly_one, "crowd7");
        assert_eq!(labels.anomaly_two, "crowd2");
        assert_eq!(labels.anomaly_three, "crowd4");
        assert_eq!(labels.anomalous_mix, "mix2");
        assert!(labels.displayed_cluster.is_none());
    }

    #[test]
    fn test_refresh_cadence_and_previous_cluster() {
        let mut session = Session::new(&layout(), 3);
        let r1 = ranking(["crowd1", "crowd2", "crowd3"], 1);
        let r2 = ranking(["crowd5", "crowd6", "crowd8"], 2);

        assert_eq!(session.advance(&r1), TickOutcome::Quiet);
        assert_eq!(session.advance(&r1), TickOutcome::Quiet);
        match session.advance(&r1) {
            TickOutcome::Refresh(plan) => {
                assert_eq!(plan.assignments[0], (PlayerSlot::First, "crowd3".to_string()));
                assert_eq!(plan.assignments[3], (PlayerSlot::Mix, "mix1".to_string()));
            }
            other => panic!("expected refresh on tick 3, got {:?}", other),
        }
        assert_eq!(session.labels().displayed_cluster.as_deref(), Some("mix1"));
        assert!(session.labels().previous_cluster.is_none());

        session.advance(&r2);
        session.advance(&r2);
        assert!(matches!(session.advance(&r2), TickOutcome::Refresh(_)));
        assert_eq!(session.labels().displayed_cluster.as_deref(), Some("mix2"));
        assert_eq!(session.labels().previous_cluster.as_deref(), Some("mix1"));
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut a = Session::new(&layout(), 1);
        let b = Session::new(&layout(), 1);
        a.advance(&ranking(["crowd5", "crowd6", "crowd8"], 2));
        assert_eq!(b.labels().tick, 0);
        assert_eq!(b.labels().anomalous_mix, "mix1");
    }
}

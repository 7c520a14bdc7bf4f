use serde::{Deserialize, Serialize};
use tracing::warn;

use super::harness::{ExampleResult, LabeledResult, LayerCounters, Tally};

pub const DEFAULT_GAP_THRESHOLD_POINTS: f64 = 5.0;

/// Whether an example's schema was part of training (`seen`) or held out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Population {
    Seen,
    Unseen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Syntax,
    Operator,
    Field,
    Overall,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Syntax, Metric::Operator, Metric::Field, Metric::Overall];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Operator => "operator",
            Self::Field => "field",
            Self::Overall => "overall",
        }
    }

    fn tally(self, counters: &LayerCounters) -> Tally {
        match self {
            Self::Syntax => counters.syntax,
            Self::Operator => counters.operator,
            Self::Field => counters.field,
            Self::Overall => counters.overall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricGap {
    pub metric: Metric,
    pub seen_pass_rate: Option<f64>,
    pub unseen_pass_rate: Option<f64>,
    /// Absolute difference in percentage points.
    pub gap_points: Option<f64>,
    pub exceeds_threshold: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralizationReport {
    pub threshold_points: f64,
    pub seen_examples: usize,
    pub unseen_examples: usize,
    pub metrics: Vec<MetricGap>,
    /// Advisory for the batch as a whole; no single example failed because of it.
    pub flagged: bool,
}

impl GeneralizationReport {
    pub fn metric(&self, metric: Metric) -> Option<&MetricGap> {
        self.metrics.iter().find(|gap| gap.metric == metric)
    }
}

/// Compare pass rates of the `seen` and `unseen` populations.
///
/// Each rate covers only examples that reached the layer; a side with no such
/// examples has no rate and its metric is never flagged. Unlabelled results
/// are ignored.
pub fn compare_populations(results: &[LabeledResult], threshold_points: f64) -> GeneralizationReport {
    let population = |wanted: Population| {
        results
            .iter()
            .filter(move |labeled| labeled.population == Some(wanted))
            .map(|labeled| &labeled.result)
    };

    compare(
        population(Population::Seen),
        population(Population::Unseen),
        threshold_points,
    )
}

pub fn compare<'a, S, U>(seen: S, unseen: U, threshold_points: f64) -> GeneralizationReport
where
    S: IntoIterator<Item = &'a ExampleResult>,
    U: IntoIterator<Item = &'a ExampleResult>,
{
    let seen = LayerCounters::from_results(seen);
    let unseen = LayerCounters::from_results(unseen);

    let metrics = Metric::ALL
        .iter()
        .map(|metric| {
            let seen_pass_rate = metric.tally(&seen).pass_rate();
            let unseen_pass_rate = metric.tally(&unseen).pass_rate();
            let gap_points = match (seen_pass_rate, unseen_pass_rate) {
                (Some(seen_rate), Some(unseen_rate)) => {
                    Some((seen_rate - unseen_rate).abs() * 100.0)
                }
                _ => None,
            };
            let exceeds_threshold = gap_points.is_some_and(|gap| gap > threshold_points);

            if exceeds_threshold {
                warn!(
                    metric = metric.as_str(),
                    seen_pass_rate = ?seen_pass_rate,
                    unseen_pass_rate = ?unseen_pass_rate,
                    gap_points = ?gap_points,
                    threshold_points,
                    "generalization gap exceeds threshold"
                );
            }

            MetricGap {
                metric: *metric,
                seen_pass_rate,
                unseen_pass_rate,
                gap_points,
                exceeds_threshold,
            }
        })
        .collect::<Vec<MetricGap>>();

    let flagged = metrics.iter().any(|gap| gap.exceeds_threshold);

    GeneralizationReport {
        threshold_points,
        seen_examples: seen.overall.attempted,
        unseen_examples: unseen.overall.attempted,
        metrics,
        flagged,
    }
}

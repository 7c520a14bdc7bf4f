use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fields::{FieldReport, check_fields};
use super::generalization::Population;
use super::operators::check_operators;
use super::syntax::check_syntax;
use super::walk::WalkRules;
use super::{Layer, LayerFailure, LayerStatus};
use crate::model::{OperatorAllowlist, QueryDocument, SchemaDescriptor};

/// Outcome of running one candidate through the layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleResult {
    pub syntax: LayerStatus,
    pub operator: LayerStatus,
    pub field: LayerStatus,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_layer: Option<Layer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub used_operators: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldReport>,
}

impl Default for ExampleResult {
    fn default() -> Self {
        Self {
            syntax: LayerStatus::Skipped,
            operator: LayerStatus::Skipped,
            field: LayerStatus::Skipped,
            passed: false,
            failed_layer: None,
            used_operators: Vec::new(),
            fields: None,
        }
    }
}

impl ExampleResult {
    pub fn status(&self, layer: Layer) -> &LayerStatus {
        match layer {
            Layer::Syntax => &self.syntax,
            Layer::Operator => &self.operator,
            Layer::Field => &self.field,
        }
    }

    pub fn first_failure(&self) -> Option<&LayerFailure> {
        Layer::ALL
            .iter()
            .find_map(|layer| self.status(*layer).failure())
    }
}

/// Where evaluation of one candidate stands. Each step runs one layer and
/// either moves on or stops at the failing layer.
enum Progress {
    NotStarted,
    SyntaxDone(QueryDocument),
    OperatorDone(QueryDocument),
    FieldDone,
    FailedAt(Layer),
}

struct Inputs<'a> {
    document: &'a str,
    schema: &'a SchemaDescriptor,
    allowlist: &'a OperatorAllowlist,
    rules: &'a WalkRules,
}

impl Progress {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::FieldDone | Self::FailedAt(_))
    }

    fn advance(self, inputs: &Inputs<'_>, result: &mut ExampleResult) -> Self {
        match self {
            Self::NotStarted => match check_syntax(inputs.document) {
                Ok(document) => {
                    result.syntax = LayerStatus::Passed;
                    Self::SyntaxDone(document)
                }
                Err(failure) => {
                    result.syntax = LayerStatus::Failed { failure };
                    Self::FailedAt(Layer::Syntax)
                }
            },
            Self::SyntaxDone(document) => {
                match check_operators(&document, inputs.allowlist, inputs.rules) {
                    Ok(report) => {
                        result.operator = LayerStatus::Passed;
                        result.used_operators = report.used_operators;
                        Self::OperatorDone(document)
                    }
                    Err(failure) => {
                        result.operator = LayerStatus::Failed { failure };
                        Self::FailedAt(Layer::Operator)
                    }
                }
            }
            Self::OperatorDone(document) => {
                match check_fields(&document, inputs.schema, inputs.rules) {
                    Ok(report) => {
                        result.field = LayerStatus::Passed;
                        result.fields = Some(report);
                        Self::FieldDone
                    }
                    Err(failure) => {
                        result.field = LayerStatus::Failed { failure };
                        Self::FailedAt(Layer::Field)
                    }
                }
            }
            terminal @ (Self::FieldDone | Self::FailedAt(_)) => terminal,
        }
    }
}

/// Run syntax, operator and field checks on one candidate, stopping at the
/// first failing layer. Layers after a failure are recorded as skipped.
pub fn evaluate_example(
    document: &str,
    schema: &SchemaDescriptor,
    allowlist: &OperatorAllowlist,
    rules: &WalkRules,
) -> ExampleResult {
    let inputs = Inputs {
        document,
        schema,
        allowlist,
        rules,
    };
    let mut result = ExampleResult::default();
    let mut progress = Progress::NotStarted;
    while !progress.is_terminal() {
        progress = progress.advance(&inputs, &mut result);
    }
    match progress {
        Progress::FieldDone => result.passed = true,
        Progress::FailedAt(layer) => result.failed_layer = Some(layer),
        Progress::NotStarted | Progress::SyntaxDone(_) | Progress::OperatorDone(_) => {}
    }
    result
}

/// One candidate queued for batch evaluation.
#[derive(Debug, Clone, Copy)]
pub struct BatchItem<'a> {
    pub document: &'a str,
    pub schema: &'a SchemaDescriptor,
    pub allowlist: &'a OperatorAllowlist,
    pub population: Option<Population>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledResult {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<Population>,
    pub result: ExampleResult,
}

/// Evaluate candidates on the rayon pool. Results keep input order.
pub fn evaluate_batch(items: &[BatchItem<'_>], rules: &WalkRules) -> Vec<LabeledResult> {
    info!(examples = items.len(), "evaluating batch");

    items
        .par_iter()
        .enumerate()
        .map(|(index, item)| {
            let result = evaluate_example(item.document, item.schema, item.allowlist, rules);
            if let Some(failure) = result.first_failure() {
                debug!(
                    index,
                    collection = %item.schema.collection(),
                    layer = failure.layer().as_str(),
                    tokens = ?failure.tokens(),
                    "example failed"
                );
            }
            LabeledResult {
                index,
                population: item.population,
                result,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub attempted: usize,
    pub passed: usize,
}

impl Tally {
    fn record(&mut self, status: &LayerStatus) {
        if status.reached() {
            self.attempted += 1;
            if status.passed() {
                self.passed += 1;
            }
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            attempted: self.attempted + other.attempted,
            passed: self.passed + other.passed,
        }
    }

    pub fn pass_rate(self) -> Option<f64> {
        (self.attempted > 0).then(|| self.passed as f64 / self.attempted as f64)
    }
}

/// Per-layer attempt/pass counts. `merge` is commutative and associative, so
/// partial counts from separate workers combine in any order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerCounters {
    pub syntax: Tally,
    pub operator: Tally,
    pub field: Tally,
    pub overall: Tally,
}

impl LayerCounters {
    pub fn record(&mut self, result: &ExampleResult) {
        self.syntax.record(&result.syntax);
        self.operator.record(&result.operator);
        self.field.record(&result.field);
        self.overall.attempted += 1;
        if result.passed {
            self.overall.passed += 1;
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            syntax: self.syntax.merge(other.syntax),
            operator: self.operator.merge(other.operator),
            field: self.field.merge(other.field),
            overall: self.overall.merge(other.overall),
        }
    }

    pub fn from_results<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = &'a ExampleResult>,
    {
        results.into_iter().fold(Self::default(), |mut counters, result| {
            counters.record(result);
            counters
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub attempted: usize,
    pub passed: usize,
    pub pass_rate: Option<f64>,
}

impl From<Tally> for LayerStats {
    fn from(tally: Tally) -> Self {
        Self {
            attempted: tally.attempted,
            passed: tally.passed,
            pass_rate: tally.pass_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<Population>,
    pub layer: Layer,
    pub failure: LayerFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub total: usize,
    pub syntax: LayerStats,
    pub operator: LayerStats,
    pub field: LayerStats,
    pub overall: LayerStats,
    pub failures: Vec<FailureDetail>,
}

/// Reduce per-example results into one report. Counting runs as a parallel
/// fold; failure details keep input order.
pub fn summarize(results: &[LabeledResult]) -> EvalReport {
    let counters = results
        .par_iter()
        .fold(LayerCounters::default, |mut counters, labeled| {
            counters.record(&labeled.result);
            counters
        })
        .reduce(LayerCounters::default, LayerCounters::merge);

    let failures = results
        .iter()
        .filter_map(|labeled| {
            labeled.result.first_failure().map(|failure| FailureDetail {
                index: labeled.index,
                population: labeled.population,
                layer: failure.layer(),
                failure: failure.clone(),
            })
        })
        .collect::<Vec<FailureDetail>>();

    let report = EvalReport {
        total: results.len(),
        syntax: counters.syntax.into(),
        operator: counters.operator.into(),
        field: counters.field.into(),
        overall: counters.overall.into(),
        failures,
    };

    info!(
        total = report.total,
        syntax_pass_rate = ?report.syntax.pass_rate,
        operator_pass_rate = ?report.operator.pass_rate,
        field_pass_rate = ?report.field.pass_rate,
        overall_pass_rate = ?report.overall.pass_rate,
        failures = report.failures.len(),
        "batch summarized"
    );

    report
}

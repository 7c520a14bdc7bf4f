use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cli::EvalArgs;
use crate::config::EvalConfig;
use crate::eval::{
    BatchItem, EvalReport, GeneralizationReport, LabeledResult, Population, compare_populations,
    evaluate_batch, extract_document, summarize,
};
use crate::model::{ExampleRecord, PredictionRecord};
use crate::util::{now_utc_string, read_jsonl, sha256_file, write_json_pretty};

pub const MANIFEST_VERSION: u32 = 1;

/// Everything an evaluation run produced, written as one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRunManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub examples_path: String,
    pub examples_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions_sha256: Option<String>,
    #[serde(default)]
    pub held_out_collections: Vec<String>,
    pub config: EvalConfig,
    pub report: EvalReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generalization: Option<GeneralizationReport>,
    pub examples: Vec<EvaluatedExample>,
    pub results: Vec<LabeledResult>,
}

/// Ties a result index back to its line in the examples file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedExample {
    pub index: usize,
    pub source_line: usize,
    pub collection: String,
    pub intent: String,
    pub is_negative: bool,
}

pub fn run(args: EvalArgs) -> Result<()> {
    let config = EvalConfig::load(args.config.as_deref())?
        .with_overrides(args.gap_threshold, args.workers)?;

    if let Some(workers) = config.workers {
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build_global()
            .context("failed to configure evaluation worker pool")?;
    }

    let examples: Vec<ExampleRecord> = read_jsonl(&args.examples_path)?;
    let candidates = match &args.predictions_path {
        Some(path) => prediction_candidates(&examples, read_jsonl(path)?, path)?,
        None => gold_candidates(&examples)?,
    };

    let selected = (0..examples.len())
        .filter(|&source| args.include_negative || !examples[source].is_negative)
        .collect::<Vec<usize>>();
    let skipped = examples.len() - selected.len();
    if skipped > 0 {
        info!(count = skipped, "skipping negative examples");
    }

    let held_out = args
        .held_out_collections
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<&str>>();
    for collection in &held_out {
        if !examples
            .iter()
            .any(|example| example.schema.collection() == *collection)
        {
            warn!(collection, "held-out collection does not occur in the examples");
        }
    }

    let items = selected
        .iter()
        .map(|&source| {
            let example = &examples[source];
            let candidate = candidates[source].as_str();
            BatchItem {
                document: if args.raw_predictions {
                    candidate
                } else {
                    extract_document(candidate)
                },
                schema: &example.schema,
                allowlist: &example.allowed_ops,
                population: population_for(&held_out, example.schema.collection()),
            }
        })
        .collect::<Vec<BatchItem<'_>>>();

    let rules = config.walk_rules();
    let results = evaluate_batch(&items, &rules);
    let report = summarize(&results);
    let generalization = (!held_out.is_empty())
        .then(|| compare_populations(&results, config.gap_threshold_points));

    let evaluated = selected
        .iter()
        .enumerate()
        .map(|(index, &source)| {
            let example = &examples[source];
            EvaluatedExample {
                index,
                source_line: source + 1,
                collection: example.schema.collection().to_string(),
                intent: example.intent.clone(),
                is_negative: example.is_negative,
            }
        })
        .collect::<Vec<EvaluatedExample>>();

    let manifest = EvalRunManifest {
        manifest_version: MANIFEST_VERSION,
        generated_at: now_utc_string(),
        examples_path: args.examples_path.display().to_string(),
        examples_sha256: sha256_file(&args.examples_path)?,
        predictions_path: args
            .predictions_path
            .as_ref()
            .map(|path| path.display().to_string()),
        predictions_sha256: args
            .predictions_path
            .as_deref()
            .map(sha256_file)
            .transpose()?,
        held_out_collections: args.held_out_collections.clone(),
        config,
        report,
        generalization,
        examples: evaluated,
        results,
    };

    write_json_pretty(&args.report_path, &manifest)?;

    info!(
        path = %args.report_path.display(),
        examples = manifest.report.total,
        overall_pass_rate = ?manifest.report.overall.pass_rate,
        gap_flagged = manifest
            .generalization
            .as_ref()
            .is_some_and(|report| report.flagged),
        "wrote evaluation manifest"
    );

    Ok(())
}

/// Serialize each example's own output so the gold data can be validated.
fn gold_candidates(examples: &[ExampleRecord]) -> Result<Vec<String>> {
    examples
        .iter()
        .enumerate()
        .map(|(index, example)| {
            serde_json::to_string(&example.output)
                .with_context(|| format!("failed to serialize output of example {}", index + 1))
        })
        .collect()
}

fn prediction_candidates(
    examples: &[ExampleRecord],
    predictions: Vec<PredictionRecord>,
    path: &Path,
) -> Result<Vec<String>> {
    if predictions.len() != examples.len() {
        bail!(
            "{} holds {} predictions but the examples file holds {} examples",
            path.display(),
            predictions.len(),
            examples.len()
        );
    }

    let mut misaligned = 0_usize;
    let candidates = examples
        .iter()
        .zip(predictions)
        .enumerate()
        .map(|(index, (example, prediction))| {
            if let Some(collection) = &prediction.collection
                && collection != example.schema.collection()
            {
                misaligned += 1;
                warn!(
                    line = index + 1,
                    expected = %example.schema.collection(),
                    found = %collection,
                    "prediction collection does not match its example"
                );
            }
            prediction.prediction
        })
        .collect::<Vec<String>>();

    if misaligned > 0 {
        warn!(count = misaligned, "predictions may be misaligned with examples");
    }
    Ok(candidates)
}

fn population_for(held_out: &BTreeSet<&str>, collection: &str) -> Option<Population> {
    if held_out.is_empty() {
        None
    } else if held_out.contains(collection) {
        Some(Population::Unseen)
    } else {
        Some(Population::Seen)
    }
}

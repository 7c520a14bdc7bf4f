use anyhow::{Result, bail};
use tracing::info;

use super::eval::{EvalRunManifest, MANIFEST_VERSION};
use crate::cli::GapArgs;
use crate::config::EvalConfig;
use crate::eval::{Metric, compare_populations};
use crate::util::{read_json, write_json_stdout};

pub fn run(args: GapArgs) -> Result<()> {
    let config = EvalConfig::load(args.config.as_deref())?.with_overrides(args.gap_threshold, None)?;
    let manifest: EvalRunManifest = read_json(&args.report_path)?;

    if manifest.manifest_version != MANIFEST_VERSION {
        bail!(
            "{} has manifest version {}, expected {}",
            args.report_path.display(),
            manifest.manifest_version,
            MANIFEST_VERSION
        );
    }
    if manifest
        .results
        .iter()
        .all(|labeled| labeled.population.is_none())
    {
        bail!(
            "{} has no seen/unseen labels; rerun eval with --held-out-collection",
            args.report_path.display()
        );
    }

    let report = compare_populations(&manifest.results, config.gap_threshold_points);
    info!(
        path = %args.report_path.display(),
        threshold_points = report.threshold_points,
        seen = report.seen_examples,
        unseen = report.unseen_examples,
        overall_gap_points = ?report
            .metric(Metric::Overall)
            .and_then(|gap| gap.gap_points),
        flagged = report.flagged,
        "recomputed generalization gap"
    );

    write_json_stdout(&report)
}

use std::fs;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::CheckArgs;
use crate::config::EvalConfig;
use crate::eval::{Layer, evaluate_example, extract_document};
use crate::model::{OperatorAllowlist, SchemaDescriptor};
use crate::util::{read_json, write_json_stdout};

pub fn run(args: CheckArgs) -> Result<()> {
    let config = EvalConfig::load(args.config.as_deref())?;
    let schema: SchemaDescriptor = read_json(&args.schema_path)?;
    let allowlist: OperatorAllowlist = read_json(&args.allowlist_path)?;

    let raw = match (args.document, &args.document_path) {
        (Some(document), _) => document,
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("either --document or --document-path is required"),
    };
    let candidate = if args.extract {
        extract_document(&raw)
    } else {
        raw.as_str()
    };

    let result = evaluate_example(candidate, &schema, &allowlist, &config.walk_rules());
    info!(
        collection = %schema.collection(),
        domain = %schema.domain(),
        passed = result.passed,
        failed_layer = result.failed_layer.map(Layer::as_str).unwrap_or("none"),
        "candidate checked"
    );

    write_json_stdout(&result)
}

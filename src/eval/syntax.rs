use serde_json::{Map, Value};

use super::{LayerFailure, SyntaxViolation, is_literal_wrapper, is_operator_shaped};
use crate::model::{PipelineStage, QueryDocument};

/// Parse untrusted candidate text into a [`QueryDocument`].
///
/// Checks run in a fixed order and stop at the first violation: the text must
/// be JSON, the value an object, `type` must be `"find"` or `"aggregate"`, and
/// the body must have the shape that type requires. An aggregate stage is an
/// object with exactly one `$`-prefixed key.
pub fn check_syntax(text: &str) -> Result<QueryDocument, LayerFailure> {
    let parsed: Value = serde_json::from_str(text).map_err(|err| LayerFailure::MalformedInput {
        violation: SyntaxViolation::NotJson,
        line: Some(err.line()),
        column: Some(err.column()),
    })?;

    let Value::Object(mut root) = parsed else {
        return Err(LayerFailure::MalformedInput {
            violation: SyntaxViolation::NotObject,
            line: None,
            column: None,
        });
    };

    let query_type = match root.get("type") {
        None => return Err(structural(SyntaxViolation::MissingType)),
        Some(Value::String(query_type)) => query_type.clone(),
        Some(_) => return Err(structural(SyntaxViolation::BadTypeValue)),
    };

    match query_type.as_str() {
        "find" => find_document(&mut root),
        "aggregate" => aggregate_document(&mut root),
        _ => Err(structural(SyntaxViolation::BadTypeValue)),
    }
}

fn find_document(root: &mut Map<String, Value>) -> Result<QueryDocument, LayerFailure> {
    let filter = match root.remove("filter") {
        Some(Value::Object(filter)) => filter,
        _ => return Err(structural(SyntaxViolation::FilterMissingOrWrongShape)),
    };

    let projection = match root.remove("projection") {
        None | Some(Value::Null) => None,
        Some(Value::Object(projection)) => Some(projection),
        Some(_) => return Err(structural(SyntaxViolation::ProjectionWrongShape)),
    };

    Ok(QueryDocument::Find { filter, projection })
}

fn aggregate_document(root: &mut Map<String, Value>) -> Result<QueryDocument, LayerFailure> {
    let Some(Value::Array(stages)) = root.remove("pipeline") else {
        return Err(structural(SyntaxViolation::PipelineMissingOrWrongShape));
    };

    let mut pipeline = Vec::with_capacity(stages.len());
    for (index, stage) in stages.into_iter().enumerate() {
        let malformed = || LayerFailure::StructuralViolation {
            violation: SyntaxViolation::StageMalformed,
            stage_index: Some(index),
        };

        let Value::Object(stage) = stage else {
            return Err(malformed());
        };
        if stage.len() != 1 {
            return Err(malformed());
        }
        let Some((operator, spec)) = stage.into_iter().next() else {
            return Err(malformed());
        };
        if !is_operator_shaped(&operator) || is_literal_wrapper(&operator) {
            return Err(malformed());
        }

        pipeline.push(PipelineStage { operator, spec });
    }

    Ok(QueryDocument::Aggregate { pipeline })
}

fn structural(violation: SyntaxViolation) -> LayerFailure {
    LayerFailure::StructuralViolation {
        violation,
        stage_index: None,
    }
}

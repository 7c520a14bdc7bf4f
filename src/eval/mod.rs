//! Layered validation of candidate query documents.
//!
//! A candidate goes through syntax, operator and field checks in that order;
//! the first failure ends evaluation for that example. Batches are summarized
//! into an [`EvalReport`] and, when populations are labelled, compared with
//! [`compare_populations`].

use serde::{Deserialize, Serialize};

use crate::model::OPERATOR_SIGIL;

mod extract;
mod fields;
mod generalization;
mod harness;
mod operators;
mod syntax;
mod walk;
#[cfg(test)]
mod tests;

pub use self::extract::extract_document;
pub use self::generalization::{
    DEFAULT_GAP_THRESHOLD_POINTS, GeneralizationReport, Metric, Population, compare_populations,
};
pub use self::harness::{
    BatchItem, EvalReport, LabeledResult, evaluate_batch, evaluate_example, summarize,
};
pub use self::walk::WalkRules;

/// Operators rejected wherever they appear, whatever the allowlist says.
pub const UNSAFE_OPERATORS: [&str; 9] = [
    "$where",
    "$function",
    "$accumulator",
    "$merge",
    "$out",
    "$currentOp",
    "$collStats",
    "$indexStats",
    "$planCacheStats",
];

/// Extended JSON type wrappers. These spell literal values, not operators.
pub const LITERAL_WRAPPERS: [&str; 15] = [
    "$date",
    "$oid",
    "$numberLong",
    "$numberInt",
    "$numberDouble",
    "$numberDecimal",
    "$binary",
    "$timestamp",
    "$regex",
    "$undefined",
    "$minKey",
    "$maxKey",
    "$dbPointer",
    "$symbol",
    "$code",
];

pub fn is_unsafe_operator(token: &str) -> bool {
    UNSAFE_OPERATORS.contains(&token)
}

pub fn is_literal_wrapper(token: &str) -> bool {
    LITERAL_WRAPPERS.contains(&token)
}

/// True for `$name`-shaped tokens. A bare sigil is not an operator.
pub fn is_operator_shaped(token: &str) -> bool {
    token.len() > OPERATOR_SIGIL.len_utf8() && token.starts_with(OPERATOR_SIGIL)
}

/// `$$ROOT`, `$$NOW` and user `$$vars` name variables, not fields.
fn is_system_variable(value: &str) -> bool {
    value.starts_with("$$")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Syntax,
    Operator,
    Field,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Syntax, Layer::Operator, Layer::Field];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Operator => "operator",
            Self::Field => "field",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyntaxViolation {
    NotJson,
    NotObject,
    MissingType,
    BadTypeValue,
    FilterMissingOrWrongShape,
    ProjectionWrongShape,
    PipelineMissingOrWrongShape,
    StageMalformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MalformedInput,
    StructuralViolation,
    UnsafeOperator,
    DisallowedOperator,
    HallucinatedField,
}

/// Why a layer rejected a candidate. Every failure path is carried as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerFailure {
    MalformedInput {
        violation: SyntaxViolation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<usize>,
    },
    StructuralViolation {
        violation: SyntaxViolation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage_index: Option<usize>,
    },
    UnsafeOperator {
        unsafe_operators: Vec<String>,
        disallowed_operators: Vec<String>,
    },
    DisallowedOperator {
        disallowed_operators: Vec<String>,
    },
    HallucinatedField {
        fields: Vec<String>,
    },
}

impl LayerFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MalformedInput { .. } => FailureKind::MalformedInput,
            Self::StructuralViolation { .. } => FailureKind::StructuralViolation,
            Self::UnsafeOperator { .. } => FailureKind::UnsafeOperator,
            Self::DisallowedOperator { .. } => FailureKind::DisallowedOperator,
            Self::HallucinatedField { .. } => FailureKind::HallucinatedField,
        }
    }

    pub fn layer(&self) -> Layer {
        match self.kind() {
            FailureKind::MalformedInput | FailureKind::StructuralViolation => Layer::Syntax,
            FailureKind::UnsafeOperator | FailureKind::DisallowedOperator => Layer::Operator,
            FailureKind::HallucinatedField => Layer::Field,
        }
    }

    /// Offending tokens, unsafe operators first.
    pub fn tokens(&self) -> Vec<String> {
        match self {
            Self::MalformedInput { .. } | Self::StructuralViolation { .. } => Vec::new(),
            Self::UnsafeOperator {
                unsafe_operators,
                disallowed_operators,
            } => unsafe_operators
                .iter()
                .chain(disallowed_operators.iter())
                .cloned()
                .collect(),
            Self::DisallowedOperator {
                disallowed_operators,
            } => disallowed_operators.clone(),
            Self::HallucinatedField { fields } => fields.clone(),
        }
    }
}

/// Where a layer ended up for one example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LayerStatus {
    Skipped,
    Passed,
    Failed { failure: LayerFailure },
}

impl LayerStatus {
    pub fn reached(&self) -> bool {
        !matches!(self, Self::Skipped)
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn failure(&self) -> Option<&LayerFailure> {
        match self {
            Self::Failed { failure } => Some(failure),
            Self::Skipped | Self::Passed => None,
        }
    }
}

fn push_unique(tokens: &mut Vec<String>, token: &str) {
    if !tokens.iter().any(|existing| existing == token) {
        tokens.push(token.to_string());
    }
}

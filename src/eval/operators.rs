use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::walk::{DocumentVisitor, OperatorSite, WalkRules, walk_document};
use super::{LayerFailure, is_unsafe_operator, push_unique};
use crate::model::{OperatorAllowlist, QueryDocument};

/// Operators found in a candidate that passed the operator layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorReport {
    pub used_operators: Vec<String>,
}

struct OperatorAudit<'a> {
    allowlist: &'a OperatorAllowlist,
    used: BTreeSet<String>,
    unsafe_operators: Vec<String>,
    disallowed_operators: Vec<String>,
}

impl DocumentVisitor for OperatorAudit<'_> {
    fn operator(&mut self, token: &str, site: OperatorSite) {
        self.used.insert(token.to_string());

        if is_unsafe_operator(token) {
            push_unique(&mut self.unsafe_operators, token);
            return;
        }

        let allowed = match site {
            OperatorSite::Stage => self.allowlist.allows_stage(token),
            OperatorSite::Expression => self.allowlist.allows_expression(token),
        };
        if !allowed {
            push_unique(&mut self.disallowed_operators, token);
        }
    }
}

/// Check every operator in `document` against the allowlist and the fixed
/// denylist. Unsafe operators fail the check even when allowlisted.
pub fn check_operators(
    document: &QueryDocument,
    allowlist: &OperatorAllowlist,
    rules: &WalkRules,
) -> Result<OperatorReport, LayerFailure> {
    let mut audit = OperatorAudit {
        allowlist,
        used: BTreeSet::new(),
        unsafe_operators: Vec::new(),
        disallowed_operators: Vec::new(),
    };
    walk_document(document, rules, &mut audit);

    if !audit.unsafe_operators.is_empty() {
        return Err(LayerFailure::UnsafeOperator {
            unsafe_operators: audit.unsafe_operators,
            disallowed_operators: audit.disallowed_operators,
        });
    }
    if !audit.disallowed_operators.is_empty() {
        return Err(LayerFailure::DisallowedOperator {
            disallowed_operators: audit.disallowed_operators,
        });
    }

    Ok(OperatorReport {
        used_operators: audit.used.into_iter().collect(),
    })
}

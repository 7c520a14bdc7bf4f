use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::walk::{DocumentVisitor, WalkRules, walk_document};
use super::{LayerFailure, push_unique};
use crate::model::{QueryDocument, SchemaDescriptor};

/// Stage operators that name new output fields. Only those listed in
/// [`WalkRules::grouping_operators`] get alias handling; the rest are
/// surfaced as advisories.
const OUTPUT_NAMING_STAGES: [&str; 4] = ["$group", "$bucket", "$bucketAuto", "$sortByCount"];

/// Schema fields a candidate touched, reported when the field layer passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldReport {
    pub referenced_fields: Vec<String>,
    pub coverage: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct AliasFrame {
    in_scope: BTreeSet<String>,
    pending: Vec<String>,
}

struct FieldAudit<'a> {
    schema: &'a SchemaDescriptor,
    rules: &'a WalkRules,
    frames: Vec<AliasFrame>,
    referenced: BTreeSet<String>,
    hallucinated: Vec<String>,
    advisories: Vec<String>,
    foreign_depth: usize,
}

impl FieldAudit<'_> {
    fn resolve(&mut self, path: &str) {
        if self.foreign_depth > 0 {
            return;
        }
        let root = path.split('.').next().unwrap_or(path);

        if self.schema.has_field(root) {
            self.referenced.insert(root.to_string());
            return;
        }
        if self.rules.is_implicit_field(root) {
            return;
        }
        if self
            .frames
            .last()
            .is_some_and(|frame| frame.in_scope.contains(root))
        {
            return;
        }

        push_unique(&mut self.hallucinated, root);
    }
}

impl DocumentVisitor for FieldAudit<'_> {
    fn pipeline_start(&mut self) {
        let inherited = self
            .frames
            .last()
            .map(|frame| frame.in_scope.clone())
            .unwrap_or_default();
        self.frames.push(AliasFrame {
            in_scope: inherited,
            pending: Vec::new(),
        });
    }

    fn pipeline_end(&mut self) {
        self.frames.pop();
    }

    fn stage_start(&mut self, operator: &str) {
        if OUTPUT_NAMING_STAGES.contains(&operator) && !self.rules.is_grouping(operator) {
            warn!(
                collection = %self.schema.collection(),
                stage = %operator,
                "stage introduces output names but is not a configured grouping operator; aliases need schema-owner confirmation"
            );
            push_unique(
                &mut self.advisories,
                &format!("unconfirmed grouping stage {operator}"),
            );
        }
    }

    fn stage_end(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            let introduced = std::mem::take(&mut frame.pending);
            frame.in_scope.extend(introduced);
        }
    }

    fn field_key(&mut self, path: &str) {
        self.resolve(path);
    }

    fn field_reference(&mut self, path: &str) {
        self.resolve(path);
    }

    fn alias(&mut self, name: &str) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pending.push(name.to_string());
        }
    }

    fn foreign_scope_start(&mut self) {
        self.foreign_depth += 1;
    }

    fn foreign_scope_end(&mut self) {
        self.foreign_depth = self.foreign_depth.saturating_sub(1);
    }
}

/// Check that every field a candidate references exists in `schema`.
///
/// Filter keys and `$path` strings are references; only the first path
/// segment is checked. Output names introduced by grouping and computed
/// stages are aliases: they are never checked themselves, and later stages
/// of the same pipeline may reference them.
pub fn check_fields(
    document: &QueryDocument,
    schema: &SchemaDescriptor,
    rules: &WalkRules,
) -> Result<FieldReport, LayerFailure> {
    let mut audit = FieldAudit {
        schema,
        rules,
        frames: vec![AliasFrame::default()],
        referenced: BTreeSet::new(),
        hallucinated: Vec::new(),
        advisories: Vec::new(),
        foreign_depth: 0,
    };
    walk_document(document, rules, &mut audit);

    if !audit.hallucinated.is_empty() {
        return Err(LayerFailure::HallucinatedField {
            fields: audit.hallucinated,
        });
    }

    let coverage = if schema.field_count() == 0 {
        0.0
    } else {
        audit.referenced.len() as f64 / schema.field_count() as f64
    };

    Ok(FieldReport {
        referenced_fields: audit.referenced.into_iter().collect(),
        coverage,
        advisories: audit.advisories,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FieldReport, check_fields};
    use crate::eval::syntax::check_syntax;
    use crate::eval::{LayerFailure, WalkRules};
    use crate::model::{FieldDescriptor, FieldRole, FieldType, SchemaDescriptor};

    fn schema(names: &[&str]) -> SchemaDescriptor {
        SchemaDescriptor::new(
            "test_collection",
            "test",
            names
                .iter()
                .map(|name| FieldDescriptor::new(*name, FieldType::String, FieldRole::Category))
                .collect(),
        )
        .expect("fixture schema has unique names")
    }

    fn run(names: &[&str], document: serde_json::Value) -> Result<FieldReport, LayerFailure> {
        run_with(names, document, &WalkRules::default())
    }

    fn run_with(
        names: &[&str],
        document: serde_json::Value,
        rules: &WalkRules,
    ) -> Result<FieldReport, LayerFailure> {
        let parsed = check_syntax(&document.to_string()).expect("fixture should be valid");
        check_fields(&parsed, &schema(names), rules)
    }

    fn hallucinated(result: Result<FieldReport, LayerFailure>) -> Vec<String> {
        match result {
            Err(LayerFailure::HallucinatedField { fields }) => fields,
            other => panic!("expected hallucinated fields, got {other:?}"),
        }
    }

    fn salary_group() -> serde_json::Value {
        json!({
            "type": "aggregate",
            "pipeline": [
                {"$group": {"_id": "$dept", "total": {"$sum": "$salary"}}}
            ]
        })
    }

    #[test]
    fn group_alias_is_accepted_and_accumulator_reference_is_checked() {
        let report = run(&["dept", "salary"], salary_group()).expect("salary is in the schema");
        assert_eq!(report.referenced_fields, vec!["dept", "salary"]);

        let missing = hallucinated(run(&["dept"], salary_group()));
        assert_eq!(missing, vec!["salary"]);
    }

    #[test]
    fn grouping_key_reference_is_checked() {
        let missing = hallucinated(run(&["salary"], salary_group()));
        assert_eq!(missing, vec!["dept"]);
    }

    #[test]
    fn dotted_paths_are_checked_by_root_segment() {
        let report = run(
            &["address", "amount"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$match": {"address.city": "NYC"}},
                    {"$project": {"amount": 1, "zip": "$address.zip.code"}}
                ]
            }),
        )
        .expect("roots exist");
        assert_eq!(report.referenced_fields, vec!["address", "amount"]);
    }

    #[test]
    fn unknown_filter_key_is_hallucinated_once() {
        let missing = hallucinated(run(
            &["status"],
            json!({
                "type": "find",
                "filter": {"bogus_field": "x", "$or": [{"bogus_field": "y"}, {"status": "a"}]}
            }),
        ));
        assert_eq!(missing, vec!["bogus_field"]);
    }

    #[test]
    fn implicit_id_and_system_variables_are_valid() {
        let report = run(
            &["status"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$group": {"_id": "$status", "docs": {"$push": "$$ROOT"}}},
                    {"$sort": {"_id": 1}}
                ]
            }),
        )
        .expect("_id is implicit and $$ROOT is a variable");
        assert_eq!(report.referenced_fields, vec!["status"]);
    }

    #[test]
    fn aliases_are_visible_to_later_stages_only() {
        let later = run(
            &["status", "amount"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$group": {"_id": "$status", "total": {"$sum": "$amount"}}},
                    {"$sort": {"total": -1}},
                    {"$project": {"share": {"$divide": ["$total", 100]}}}
                ]
            }),
        );
        assert!(later.is_ok(), "{later:?}");

        let same_stage = hallucinated(run(
            &["status", "amount"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$group": {"_id": "$status", "total": {"$sum": "$amount"}, "again": {"$max": "$total"}}}
                ]
            }),
        ));
        assert_eq!(same_stage, vec!["total"]);
    }

    #[test]
    fn facet_aliases_stay_inside_their_branch() {
        let missing = hallucinated(run(
            &["tier"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$facet": {
                        "a": [{"$count": "n"}, {"$match": {"n": {"$gt": 1}}}],
                        "b": [{"$match": {"n": 1}}]
                    }}
                ]
            }),
        ));
        assert_eq!(missing, vec!["n"]);
    }

    #[test]
    fn literal_wrapper_values_are_not_references() {
        let report = run(
            &["created_at"],
            json!({
                "type": "find",
                "filter": {"created_at": {"$gte": {"$date": "$not_a_field"}}}
            }),
        )
        .expect("wrapper contents are literals");
        assert_eq!(report.referenced_fields, vec!["created_at"]);
    }

    #[test]
    fn sigil_strings_naming_wrappers_or_unsafe_operators_are_not_references() {
        let report = run(
            &["status"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$match": {"status": "$where"}},
                    {"$match": {"status": {"$in": ["$date", "$oid"]}}}
                ]
            }),
        )
        .expect("operator-named strings are not field paths");
        assert_eq!(report.referenced_fields, vec!["status"]);
    }

    #[test]
    fn lookup_and_unwind_outputs_are_aliases() {
        let report = run(
            &["customer_id", "total"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$lookup": {
                        "from": "customers",
                        "localField": "customer_id",
                        "foreignField": "id",
                        "as": "buyer"
                    }},
                    {"$unwind": {"path": "$buyer", "includeArrayIndex": "position"}},
                    {"$project": {"name": "$buyer.name", "position": 1, "total": 1}}
                ]
            }),
        )
        .expect("joined and index names are in scope after their stage");
        assert_eq!(report.referenced_fields, vec!["customer_id", "total"]);

        let missing = hallucinated(run(
            &["total"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$lookup": {"from": "customers", "localField": "cust", "foreignField": "id", "as": "buyer"}}
                ]
            }),
        ));
        assert_eq!(missing, vec!["cust"]);
    }

    #[test]
    fn lookup_sub_pipeline_fields_belong_to_the_joined_collection() {
        let report = run(
            &["qty"],
            json!({
                "type": "aggregate",
                "pipeline": [
                    {"$lookup": {
                        "from": "warehouses",
                        "let": {"needed": "$qty"},
                        "pipeline": [
                            {"$match": {"stock_level": {"$gte": 1}}},
                            {"$project": {"region": 1}}
                        ],
                        "as": "stock"
                    }},
                    {"$match": {"stock": {"$ne": []}}}
                ]
            }),
        )
        .expect("sub-pipeline names are not checked against this schema");
        assert_eq!(report.referenced_fields, vec!["qty"]);
    }

    #[test]
    fn projection_fields_are_checked_and_coverage_is_reported() {
        let document = json!({
            "type": "find",
            "filter": {"status": "active"},
            "projection": {"name": 1, "region": 1}
        });
        let report = run(&["name", "status", "region", "amount"], document).expect("all known");
        assert_eq!(report.referenced_fields, vec!["name", "region", "status"]);
        assert!((report.coverage - 0.75).abs() < f64::EPSILON);

        let missing = hallucinated(run(
            &["name"],
            json!({"type": "find", "filter": {}, "projection": {"name": 1, "fake_field": 1}}),
        ));
        assert_eq!(missing, vec!["fake_field"]);
    }

    #[test]
    fn unconfigured_grouping_stage_is_an_advisory_not_a_failure() {
        let rules = WalkRules {
            grouping_operators: vec!["$group".to_string()],
            ..WalkRules::default()
        };
        let report = run_with(
            &["category"],
            json!({
                "type": "aggregate",
                "pipeline": [{"$sortByCount": "$category"}]
            }),
            &rules,
        )
        .expect("$sortByCount only references category");

        assert_eq!(
            report.advisories,
            vec!["unconfirmed grouping stage $sortByCount"]
        );
    }

    #[test]
    fn empty_filter_references_nothing() {
        let report = run(&["status"], json!({"type": "find", "filter": {}})).expect("trivial");
        assert!(report.referenced_fields.is_empty());
        assert_eq!(report.coverage, 0.0);
    }
}

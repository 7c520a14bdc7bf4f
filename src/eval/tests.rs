use proptest::prelude::*;
use serde_json::json;

use super::harness::{ExampleResult, LayerCounters};
use super::{
    BatchItem, FailureKind, Layer, LayerFailure, LayerStatus, Population, WalkRules,
    compare_populations, evaluate_batch, evaluate_example, extract_document, summarize,
};
use crate::model::{FieldDescriptor, FieldRole, FieldType, OperatorAllowlist, SchemaDescriptor};

fn orders_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        "orders",
        "ecommerce",
        vec![
            FieldDescriptor::new("status", FieldType::String, FieldRole::Enum)
                .with_enum_values(&["pending", "shipped", "delivered", "cancelled"]),
            FieldDescriptor::new("total", FieldType::Double, FieldRole::Measure),
            FieldDescriptor::new("salary", FieldType::Double, FieldRole::Measure),
            FieldDescriptor::new("order_date", FieldType::Date, FieldRole::Timestamp),
        ],
    )
    .expect("fixture schema is valid")
}

fn full_allowlist() -> OperatorAllowlist {
    OperatorAllowlist::new(
        ["$match", "$group", "$sort", "$limit", "$project", "$count"],
        ["$gt", "$gte", "$lt", "$sum", "$avg", "$in", "$or", "$and"],
    )
    .expect("fixture allowlist is disjoint")
}

fn evaluate(document: &str) -> ExampleResult {
    evaluate_example(
        document,
        &orders_schema(),
        &full_allowlist(),
        &WalkRules::default(),
    )
}

#[test]
fn pending_orders_over_one_hundred_pass_every_layer() {
    let result = evaluate(r#"{"type":"find","filter":{"status":"pending","total":{"$gt":100}}}"#);

    assert!(result.passed, "{result:?}");
    assert_eq!(result.failed_layer, None);
    assert_eq!(result.syntax, LayerStatus::Passed);
    assert_eq!(result.operator, LayerStatus::Passed);
    assert_eq!(result.field, LayerStatus::Passed);
    assert_eq!(result.used_operators, vec!["$gt"]);
    let fields = result.fields.expect("field report on pass");
    assert_eq!(fields.referenced_fields, vec!["status", "total"]);
}

#[test]
fn unknown_field_fails_field_layer_with_token() {
    let result = evaluate(r#"{"type":"find","filter":{"bogus_field":"x"}}"#);

    assert!(!result.passed);
    assert_eq!(
        result.field,
        LayerStatus::Failed {
            failure: LayerFailure::HallucinatedField {
                fields: vec!["bogus_field".to_string()],
            },
        }
    );
    assert_eq!(
        result.first_failure().map(LayerFailure::kind),
        Some(FailureKind::HallucinatedField)
    );
}

#[test]
fn empty_filter_passes_trivially() {
    let result = evaluate(r#"{"type":"find","filter":{}}"#);
    assert!(result.passed);
    assert!(result.used_operators.is_empty());
}

#[test]
fn where_alongside_allowed_query_is_unsafe() {
    let allowlist = OperatorAllowlist::new(["$match"], ["$gt", "$where"]).expect("disjoint");
    let result = evaluate_example(
        r#"{"type":"aggregate","pipeline":[{"$match":{"total":{"$gt":5},"$where":"sleep(1)"}}]}"#,
        &orders_schema(),
        &allowlist,
        &WalkRules::default(),
    );

    assert_eq!(
        result.first_failure().map(LayerFailure::kind),
        Some(FailureKind::UnsafeOperator)
    );
    assert_eq!(result.field, LayerStatus::Skipped);
}

#[test]
fn group_alias_passes_or_fails_on_referenced_field_only() {
    let document = r#"{"type":"aggregate","pipeline":[{"$group":{"_id":"$status","total":{"$sum":"$salary"}}}]}"#;
    assert!(evaluate(document).passed);

    let without_salary = SchemaDescriptor::new(
        "orders",
        "ecommerce",
        vec![FieldDescriptor::new(
            "status",
            FieldType::String,
            FieldRole::Enum,
        )],
    )
    .expect("valid schema");
    let result = evaluate_example(
        document,
        &without_salary,
        &full_allowlist(),
        &WalkRules::default(),
    );
    assert_eq!(
        result.field.failure().map(LayerFailure::tokens),
        Some(vec!["salary".to_string()])
    );
}

#[test]
fn date_wrapper_is_neither_operator_nor_field() {
    let result = evaluate(
        r#"{"type":"find","filter":{"order_date":{"$gte":{"$date":"2024-01-01"}}}}"#,
    );
    assert!(result.passed, "{result:?}");
    assert_eq!(result.used_operators, vec!["$gte"]);
}

#[test]
fn syntax_failure_skips_later_layers() {
    let result = evaluate("{\"type\": \"find\", \"filter\": ");

    assert!(!result.passed);
    assert_eq!(
        result.first_failure().map(LayerFailure::layer),
        Some(Layer::Syntax)
    );
    assert_eq!(result.operator, LayerStatus::Skipped);
    assert_eq!(result.field, LayerStatus::Skipped);
    assert_eq!(result.failed_layer, Some(Layer::Syntax));
}

#[test]
fn result_serializes_with_status_tags() {
    let result = evaluate(r#"{"type":"find","filter":{"bogus_field":"x"}}"#);
    let encoded = serde_json::to_value(&result).expect("result serializes");

    assert_eq!(encoded["syntax"], json!({"status": "passed"}));
    assert_eq!(
        encoded["field"],
        json!({
            "status": "failed",
            "failure": {"kind": "hallucinated_field", "fields": ["bogus_field"]}
        })
    );

    let decoded: ExampleResult =
        serde_json::from_value(encoded).expect("result deserializes");
    assert_eq!(decoded, result);
}

#[test]
fn report_counts_only_examples_that_reached_each_layer() {
    let schema = orders_schema();
    let allowlist = full_allowlist();
    let documents = [
        r#"{"type":"find","filter":{"status":"pending"}}"#,
        r#"not json"#,
        r#"{"type":"find","filter":{"status":{"$nin":["x"]}}}"#,
        r#"{"type":"find","filter":{"ghost":1}}"#,
    ];
    let items = documents
        .iter()
        .enumerate()
        .map(|(index, document)| BatchItem {
            document: *document,
            schema: &schema,
            allowlist: &allowlist,
            population: Some(if index % 2 == 0 {
                Population::Seen
            } else {
                Population::Unseen
            }),
        })
        .collect::<Vec<BatchItem<'_>>>();

    let results = evaluate_batch(&items, &WalkRules::default());
    assert_eq!(
        results.iter().map(|labeled| labeled.index).collect::<Vec<usize>>(),
        vec![0, 1, 2, 3]
    );

    let report = summarize(&results);
    assert_eq!(report.total, 4);
    assert_eq!((report.syntax.attempted, report.syntax.passed), (4, 3));
    assert_eq!((report.operator.attempted, report.operator.passed), (3, 2));
    assert_eq!((report.field.attempted, report.field.passed), (2, 1));
    assert_eq!((report.overall.attempted, report.overall.passed), (4, 1));
    assert_eq!(report.field.pass_rate, Some(0.5));

    let failed_layers = report
        .failures
        .iter()
        .map(|detail| (detail.index, detail.layer))
        .collect::<Vec<(usize, Layer)>>();
    assert_eq!(
        failed_layers,
        vec![(1, Layer::Syntax), (2, Layer::Operator), (3, Layer::Field)]
    );

    let generalization = compare_populations(&results, 5.0);
    assert_eq!(generalization.seen_examples, 2);
    assert_eq!(generalization.unseen_examples, 2);
}

#[test]
fn extracted_fenced_prediction_evaluates_like_clean_text() {
    let raw = "Sure!\n```json\n{\"type\":\"find\",\"filter\":{\"status\":\"shipped\"}}\n```";
    let result = evaluate(extract_document(raw));
    assert!(result.passed, "{result:?}");
}

#[test]
fn unsafe_operator_hidden_in_date_wrapper_fails() {
    let result = evaluate(
        r#"{"type":"find","filter":{"order_date":{"$date":{"$where":"sleep(1000)"}}}}"#,
    );

    assert!(!result.passed);
    assert_eq!(result.failed_layer, Some(Layer::Operator));
    assert_eq!(
        result.first_failure().map(LayerFailure::kind),
        Some(FailureKind::UnsafeOperator)
    );
}

#[test]
fn wrapper_and_unsafe_names_as_values_are_not_fields() {
    let result = evaluate(r#"{"type":"find","filter":{"status":{"$in":["$date","$where"]}}}"#);
    assert!(result.passed, "{result:?}");
}

fn contains_key(value: &serde_json::Value, wanted: &str) -> bool {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .any(|(key, nested)| key == wanted || contains_key(nested, wanted)),
        serde_json::Value::Array(items) => items.iter().any(|item| contains_key(item, wanted)),
        _ => false,
    }
}

fn arb_document() -> impl Strategy<Value = String> {
    let key = prop_oneof![
        Just("status".to_string()),
        Just("total".to_string()),
        Just("ghost".to_string()),
        Just("$gt".to_string()),
        Just("$where".to_string()),
        Just("$date".to_string()),
    ];
    let leaf = prop_oneof![
        any::<i32>().prop_map(|value| json!(value)),
        Just(json!("$salary")),
        Just(json!("$nowhere")),
        Just(json!("pending")),
    ];
    let value = leaf.prop_recursive(3, 16, 3, move |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..3).prop_map(serde_json::Value::Array),
            prop::collection::vec((key.clone(), inner), 0..3).prop_map(|entries| {
                serde_json::Value::Object(entries.into_iter().collect())
            }),
        ]
    });

    prop_oneof![
        value
            .clone()
            .prop_map(|filter| json!({"type": "find", "filter": filter}).to_string()),
        prop::collection::vec(value, 0..3)
            .prop_map(|pipeline| json!({"type": "aggregate", "pipeline": pipeline}).to_string()),
        "[ -~]{0,40}",
    ]
}

proptest! {
    #[test]
    fn evaluation_is_idempotent(document in arb_document()) {
        let first = serde_json::to_vec(&evaluate(&document)).expect("serializes");
        let second = serde_json::to_vec(&evaluate(&document)).expect("serializes");
        prop_assert_eq!(first, second);
    }

    #[test]
    fn layers_after_a_failure_are_skipped(document in arb_document()) {
        let result = evaluate(&document);
        let statuses = [&result.syntax, &result.operator, &result.field];
        let first_unpassed = statuses.iter().position(|status| !status.passed());

        match first_unpassed {
            None => prop_assert!(result.passed),
            Some(position) => {
                prop_assert!(!result.passed);
                prop_assert!(statuses[position].failure().is_some());
                for status in &statuses[position + 1..] {
                    prop_assert_eq!(*status, &LayerStatus::Skipped);
                }
            }
        }
    }

    #[test]
    fn denylisted_key_anywhere_fails_with_unsafe_operator(document in arb_document()) {
        let result = evaluate(&document);
        let parsed = serde_json::from_str::<serde_json::Value>(&document);

        if let (LayerStatus::Passed, Ok(parsed)) = (&result.syntax, parsed) {
            if contains_key(&parsed, "$where") {
                prop_assert_eq!(
                    result.first_failure().map(LayerFailure::kind),
                    Some(FailureKind::UnsafeOperator)
                );
            }
        }
    }

    #[test]
    fn counter_merge_matches_sequential_count(
        documents in prop::collection::vec(arb_document(), 0..12),
        split in 0usize..12,
    ) {
        let results = documents.iter().map(|document| evaluate(document)).collect::<Vec<_>>();
        let split = split.min(results.len());

        let whole = LayerCounters::from_results(&results);
        let left = LayerCounters::from_results(&results[..split]);
        let right = LayerCounters::from_results(&results[split..]);

        prop_assert_eq!(left.merge(right), whole);
        prop_assert_eq!(right.merge(left), whole);
    }
}

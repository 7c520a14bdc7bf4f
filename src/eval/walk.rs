use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{is_literal_wrapper, is_operator_shaped, is_system_variable, is_unsafe_operator};
use crate::model::QueryDocument;

/// Logical query operators whose operands are whole filter documents.
const LOGICAL_FILTER_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

/// Arguments of bucket-shaped grouping stages. They configure the stage and
/// never name an output field.
const BUCKET_ARGUMENTS: [&str; 6] = [
    "groupBy",
    "boundaries",
    "default",
    "buckets",
    "granularity",
    "output",
];

/// Default output name of a bucket-shaped stage without an `output` document.
const BUCKET_DEFAULT_OUTPUT: &str = "count";

/// Key of the grouping expression in grouping-style stages.
const GROUP_KEY: &str = "_id";

/// Rules that decide how a document is interpreted while walking it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkRules {
    /// Stage operators whose specification keys name new output fields.
    pub grouping_operators: Vec<String>,
    /// Fields every collection carries implicitly.
    pub implicit_fields: Vec<String>,
}

impl Default for WalkRules {
    fn default() -> Self {
        Self {
            grouping_operators: vec![
                "$group".to_string(),
                "$bucket".to_string(),
                "$bucketAuto".to_string(),
            ],
            implicit_fields: vec![GROUP_KEY.to_string()],
        }
    }
}

impl WalkRules {
    pub fn is_grouping(&self, operator: &str) -> bool {
        self.grouping_operators
            .iter()
            .any(|candidate| candidate == operator)
    }

    pub fn is_implicit_field(&self, name: &str) -> bool {
        self.implicit_fields.iter().any(|candidate| candidate == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorSite {
    Stage,
    Expression,
}

/// Callbacks fired while a [`QueryDocument`] is walked. Every method has a
/// no-op default so each layer only listens for the tokens it checks.
pub trait DocumentVisitor {
    fn pipeline_start(&mut self) {}
    fn pipeline_end(&mut self) {}
    fn stage_start(&mut self, _operator: &str) {}
    fn stage_end(&mut self) {}
    fn operator(&mut self, _token: &str, _site: OperatorSite) {}
    /// A plain key in filter position, e.g. `status` in `{"status": "x"}`.
    fn field_key(&mut self, _path: &str) {}
    /// A `$path` string with the sigil stripped.
    fn field_reference(&mut self, _path: &str) {}
    /// An output name introduced by the current stage.
    fn alias(&mut self, _name: &str) {}
    /// A nested pipeline that runs against another collection, e.g. the
    /// `pipeline` of `$lookup`. Field names inside belong to that collection.
    fn foreign_scope_start(&mut self) {}
    fn foreign_scope_end(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    /// Plain keys are field paths.
    Filter,
    /// The value matched against a field path. Plain keys belong to an
    /// embedded document literal.
    FieldValue,
    /// Aggregation expression. Plain keys are argument or output names.
    Expression,
    /// Payload of a literal wrapper such as `$date`. Only unsafe operator
    /// keys are reported; nothing in it is a field reference.
    Literal,
}

pub fn walk_document<V: DocumentVisitor>(
    document: &QueryDocument,
    rules: &WalkRules,
    visitor: &mut V,
) {
    let mut walker = Walker { rules, visitor };
    match document {
        QueryDocument::Find { filter, projection } => {
            walker.object(filter, Context::Filter);
            if let Some(projection) = projection {
                walker.object(projection, Context::Filter);
            }
        }
        QueryDocument::Aggregate { pipeline } => {
            walker.visitor.pipeline_start();
            for stage in pipeline {
                walker.stage(&stage.operator, &stage.spec);
            }
            walker.visitor.pipeline_end();
        }
    }
}

struct Walker<'a, V> {
    rules: &'a WalkRules,
    visitor: &'a mut V,
}

impl<V: DocumentVisitor> Walker<'_, V> {
    fn stage(&mut self, operator: &str, spec: &Value) {
        self.visitor.stage_start(operator);
        self.visitor.operator(operator, OperatorSite::Stage);

        match operator {
            "$match" | "$sort" => self.value(spec, Context::Filter),
            "$project" => self.projection_stage(spec),
            "$addFields" | "$set" => self.computed_fields(spec),
            "$unset" => self.unset(spec),
            "$count" => match spec {
                Value::String(name) => self.visitor.alias(name),
                other => self.value(other, Context::Expression),
            },
            "$facet" => self.facet(spec),
            "$lookup" => self.lookup(spec),
            "$unwind" => self.unwind(spec),
            grouping if self.rules.is_grouping(grouping) => self.grouping(spec),
            _ => self.value(spec, Context::Expression),
        }

        self.visitor.stage_end();
    }

    fn value(&mut self, value: &Value, context: Context) {
        match value {
            Value::String(_) if context == Context::Literal => {}
            Value::String(text) => self.string(text),
            Value::Array(items) => {
                for item in items {
                    self.value(item, context);
                }
            }
            Value::Object(map) => self.object(map, context),
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    fn string(&mut self, text: &str) {
        if is_operator_shaped(text)
            && !is_system_variable(text)
            && !is_literal_wrapper(text)
            && !is_unsafe_operator(text)
        {
            self.visitor.field_reference(&text[1..]);
        }
    }

    fn object(&mut self, map: &Map<String, Value>, context: Context) {
        for (key, value) in map {
            if is_operator_shaped(key) {
                self.operator_entry(key, value, context);
                continue;
            }

            match context {
                Context::Filter => {
                    self.visitor.field_key(key);
                    self.value(value, Context::FieldValue);
                }
                Context::FieldValue | Context::Expression | Context::Literal => {
                    self.value(value, context)
                }
            }
        }
    }

    fn operator_entry(&mut self, key: &str, value: &Value, context: Context) {
        if context == Context::Literal {
            if is_unsafe_operator(key) {
                self.visitor.operator(key, OperatorSite::Expression);
            }
            self.value(value, Context::Literal);
            return;
        }
        if is_literal_wrapper(key) {
            self.value(value, Context::Literal);
            return;
        }

        self.visitor.operator(key, OperatorSite::Expression);
        let operand_context = match context {
            Context::Filter if LOGICAL_FILTER_OPERATORS.contains(&key) => Context::Filter,
            Context::Filter if key == "$expr" => Context::Expression,
            Context::Filter | Context::Expression => Context::Expression,
            Context::FieldValue | Context::Literal => context,
        };
        self.value(value, operand_context);
    }

    fn grouping(&mut self, spec: &Value) {
        let Value::Object(map) = spec else {
            self.value(spec, Context::Expression);
            return;
        };

        let bucket_shaped = map.contains_key("groupBy");
        for (key, value) in map {
            if is_operator_shaped(key) {
                self.operator_entry(key, value, Context::Expression);
                continue;
            }

            if key == GROUP_KEY {
                self.value(value, Context::Expression);
            } else if bucket_shaped && key == "output" {
                self.output_aliases(value);
            } else if bucket_shaped && BUCKET_ARGUMENTS.contains(&key.as_str()) {
                self.value(value, Context::Expression);
            } else {
                self.visitor.alias(key);
                self.value(value, Context::Expression);
            }
        }

        if bucket_shaped && !map.contains_key("output") {
            self.visitor.alias(BUCKET_DEFAULT_OUTPUT);
        }
    }

    fn output_aliases(&mut self, output: &Value) {
        let Value::Object(accumulators) = output else {
            self.value(output, Context::Expression);
            return;
        };
        for (name, accumulator) in accumulators {
            self.visitor.alias(name);
            self.value(accumulator, Context::Expression);
        }
    }

    fn projection_stage(&mut self, spec: &Value) {
        let Value::Object(map) = spec else {
            self.value(spec, Context::Expression);
            return;
        };

        for (key, value) in map {
            if is_operator_shaped(key) {
                self.operator_entry(key, value, Context::Expression);
                continue;
            }

            match value {
                Value::Bool(_) | Value::Number(_) => self.visitor.field_key(key),
                computed => {
                    self.visitor.alias(key);
                    self.value(computed, Context::Expression);
                }
            }
        }
    }

    fn computed_fields(&mut self, spec: &Value) {
        let Value::Object(map) = spec else {
            self.value(spec, Context::Expression);
            return;
        };

        for (key, value) in map {
            if is_operator_shaped(key) {
                self.operator_entry(key, value, Context::Expression);
                continue;
            }
            self.visitor.alias(key);
            self.value(value, Context::Expression);
        }
    }

    fn unset(&mut self, spec: &Value) {
        match spec {
            Value::String(path) => self.visitor.field_key(path),
            Value::Array(paths) => {
                for path in paths {
                    match path {
                        Value::String(path) => self.visitor.field_key(path),
                        other => self.value(other, Context::Expression),
                    }
                }
            }
            other => self.value(other, Context::Expression),
        }
    }

    fn facet(&mut self, spec: &Value) {
        let Value::Object(branches) = spec else {
            self.value(spec, Context::Expression);
            return;
        };

        for (name, branch) in branches {
            if is_operator_shaped(name) {
                self.operator_entry(name, branch, Context::Expression);
                continue;
            }

            self.visitor.alias(name);
            let Value::Array(stages) = branch else {
                self.value(branch, Context::Expression);
                continue;
            };

            self.pipeline(stages);
        }
    }

    fn pipeline(&mut self, stages: &[Value]) {
        self.visitor.pipeline_start();
        for stage in stages {
            match single_entry(stage) {
                Some((operator, nested)) => self.stage(operator, nested),
                None => self.value(stage, Context::Expression),
            }
        }
        self.visitor.pipeline_end();
    }

    fn lookup(&mut self, spec: &Value) {
        let Value::Object(map) = spec else {
            self.value(spec, Context::Expression);
            return;
        };

        for (key, value) in map {
            if is_operator_shaped(key) {
                self.operator_entry(key, value, Context::Expression);
                continue;
            }

            match (key.as_str(), value) {
                ("localField", Value::String(path)) => self.visitor.field_key(path),
                ("as", Value::String(name)) => self.visitor.alias(name),
                ("from" | "foreignField", other) => self.value(other, Context::Literal),
                ("pipeline", Value::Array(stages)) => {
                    self.visitor.foreign_scope_start();
                    self.pipeline(stages);
                    self.visitor.foreign_scope_end();
                }
                (_, other) => self.value(other, Context::Expression),
            }
        }
    }

    fn unwind(&mut self, spec: &Value) {
        let Value::Object(map) = spec else {
            self.value(spec, Context::Expression);
            return;
        };

        for (key, value) in map {
            match (key.as_str(), value) {
                ("includeArrayIndex", Value::String(name)) => self.visitor.alias(name),
                _ if is_operator_shaped(key) => {
                    self.operator_entry(key, value, Context::Expression)
                }
                (_, other) => self.value(other, Context::Expression),
            }
        }
    }
}

fn single_entry(value: &Value) -> Option<(&str, &Value)> {
    let Value::Object(map) = value else {
        return None;
    };
    if map.len() != 1 {
        return None;
    }
    map.iter()
        .next()
        .filter(|(key, _)| is_operator_shaped(key) && !is_literal_wrapper(key))
        .map(|(key, spec)| (key.as_str(), spec))
}

use std::collections::{BTreeSet, HashSet};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix shared by query operators, literal wrappers and field path strings.
pub const OPERATOR_SIGIL: char = '$';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    #[serde(alias = "int", alias = "long")]
    Number,
    Double,
    Date,
    #[serde(alias = "bool")]
    Boolean,
    Array,
    Object,
    ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    Identifier,
    Measure,
    Timestamp,
    Category,
    Enum,
    Boolean,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub role: FieldRole,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, alias = "enumValues", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

#[cfg(test)]
impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType, role: FieldRole) -> Self {
        Self {
            name: name.into(),
            field_type,
            role,
            description: String::new(),
            enum_values: None,
        }
    }

    pub fn with_enum_values(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|value| value.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawSchema {
    #[serde(alias = "collectionName")]
    collection: String,
    #[serde(default)]
    domain: String,
    fields: Vec<FieldDescriptor>,
}

/// A collection schema. Field names are unique; the descriptor is read-only
/// once constructed and is shared by reference across evaluations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawSchema", into = "RawSchema")]
pub struct SchemaDescriptor {
    collection: String,
    domain: String,
    fields: Vec<FieldDescriptor>,
    names: HashSet<String>,
}

impl SchemaDescriptor {
    pub fn new(
        collection: impl Into<String>,
        domain: impl Into<String>,
        fields: Vec<FieldDescriptor>,
    ) -> Result<Self> {
        let collection = collection.into();
        let mut names = HashSet::with_capacity(fields.len());

        for field in &fields {
            if !names.insert(field.name.clone()) {
                bail!(
                    "schema {collection} declares field {} more than once",
                    field.name
                );
            }
            match (&field.role, &field.enum_values) {
                (FieldRole::Enum, _) | (_, None) => {}
                (_, Some(_)) => bail!(
                    "schema {collection} field {} carries enum values but its role is not enum",
                    field.name
                ),
            }
        }

        Ok(Self {
            collection,
            domain: domain.into(),
            fields,
            names,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[cfg(test)]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

impl TryFrom<RawSchema> for SchemaDescriptor {
    type Error = anyhow::Error;

    fn try_from(raw: RawSchema) -> Result<Self> {
        Self::new(raw.collection, raw.domain, raw.fields)
    }
}

impl From<SchemaDescriptor> for RawSchema {
    fn from(schema: SchemaDescriptor) -> Self {
        Self {
            collection: schema.collection,
            domain: schema.domain,
            fields: schema.fields,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawAllowlist {
    #[serde(default, alias = "stageOperators")]
    stage_operators: Vec<String>,
    #[serde(default, alias = "expressionOperators")]
    expression_operators: Vec<String>,
}

/// Operators a candidate may use, split by the position they may occupy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawAllowlist", into = "RawAllowlist")]
pub struct OperatorAllowlist {
    stage_operators: BTreeSet<String>,
    expression_operators: BTreeSet<String>,
}

impl OperatorAllowlist {
    pub fn new<S, E>(stage_operators: S, expression_operators: E) -> Result<Self>
    where
        S: IntoIterator,
        S::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let stage_operators = stage_operators
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<String>>();
        let expression_operators = expression_operators
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<String>>();

        let overlap = stage_operators
            .intersection(&expression_operators)
            .cloned()
            .collect::<Vec<String>>();
        if !overlap.is_empty() {
            bail!(
                "operators listed as both stage and expression operators: {}",
                overlap.join(", ")
            );
        }

        Ok(Self {
            stage_operators,
            expression_operators,
        })
    }

    pub fn allows_stage(&self, token: &str) -> bool {
        self.stage_operators.contains(token)
    }

    pub fn allows_expression(&self, token: &str) -> bool {
        self.expression_operators.contains(token)
    }
}

impl TryFrom<RawAllowlist> for OperatorAllowlist {
    type Error = anyhow::Error;

    fn try_from(raw: RawAllowlist) -> Result<Self> {
        Self::new(raw.stage_operators, raw.expression_operators)
    }
}

impl From<OperatorAllowlist> for RawAllowlist {
    fn from(allowlist: OperatorAllowlist) -> Self {
        Self {
            stage_operators: allowlist.stage_operators.into_iter().collect(),
            expression_operators: allowlist.expression_operators.into_iter().collect(),
        }
    }
}

/// One aggregation stage: its sole operator key and the specification under it.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    pub operator: String,
    pub spec: Value,
}

/// A syntactically valid read-only query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryDocument {
    Find {
        filter: Map<String, Value>,
        projection: Option<Map<String, Value>>,
    },
    Aggregate {
        pipeline: Vec<PipelineStage>,
    },
}

/// One line of an exported examples file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExampleRecord {
    #[serde(alias = "schema_def")]
    pub schema: SchemaDescriptor,
    #[serde(default)]
    pub allowed_ops: OperatorAllowlist,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub is_negative: bool,
}

/// One line of a predictions file, aligned by position with the examples file.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRecord {
    #[serde(default)]
    pub collection: Option<String>,
    pub prediction: String,
}

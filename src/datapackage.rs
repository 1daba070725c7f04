//! Derive tabular schemas from taxonomy concept trees and render filings
//! against them.
//!
//! Each taxonomy link role becomes up to two resources (one per period
//! kind) in a frictionless-style tabular datapackage descriptor. The
//! `FactTable` companion of a resource does the actual extraction work.

use ahash::AHashMap;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use crate::helpers::{lowercase_words, snake_case};
use crate::instance::Instance;
use crate::table::{Table, Value};
use crate::taxonomy::{Concept, LinkRole, PeriodType, Taxonomy};
use crate::{Error, Result};

/// Output field types, following the frictionless table-schema vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Integer,
    Year,
    Boolean,
    Date,
}

impl FieldType {
    /// Convert a raw fact value into a typed cell.
    pub fn convert(self, raw: &str, column: &str) -> Result<Value> {
        match self {
            FieldType::String | FieldType::Date => Ok(Value::Str(raw.to_string())),
            FieldType::Number => raw
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| conversion_error(raw, column, "number")),
            FieldType::Integer | FieldType::Year => raw
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| conversion_error(raw, column, "integer")),
            FieldType::Boolean => match raw {
                "true" | "1" => Ok(Value::Boolean(true)),
                "false" | "0" => Ok(Value::Boolean(false)),
                _ => Err(conversion_error(raw, column, "boolean")),
            },
        }
    }
}

fn conversion_error(raw: &str, column: &str, expected: &str) -> Error {
    Error::Parse(format!(
        "value {raw:?} in column {column} is not a valid {expected}"
    ))
}

/// One column in a table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub title: String,
    #[serde(rename = "type")]
    pub type_: FieldType,
    #[serde(rename = "format")]
    pub format_: String,
    pub description: String,
}

impl Field {
    fn new(name: &str, title: &str, type_: FieldType, description: &str) -> Field {
        Field {
            name: name.to_string(),
            title: title.to_string(),
            type_,
            format_: "default".to_string(),
            description: description.to_string(),
        }
    }

    /// Build a data-column field from a leaf concept.
    pub fn from_concept(concept: &Concept) -> Result<Field> {
        Ok(Field {
            name: snake_case(&concept.name),
            title: concept.standard_label.clone(),
            type_: concept.xbrl_type.schema_type()?,
            format_: "default".to_string(),
            description: concept.documentation.trim().to_string(),
        })
    }

    fn entity_id() -> Field {
        Field::new(
            "entity_id",
            "Entity Identifier",
            FieldType::String,
            "Unique identifier of respondent",
        )
    }

    fn filing_name() -> Field {
        Field::new(
            "filing_name",
            "Filing Name",
            FieldType::String,
            "Name of filing",
        )
    }

    fn publication_time() -> Field {
        Field::new(
            "publication_time",
            "Publication Time",
            FieldType::String,
            "Time the filing was made available",
        )
    }

    fn date() -> Field {
        Field::new(
            "date",
            "Date",
            FieldType::Date,
            "Date of instant period",
        )
    }

    fn start_date() -> Field {
        Field::new(
            "start_date",
            "Start Date",
            FieldType::Date,
            "Start date of duration period",
        )
    }

    fn end_date() -> Field {
        Field::new(
            "end_date",
            "End Date",
            FieldType::Date,
            "End date of duration period",
        )
    }
}

fn table_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(.+?)\s+-\s+(schedule|deprecated)\s+-\s+(.*)$")
            .unwrap_or_else(|e| panic!("invalid regex: {e}"))
    })
}

/// Derive a table name from a link role definition.
///
/// Definitions look like `001 - Schedule - Comparative Balance Sheet`;
/// the schedule name and code become `comparative_balance_sheet_001`.
/// Returns `Ok(None)` for roles marked `Deprecated`, and an error for
/// definitions that fit neither shape.
pub fn clean_table_name(definition: &str) -> Result<Option<String>> {
    let normalized = lowercase_words(definition);
    let caps = table_name_re()
        .captures(normalized.trim())
        .ok_or_else(|| Error::TableName(definition.to_string()))?;

    if caps[2].eq_ignore_ascii_case("deprecated") {
        return Ok(None);
    }
    Ok(Some(snake_case(&format!("{} {}", &caps[3], &caps[1]))))
}

/// Table schema: ordered fields with a composite primary key prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
    pub primary_key: Vec<String>,
}

impl Schema {
    /// Walk a link role's concept tree and derive the schema for one
    /// period kind.
    ///
    /// Dimension (`*Axis`) concepts become primary-key columns and their
    /// subtrees are not descended into; leaf concepts matching the period
    /// kind become data columns; container concepts only contribute their
    /// children. Duplicate concept appearances keep the first definition.
    pub fn from_concept_tree(root: &Concept, period_type: PeriodType) -> Result<Schema> {
        let mut axes: IndexMap<String, Field> = IndexMap::new();
        let mut columns: IndexMap<String, Field> = IndexMap::new();
        collect_fields(root, period_type, &mut axes, &mut columns)?;

        let mut fields = vec![
            Field::entity_id(),
            Field::filing_name(),
            Field::publication_time(),
        ];
        match period_type {
            PeriodType::Instant => fields.push(Field::date()),
            PeriodType::Duration => {
                fields.push(Field::start_date());
                fields.push(Field::end_date());
            }
        }
        fields.extend(axes.into_values());
        let primary_key: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
        fields.extend(columns.into_values());

        Ok(Schema {
            fields,
            primary_key,
        })
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Names of fields outside the primary key.
    pub fn data_column_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !self.primary_key.contains(&f.name))
            .map(|f| f.name.clone())
            .collect()
    }

    /// Primary-key columns that are dimensions.
    pub fn axis_names(&self) -> Vec<String> {
        self.primary_key
            .iter()
            .filter(|name| name.ends_with("axis"))
            .cloned()
            .collect()
    }
}

fn collect_fields(
    concept: &Concept,
    period_type: PeriodType,
    axes: &mut IndexMap<String, Field>,
    columns: &mut IndexMap<String, Field>,
) -> Result<()> {
    if concept.is_axis() {
        // Axis children enumerate allowed members, not columns.
        let name = snake_case(&concept.name);
        axes.entry(name.clone()).or_insert_with(|| {
            Field::new(
                &name,
                &concept.standard_label,
                FieldType::String,
                concept.documentation.trim(),
            )
        });
        return Ok(());
    }

    if concept.is_leaf() {
        if concept.period_type == period_type {
            let field = Field::from_concept(concept)?;
            columns.entry(field.name.clone()).or_insert(field);
        }
        return Ok(());
    }

    for child in &concept.child_concepts {
        collect_fields(child, period_type, axes, columns)?;
    }
    Ok(())
}

/// CSV dialect of an output resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialect {
    pub delimiter: String,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            delimiter: ",".to_string(),
        }
    }
}

/// One table in the datapackage descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub path: String,
    pub profile: String,
    pub name: String,
    #[serde(default)]
    pub dialect: Dialect,
    pub title: String,
    pub description: String,
    #[serde(rename = "format")]
    pub format_: String,
    pub mediatype: String,
    pub schema: Schema,
}

impl Resource {
    /// Build the resource for one link role and period kind.
    ///
    /// Returns `Ok(None)` for deprecated roles and for period kinds the
    /// role has no data columns for.
    pub fn from_link_role(role: &LinkRole, period_type: PeriodType) -> Result<Option<Resource>> {
        let Some(table_name) = clean_table_name(&role.definition)? else {
            return Ok(None);
        };
        let schema = Schema::from_concept_tree(&role.concepts, period_type)?;
        if schema.data_column_names().is_empty() {
            return Ok(None);
        }

        let name = format!("{table_name}_{}", period_type.as_str());
        Ok(Some(Resource {
            path: format!("{name}.csv"),
            profile: "tabular-data-resource".to_string(),
            name,
            dialect: Dialect::default(),
            title: format!("{} - {}", role.definition, period_type.as_str()),
            description: role.concepts.documentation.trim().to_string(),
            format_: "csv".to_string(),
            mediatype: "text/csv".to_string(),
            schema,
        }))
    }

    pub fn period_type(&self) -> PeriodType {
        if self.schema.primary_key.iter().any(|c| c == "date") {
            PeriodType::Instant
        } else {
            PeriodType::Duration
        }
    }
}

/// Derive every resource defined by one taxonomy version.
pub fn resources_from_taxonomy(taxonomy: &Taxonomy) -> Result<Vec<Resource>> {
    let mut resources = Vec::new();
    for role in &taxonomy.roles {
        for period_type in [PeriodType::Duration, PeriodType::Instant] {
            if let Some(resource) = Resource::from_link_role(role, period_type)? {
                resources.push(resource);
            }
        }
    }
    Ok(resources)
}

/// Descriptor for the full set of extracted tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datapackage {
    pub profile: String,
    pub name: String,
    pub title: String,
    pub resources: Vec<Resource>,
}

impl Datapackage {
    pub fn new(form_number: u32, resources: Vec<Resource>) -> Datapackage {
        Datapackage {
            profile: "tabular-data-package".to_string(),
            name: format!("ferc{form_number}-extracted-xbrl"),
            title: format!("FERC Form {form_number} XBRL extracted data"),
            resources,
        }
    }

    /// Structural validation of the descriptor before any extraction work.
    pub fn validate(&self) -> Result<()> {
        if self.resources.is_empty() {
            return Err(Error::InvalidDescriptor(
                "datapackage defines no resources".to_string(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for resource in &self.resources {
            if !seen.insert(&resource.name) {
                return Err(Error::InvalidDescriptor(format!(
                    "duplicate resource name {:?}",
                    resource.name
                )));
            }
            let field_names = resource.schema.field_names();
            for key in &resource.schema.primary_key {
                if !field_names.contains(key) {
                    return Err(Error::InvalidDescriptor(format!(
                        "primary key column {key:?} of {} is not a field",
                        resource.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the extraction engines for all (or the requested) resources.
    pub fn fact_tables(
        &self,
        requested: Option<&HashSet<String>>,
        max_precision: u32,
    ) -> BTreeMap<String, FactTable> {
        self.resources
            .iter()
            .filter(|resource| requested.map_or(true, |names| names.contains(&resource.name)))
            .map(|resource| {
                (
                    resource.name.clone(),
                    FactTable::new(resource, max_precision),
                )
            })
            .collect()
    }
}

/// Extraction engine for one resource: selects facts by dimensional
/// filtering, reconciles duplicates, and pivots contexts into rows.
#[derive(Debug, Clone)]
pub struct FactTable {
    pub schema: Schema,
    pub period_type: PeriodType,
    axes: Vec<String>,
    data_columns: Vec<String>,
    column_types: AHashMap<String, FieldType>,
    max_precision: u32,
}

impl FactTable {
    pub fn new(resource: &Resource, max_precision: u32) -> FactTable {
        let schema = resource.schema.clone();
        let column_types = schema
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.type_))
            .collect();
        FactTable {
            period_type: resource.period_type(),
            axes: schema.axis_names(),
            data_columns: schema.data_column_names(),
            column_types,
            max_precision,
            schema,
        }
    }

    /// Render one filing against this table definition.
    ///
    /// A context contributes a row when its dimensions are a subset of the
    /// table's axes; declared axes the context omits are filled with the
    /// `"total"` sentinel. Rows whose data columns are all null are
    /// dropped.
    pub fn construct_table(&self, instance: &mut Instance) -> Result<Table> {
        let columns = self.schema.field_names();
        let primary_key = self.schema.primary_key.clone();

        let facts = instance.get_facts(self.period_type, &self.data_columns, &primary_key);
        let mut table = Table::new(columns.clone(), primary_key);
        if facts.is_empty() {
            return Ok(table);
        }

        // Collect every reported value per (context, column) cell.
        let mut cells: IndexMap<String, AHashMap<String, Vec<Value>>> = IndexMap::new();
        for fact in facts {
            let type_ = self
                .column_types
                .get(&fact.name)
                .copied()
                .unwrap_or_default();
            let value = type_.convert(&fact.value, &fact.name)?;
            cells
                .entry(fact.c_id)
                .or_default()
                .entry(fact.name)
                .or_default()
                .push(value);
        }

        let filing_name = instance.filing_name.clone();
        let publication_time = instance.publication_time.to_rfc3339();

        for (c_id, mut row_cells) in cells {
            let context = instance.context(&c_id).ok_or_else(|| {
                Error::Parse(format!("missing context {c_id} during pivot"))
            })?;
            let key = context.as_primary_key(&filing_name, &self.axes);

            let mut row = Vec::with_capacity(columns.len());
            let mut any_data = false;
            for column in &columns {
                if column == "publication_time" {
                    row.push(Value::Str(publication_time.clone()));
                } else if let Some(value) = key.get(column) {
                    row.push(Value::Str(value.clone()));
                } else if let Some(values) = row_cells.remove(column) {
                    let value = reconcile(values, &c_id, column, self.max_precision)?;
                    any_data = any_data || !value.is_null();
                    row.push(value);
                } else {
                    row.push(Value::Null);
                }
            }
            if any_data {
                table.push_row(row);
            }
        }
        Ok(table)
    }
}

/// Reduce the values reported for one cell to a single value.
///
/// Exact duplicates collapse silently. Remaining numeric conflicts are
/// tolerated when they look like the same quantity at different rounding
/// precisions, in which case the most precise value wins.
fn reconcile(values: Vec<Value>, context: &str, concept: &str, max_precision: u32) -> Result<Value> {
    let mut unique: Vec<Value> = Vec::new();
    for value in values {
        if !unique.contains(&value) {
            unique.push(value);
        }
    }
    if unique.len() == 1 {
        if let Some(value) = unique.pop() {
            return Ok(value);
        }
    }
    if let Some(value) = resolve_conflict(&unique, max_precision) {
        return Ok(value);
    }
    Err(Error::Reconciliation {
        context: context.to_string(),
        concept: concept.to_string(),
        values: unique.iter().map(Value::render).collect(),
    })
}

/// Pick the single unrounded value out of a set of conflicting numbers,
/// if one exists at any precision up to `max_precision` decimal places.
fn resolve_conflict(values: &[Value], max_precision: u32) -> Option<Value> {
    let numbers: Vec<f64> = values.iter().map(Value::as_f64).collect::<Option<_>>()?;

    for precision in 0..max_precision {
        let scale = 10f64.powi(precision as i32);
        let unrounded: Vec<usize> = numbers
            .iter()
            .enumerate()
            .filter(|(_, &n)| (n * scale).round() / scale != n)
            .map(|(i, _)| i)
            .collect();
        if let [index] = unrounded[..] {
            return Some(values[index].clone());
        }
    }
    None
}

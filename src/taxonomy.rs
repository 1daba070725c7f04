//! XBRL taxonomy structures.
//!
//! The heavy lifting of resolving a taxonomy's DTS is delegated to an
//! external document model provider; each taxonomy version arrives here as
//! one JSON concept-graph document (the provider's relationship-set dump),
//! deserialized directly into these structures. A taxonomy archive is a zip
//! of dated concept-graph documents, one per taxonomy version.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;
use zip::ZipArchive;

use crate::datapackage::FieldType;
use crate::{Error, Result};

/// Period kind declared for a concept: a point in time or a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Instant,
    Duration,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Instant => "instant",
            PeriodType::Duration => "duration",
        }
    }
}

/// The declared type of a concept.
///
/// XBRL has an inheritance model for types; only the name and the base type
/// it derives from are kept. The base type determines the output field
/// type. The set handled here covers every base type appearing in the FERC
/// taxonomies; anything else is a fatal schema-derivation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XbrlType {
    #[serde(default = "default_base")]
    pub name: String,
    #[serde(default = "default_base")]
    pub base: String,
}

fn default_base() -> String {
    "string".to_string()
}

impl Default for XbrlType {
    fn default() -> Self {
        Self {
            name: default_base(),
            base: default_base(),
        }
    }
}

impl XbrlType {
    /// Map the base type to an output schema field type.
    ///
    /// Date and duration concepts carry free-form values in practice, so
    /// they land as strings; the `date` field type is reserved for the
    /// period columns of the primary key.
    pub fn schema_type(&self) -> Result<FieldType> {
        match self.base.as_str() {
            "string" | "date" | "duration" => Ok(FieldType::String),
            "decimal" => Ok(FieldType::Number),
            "gyear" | "year" => Ok(FieldType::Year),
            "integer" => Ok(FieldType::Integer),
            "boolean" => Ok(FieldType::Boolean),
            other => Err(Error::TypeMapping(other.to_string())),
        }
    }
}

/// Credit/debit balance indicator on monetary concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Balance {
    Credit,
    Debit,
}

/// Where a concept appears on the physical form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

/// Regulatory citation attached to a concept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct References {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub form_locations: Vec<FormLocation>,
}

/// One summation term from the calculation linkbase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub name: String,
    pub weight: f64,
}

/// Sidecar metadata emitted for leaf (data-column) concepts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConceptMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<References>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub calculations: Vec<Calculation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<Balance>,
}

/// A node in a taxonomy concept tree.
///
/// A concept either represents a single reportable fact (no children) or a
/// container grouping other concepts. A concept whose name ends in `Axis`
/// is a dimension rather than a data column, regardless of children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    #[serde(default)]
    pub standard_label: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(rename = "type", default)]
    pub xbrl_type: XbrlType,
    pub period_type: PeriodType,
    #[serde(default)]
    pub child_concepts: Vec<Concept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<References>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calculations: Vec<Calculation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Balance>,
}

impl Concept {
    pub fn is_axis(&self) -> bool {
        self.name.ends_with("Axis")
    }

    pub fn is_leaf(&self) -> bool {
        self.child_concepts.is_empty()
    }
}

/// A link role groups concepts into one "fact table" definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRole {
    pub role: String,
    pub definition: String,
    pub concepts: Concept,
}

/// One taxonomy version: the ordered link roles of its concept graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taxonomy {
    pub roles: Vec<LinkRole>,
}

fn version_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap_or_else(|e| panic!("invalid regex: {e}"))
    })
}

impl Taxonomy {
    /// Deserialize one concept-graph document.
    pub fn from_source<R: Read>(source: R) -> Result<Taxonomy> {
        Ok(serde_json::from_reader(source)?)
    }

    /// Load every taxonomy version from a zip archive.
    ///
    /// Each entry carrying a `YYYY-MM-DD` date in its name is one taxonomy
    /// version; entries without a date are ignored. Returns versions keyed
    /// by date so downstream merging is deterministic.
    pub fn from_archive(path: &Path) -> Result<BTreeMap<String, Taxonomy>> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;

        let mut taxonomies = BTreeMap::new();
        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            let Some(date) = version_date_re().find(&name) else {
                continue;
            };
            info!("Parsing taxonomy from {name}");
            taxonomies.insert(date.as_str().to_string(), Taxonomy::from_source(entry)?);
        }

        if taxonomies.is_empty() {
            return Err(Error::NotFound(format!(
                "no dated taxonomy entry points in {}",
                path.display()
            )));
        }
        Ok(taxonomies)
    }

    /// Collect sidecar metadata for leaf (data-column) concepts.
    pub fn metadata(&self) -> BTreeMap<String, ConceptMetadata> {
        let mut out = BTreeMap::new();
        for role in &self.roles {
            collect_metadata(&role.concepts, &mut out);
        }
        out
    }
}

fn collect_metadata(concept: &Concept, out: &mut BTreeMap<String, ConceptMetadata>) {
    if concept.is_leaf() && !concept.is_axis() {
        let has_metadata = concept.references.is_some()
            || !concept.calculations.is_empty()
            || concept.balance.is_some();
        if has_metadata && !out.contains_key(&concept.name) {
            out.insert(
                concept.name.clone(),
                ConceptMetadata {
                    references: concept.references.clone(),
                    calculations: concept.calculations.clone(),
                    balance: concept.balance,
                },
            );
        }
    }
    for child in &concept.child_concepts {
        collect_metadata(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_concept_graph() {
        let raw = r#"{
            "roles": [
                {
                    "role": "https://example.com/roles/001",
                    "definition": "001 - Schedule - Example",
                    "concepts": {
                        "name": "RootConcept",
                        "standard_label": "Root",
                        "documentation": "Root of the tree.",
                        "type": {"name": "type", "base": "string"},
                        "period_type": "duration",
                        "child_concepts": [
                            {
                                "name": "Revenue",
                                "standard_label": "Revenue",
                                "documentation": "Total revenue.",
                                "type": {"name": "monetary", "base": "decimal"},
                                "period_type": "duration",
                                "child_concepts": [],
                                "balance": "credit",
                                "references": {
                                    "account": "400",
                                    "form_locations": [{"schedule": "114", "page": "300"}]
                                },
                                "calculations": [{"name": "OperatingRevenue", "weight": 1.0}]
                            }
                        ]
                    }
                }
            ]
        }"#;

        let taxonomy = Taxonomy::from_source(raw.as_bytes()).unwrap();
        assert_eq!(taxonomy.roles.len(), 1);
        let root = &taxonomy.roles[0].concepts;
        assert_eq!(root.name, "RootConcept");
        assert_eq!(root.child_concepts[0].balance, Some(Balance::Credit));

        let metadata = taxonomy.metadata();
        assert_eq!(metadata.len(), 1);
        let revenue = &metadata["Revenue"];
        assert_eq!(revenue.calculations[0].weight, 1.0);
        assert_eq!(
            revenue.references.as_ref().unwrap().account.as_deref(),
            Some("400")
        );
    }

    #[test]
    fn test_unknown_base_type_is_fatal() {
        let xbrl_type = XbrlType {
            name: "exotic".to_string(),
            base: "hexBinary".to_string(),
        };
        assert!(matches!(
            xbrl_type.schema_type(),
            Err(Error::TypeMapping(t)) if t == "hexBinary"
        ));
    }

    #[test]
    fn test_axis_detection() {
        let concept = Concept {
            name: "SomethingAxis".to_string(),
            standard_label: String::new(),
            documentation: String::new(),
            xbrl_type: XbrlType::default(),
            period_type: PeriodType::Duration,
            child_concepts: vec![],
            references: None,
            calculations: vec![],
            balance: None,
        };
        assert!(concept.is_axis());
        assert!(concept.is_leaf());
    }
}

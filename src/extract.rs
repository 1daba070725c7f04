//! Batch extraction across many filings: taxonomy loading, parallel
//! per-filing rendering, and cross-filing merging.

use ahash::{AHashMap, AHashSet};
use chrono::NaiveDate;
use regex::Regex;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::info;

use crate::datapackage::{resources_from_taxonomy, Datapackage, FactTable, Resource};
use crate::instance::{
    get_instances, InstanceBuilder, ReportDatePolicy, DEFAULT_FACT_PREFIX,
};
use crate::table::Table;
use crate::taxonomy::{ConceptMetadata, Taxonomy};
use crate::{Error, Result};

/// FERC forms with published XBRL taxonomies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    Form1,
    Form2,
    Form6,
    Form60,
    Form714,
}

impl Form {
    pub fn from_number(number: u32) -> Result<Form> {
        match number {
            1 => Ok(Form::Form1),
            2 => Ok(Form::Form2),
            6 => Ok(Form::Form6),
            60 => Ok(Form::Form60),
            714 => Ok(Form::Form714),
            other => Err(Error::UnknownForm(other)),
        }
    }

    pub fn number(self) -> u32 {
        match self {
            Form::Form1 => 1,
            Form::Form2 => 2,
            Form::Form6 => 6,
            Form::Form60 => 60,
            Form::Form714 => 714,
        }
    }
}

/// Cache of resources derived per taxonomy version, so repeated extract
/// calls (or versions shared between filing sets) skip re-deriving
/// schemas.
#[derive(Debug, Default)]
pub struct TableCache {
    resources: AHashMap<String, Vec<Resource>>,
}

impl TableCache {
    pub fn get_or_derive(&mut self, version: &str, taxonomy: &Taxonomy) -> Result<&Vec<Resource>> {
        match self.resources.entry(version.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(resources_from_taxonomy(taxonomy)?)),
        }
    }
}

/// Per-filing accounting used for coverage reporting.
#[derive(Debug, Clone, Default)]
pub struct InstanceStats {
    pub total_facts: usize,
    pub used_facts: AHashSet<String>,
    pub report_date: Option<NaiveDate>,
}

/// Fraction of parsed facts that landed in some output table, across all
/// filings. `None` when no facts were parsed at all.
pub fn used_fact_ratio(stats: &BTreeMap<String, InstanceStats>) -> Option<f64> {
    let total: usize = stats.values().map(|s| s.total_facts).sum();
    if total == 0 {
        return None;
    }
    let used: usize = stats.values().map(|s| s.used_facts.len()).sum();
    Some(used as f64 / total as f64)
}

/// Everything configuring one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    /// Filing locations: files, directories, or zip archives.
    pub filings: Vec<PathBuf>,
    /// Zip archive of taxonomy concept-graph documents.
    pub taxonomy_source: PathBuf,
    pub form: Form,
    /// Only extract these resources when set.
    pub requested_tables: Option<HashSet<String>>,
    /// Only parse filings whose name matches when set.
    pub instance_pattern: Option<Regex>,
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub fact_prefix: String,
    pub report_date_policy: ReportDatePolicy,
    /// Decimal places tried when reconciling near-duplicate numbers.
    pub max_precision: u32,
}

impl ExtractionOptions {
    pub fn new(filings: Vec<PathBuf>, taxonomy_source: PathBuf, form: Form) -> ExtractionOptions {
        ExtractionOptions {
            filings,
            taxonomy_source,
            form,
            requested_tables: None,
            instance_pattern: None,
            workers: None,
            batch_size: None,
            fact_prefix: DEFAULT_FACT_PREFIX.to_string(),
            report_date_policy: ReportDatePolicy::default(),
            max_precision: 6,
        }
    }
}

/// Results of one extraction run.
#[derive(Debug)]
pub struct ExtractOutput {
    pub datapackage: Datapackage,
    /// Merged table data keyed by resource name.
    pub tables: BTreeMap<String, Table>,
    /// Per-filing fact accounting keyed by filing name.
    pub stats: BTreeMap<String, InstanceStats>,
    /// Sidecar concept metadata keyed by concept name.
    pub metadata: BTreeMap<String, ConceptMetadata>,
}

/// Run a full extraction: load taxonomies, derive the datapackage, render
/// every filing, and merge rows across filings.
pub fn extract(options: &ExtractionOptions, cache: &mut TableCache) -> Result<ExtractOutput> {
    let taxonomies = Taxonomy::from_archive(&options.taxonomy_source)?;

    // Versions merge oldest-first; the first definition of a resource or
    // concept wins.
    let mut resources: Vec<Resource> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut metadata: BTreeMap<String, ConceptMetadata> = BTreeMap::new();
    for (version, taxonomy) in &taxonomies {
        for resource in cache.get_or_derive(version, taxonomy)? {
            if seen.insert(resource.name.clone()) {
                resources.push(resource.clone());
            }
        }
        for (name, concept_metadata) in taxonomy.metadata() {
            metadata.entry(name).or_insert(concept_metadata);
        }
    }

    let datapackage = Datapackage::new(options.form.number(), resources);
    datapackage.validate()?;
    let fact_tables =
        datapackage.fact_tables(options.requested_tables.as_ref(), options.max_precision);

    let mut builders: Vec<InstanceBuilder> = Vec::new();
    for path in &options.filings {
        builders.extend(get_instances(path)?);
    }
    if let Some(pattern) = &options.instance_pattern {
        builders.retain(|builder| pattern.is_match(&builder.name));
    }
    info!("Extracting {} filings", builders.len());

    let (mut tables, stats) = table_data_from_instances(&builders, &fact_tables, options)?;

    let report_dates: AHashMap<String, NaiveDate> = stats
        .iter()
        .filter_map(|(name, s)| s.report_date.map(|date| (name.clone(), date)))
        .collect();
    for table in tables.values_mut() {
        *table = table.merge_filings(&report_dates);
    }

    Ok(ExtractOutput {
        datapackage,
        tables,
        stats,
        metadata,
    })
}

struct BatchOutput {
    tables: BTreeMap<String, Table>,
    stats: BTreeMap<String, InstanceStats>,
}

fn empty_tables(fact_tables: &BTreeMap<String, FactTable>) -> BTreeMap<String, Table> {
    fact_tables
        .iter()
        .map(|(name, fact_table)| {
            (
                name.clone(),
                Table::new(
                    fact_table.schema.field_names(),
                    fact_table.schema.primary_key.clone(),
                ),
            )
        })
        .collect()
}

/// Split the filings into batches and render each batch, in parallel when
/// the `parallel` feature is enabled. Batch outputs fold back in input
/// order, so results do not depend on scheduling.
fn table_data_from_instances(
    builders: &[InstanceBuilder],
    fact_tables: &BTreeMap<String, FactTable>,
    options: &ExtractionOptions,
) -> Result<(BTreeMap<String, Table>, BTreeMap<String, InstanceStats>)> {
    let workers = options
        .workers
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
        .max(1);
    let batch_size = options
        .batch_size
        .unwrap_or_else(|| builders.len().div_ceil(workers))
        .max(1);
    let batches: Vec<&[InstanceBuilder]> = builders.chunks(batch_size).collect();
    let total_batches = batches.len();

    #[cfg(feature = "parallel")]
    let outputs: Vec<BatchOutput> = {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Pool(e.to_string()))?;
        pool.install(|| {
            batches
                .par_iter()
                .map(|batch| process_batch(batch, fact_tables, options))
                .collect::<Result<Vec<_>>>()
        })?
    };
    #[cfg(not(feature = "parallel"))]
    let outputs: Vec<BatchOutput> = batches
        .iter()
        .map(|batch| process_batch(batch, fact_tables, options))
        .collect::<Result<Vec<_>>>()?;

    let mut tables = empty_tables(fact_tables);
    let mut stats: BTreeMap<String, InstanceStats> = BTreeMap::new();
    for (i, output) in outputs.into_iter().enumerate() {
        for (name, batch_table) in output.tables {
            if let Some(table) = tables.get_mut(&name) {
                table.append(batch_table)?;
            }
        }
        stats.extend(output.stats);
        info!("Finished batch {}/{total_batches}", i + 1);
    }
    Ok((tables, stats))
}

fn process_batch(
    builders: &[InstanceBuilder],
    fact_tables: &BTreeMap<String, FactTable>,
    options: &ExtractionOptions,
) -> Result<BatchOutput> {
    let mut tables = empty_tables(fact_tables);
    let mut stats = BTreeMap::new();

    for builder in builders {
        let mut instance =
            match builder.parse_with(&options.fact_prefix, &options.report_date_policy) {
                Ok(instance) => instance,
                Err(Error::EmptyInstance(name)) => {
                    info!("Skipping empty or unparsable filing {name}");
                    continue;
                }
                Err(other) => return Err(other),
            };

        info!("Extracting {}", instance.filing_name);
        for (name, fact_table) in fact_tables {
            let data = fact_table.construct_table(&mut instance)?;
            if let Some(table) = tables.get_mut(name) {
                table.append(data)?;
            }
        }

        stats.insert(
            instance.filing_name.clone(),
            InstanceStats {
                total_facts: instance.total_facts,
                used_facts: instance.used_fact_ids().clone(),
                report_date: instance.report_date,
            },
        );
    }
    Ok(BatchOutput { tables, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::tests::TEST_FILING;
    use crate::table::Value;
    use crate::taxonomy::{Concept, LinkRole, PeriodType, XbrlType};
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    fn leaf(name: &str, period_type: PeriodType) -> Concept {
        Concept {
            name: name.to_string(),
            standard_label: name.to_string(),
            documentation: String::new(),
            xbrl_type: XbrlType::default(),
            period_type,
            child_concepts: vec![],
            references: None,
            calculations: vec![],
            balance: None,
        }
    }

    fn test_taxonomy() -> Taxonomy {
        let mut root = leaf("TestTableAbstract", PeriodType::Duration);
        root.child_concepts = vec![
            leaf("DimensionOneAxis", PeriodType::Duration),
            leaf("DimensionTwoAxis", PeriodType::Duration),
            leaf("ColumnOne", PeriodType::Duration),
            leaf("ColumnTwo", PeriodType::Duration),
            leaf("ColumnThree", PeriodType::Instant),
            leaf("ColumnFour", PeriodType::Instant),
        ];
        // The filing reports ColumnOne and ColumnTwo against both period
        // kinds, so the taxonomy declares them for both.
        root.child_concepts.push(leaf("ColumnOne", PeriodType::Instant));
        root.child_concepts.push(leaf("ColumnTwo", PeriodType::Instant));

        Taxonomy {
            roles: vec![LinkRole {
                role: "https://example.com/roles/001".to_string(),
                definition: "001 - Schedule - Test Table Name".to_string(),
                concepts: root,
            }],
        }
    }

    fn write_taxonomy_archive(path: &Path) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer
            .start_file("taxonomy-2021-01-01.json", options)
            .unwrap();
        writer
            .write_all(&serde_json::to_vec(&test_taxonomy()).unwrap())
            .unwrap();
        writer.finish().unwrap();
    }

    fn test_options(dir: &Path) -> ExtractionOptions {
        ExtractionOptions::new(
            vec![dir.join("filings")],
            dir.join("taxonomy.zip"),
            Form::Form1,
        )
    }

    fn setup(dir: &Path) {
        write_taxonomy_archive(&dir.join("taxonomy.zip"));
        std::fs::create_dir(dir.join("filings")).unwrap();
        std::fs::write(dir.join("filings/filing.xbrl"), TEST_FILING).unwrap();
    }

    #[test]
    fn test_form_numbers() {
        assert_eq!(Form::from_number(714).unwrap(), Form::Form714);
        assert_eq!(Form::Form60.number(), 60);
        assert!(matches!(Form::from_number(99), Err(Error::UnknownForm(99))));
    }

    #[test]
    fn test_extract_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());

        let options = test_options(dir.path());
        let mut cache = TableCache::default();
        let output = extract(&options, &mut cache).unwrap();

        assert_eq!(output.datapackage.name, "ferc1-extracted-xbrl");
        assert_eq!(
            output
                .tables
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>(),
            vec![
                "test_table_name_001_duration",
                "test_table_name_001_instant"
            ]
        );

        let duration = &output.tables["test_table_name_001_duration"];
        assert_eq!(duration.len(), 3);
        let row = (0..duration.len())
            .find(|&i| {
                duration.get(i, "start_date") == Some(&Value::Str("2021-01-01".to_string()))
            })
            .unwrap();
        assert_eq!(
            duration.get(row, "column_one"),
            Some(&Value::Str("value 1".to_string()))
        );
        assert_eq!(
            duration.get(row, "dimension_one_axis"),
            Some(&Value::Str("total".to_string()))
        );

        let instant = &output.tables["test_table_name_001_instant"];
        assert_eq!(instant.len(), 2);
        let dimensioned = (0..instant.len())
            .find(|&i| {
                instant.get(i, "dimension_one_axis")
                    == Some(&Value::Str("Dim 1 Value".to_string()))
            })
            .unwrap();
        assert_eq!(
            instant.get(dimensioned, "column_one"),
            Some(&Value::Str("value 7".to_string()))
        );
        assert_eq!(
            instant.get(dimensioned, "dimension_two_axis"),
            Some(&Value::Str("Dimension2Value".to_string()))
        );

        // Every fact except the report date landed in a table.
        let stats = &output.stats["filing"];
        assert_eq!(stats.total_facts, 13);
        assert_eq!(stats.used_facts.len(), 12);
        let ratio = used_fact_ratio(&output.stats).unwrap();
        assert!(ratio > 0.9 && ratio < 1.0);
    }

    #[test]
    fn test_extract_is_idempotent_across_cache_reuse() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());

        let options = test_options(dir.path());
        let mut cache = TableCache::default();
        let first = extract(&options, &mut cache).unwrap();
        let second = extract(&options, &mut cache).unwrap();
        assert_eq!(first.tables, second.tables);
    }

    #[test]
    fn test_requested_tables_filter() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());

        let mut options = test_options(dir.path());
        options.requested_tables = Some(
            ["test_table_name_001_instant".to_string()]
                .into_iter()
                .collect(),
        );
        let output = extract(&options, &mut TableCache::default()).unwrap();
        assert_eq!(output.tables.len(), 1);
        assert!(output.tables.contains_key("test_table_name_001_instant"));
    }

    #[test]
    fn test_instance_pattern_filter() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());

        let mut options = test_options(dir.path());
        options.instance_pattern = Some(Regex::new("^no_such_filing$").unwrap());
        let output = extract(&options, &mut TableCache::default()).unwrap();
        assert!(output.stats.is_empty());
        assert!(output.tables.values().all(Table::is_empty));
    }

    #[test]
    fn test_unparsable_filing_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        std::fs::write(dir.path().join("filings/broken.xbrl"), "<not-xml").unwrap();

        let output = extract(&test_options(dir.path()), &mut TableCache::default()).unwrap();
        assert_eq!(output.stats.len(), 1);
        assert!(output.stats.contains_key("filing"));
    }

    #[test]
    fn test_cross_filing_merge() {
        let dir = tempfile::tempdir().unwrap();
        write_taxonomy_archive(&dir.path().join("taxonomy.zip"));
        std::fs::create_dir(dir.path().join("filings")).unwrap();

        // The amendment restates ColumnOne for cid_1 and omits ColumnTwo.
        std::fs::write(dir.path().join("filings/a_original.xbrl"), TEST_FILING).unwrap();
        let amendment = r#"<?xml version="1.0" encoding="UTF-8"?>
<xbrli:xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance" xmlns:ferc="http://ferc.gov/form/2022-01-01/ferc">
  <xbrli:context id="cid_1">
    <xbrli:entity>
      <xbrli:identifier scheme="http://www.ferc.gov/CID">EID1</xbrli:identifier>
    </xbrli:entity>
    <xbrli:period>
      <xbrli:startDate>2021-01-01</xbrli:startDate>
      <xbrli:endDate>2021-12-31</xbrli:endDate>
    </xbrli:period>
  </xbrli:context>
  <ferc:ColumnOne contextRef="cid_1">amended value</ferc:ColumnOne>
  <ferc:ReportDate contextRef="cid_1">2022-06-01</ferc:ReportDate>
</xbrli:xbrl>
"#;
        std::fs::write(dir.path().join("filings/b_amendment.xbrl"), amendment).unwrap();

        let output = extract(&test_options(dir.path()), &mut TableCache::default()).unwrap();
        let duration = &output.tables["test_table_name_001_duration"];

        // The 2021 row collapses across the two filings.
        assert_eq!(duration.len(), 3);
        let row = (0..duration.len())
            .find(|&i| {
                duration.get(i, "start_date") == Some(&Value::Str("2021-01-01".to_string()))
                    && duration.get(i, "dimension_one_axis")
                        == Some(&Value::Str("total".to_string()))
            })
            .unwrap();
        assert_eq!(
            duration.get(row, "column_one"),
            Some(&Value::Str("amended value".to_string()))
        );
        // ColumnTwo forward-fills from the original filing.
        assert_eq!(
            duration.get(row, "column_two"),
            Some(&Value::Str("value 2".to_string()))
        );
        assert_eq!(
            duration.get(row, "filing_name"),
            Some(&Value::Str("b_amendment".to_string()))
        );
    }
}

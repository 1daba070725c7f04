//! Parse a single XBRL instance document into typed fact and context
//! collections.

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::helpers::{snake_case, strip_prefix};
use crate::taxonomy::PeriodType;
use crate::{Error, Result};

/// Namespace prefix identifying facts in FERC filings.
pub const DEFAULT_FACT_PREFIX: &str = "ferc";

/// File suffixes recognized as XBRL filings.
const ALLOWABLE_SUFFIXES: &[&str] = &["xbrl"];

/// An XBRL period: instantaneous periods carry only `end_date`, duration
/// periods carry both dates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub instant: bool,
    pub start_date: Option<String>,
    pub end_date: String,
}

/// Explicit dimensions enumerate their values in the taxonomy; typed
/// dimensions carry dynamic values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionType {
    Explicit,
    Typed,
}

/// One dimension qualifying a context. Axes become columns and part of the
/// primary key of the tables they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Axis {
    /// Dimension name with its namespace prefix stripped.
    pub name: String,
    pub value: String,
    pub dimension_type: DimensionType,
}

/// The entity a context refers to, along with any dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub identifier: String,
    pub dimensions: Vec<Axis>,
}

impl Entity {
    /// Check whether every dimension is declared in the table's primary
    /// key. A context missing an axis is a total across that axis, but one
    /// with an extra axis belongs to a different table.
    pub fn check_dimensions(&self, primary_key: &[String]) -> bool {
        self.dimensions
            .iter()
            .all(|dim| primary_key.iter().any(|key| *key == snake_case(&dim.name)))
    }
}

/// The (entity, period, dimension-set) key identifying what a fact is
/// about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    pub c_id: String,
    pub entity: Entity,
    pub period: Period,
}

impl Context {
    pub fn check_dimensions(&self, primary_key: &[String]) -> bool {
        self.entity.check_dimensions(primary_key)
    }

    /// Render the context as the composite primary key of an output row.
    ///
    /// Axes the table declares but this context omits get the sentinel
    /// value `"total"`, meaning aggregated across that dimension.
    pub fn as_primary_key(&self, filing_name: &str, axes: &[String]) -> BTreeMap<String, String> {
        let mut key = BTreeMap::new();
        key.insert("entity_id".to_string(), self.entity.identifier.clone());
        key.insert("filing_name".to_string(), filing_name.to_string());

        if self.period.instant {
            key.insert("date".to_string(), self.period.end_date.clone());
        } else {
            key.insert(
                "start_date".to_string(),
                self.period.start_date.clone().unwrap_or_default(),
            );
            key.insert("end_date".to_string(), self.period.end_date.clone());
        }

        for dim in &self.entity.dimensions {
            key.insert(snake_case(&dim.name), dim.value.clone());
        }
        for axis in axes {
            key.entry(axis.clone()).or_insert_with(|| "total".to_string());
        }
        key
    }
}

/// One reported value tied to one context and one concept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    /// Concept name in snake_case.
    pub name: String,
    pub c_id: String,
    pub value: String,
}

impl Fact {
    /// Unique identifier for the fact. Some facts lack an `id` attribute,
    /// so the (context id, concept name) pair is used instead; it is
    /// assumed unique within one instance.
    pub fn f_id(&self) -> String {
        format!("{}:{}", self.c_id, self.name)
    }
}

/// Ordered list of duration concepts to try when deriving an instance's
/// report date. The certifying-official fallback is a FERC Form 714
/// workaround; filings with neither fact are a data-quality anomaly, not an
/// error.
#[derive(Debug, Clone)]
pub struct ReportDatePolicy {
    pub candidates: Vec<String>,
}

impl Default for ReportDatePolicy {
    fn default() -> Self {
        Self {
            candidates: vec![
                "report_date".to_string(),
                "certifying_official_date".to_string(),
            ],
        }
    }
}

/// One parsed filing: contexts keyed by id and facts bucketed by concept
/// name, split by period kind for fast lookup.
#[derive(Debug, Clone)]
pub struct Instance {
    pub contexts: AHashMap<String, Context>,
    pub instant_facts: AHashMap<String, Vec<Fact>>,
    pub duration_facts: AHashMap<String, Vec<Fact>>,
    pub filing_name: String,
    pub publication_time: DateTime<Utc>,
    pub report_date: Option<NaiveDate>,
    /// Number of distinct fact ids parsed, for coverage auditing.
    pub total_facts: usize,
    used_fact_ids: AHashSet<String>,
}

impl Instance {
    pub fn new(
        contexts: AHashMap<String, Context>,
        instant_facts: AHashMap<String, Vec<Fact>>,
        duration_facts: AHashMap<String, Vec<Fact>>,
        filing_name: String,
        publication_time: DateTime<Utc>,
        policy: &ReportDatePolicy,
    ) -> Instance {
        let mut fact_id_counts: AHashMap<String, usize> = AHashMap::new();
        for fact in instant_facts
            .values()
            .chain(duration_facts.values())
            .flatten()
        {
            *fact_id_counts.entry(fact.f_id()).or_insert(0) += 1;
        }
        let total_facts = fact_id_counts.len();

        // Duplicate ids arise from real-world filer errors; tolerate them.
        let duplicated: Vec<&String> = fact_id_counts
            .iter()
            .filter(|(_, &count)| count >= 2)
            .map(|(f_id, _)| f_id)
            .collect();
        if !duplicated.is_empty() {
            debug!("Duplicated facts in {filing_name}: {duplicated:?}");
        }

        let report_date = policy.candidates.iter().find_map(|candidate| {
            duration_facts
                .get(candidate)
                .and_then(|facts| facts.first())
                .and_then(|fact| fact.value.parse::<NaiveDate>().ok())
        });
        if report_date.is_none() {
            warn!("no report date fact found in {filing_name}");
        }

        Instance {
            contexts,
            instant_facts,
            duration_facts,
            filing_name,
            publication_time,
            report_date,
            total_facts,
            used_fact_ids: AHashSet::new(),
        }
    }

    /// Select the facts for the named concepts whose context dimensions
    /// are a subset of the given primary key, and mark them used.
    pub fn get_facts(
        &mut self,
        period_type: PeriodType,
        concept_names: &[String],
        primary_key: &[String],
    ) -> Vec<Fact> {
        let bucket = match period_type {
            PeriodType::Instant => &self.instant_facts,
            PeriodType::Duration => &self.duration_facts,
        };

        let mut selected = Vec::new();
        for name in concept_names {
            let Some(facts) = bucket.get(name) else {
                continue;
            };
            for fact in facts {
                let Some(context) = self.contexts.get(&fact.c_id) else {
                    continue;
                };
                if context.check_dimensions(primary_key) {
                    selected.push(fact.clone());
                }
            }
        }

        self.used_fact_ids
            .extend(selected.iter().map(|fact| fact.f_id()));
        selected
    }

    pub fn context(&self, c_id: &str) -> Option<&Context> {
        self.contexts.get(c_id)
    }

    pub fn used_fact_ids(&self) -> &AHashSet<String> {
        &self.used_fact_ids
    }
}

/// Source of one filing: a path on disk or an in-memory buffer (e.g. read
/// out of a zip archive).
#[derive(Debug, Clone)]
enum FilingSource {
    Path(PathBuf),
    Memory(Vec<u8>),
}

/// Lazily parseable handle on one filing.
#[derive(Debug, Clone)]
pub struct InstanceBuilder {
    source: FilingSource,
    pub name: String,
    pub publication_time: DateTime<Utc>,
}

impl InstanceBuilder {
    pub fn from_path(path: &Path, publication_time: DateTime<Utc>) -> InstanceBuilder {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        InstanceBuilder {
            source: FilingSource::Path(path.to_path_buf()),
            name,
            publication_time,
        }
    }

    pub fn from_bytes(
        data: Vec<u8>,
        name: &str,
        publication_time: DateTime<Utc>,
    ) -> InstanceBuilder {
        InstanceBuilder {
            source: FilingSource::Memory(data),
            name: name.to_string(),
            publication_time,
        }
    }

    /// Parse with the default fact prefix and report-date policy.
    pub fn parse(&self) -> Result<Instance> {
        self.parse_with(DEFAULT_FACT_PREFIX, &ReportDatePolicy::default())
    }

    /// Parse the filing into an `Instance`.
    ///
    /// XML-level failures are reported as `Error::EmptyInstance` so batch
    /// callers can skip the filing; structural problems (facts referencing
    /// unknown contexts, contexts without periods) stay fatal.
    pub fn parse_with(&self, fact_prefix: &str, policy: &ReportDatePolicy) -> Result<Instance> {
        let data = match &self.source {
            FilingSource::Path(path) => std::fs::read(path)?,
            FilingSource::Memory(data) => data.clone(),
        };
        parse_bytes(&data, &self.name, self.publication_time, fact_prefix, policy).map_err(
            |err| match err {
                Error::Xml(e) => Error::EmptyInstance(format!("{}: {e}", self.name)),
                other => other,
            },
        )
    }
}

fn attr_value(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes().with_checks(false) {
        let attr = attr.map_err(|e| Error::Parse(format!("malformed attribute: {e}")))?;
        if attr.key.as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|e| Error::Parse(format!("malformed attribute value: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn parse_bytes(
    data: &[u8],
    name: &str,
    publication_time: DateTime<Utc>,
    fact_prefix: &str,
    policy: &ReportDatePolicy,
) -> Result<Instance> {
    // Skip BOM if present
    let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(data);

    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut contexts: AHashMap<String, Context> = AHashMap::new();
    let mut raw_facts: Vec<Fact> = Vec::new();
    let mut saw_element = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                saw_element = true;
                if e.local_name().as_ref() == b"context" {
                    let c_id = attr_value(&e, b"id")?
                        .ok_or_else(|| Error::Parse("context missing id".to_string()))?;
                    let context = parse_context(&mut reader, c_id)?;
                    contexts.insert(context.c_id.clone(), context);
                } else if has_prefix(&e, fact_prefix) {
                    let concept = snake_case(&String::from_utf8_lossy(e.local_name().as_ref()));
                    let c_id = attr_value(&e, b"contextRef")?.ok_or_else(|| {
                        Error::Parse(format!("fact {concept} missing contextRef"))
                    })?;
                    let value = reader.read_text(e.name())?;
                    let value = value.trim();
                    // Facts with no text represent nil values; skip them.
                    if !value.is_empty() {
                        raw_facts.push(Fact {
                            name: concept,
                            c_id,
                            value: value.to_string(),
                        });
                    }
                }
            }
            Event::Empty(_) => saw_element = true,
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_element {
        return Err(Error::EmptyInstance(name.to_string()));
    }

    // Bucket non-nil facts by the period kind of their context.
    let mut instant_facts: AHashMap<String, Vec<Fact>> = AHashMap::new();
    let mut duration_facts: AHashMap<String, Vec<Fact>> = AHashMap::new();
    for fact in raw_facts {
        let context = contexts.get(&fact.c_id).ok_or_else(|| {
            Error::Parse(format!(
                "fact {} references unknown context {}",
                fact.name, fact.c_id
            ))
        })?;
        let bucket = if context.period.instant {
            &mut instant_facts
        } else {
            &mut duration_facts
        };
        bucket.entry(fact.name.clone()).or_default().push(fact);
    }

    Ok(Instance::new(
        contexts,
        instant_facts,
        duration_facts,
        name.to_string(),
        publication_time,
        policy,
    ))
}

fn has_prefix(element: &BytesStart<'_>, prefix: &str) -> bool {
    element
        .name()
        .prefix()
        .is_some_and(|p| p.as_ref() == prefix.as_bytes())
}

/// Element whose text is currently being collected inside a context.
#[derive(Clone, Copy)]
enum TextTarget {
    Identifier,
    Instant,
    StartDate,
    EndDate,
}

fn parse_context(reader: &mut Reader<&[u8]>, c_id: String) -> Result<Context> {
    let mut identifier = String::new();
    let mut dimensions: Vec<Axis> = Vec::new();
    let mut instant: Option<String> = None;
    let mut start_date: Option<String> = None;
    let mut end_date: Option<String> = None;
    let mut target: Option<TextTarget> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"identifier" => target = Some(TextTarget::Identifier),
                b"instant" => target = Some(TextTarget::Instant),
                b"startDate" => target = Some(TextTarget::StartDate),
                b"endDate" => target = Some(TextTarget::EndDate),
                b"explicitMember" => {
                    let name = dimension_name(&e, &c_id)?;
                    let raw = reader.read_text(e.name())?;
                    dimensions.push(Axis {
                        name,
                        value: strip_prefix(raw.trim()).to_string(),
                        dimension_type: DimensionType::Explicit,
                    });
                }
                b"typedMember" => {
                    let name = dimension_name(&e, &c_id)?;
                    let value = read_typed_member(reader)?;
                    dimensions.push(Axis {
                        name,
                        value,
                        dimension_type: DimensionType::Typed,
                    });
                }
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"explicitMember" {
                    let name = dimension_name(&e, &c_id)?;
                    dimensions.push(Axis {
                        name,
                        value: String::new(),
                        dimension_type: DimensionType::Explicit,
                    });
                }
            }
            Event::Text(t) => {
                if let Some(current) = target {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Parse(format!("malformed text: {e}")))?
                        .trim()
                        .to_string();
                    match current {
                        TextTarget::Identifier => identifier = text,
                        TextTarget::Instant => instant = Some(text),
                        TextTarget::StartDate => start_date = Some(text),
                        TextTarget::EndDate => end_date = Some(text),
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"context" => break,
                b"identifier" | b"instant" | b"startDate" | b"endDate" => target = None,
                _ => {}
            },
            Event::Eof => {
                return Err(Error::Parse(format!(
                    "unexpected end of document inside context {c_id}"
                )))
            }
            _ => {}
        }
    }

    if identifier.is_empty() {
        return Err(Error::Parse(format!(
            "context {c_id} missing entity identifier"
        )));
    }

    let period = match (instant, start_date, end_date) {
        (Some(date), _, _) => Period {
            instant: true,
            start_date: None,
            end_date: date,
        },
        (None, Some(start), Some(end)) => Period {
            instant: false,
            start_date: Some(start),
            end_date: end,
        },
        _ => return Err(Error::Parse(format!("context {c_id} missing period"))),
    };

    Ok(Context {
        c_id,
        entity: Entity {
            identifier,
            dimensions,
        },
        period,
    })
}

fn dimension_name(element: &BytesStart<'_>, c_id: &str) -> Result<String> {
    let raw = attr_value(element, b"dimension")?.ok_or_else(|| {
        Error::Parse(format!("dimension member in context {c_id} missing name"))
    })?;
    Ok(strip_prefix(&raw).to_string())
}

/// The value of a typed dimension is the text of its single child element.
fn read_typed_member(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut value = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(t) => {
                value = t
                    .unescape()
                    .map_err(|e| Error::Parse(format!("malformed text: {e}")))?
                    .trim()
                    .to_string();
            }
            Event::End(e) if e.local_name().as_ref() == b"typedMember" => break,
            Event::Eof => {
                return Err(Error::Parse(
                    "unexpected end of document inside typedMember".to_string(),
                ))
            }
            _ => {}
        }
    }
    Ok(value)
}

/// Discover filings at a path: a single file, a directory of filings, or a
/// zip archive.
pub fn get_instances(path: &Path) -> Result<Vec<InstanceBuilder>> {
    if !path.exists() {
        return Err(Error::NotFound(format!(
            "Could not find XBRL instances at {}",
            path.display()
        )));
    }

    if path.extension().is_some_and(|ext| ext == "zip") {
        return instances_from_zip(path);
    }

    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .collect();
        entries.sort();
        entries
    };

    let mut builders = Vec::new();
    for file in files {
        if !has_allowable_suffix(&file) {
            continue;
        }
        builders.push(InstanceBuilder::from_path(&file, file_mtime(&file)?));
    }
    Ok(builders)
}

fn has_allowable_suffix(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ALLOWABLE_SUFFIXES.iter().any(|ok| ext == *ok))
}

fn file_mtime(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Read filings from a zip archive.
///
/// The archive may carry an `rssfeed` manifest: a JSON object mapping
/// filing file name to its publication timestamp. Entries without a
/// manifest record fall back to the archive's modification time.
fn instances_from_zip(path: &Path) -> Result<Vec<InstanceBuilder>> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let fallback_time = file_mtime(path)?;

    let publication_times = read_manifest(&mut archive)?;

    let mut builders = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_name = entry.name().to_string();
        if !has_allowable_suffix(Path::new(&entry_name)) {
            continue;
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        let stem = Path::new(&entry_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry_name.clone());
        let publication_time = publication_times
            .get(&entry_name)
            .copied()
            .unwrap_or(fallback_time);
        builders.push(InstanceBuilder::from_bytes(data, &stem, publication_time));
    }
    builders.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(builders)
}

fn read_manifest<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<AHashMap<String, DateTime<Utc>>> {
    let raw: AHashMap<String, String> = match archive.by_name("rssfeed") {
        Ok(entry) => serde_json::from_reader(entry)?,
        Err(zip::result::ZipError::FileNotFound) => return Ok(AHashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut times = AHashMap::new();
    for (filename, stamp) in raw {
        let Some(time) = parse_publication_time(&stamp) else {
            warn!("unparseable publication time {stamp:?} for {filename}");
            continue;
        };
        times.insert(filename, time);
    }
    Ok(times)
}

fn parse_publication_time(stamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stamp)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .ok()
        })
}

//! Write extracted tables out as CSV files.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::table::Table;
use crate::Result;

/// Whether an existing output file is replaced or extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    Append,
}

/// Destination for extracted tables.
pub trait TableSink {
    fn write_table(&mut self, name: &str, table: &Table, mode: WriteMode) -> Result<()>;
}

/// Writes each table to `<dir>/<name>.csv`.
#[derive(Debug)]
pub struct CsvDirSink {
    dir: PathBuf,
}

impl CsvDirSink {
    pub fn new(dir: &Path) -> Result<CsvDirSink> {
        std::fs::create_dir_all(dir)?;
        Ok(CsvDirSink {
            dir: dir.to_path_buf(),
        })
    }
}

impl TableSink for CsvDirSink {
    fn write_table(&mut self, name: &str, table: &Table, mode: WriteMode) -> Result<()> {
        let path = self.dir.join(format!("{name}.csv"));
        let append = mode == WriteMode::Append && path.exists();

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;
        let mut writer = csv::Writer::from_writer(file);

        if !append {
            writer.write_record(table.columns())?;
        }
        for row in table.rows() {
            writer.write_record(row.iter().map(|value| value.render()))?;
        }
        writer.flush()?;

        debug!("Wrote {} rows to {}", table.len(), path.display());
        Ok(())
    }
}

/// Mirrors every table to two sinks.
pub struct TeeSink<A, B> {
    first: A,
    second: B,
}

impl<A: TableSink, B: TableSink> TeeSink<A, B> {
    pub fn new(first: A, second: B) -> TeeSink<A, B> {
        TeeSink { first, second }
    }
}

impl<A: TableSink, B: TableSink> TableSink for TeeSink<A, B> {
    fn write_table(&mut self, name: &str, table: &Table, mode: WriteMode) -> Result<()> {
        self.first.write_table(name, table, mode)?;
        self.second.write_table(name, table, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Value;
    use pretty_assertions::assert_eq;

    fn sample_table() -> Table {
        let mut table = Table::new(
            vec!["entity_id".to_string(), "revenue".to_string()],
            vec!["entity_id".to_string()],
        );
        table.push_row(vec![Value::Str("EID1".to_string()), Value::Number(1.5)]);
        table.push_row(vec![Value::Str("EID2".to_string()), Value::Null]);
        table
    }

    #[test]
    fn test_replace_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvDirSink::new(dir.path()).unwrap();
        let table = sample_table();

        sink.write_table("revenues", &table, WriteMode::Replace).unwrap();
        sink.write_table("revenues", &table, WriteMode::Append).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("revenues.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        // One header plus two rows per write.
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "entity_id,revenue");
        assert_eq!(lines[1], "EID1,1.5");
        assert_eq!(lines[2], "EID2,");

        // Replace discards previous contents.
        sink.write_table("revenues", &table, WriteMode::Replace).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("revenues.csv")).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn test_append_to_fresh_file_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvDirSink::new(dir.path()).unwrap();
        sink.write_table("fresh", &sample_table(), WriteMode::Append).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("fresh.csv")).unwrap();
        assert_eq!(contents.lines().next(), Some("entity_id,revenue"));
    }

    #[test]
    fn test_tee_writes_both_directories() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary");
        let mirror = dir.path().join("mirror");
        let mut sink = TeeSink::new(
            CsvDirSink::new(&primary).unwrap(),
            CsvDirSink::new(&mirror).unwrap(),
        );
        sink.write_table("revenues", &sample_table(), WriteMode::Replace).unwrap();

        let first = std::fs::read_to_string(primary.join("revenues.csv")).unwrap();
        let second = std::fs::read_to_string(mirror.join("revenues.csv")).unwrap();
        assert_eq!(first, second);
    }
}

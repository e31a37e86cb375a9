// CSV ledger storage
// File-backed implementation of the LedgerStore contract. Each ledger is a
// pair of CSV files under the organization's directory:
//   <entity>_resources_info.csv      -- single-row metadata
//   <entity>_resources_expended.csv  -- append-only allocation records
// Rewrites land through a temp file plus rename, so a torn write can never
// be observed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::contracts::LedgerStore;

/// Prefix of info columns that map a ledger column to a dotted request
/// path.
pub const HEADER_PREFIX: &str = "header::";

/// An in-memory table: a header row plus string cells. Everything a ledger
/// stores is a string; numeric columns are parsed where they are used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        for row in &rows {
            ensure!(
                row.len() == headers.len(),
                "row width {} does not match {} columns",
                row.len(),
                headers.len()
            );
        }
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<String>) -> Result<()> {
        ensure!(
            row.len() == self.headers.len(),
            "row width {} does not match {} columns",
            row.len(),
            self.headers.len()
        );
        self.rows.push(row);
        Ok(())
    }

    /// Cell of the first row, by column name. The info table is single-row,
    /// so this is its entire read surface.
    pub fn first_row_cell(&self, column: &str) -> Option<&str> {
        let index = self.headers.iter().position(|h| h == column)?;
        self.rows.first().and_then(|row| row.get(index)).map(String::as_str)
    }

    /// All cells of a column, in row order.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let index = self.headers.iter().position(|h| h == name)?;
        Some(
            self.rows
                .iter()
                .filter_map(|row| row.get(index))
                .map(String::as_str)
                .collect(),
        )
    }

    /// Columnar JSON snapshot: `{column: [values...]}`.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (index, header) in self.headers.iter().enumerate() {
            let cells: Vec<Value> = self
                .rows
                .iter()
                .filter_map(|row| row.get(index))
                .map(|cell| json!(cell))
                .collect();
            map.insert(header.clone(), Value::Array(cells));
        }
        Value::Object(map)
    }
}

/// CSV-file ledger store rooted at the broker's data directory.
pub struct CsvLedgerStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CsvLedgerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything an organization owns.
    pub fn org_dir(&self, org: &str) -> PathBuf {
        self.root.join(format!("organization_{org}"))
    }

    fn info_path(&self, org: &str, entity: &str) -> PathBuf {
        self.org_dir(org).join(format!("{entity}_resources_info.csv"))
    }

    fn expended_path(&self, org: &str, entity: &str) -> PathBuf {
        self.org_dir(org)
            .join(format!("{entity}_resources_expended.csv"))
    }

    async fn read_table(path: &Path) -> Result<Table> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read ledger table {}", path.display()))?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes.as_slice());
        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("ledger table {} has no header row", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.with_context(|| format!("bad record in {}", path.display()))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Table { headers, rows })
    }

    /// Serialize and land the table via temp file + rename.
    async fn write_table(path: &Path, table: &Table) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        writer.write_record(table.headers())?;
        for row in table.rows() {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("failed to serialize ledger table: {err}"))?;

        let tmp = path.with_extension("csv.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to stage ledger table {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to land ledger table {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for CsvLedgerStore {
    async fn read_info(&self, org: &str, entity: &str) -> Result<Table> {
        Self::read_table(&self.info_path(org, entity)).await
    }

    async fn read_expended(&self, org: &str, entity: &str) -> Result<Table> {
        Self::read_table(&self.expended_path(org, entity)).await
    }

    async fn append_expended(
        &self,
        org: &str,
        entity: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<()> {
        let path = self.expended_path(org, entity);
        let mut table = Self::read_table(&path).await?;
        for row in rows {
            table.push_row(row)?;
        }
        Self::write_table(&path, &table).await?;
        debug!(org, entity, rows = table.len(), "ledger appended");
        Ok(())
    }

    async fn create_ledger(
        &self,
        org: &str,
        entity: &str,
        info: Table,
        expended_headers: Vec<String>,
    ) -> Result<()> {
        ensure!(info.len() == 1, "info table must have exactly one row");
        Self::write_table(&self.info_path(org, entity), &info).await?;
        Self::write_table(
            &self.expended_path(org, entity),
            &Table::new(expended_headers),
        )
        .await?;
        debug!(org, entity, "ledger created");
        Ok(())
    }

    async fn lock(&self, org: &str, entity: &str) -> OwnedMutexGuard<()> {
        let key = format!("{org}/{entity}");
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CsvLedgerStore {
        let store = CsvLedgerStore::new(dir.path());
        std::fs::create_dir_all(store.org_dir("uofc")).unwrap();
        store
    }

    fn ticket_info() -> Table {
        Table::with_rows(
            vec!["available".into(), "header::quantity".into()],
            vec![vec!["2".into(), "quantity".into()]],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_read_ledger() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .create_ledger("uofc", "eventa", ticket_info(), vec!["quantity".into()])
            .await
            .unwrap();

        let info = store.read_info("uofc", "eventa").await.unwrap();
        assert_eq!(info.first_row_cell("available"), Some("2"));
        assert_eq!(info.first_row_cell("header::quantity"), Some("quantity"));

        let expended = store.read_expended("uofc", "eventa").await.unwrap();
        assert!(expended.is_empty());
        assert_eq!(expended.headers(), ["quantity".to_string()]);
    }

    #[tokio::test]
    async fn test_append_preserves_existing_rows() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .create_ledger("uofc", "eventa", ticket_info(), vec!["quantity".into()])
            .await
            .unwrap();

        store
            .append_expended("uofc", "eventa", vec![vec!["1".into()]])
            .await
            .unwrap();
        store
            .append_expended("uofc", "eventa", vec![vec!["1".into()], vec!["1".into()]])
            .await
            .unwrap();

        let expended = store.read_expended("uofc", "eventa").await.unwrap();
        assert_eq!(expended.len(), 3);
    }

    #[tokio::test]
    async fn test_append_rejects_wrong_width() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .create_ledger("uofc", "eventa", ticket_info(), vec!["quantity".into()])
            .await
            .unwrap();
        let result = store
            .append_expended("uofc", "eventa", vec![vec!["1".into(), "extra".into()]])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_missing_ledger_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.read_info("uofc", "ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_lock_serializes_per_ledger() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let guard = store.lock("uofc", "eventa").await;
        // A different ledger locks independently.
        let _other = store.lock("uofc", "eventb").await;
        drop(guard);
        let _again = store.lock("uofc", "eventa").await;
    }

    #[test]
    fn test_table_to_json_is_columnar() {
        let table = Table::with_rows(
            vec!["a".into(), "b".into()],
            vec![
                vec!["1".into(), "2".into()],
                vec!["3".into(), "4".into()],
            ],
        )
        .unwrap();
        assert_eq!(
            table.to_json(),
            json!({"a": ["1", "3"], "b": ["2", "4"]})
        );
    }

    #[test]
    fn test_table_column_access() {
        let table = Table::with_rows(
            vec!["start_time".into(), "end_time".into()],
            vec![vec!["s1".into(), "e1".into()], vec!["s2".into(), "e2".into()]],
        )
        .unwrap();
        assert_eq!(table.column("start_time").unwrap(), vec!["s1", "s2"]);
        assert!(table.column("missing").is_none());
    }
}

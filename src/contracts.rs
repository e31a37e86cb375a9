// Storage contract
// The ledger behind a Ticketed or Slotted entity is any store that can
// fetch one-row metadata, scan the expended table, and append atomically.
// CSV files implement it today; the allocation engine only sees this trait.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::ledger::Table;

/// Tabular persistence for per-(org, entity) ledgers.
///
/// Every implementation must guarantee that a reader never observes a
/// partially written table, and must hand out one exclusive lock per
/// `(org, entity)` pair so a writer can span a read-check-write triple.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fetch the single-row metadata table of a ledger.
    ///
    /// # Preconditions
    /// - The ledger was created for this `(org, entity)` pair
    ///
    /// # Postconditions
    /// - Returns the info table with exactly the columns it was created with
    /// - Does not modify any state
    async fn read_info(&self, org: &str, entity: &str) -> Result<Table>;

    /// Scan the append-only table of allocated records.
    ///
    /// # Postconditions
    /// - Returns a consistent snapshot: every row of some past state
    /// - Does not modify any state
    async fn read_expended(&self, org: &str, entity: &str) -> Result<Table>;

    /// Append rows to the expended table.
    ///
    /// # Preconditions
    /// - Caller holds the ledger lock for this `(org, entity)` pair
    /// - Every row matches the expended table's column count
    ///
    /// # Postconditions
    /// - All rows are appended, or none are (a crashed append leaves the
    ///   previous table intact)
    /// - Row order is preserved
    async fn append_expended(
        &self,
        org: &str,
        entity: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<()>;

    /// Create the info table and an empty expended table for a new ledger.
    ///
    /// # Preconditions
    /// - The organization directory exists
    /// - `info` has exactly one row
    ///
    /// # Postconditions
    /// - Both tables exist on storage; the expended table has the given
    ///   headers and zero rows
    async fn create_ledger(
        &self,
        org: &str,
        entity: &str,
        info: Table,
        expended_headers: Vec<String>,
    ) -> Result<()>;

    /// Take the exclusive lock for a ledger. Held across the whole
    /// read-check-write triple of an allocation; read-only queries do not
    /// take it.
    async fn lock(&self, org: &str, entity: &str) -> OwnedMutexGuard<()>;
}

// Allocation engine
// Leaf entities delegate here. Tickets are counted against a capacity;
// timeslots are checked for interval overlap under the ledger's strict
// flag. Both paths hold the per-ledger lock across their read-check-write
// triple, and both resolve the ledger's `header::` mapping against the
// request data before touching capacity.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::contracts::LedgerStore;
use crate::errors::{BrokerError, BrokerResult};
use crate::ledger::{Table, HEADER_PREFIX};
use crate::path_utils::{all_keys, lookup};
use crate::policy::eval::coerce;
use crate::types::IsoTimestamp;

/// Columns the slot path owns; they are filled from the resolved
/// timestamps, never from the collect mapping.
const START_COLUMN: &str = "start_time";
const END_COLUMN: &str = "end_time";

/// Resolve the `header::<col>` mapping from the info table and require
/// every mapped dotted path to resolve in the request data.
fn resolve_header_map(info: &Table, data: &Value) -> BrokerResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for header in info.headers() {
        if let Some(column) = header.strip_prefix(HEADER_PREFIX) {
            let path = info.first_row_cell(header).ok_or_else(|| {
                BrokerError::DatabaseWrite(format!("ledger info has no value for {header}"))
            })?;
            map.insert(column.to_string(), path.to_string());
        }
    }

    let missing: Vec<&String> = map
        .values()
        .filter(|path| lookup(data, path).is_err())
        .collect();
    if !missing.is_empty() {
        let expected: Vec<&String> = map.values().collect();
        let available = all_keys(data, None);
        return Err(BrokerError::DatabaseWrite(format!(
            "tracking {expected:?} but provided {available:?}: missing {missing:?}"
        )));
    }
    Ok(map)
}

/// Build one expended row in the table's column order from the mapping.
fn mapped_row(
    expended: &Table,
    header_map: &BTreeMap<String, String>,
    data: &Value,
    explicit: &BTreeMap<&str, &str>,
) -> BrokerResult<Vec<String>> {
    let mut row = Vec::with_capacity(expended.headers().len());
    for column in expended.headers() {
        if let Some(value) = explicit.get(column.as_str()) {
            row.push(value.to_string());
            continue;
        }
        let path = header_map.get(column).ok_or_else(|| {
            BrokerError::DatabaseWrite(format!(
                "expended column {column:?} has no header mapping"
            ))
        })?;
        let value = lookup(data, path)
            .map_err(|err| BrokerError::DatabaseWrite(err.to_string()))?;
        row.push(coerce(value));
    }
    Ok(row)
}

fn store_err(err: anyhow::Error) -> BrokerError {
    BrokerError::DatabaseWrite(err.to_string())
}

/// Register `quantity` tickets against a ticketed ledger.
pub async fn register_tickets(
    store: &dyn LedgerStore,
    org: &str,
    entity: &str,
    data: &Value,
) -> BrokerResult<Value> {
    let _guard = store.lock(org, entity).await;

    let info = store.read_info(org, entity).await.map_err(store_err)?;
    let header_map = resolve_header_map(&info, data)?;
    let expended = store.read_expended(org, entity).await.map_err(store_err)?;

    let available: i64 = info
        .first_row_cell("available")
        .and_then(|cell| cell.parse().ok())
        .ok_or_else(|| {
            BrokerError::DatabaseWrite("ticketed ledger info has no available count".into())
        })?;
    let remaining = available - expended.len() as i64;

    let quantity_path = header_map.get("quantity").ok_or_else(|| {
        BrokerError::DatabaseWrite("ticketed ledger does not track a quantity column".into())
    })?;
    let quantity = lookup(data, quantity_path)
        .ok()
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            BrokerError::InvalidRequest("requested quantity must be an integer".into())
        })?;

    if quantity <= 0 {
        return Err(BrokerError::InvalidRequest(
            "you must request a positive number of tickets".into(),
        ));
    }
    if quantity > remaining {
        return Err(BrokerError::NoTicketsAvailable(format!(
            "requested {quantity} tickets but only {remaining} are available"
        )));
    }

    let row = mapped_row(&expended, &header_map, data, &BTreeMap::new())?;
    let rows = vec![row; quantity as usize];
    store
        .append_expended(org, entity, rows)
        .await
        .map_err(store_err)?;

    info!(org, entity, quantity, "tickets allocated");
    Ok(json!({ "result": "ok" }))
}

/// Does `[start, end)` conflict with an existing `[row_start, row_end)`
/// under lexicographic order?
pub(crate) fn overlaps(start: &str, end: &str, row_start: &str, row_end: &str) -> bool {
    (row_start <= start && start <= row_end)
        || (row_start <= end && end <= row_end)
        || (start <= row_start && row_end <= end)
}

/// Register a timeslot against a slotted ledger.
pub async fn register_timeslot(
    store: &dyn LedgerStore,
    org: &str,
    entity: &str,
    data: &Value,
) -> BrokerResult<Value> {
    let _guard = store.lock(org, entity).await;

    let info = store.read_info(org, entity).await.map_err(store_err)?;
    let header_map = resolve_header_map(&info, data)?;

    let start_key = info.first_row_cell("start_key").ok_or_else(|| {
        BrokerError::DatabaseWrite("slotted ledger info has no start_key".into())
    })?;
    let end_key = info.first_row_cell("end_key").ok_or_else(|| {
        BrokerError::DatabaseWrite("slotted ledger info has no end_key".into())
    })?;

    let start = lookup(data, start_key).map(coerce).map_err(|_| {
        BrokerError::DatabaseWrite(
            "keyword argument for start time or end time is missing".into(),
        )
    })?;
    let end = lookup(data, end_key).map(coerce).map_err(|_| {
        BrokerError::DatabaseWrite(
            "keyword argument for start time or end time is missing".into(),
        )
    })?;

    let start = IsoTimestamp::new(start).map_err(|_| {
        BrokerError::InvalidTimeslot("timestamps must be in ISO 8601 format".into())
    })?;
    let end = IsoTimestamp::new(end).map_err(|_| {
        BrokerError::InvalidTimeslot("timestamps must be in ISO 8601 format".into())
    })?;
    if start >= end {
        return Err(BrokerError::InvalidTimeslot(format!(
            "start time {start} is not before end time {end}"
        )));
    }

    let strict = info
        .first_row_cell("strict")
        .is_some_and(|cell| cell != "0" && !cell.is_empty());
    let expended = store.read_expended(org, entity).await.map_err(store_err)?;

    if strict {
        let starts = expended.column(START_COLUMN).unwrap_or_default();
        let ends = expended.column(END_COLUMN).unwrap_or_default();
        let conflicts = starts
            .iter()
            .zip(ends.iter())
            .filter(|(row_start, row_end)| {
                overlaps(start.as_str(), end.as_str(), row_start, row_end)
            })
            .count();
        if conflicts > 0 {
            return Err(BrokerError::OverlappingTimeslot(format!(
                "requested slot overlaps with {conflicts} existing timeslots"
            )));
        }
    }

    let explicit = BTreeMap::from([
        (START_COLUMN, start.as_str()),
        (END_COLUMN, end.as_str()),
    ]);
    let row = mapped_row(&expended, &header_map, data, &explicit)?;
    store
        .append_expended(org, entity, vec![row])
        .await
        .map_err(store_err)?;

    debug!(org, entity, %start, %end, "timeslot allocated");
    Ok(json!({ "result": "ok" }))
}

// Integration tests for the allocation engine over a real CSV ledger
// store: capacity enforcement, interval exclusion, and the ledger
// invariants that must hold after every successful allocation.
use reserva::allocation::{register_tickets, register_timeslot};
use reserva::contracts::LedgerStore;
use reserva::errors::BrokerError;
use reserva::ledger::{CsvLedgerStore, Table};
use serde_json::json;
use tempfile::TempDir;

fn store(dir: &TempDir) -> CsvLedgerStore {
    let store = CsvLedgerStore::new(dir.path());
    std::fs::create_dir_all(store.org_dir("uofc")).unwrap();
    store
}

async fn create_ticket_ledger(store: &CsvLedgerStore, available: i64) {
    let info = Table::with_rows(
        vec![
            "available".into(),
            "header::quantity".into(),
            "header::user_id".into(),
        ],
        vec![vec![available.to_string(), "quantity".into(), "user.id".into()]],
    )
    .unwrap();
    store
        .create_ledger(
            "uofc",
            "eventa",
            info,
            vec!["quantity".into(), "user_id".into()],
        )
        .await
        .unwrap();
}

async fn create_slot_ledger(store: &CsvLedgerStore, strict: bool) {
    let info = Table::with_rows(
        vec![
            "start_key".into(),
            "end_key".into(),
            "strict".into(),
            "header::user_id".into(),
        ],
        vec![vec![
            "start_time".into(),
            "end_time".into(),
            if strict { "1".into() } else { "0".into() },
            "user.id".into(),
        ]],
    )
    .unwrap();
    store
        .create_ledger(
            "uofc",
            "v100",
            info,
            vec!["user_id".into(), "start_time".into(), "end_time".into()],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ticket_allocation_appends_one_row_per_ticket() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_ticket_ledger(&store, 2).await;

    let data = json!({"quantity": 1, "user": {"id": 7}});
    register_tickets(&store, "uofc", "eventa", &data).await.unwrap();

    let expended = store.read_expended("uofc", "eventa").await.unwrap();
    assert_eq!(expended.len(), 1);
    assert_eq!(expended.column("user_id").unwrap(), vec!["7"]);
    assert_eq!(expended.column("quantity").unwrap(), vec!["1"]);

    // A second request for more than the remaining capacity is refused.
    let data = json!({"quantity": 2, "user": {"id": 8}});
    let err = register_tickets(&store, "uofc", "eventa", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NoTicketsAvailable(_)));
    assert_eq!(err.status_code(), 403);

    // The refused request must not have written anything.
    let expended = store.read_expended("uofc", "eventa").await.unwrap();
    assert_eq!(expended.len(), 1);
}

#[tokio::test]
async fn test_expended_never_exceeds_available() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_ticket_ledger(&store, 3).await;

    for id in 0..5 {
        let data = json!({"quantity": 1, "user": {"id": id}});
        let _ = register_tickets(&store, "uofc", "eventa", &data).await;
    }

    let info = store.read_info("uofc", "eventa").await.unwrap();
    let available: usize = info.first_row_cell("available").unwrap().parse().unwrap();
    let expended = store.read_expended("uofc", "eventa").await.unwrap();
    assert!(expended.len() <= available);
    assert_eq!(expended.len(), 3);
}

#[tokio::test]
async fn test_multi_ticket_request_appends_identical_rows() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_ticket_ledger(&store, 5).await;

    let data = json!({"quantity": 3, "user": {"id": 9}});
    register_tickets(&store, "uofc", "eventa", &data).await.unwrap();

    let expended = store.read_expended("uofc", "eventa").await.unwrap();
    assert_eq!(expended.len(), 3);
    assert_eq!(expended.column("user_id").unwrap(), vec!["9", "9", "9"]);
}

#[tokio::test]
async fn test_non_positive_quantity_is_invalid() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_ticket_ledger(&store, 2).await;

    for quantity in [0, -3] {
        let data = json!({"quantity": quantity, "user": {"id": 1}});
        let err = register_tickets(&store, "uofc", "eventa", &data)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequest(_)));
    }
}

#[tokio::test]
async fn test_unresolvable_mapping_is_a_database_write_error() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_ticket_ledger(&store, 2).await;

    // user.id is tracked but not provided.
    let data = json!({"quantity": 1});
    let err = register_tickets(&store, "uofc", "eventa", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DatabaseWrite(_)));
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_strict_slot_rejects_overlap() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_slot_ledger(&store, true).await;

    let data = json!({
        "start_time": "2024-01-02T01:00:00Z",
        "end_time": "2024-01-02T02:00:00Z",
        "user": {"id": 1}
    });
    register_timeslot(&store, "uofc", "v100", &data).await.unwrap();

    // Overlapping request: starts inside the existing interval.
    let data = json!({
        "start_time": "2024-01-02T01:30:00Z",
        "end_time": "2024-01-02T02:30:00Z",
        "user": {"id": 2}
    });
    let err = register_timeslot(&store, "uofc", "v100", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::OverlappingTimeslot(_)));
    assert_eq!(err.status_code(), 403);

    // A disjoint interval is accepted.
    let data = json!({
        "start_time": "2024-01-02T03:00:00Z",
        "end_time": "2024-01-02T04:00:00Z",
        "user": {"id": 3}
    });
    register_timeslot(&store, "uofc", "v100", &data).await.unwrap();

    let expended = store.read_expended("uofc", "v100").await.unwrap();
    assert_eq!(expended.len(), 2);
    assert_eq!(
        expended.column("start_time").unwrap(),
        vec!["2024-01-02T01:00:00Z", "2024-01-02T03:00:00Z"]
    );
}

#[tokio::test]
async fn test_strict_ledger_intervals_stay_pairwise_disjoint() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_slot_ledger(&store, true).await;

    let slots = [
        ("2024-01-02T01:00:00Z", "2024-01-02T02:00:00Z"),
        ("2024-01-02T01:30:00Z", "2024-01-02T02:30:00Z"),
        ("2024-01-02T02:30:00Z", "2024-01-02T03:30:00Z"),
        ("2024-01-01T00:00:00Z", "2024-01-03T00:00:00Z"),
        ("2024-01-02T05:00:00Z", "2024-01-02T06:00:00Z"),
    ];
    for (id, (start, end)) in slots.iter().enumerate() {
        let data = json!({
            "start_time": start,
            "end_time": end,
            "user": {"id": id}
        });
        let _ = register_timeslot(&store, "uofc", "v100", &data).await;
    }

    let expended = store.read_expended("uofc", "v100").await.unwrap();
    let starts = expended.column("start_time").unwrap();
    let ends = expended.column("end_time").unwrap();
    for i in 0..starts.len() {
        for j in (i + 1)..starts.len() {
            let disjoint = ends[i] <= starts[j] || ends[j] <= starts[i];
            assert!(
                disjoint,
                "rows {i} and {j} overlap: [{}, {}) vs [{}, {})",
                starts[i], ends[i], starts[j], ends[j]
            );
        }
    }
}

#[tokio::test]
async fn test_relaxed_slot_allows_overlap() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_slot_ledger(&store, false).await;

    for id in 0..2 {
        let data = json!({
            "start_time": "2024-01-02T01:00:00Z",
            "end_time": "2024-01-02T02:00:00Z",
            "user": {"id": id}
        });
        register_timeslot(&store, "uofc", "v100", &data).await.unwrap();
    }
    let expended = store.read_expended("uofc", "v100").await.unwrap();
    assert_eq!(expended.len(), 2);
}

#[tokio::test]
async fn test_bad_timestamps_are_invalid_timeslots() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_slot_ledger(&store, true).await;

    // Not ISO-8601.
    let data = json!({
        "start_time": "tomorrow",
        "end_time": "later",
        "user": {"id": 1}
    });
    let err = register_timeslot(&store, "uofc", "v100", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTimeslot(_)));

    // Start not before end.
    let data = json!({
        "start_time": "2024-01-02T02:00:00Z",
        "end_time": "2024-01-02T01:00:00Z",
        "user": {"id": 1}
    });
    let err = register_timeslot(&store, "uofc", "v100", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidTimeslot(_)));
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn test_missing_slot_keys_are_database_write_errors() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    create_slot_ledger(&store, true).await;

    let data = json!({"start_time": "2024-01-02T01:00:00Z", "user": {"id": 1}});
    let err = register_timeslot(&store, "uofc", "v100", &data)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DatabaseWrite(_)));
}

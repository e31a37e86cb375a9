// Tree builder
// Materializes a new organization from a PUT definition: validates the
// policies and every entity, creates the ledgers for the leaves, and
// persists the normalized tree. Any failure after the directory is
// allocated rolls the whole organization back off disk.

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::contracts::LedgerStore;
use crate::errors::{BrokerError, BrokerResult};
use crate::ledger::{CsvLedgerStore, Table, HEADER_PREFIX};
use crate::policy::{self, OrgContext};
use crate::request::Request;
use crate::types::OrgName;

const LEAF_TYPES: [&str; 2] = ["Ticketed", "Slotted"];

/// Builds organizations onto a CSV ledger store.
pub struct TreeBuilder<'a> {
    store: &'a CsvLedgerStore,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(store: &'a CsvLedgerStore) -> Self {
        Self { store }
    }

    /// Build a brand-new organization, its policies, and its entities.
    ///
    /// The organization directory is the transaction boundary: it is
    /// created first, and removed again if any later step fails.
    pub async fn build(&self, request: &Request) -> BrokerResult<Value> {
        let raw = request.raw_request();
        let org = raw
            .get("OrganizationName")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BrokerError::MalformedEntity("OrganizationName must be specified".into())
            })?;
        let org = OrgName::new(org).map_err(|err| BrokerError::MalformedEntity(err.to_string()))?;

        let org_dir = self.store.org_dir(org.as_str());
        if tokio::fs::try_exists(&org_dir).await.unwrap_or(false) {
            return Err(BrokerError::AssociationAlreadyExists(format!(
                "organization {org} already exists"
            )));
        }
        tokio::fs::create_dir_all(&org_dir)
            .await
            .map_err(|err| BrokerError::DatabaseWrite(err.to_string()))?;

        match self.build_contents(raw, &org).await {
            Ok(()) => {
                info!(org = %org, "organization created");
                Ok(json!({ "result": "ok" }))
            }
            Err(err) => {
                // Roll back: a failed build must leave no directory behind.
                if let Err(cleanup) = tokio::fs::remove_dir_all(&org_dir).await {
                    warn!(org = %org, %cleanup, "rollback of failed build left debris");
                }
                Err(err)
            }
        }
    }

    async fn build_contents(&self, raw: &Value, org: &OrgName) -> BrokerResult<()> {
        let org_dir = self.store.org_dir(org.as_str());

        // Validate every named policy before writing any of them.
        let mut policies: Vec<(&String, &Value)> = Vec::new();
        if let Some(named) = raw.get("Policies") {
            let named = named.as_object().ok_or_else(|| {
                BrokerError::MalformedEntity("Policies must be an object of definitions".into())
            })?;
            for (name, definition) in named {
                policy::from_argument(definition, None)
                    .map_err(|err| BrokerError::MalformedEntity(err.to_string()))?;
                policies.push((name, definition));
            }
        }
        if !policies.is_empty() {
            let policies_dir = org_dir.join("policies");
            tokio::fs::create_dir_all(&policies_dir)
                .await
                .map_err(|err| BrokerError::DatabaseWrite(err.to_string()))?;
            for (name, definition) in &policies {
                let path = policies_dir.join(format!("{name}.json"));
                let text = serde_json::to_string_pretty(definition)
                    .map_err(BrokerError::unknown)?;
                tokio::fs::write(&path, text)
                    .await
                    .map_err(|err| BrokerError::DatabaseWrite(err.to_string()))?;
            }
        }

        // The root policy may call on a freshly written named policy, so it
        // is validated after the registry lands.
        let ctx = OrgContext::new(self.store.root(), org.as_str());
        if let Some(root_policy) = raw.get("Policy") {
            policy::from_argument(root_policy, Some(&ctx))
                .map_err(|err| BrokerError::MalformedEntity(err.to_string()))?;
        }

        let entities = raw
            .get("Entities")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                BrokerError::MalformedEntity("Entities must be defined as a list".into())
            })?;
        for entity in entities {
            validate_entity(entity, &ctx)?;
        }

        // Everything checked out: create the leaf ledgers.
        for entity in entities {
            self.create_ledgers(entity, org).await?;
        }

        // Persist the normalized tree with the organization as its root.
        let definition = json!({
            "Entity_Name": org.as_str(),
            "Type": "Routing",
            "Policy": raw.get("Policy").cloned().unwrap_or_else(|| json!("FullApproval")),
            "Children": entities.iter().map(normalize_entity).collect::<Vec<_>>(),
        });
        let text = serde_json::to_string_pretty(&definition).map_err(BrokerError::unknown)?;
        tokio::fs::write(org_dir.join("entity_definition.json"), text)
            .await
            .map_err(|err| BrokerError::DatabaseWrite(err.to_string()))?;
        Ok(())
    }

    /// Create the info and empty expended tables for every leaf in the
    /// subtree.
    async fn create_ledgers(&self, definition: &Value, org: &OrgName) -> BrokerResult<()> {
        let mut stack = vec![definition];
        while let Some(current) = stack.pop() {
            if let Some(collect) = current.get("Collect").and_then(Value::as_object) {
                let name = current
                    .get("Entity_Name")
                    .and_then(Value::as_str)
                    .expect("validated before ledger creation");
                let (info, expended_headers) = leaf_tables(current, collect)?;
                self.store
                    .create_ledger(org.as_str(), name, info, expended_headers)
                    .await
                    .map_err(|err| BrokerError::DatabaseWrite(err.to_string()))?;
            }
            if let Some(children) = current.get("Children").and_then(Value::as_array) {
                stack.extend(children);
            }
        }
        Ok(())
    }
}

/// Build the single-row info table and the expended header row for a leaf.
fn leaf_tables(
    definition: &Value,
    collect: &Map<String, Value>,
) -> BrokerResult<(Table, Vec<String>)> {
    let mut headers = Vec::new();
    let mut row = Vec::new();
    if definition.get("Type").and_then(Value::as_str) == Some("Ticketed") {
        let available = definition
            .get("Available")
            .and_then(Value::as_i64)
            .expect("validated before ledger creation");
        headers.push("available".to_string());
        row.push(available.to_string());
    } else {
        let start_key = definition
            .get("StartKey")
            .and_then(Value::as_str)
            .expect("validated before ledger creation");
        let end_key = definition
            .get("EndKey")
            .and_then(Value::as_str)
            .expect("validated before ledger creation");
        headers.extend([
            "start_key".to_string(),
            "end_key".to_string(),
            "strict".to_string(),
        ]);
        row.extend([start_key.to_string(), end_key.to_string(), "1".to_string()]);
    }

    let mut expended_headers = Vec::new();
    for (column, path) in collect {
        let path = path.as_str().ok_or_else(|| {
            BrokerError::MalformedEntity(format!(
                "Collect entry {column:?} must map to a dotted request path"
            ))
        })?;
        headers.push(format!("{HEADER_PREFIX}{column}"));
        row.push(path.to_string());
        expended_headers.push(column.clone());
    }
    if definition.get("Type").and_then(Value::as_str) == Some("Slotted") {
        for column in ["start_time", "end_time"] {
            if !expended_headers.iter().any(|h| h == column) {
                expended_headers.push(column.to_string());
            }
        }
    }

    let info =
        Table::with_rows(headers, vec![row]).map_err(|err| BrokerError::unknown(err))?;
    Ok((info, expended_headers))
}

/// Recursively verify one entity definition.
fn validate_entity(definition: &Value, ctx: &OrgContext<'_>) -> BrokerResult<()> {
    if definition.get("Entity_Name").and_then(Value::as_str).is_none() {
        return Err(BrokerError::MalformedEntity(
            "Entity_Name must be defined in your entities".into(),
        ));
    }
    let entity_type = definition
        .get("Type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !matches!(entity_type, "Routing" | "Ticketed" | "Slotted") {
        return Err(BrokerError::MalformedEntity(
            "type of entity must be Ticketed, Routing, or Slotted".into(),
        ));
    }
    if LEAF_TYPES.contains(&entity_type)
        && definition.get("Collect").and_then(Value::as_object).is_none()
    {
        return Err(BrokerError::MalformedEntity(
            "define what data is to be collected for your ticketed/slotted entities".into(),
        ));
    }
    if entity_type == "Ticketed" && definition.get("Available").and_then(Value::as_i64).is_none()
    {
        return Err(BrokerError::MalformedEntity(
            "must define an integer Available in ticketed entities".into(),
        ));
    }
    if entity_type == "Slotted"
        && (definition.get("StartKey").and_then(Value::as_str).is_none()
            || definition.get("EndKey").and_then(Value::as_str).is_none())
    {
        return Err(BrokerError::MalformedEntity(
            "must define StartKey and EndKey in slotted entities".into(),
        ));
    }
    if let Some(policy) = definition.get("Policy") {
        policy::from_argument(policy, Some(ctx))
            .map_err(|err| BrokerError::MalformedEntity(err.to_string()))?;
    }
    if let Some(children) = definition.get("Children").and_then(Value::as_array) {
        for child in children {
            validate_entity(child, ctx)?;
        }
    }
    Ok(())
}

/// The normalized shape persisted to `entity_definition.json`: resource
/// parameters live in the info tables, not in the tree.
fn normalize_entity(definition: &Value) -> Value {
    json!({
        "Entity_Name": definition.get("Entity_Name").cloned().unwrap_or_default(),
        "Type": definition.get("Type").cloned().unwrap_or_default(),
        "Policy": definition.get("Policy").cloned().unwrap_or_else(|| json!("FullApproval")),
        "Children": definition
            .get("Children")
            .and_then(Value::as_array)
            .map(|children| children.iter().map(normalize_entity).collect::<Vec<_>>())
            .unwrap_or_default(),
    })
}

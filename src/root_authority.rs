// Root authority
// Resolves the first path fragment of a request to an organization root:
// checks that the organization exists under the data root, hydrates its
// stored tree, and hands the root entity back to the dispatcher.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::entity::Entity;
use crate::errors::{BrokerError, BrokerResult};
use crate::policy::OrgContext;
use crate::request::Request;

/// Locates organization roots under the broker's data directory.
pub struct RootAuthority<'a> {
    data_root: &'a Path,
}

impl<'a> RootAuthority<'a> {
    pub fn new(data_root: &'a Path) -> Self {
        Self { data_root }
    }

    /// Consume the request's first fragment and hydrate the organization it
    /// names. The returned entity starts the tree walk.
    pub async fn get_root(&self, request: &mut Request) -> BrokerResult<Entity> {
        let root_name = request.next_route()?;
        let org_dir = self.data_root.join(format!("organization_{root_name}"));
        if !tokio::fs::try_exists(&org_dir).await.unwrap_or(false) {
            return Err(BrokerError::RouteDoesNotExist(format!(
                "root {root_name} does not exist"
            )));
        }

        let definition_path = org_dir.join("entity_definition.json");
        let text = tokio::fs::read_to_string(&definition_path)
            .await
            .map_err(|err| {
                BrokerError::unknown(format!(
                    "organization {root_name} has no readable entity definition: {err}"
                ))
            })?;
        let definition: Value = serde_json::from_str(&text).map_err(BrokerError::unknown)?;

        debug!(org = %root_name, "hydrating organization tree");
        let ctx = OrgContext::new(self.data_root, &root_name);
        Entity::from_definition(&definition, &root_name, Some(&ctx))
    }
}

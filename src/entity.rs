// Entity tree
// An organization is a tree of typed entities: routing waypoints and the
// two leaf resources (ticketed, slotted). A request walks the tree one
// path fragment at a time, passing the node's policy at every hop; the
// walk ends at a leaf that delegates to the allocation engine.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::allocation;
use crate::contracts::LedgerStore;
use crate::errors::{BrokerError, BrokerResult};
use crate::policy::{self, OrgContext, Policy};
use crate::request::Request;

/// The three entity flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Routing,
    Ticketed,
    Slotted,
}

impl EntityKind {
    pub fn from_type_str(type_string: &str) -> Option<Self> {
        match type_string {
            "Routing" => Some(EntityKind::Routing),
            "Ticketed" => Some(EntityKind::Ticketed),
            "Slotted" => Some(EntityKind::Slotted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Routing => "Routing",
            EntityKind::Ticketed => "Ticketed",
            EntityKind::Slotted => "Slotted",
        }
    }
}

/// A runtime tree node, hydrated from the organization's stored definition
/// for the duration of one request.
#[derive(Debug, Clone)]
pub struct Entity {
    name: String,
    org: String,
    kind: EntityKind,
    policy: Policy,
    children: HashMap<String, Entity>,
}

impl Entity {
    /// Hydrate an entity (and its subtree) from a stored definition.
    ///
    /// Stored definitions were validated by the tree builder, so a failure
    /// here means the data directory was edited out from under the broker.
    pub fn from_definition(
        definition: &Value,
        org: &str,
        ctx: Option<&OrgContext<'_>>,
    ) -> BrokerResult<Self> {
        let name = definition
            .get("Entity_Name")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::unknown("stored entity has no Entity_Name"))?;
        let kind = definition
            .get("Type")
            .and_then(Value::as_str)
            .and_then(EntityKind::from_type_str)
            .ok_or_else(|| {
                BrokerError::unknown(format!("stored entity {name} has a bad Type"))
            })?;

        let policy = match definition.get("Policy") {
            Some(argument) => {
                policy::from_argument(argument, ctx).map_err(BrokerError::unknown)?
            }
            None => Policy::FullApproval,
        };

        let mut children = HashMap::new();
        for child in definition
            .get("Children")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let child = Entity::from_definition(child, org, ctx)?;
            children.insert(child.name.clone(), child);
        }

        Ok(Self {
            name: name.to_string(),
            org: org.to_string(),
            kind,
            policy,
            children,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn org_name(&self) -> &str {
        &self.org
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Walk the tree along the request's remaining path fragments.
    ///
    /// At every node: evaluate the policy (rejection aborts the walk), then
    /// either descend into the child named by the next fragment or, when
    /// the path is exhausted, handle the leaf here.
    pub async fn call(
        &self,
        request: &mut Request,
        store: &dyn LedgerStore,
    ) -> BrokerResult<Value> {
        let mut node = self;
        loop {
            node.validate_request(request)?;
            match request.next_route() {
                Err(BrokerError::BottomOfRequest) => {
                    return node.handle_leaf(request, store).await;
                }
                Err(other) => return Err(other),
                Ok(fragment) => {
                    node = node.children.get(&fragment).ok_or_else(|| {
                        BrokerError::RouteDoesNotExist(format!(
                            "no route named {fragment} in the children of {}",
                            node.name
                        ))
                    })?;
                    debug!(entity = %node.name, "descending");
                }
            }
        }
    }

    fn validate_request(&self, request: &Request) -> BrokerResult<()> {
        let verdict = self.policy.evaluate(request)?;
        if !verdict.approved {
            return Err(BrokerError::Rejected(verdict.reason));
        }
        Ok(())
    }

    /// The path ended on this node.
    async fn handle_leaf(
        &self,
        request: &Request,
        store: &dyn LedgerStore,
    ) -> BrokerResult<Value> {
        match self.kind {
            EntityKind::Routing => Err(BrokerError::RouteDoesNotExist(format!(
                "{} is a routing entity, and should not be a leaf",
                self.name
            ))),
            EntityKind::Ticketed => {
                allocation::register_tickets(store, &self.org, &self.name, request.data()?)
                    .await
            }
            EntityKind::Slotted => {
                allocation::register_timeslot(store, &self.org, &self.name, request.data()?)
                    .await
            }
        }
    }

    /// The node at `path` below (and including) this one, plus all of its
    /// descendants when `recursive` is set. The head of `path` must name
    /// this node.
    pub fn get_children_of(&self, path: &str, recursive: bool) -> BrokerResult<Vec<&Entity>> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        if head != self.name {
            return Err(BrokerError::RouteDoesNotExist(format!(
                "tried to get entity children, but {path} doesn't exist on {}'s tree",
                self.name
            )));
        }
        match rest {
            None => {
                let mut results = vec![self];
                if recursive {
                    for child in self.children.values() {
                        results.extend(child.get_children_of(&child.name, true)?);
                    }
                }
                Ok(results)
            }
            Some(rest) => {
                let next = rest.split('.').next().expect("split yields a fragment");
                let child = self.children.get(next).ok_or_else(|| {
                    BrokerError::RouteDoesNotExist(format!(
                        "no route named {next} in the children of {}",
                        self.name
                    ))
                })?;
                child.get_children_of(rest, recursive)
            }
        }
    }

    /// Snapshot the ledger behind a leaf: `(info, expended)` in columnar
    /// JSON. Routing entities have no data to query.
    pub async fn query_data(
        &self,
        store: &dyn LedgerStore,
    ) -> BrokerResult<(Value, Value)> {
        if self.kind == EntityKind::Routing {
            return Err(BrokerError::InvalidRequest(
                "cannot query data from a routing entity".into(),
            ));
        }
        let info = store
            .read_info(&self.org, &self.name)
            .await
            .map_err(BrokerError::unknown)?;
        let expended = store
            .read_expended(&self.org, &self.name)
            .await
            .map_err(BrokerError::unknown)?;
        Ok((info.to_json(), expended.to_json()))
    }
}

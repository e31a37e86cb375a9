// Reserva - A Hierarchical Resource-Reservation Broker
// Root library module

pub mod allocation;
pub mod contracts;
pub mod entity;
pub mod errors;
pub mod gateway;
pub mod ledger;
pub mod observability;
pub mod path_utils;
pub mod policy;
pub mod request;
pub mod root_authority;
pub mod tree_builder;
pub mod types;

// Re-export key types
pub use errors::{BrokerError, BrokerResult};

pub use observability::{init_logging, init_logging_with_level};

pub use contracts::LedgerStore;

pub use ledger::{CsvLedgerStore, Table};

pub use policy::{from_argument, parse, OrgContext, Policy, Sentence, Verdict};

pub use entity::{Entity, EntityKind};

pub use request::{Method, Request};

pub use gateway::{Gateway, Response, Server, ServerConfig};

pub use tree_builder::TreeBuilder;

pub use root_authority::RootAuthority;

// Re-export validated types
pub use types::{EntityPath, IsoTimestamp, OrgName};

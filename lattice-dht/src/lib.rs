#![forbid(unsafe_code)]

//! The Lattice DHT engine.
//!
//! A Kademlia-style structured overlay: nodes locate peers close to an
//! arbitrary 20-byte address, route messages hop-by-hop toward a target,
//! and store/replicate small key-value entries across the nodes nearest to
//! the key. Higher layers (stream topology management, the pub/sub client
//! library) run their own instances of this engine under distinct service
//! ids over a shared transport.
//!
//! The crate is organised along the engine's components:
//!
//! * [`contact`]: contact wrappers, sorted/random contact lists and the
//!   k-bucket routing table,
//! * [`peer_manager`]: contact admission, eviction and lifecycle events,
//! * [`discovery`]: iterative closest-node lookups and network join,
//! * [`routing`]: hop-by-hop message routing with duplicate suppression,
//! * [`recursive`]: FIND_NODE / FETCH_DATA / DELETE_DATA coordination,
//! * [`store`]: the local entry store and its replication manager,
//! * [`node`]: the [`DhtNode`] facade wiring everything together.

pub mod contact;
pub mod discovery;
pub mod node;
pub mod peer_manager;
pub mod recursive;
pub mod routing;
pub mod rpc;
pub mod store;

pub use node::{DhtNode, InboundMessage};
pub use peer_manager::{ContactEvent, PeerManager};
pub use recursive::{RecursiveOperationManager, RecursiveOperationResult};
pub use routing::{RecursiveOperation, RouteError, RoutedMessage, Router};
pub use store::{DataEntry, LocalDataStore, StoreManager};

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod identifiers;

pub use config::DhtConfig;
pub use error::{DhtError, DhtResult};
pub use identifiers::{DhtAddress, Distance, DHT_ADDRESS_LENGTH};

//! Replication primitives shared by the stores

pub mod consistent;
pub mod ecmap;
pub mod lock;

pub use consistent::{
    ConsistentMap, InMemoryConsistentMap, ListenerId, MapEvent, MapEventListener, MapEventType, Versioned,
};
pub use ecmap::{EcMapEvent, EcMapListener, EventuallyConsistentMap, MapUpdate};
pub use lock::StripedLock;

//! Session lifecycle: the record, its owner actor, and the id registry.

pub mod actor;
pub mod record;
pub mod registry;

pub use actor::{SessionActor, SessionActorArgs, SessionMessage, SessionSnapshot};
pub use record::{Session, DEFAULT_SESSION_TTL_SECS};
pub use registry::{RegistrySettings, SessionHandle, SessionRegistry};

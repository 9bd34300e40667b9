//! Domain model for session coordination.
//!
//! # Architecture
//!
//! - **Types** (`types.rs`): identifiers and small enums
//! - **Events** (`events.rs`): records and the closed `SessionEvent` set
//! - **Errors** (`errors.rs`): the relay error taxonomy
//! - **Services** (`services.rs`): injected clock

pub mod errors;
pub mod events;
pub mod services;
pub mod types;

pub use errors::{RelayError, RelayResult};
pub use events::{
    FileRecord, MessageRecord, PresenceEntry, PresenceSync, SessionEvent, SessionStateEvent,
    StateChange, Topic, UploadProgressEvent,
};
pub use services::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use types::{
    share_url, DeviceType, MessageKind, SessionId, SessionStatus, TimestampUtc, UploadId,
    UploadStatus, UserId,
};

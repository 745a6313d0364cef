//! Client-side synchronization engine: keeps a local view of messages, reactions and threads
//! consistent with the server while push channels drop, reconnect and redeliver.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http_backend;
pub mod pending;
pub mod reconciler;
pub mod signals;
pub mod store;
pub mod subscription;
pub mod sweeper;
pub mod ws_transport;

pub use api::{FetchApi, MutationApi, PushChannel, PushTransport};
pub use cache::{EntityCache, ReactionGroup, SweepDiff};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_settings, load_settings_from, SyncSettings};
pub use engine::{SyncBackends, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use http_backend::HttpBackend;
pub use pending::{LocalId, MutationKind, MutationOutcome, MutationRequest, MutationResolution};
pub use subscription::{ConnectionState, SubscriptionHandle, TopicStatus};
pub use ws_transport::WsPushTransport;

#[cfg(test)]
#[path = "tests/fixtures.rs"]
pub(crate) mod fixtures;

pub mod account;
pub mod errors;
pub mod events;
pub mod pool;
mod queue;

pub use account::{Account, AccountId, AccountState, OAuthCredential, UnavailableReason};
pub use errors::{ProviderError, ProviderResult};
pub use events::{Event, EventHub, EventSink, NoopSink, OperationalEvent};
pub use pool::{AccountPool, AcquireError};

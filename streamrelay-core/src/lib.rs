pub mod bootstrap;
pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod history;
pub mod idle;
pub mod logging;
pub mod upstream;
pub mod viewers;

pub use config::Config;
pub use coordinator::{RelayCoordinator, RelayEvent, RelayHandle, RelayStatus, ViewerSession};
pub use envelope::Envelope;
pub use error::{RelayError, RelayResult, TransportError};
pub use history::{BufferedMessage, HistoryBuffer};
pub use upstream::{MemoryTransport, PubSubTransport, RedisTransport, SubscriptionState};

// Requests for a partition have to reach whichever node currently leads it,
// and the client rarely knows for sure who that is. Addresses go stale, nodes
// restart, and command handlers get registered a little after a node comes
// up. The transport hides all of this behind a single future per request.
//
// Every client owns one actor task. Request state lives exclusively inside
// that task, so none of it needs a lock. Network completions arrive on
// whatever task the messaging service drives them on and are posted back into
// the actor's mailbox before they touch a request. Each request races a
// timeout that is armed once and never cancelled; whichever of the two
// resolves the request first wins, and the loser finds the request gone.

use std::time::Duration;

pub mod actor;
pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod messaging;
pub mod request;

pub use adapter::{ClientTransport, ResponseFuture, RetryingRequestClient};
pub use config::TransportConfig;
pub use error::{classify, Disposition, Error};
pub use messaging::{MessagingError, MessagingService};
pub use request::{ClientRequest, NodeAddress, PartitionId, RawRequest};

/// Delay between two attempts of the same request. Much shorter than any
/// sensible request timeout, so a request gets many attempts before its
/// deadline.
pub const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Prefix of the topic the broker registers its command handler under, one
/// per partition.
pub const COMMAND_API_TOPIC_PREFIX: &str = "command-api-";

use std::time::Duration;

use typed_builder::TypedBuilder;

use super::{COMMAND_API_TOPIC_PREFIX, RETRY_DELAY};

/// Settings shared by every request a client sends.
#[derive(Clone, Debug, TypedBuilder)]
pub struct TransportConfig {
    /// Pause between two attempts of a request that allows retries.
    #[builder(default = RETRY_DELAY)]
    pub retry_delay: Duration,
    /// Partition `n` is addressed through the topic `{topic_prefix}{n}`.
    #[builder(default = COMMAND_API_TOPIC_PREFIX.to_owned(), setter(into))]
    pub topic_prefix: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

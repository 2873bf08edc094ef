use std::time::Duration;

use bytes::Bytes;
use tokio::{sync::oneshot, time::Instant};
use tracing::trace;

use super::{
    actor::{deadline_after, ScheduledTimer},
    error::Error,
    request::{NodeAddress, PartitionId},
};

/// Looks up the node currently believed to own a partition. `None` means no
/// address is known yet.
pub type AddressResolver = Box<dyn Fn() -> Option<NodeAddress> + Send>;

/// Decides whether a raw response can be handed to the caller.
pub type ResponseValidator = Box<dyn Fn(&[u8]) -> bool + Send>;

/// Where the caller's future gets its outcome from.
pub type ResultSender = oneshot::Sender<Result<Bytes, Error>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Completed,
    Failed,
}

/// Everything known about one logical request, from the moment it is sent
/// until it is resolved.
///
/// The context never does I/O. It only answers questions about the request
/// and makes sure the caller learns its outcome exactly once.
pub struct RequestContext {
    id: u64,
    result: Option<ResultSender>,
    resolve_target: AddressResolver,
    partition_id: PartitionId,
    topic: String,
    payload: Bytes,
    validate: ResponseValidator,
    retry_enabled: bool,
    timeout: Duration,
    deadline: Instant,
    scheduled_timeout: Option<ScheduledTimer>,
    state: CompletionState,
}

impl RequestContext {
    /// Creates a pending request whose deadline is `timeout` from now.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        result: ResultSender,
        resolve_target: AddressResolver,
        partition_id: PartitionId,
        topic: String,
        payload: Bytes,
        validate: ResponseValidator,
        retry_enabled: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            result: Some(result),
            resolve_target,
            partition_id,
            topic,
            payload,
            validate,
            retry_enabled,
            timeout,
            deadline: deadline_after(timeout),
            scheduled_timeout: None,
            state: CompletionState::Pending,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn should_retry(&self) -> bool {
        self.retry_enabled
    }

    /// The timeout the request was created with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> CompletionState {
        self.state
    }

    pub fn scheduled_timeout(&self) -> Option<&ScheduledTimer> {
        self.scheduled_timeout.as_ref()
    }

    pub fn set_scheduled_timeout(&mut self, timer: ScheduledTimer) {
        self.scheduled_timeout = Some(timer);
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining_timeout(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_done(&self) -> bool {
        self.state != CompletionState::Pending
    }

    pub fn current_target_address(&self) -> Option<NodeAddress> {
        (self.resolve_target)()
    }

    pub fn verify_response(&self, response: &[u8]) -> bool {
        (self.validate)(response)
    }

    /// Resolves the request with `response`. Returns `false` if it had
    /// already been resolved, in which case nothing happens.
    pub fn complete(&mut self, response: Bytes) -> bool {
        self.resolve(CompletionState::Completed, Ok(response))
    }

    /// Fails the request with `error`. Returns `false` if it had already
    /// been resolved, in which case nothing happens.
    pub fn complete_with_error(&mut self, error: Error) -> bool {
        self.resolve(CompletionState::Failed, Err(error))
    }

    /// Called when the deadline has been reached.
    pub fn on_timeout_fired(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        let error = Error::Timeout {
            topic: self.topic.clone(),
            timeout: self.timeout,
        };
        self.complete_with_error(error)
    }

    fn resolve(&mut self, state: CompletionState, outcome: Result<Bytes, Error>) -> bool {
        if self.is_done() {
            return false;
        }
        self.state = state;
        if let Some(result) = self.result.take() {
            if result.send(outcome).is_err() {
                trace!(request = self.id, "caller is no longer waiting for the result");
            }
        }
        true
    }
}

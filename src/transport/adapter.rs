use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::hex::HexDisplayExt;

use super::{
    actor::ActorControl,
    config::TransportConfig,
    context::{AddressResolver, RequestContext, ResponseValidator},
    error::{classify, Disposition, Error},
    messaging::{MessagingError, MessagingService},
    request::{encode, topic_name, ClientRequest, NodeAddress, PartitionId},
};

/// Sends requests to the node owning a partition.
pub trait ClientTransport {
    /// Sends `request` once. A missing address or a response rejected by
    /// `validate` fails the request right away.
    fn send_request<R, V, Q>(
        &self,
        resolve_target: R,
        validate: V,
        request: &Q,
        timeout: Duration,
    ) -> ResponseFuture
    where
        R: Fn() -> Option<NodeAddress> + Send + 'static,
        V: Fn(&[u8]) -> bool + Send + 'static,
        Q: ClientRequest + ?Sized;

    /// Sends `request` until a response passes `validate` or `timeout`
    /// elapses.
    fn send_request_with_retry<R, V, Q>(
        &self,
        resolve_target: R,
        validate: V,
        request: &Q,
        timeout: Duration,
    ) -> ResponseFuture
    where
        R: Fn() -> Option<NodeAddress> + Send + 'static,
        V: Fn(&[u8]) -> bool + Send + 'static,
        Q: ClientRequest + ?Sized;
}

/// Request/response client that keeps trying to reach a partition's owner
/// until it gets a valid answer or runs out of time.
///
/// Can be cloned to obtain another handle to the same client.
#[derive(Clone)]
pub struct RetryingRequestClient {
    actor: ActorControl<ClientState>,
    config: TransportConfig,
    next_request_id: Arc<AtomicU64>,
}

impl RetryingRequestClient {
    /// Creates a client sending through `messaging`. Must be called from
    /// within a tokio runtime.
    pub fn new(messaging: Arc<dyn MessagingService>, config: TransportConfig) -> Self {
        let state = ClientState {
            messaging,
            retry_delay: config.retry_delay,
            requests: HashMap::new(),
        };
        Self {
            actor: ActorControl::spawn("client-transport", state),
            config,
            next_request_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Sends `payload` to `partition_id` with a single attempt: an unknown
    /// address, a refused connection or a rejected response end the request.
    pub fn send<R, V>(
        &self,
        resolve_target: R,
        validate: V,
        partition_id: PartitionId,
        payload: &[u8],
        timeout: Duration,
    ) -> ResponseFuture
    where
        R: Fn() -> Option<NodeAddress> + Send + 'static,
        V: Fn(&[u8]) -> bool + Send + 'static,
    {
        self.send_internal(
            Box::new(resolve_target),
            Box::new(validate),
            partition_id,
            Bytes::copy_from_slice(payload),
            false,
            timeout,
        )
    }

    /// Sends `payload` to `partition_id`, retrying unknown addresses,
    /// connectivity problems and rejected responses until `timeout` elapses.
    pub fn send_with_retry<R, V>(
        &self,
        resolve_target: R,
        validate: V,
        partition_id: PartitionId,
        payload: &[u8],
        timeout: Duration,
    ) -> ResponseFuture
    where
        R: Fn() -> Option<NodeAddress> + Send + 'static,
        V: Fn(&[u8]) -> bool + Send + 'static,
    {
        self.send_internal(
            Box::new(resolve_target),
            Box::new(validate),
            partition_id,
            Bytes::copy_from_slice(payload),
            true,
            timeout,
        )
    }

    /// Number of requests that have not been resolved yet.
    pub async fn in_flight_requests(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.actor.call(move |state: &mut ClientState, _| {
            let _ = tx.send(state.requests.len());
        });
        rx.await.unwrap_or(0)
    }

    #[allow(clippy::too_many_arguments)]
    fn send_internal(
        &self,
        resolve_target: AddressResolver,
        validate: ResponseValidator,
        partition_id: PartitionId,
        payload: Bytes,
        retry_enabled: bool,
        timeout: Duration,
    ) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let topic = topic_name(&self.config.topic_prefix, partition_id);
        let context = RequestContext::new(
            id,
            tx,
            resolve_target,
            partition_id,
            topic,
            payload,
            validate,
            retry_enabled,
            timeout,
        );

        // if the actor is gone the context is dropped with the job, which
        // resolves the future with `Error::Closed`
        if !self.actor.call(move |state, actor| state.register(context, actor)) {
            debug!(request = id, "client transport is closed");
        }

        ResponseFuture { rx }
    }
}

impl ClientTransport for RetryingRequestClient {
    fn send_request<R, V, Q>(
        &self,
        resolve_target: R,
        validate: V,
        request: &Q,
        timeout: Duration,
    ) -> ResponseFuture
    where
        R: Fn() -> Option<NodeAddress> + Send + 'static,
        V: Fn(&[u8]) -> bool + Send + 'static,
        Q: ClientRequest + ?Sized,
    {
        self.send_internal(
            Box::new(resolve_target),
            Box::new(validate),
            request.partition_id(),
            encode(request),
            false,
            timeout,
        )
    }

    fn send_request_with_retry<R, V, Q>(
        &self,
        resolve_target: R,
        validate: V,
        request: &Q,
        timeout: Duration,
    ) -> ResponseFuture
    where
        R: Fn() -> Option<NodeAddress> + Send + 'static,
        V: Fn(&[u8]) -> bool + Send + 'static,
        Q: ClientRequest + ?Sized,
    {
        self.send_internal(
            Box::new(resolve_target),
            Box::new(validate),
            request.partition_id(),
            encode(request),
            true,
            timeout,
        )
    }
}

/// Resolves with the response of a request, or with the reason it failed.
///
/// Dropping the future does not stop the request; it keeps going until it
/// completes or times out.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Bytes, Error>>,
}

impl Future for ResponseFuture {
    type Output = Result<Bytes, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(Error::Closed)))
    }
}

/// State owned by the client's actor. Only ever touched from its jobs.
struct ClientState {
    messaging: Arc<dyn MessagingService>,
    retry_delay: Duration,
    requests: HashMap<u64, RequestContext>,
}

impl ClientState {
    fn register(&mut self, mut context: RequestContext, actor: &ActorControl<Self>) {
        let id = context.id();
        // never cancelled; once the request is resolved the timer finds it
        // gone and does nothing
        let timer = actor.run_at(context.deadline(), move |state, _| state.on_timeout(id));
        context.set_scheduled_timeout(timer);
        self.requests.insert(id, context);
        self.try_to_send(id, actor);
    }

    fn try_to_send(&mut self, id: u64, actor: &ActorControl<Self>) {
        let Some(context) = self.requests.get_mut(&id) else {
            trace!(request = id, "request is already done");
            return;
        };
        if context.is_done() {
            trace!(request = id, "request is already done");
            return;
        }

        let remaining = context.remaining_timeout();
        if remaining.as_millis() == 0 {
            // the scheduled timeout fails the request
            trace!(
                request = id,
                timeout = ?context.timeout(),
                ?remaining,
                "request reached its timeout"
            );
            return;
        }

        let Some(address) = context.current_target_address() else {
            if context.should_retry() {
                trace!(
                    request = id,
                    topic = context.topic(),
                    delay = ?self.retry_delay,
                    "no target address for request, retrying"
                );
                Self::retry_later(actor, id, self.retry_delay);
            } else {
                trace!(
                    request = id,
                    topic = context.topic(),
                    "no target address for request, failing"
                );
                let error = Error::NoRoute {
                    topic: context.topic().to_owned(),
                };
                context.complete_with_error(error);
                self.reap(id);
            }
            return;
        };

        trace!(
            request = id,
            %address,
            topic = context.topic(),
            payload = %context.payload().preview(),
            "sending request"
        );
        let response = self.messaging.send_and_receive(
            &address,
            context.topic(),
            context.payload().clone(),
            remaining,
        );
        let actor = actor.clone();
        tokio::spawn(async move {
            let result = response.await;
            actor.call(move |state, actor| state.handle_response(id, result, actor));
        });
    }

    fn handle_response(
        &mut self,
        id: u64,
        result: Result<Bytes, MessagingError>,
        actor: &ActorControl<Self>,
    ) {
        let Some(context) = self.requests.get_mut(&id) else {
            trace!(request = id, "got response, but request is already done");
            return;
        };
        if context.is_done() {
            trace!(request = id, "got response, but request is already done");
            return;
        }

        match result {
            Ok(response) if context.verify_response(&response) => {
                trace!(request = id, "got valid response");
                context.complete(response);
            }
            Ok(response) if context.should_retry() => {
                trace!(
                    request = id,
                    response = %response.preview(),
                    delay = ?self.retry_delay,
                    "got invalid response, retrying"
                );
                Self::retry_later(actor, id, self.retry_delay);
            }
            Ok(response) => {
                trace!(
                    request = id,
                    response = %response.preview(),
                    "got invalid response, failing"
                );
                let error = Error::InvalidResponse {
                    topic: context.topic().to_owned(),
                };
                context.complete_with_error(error);
            }
            Err(error) => match classify(&error) {
                Disposition::Retry if context.should_retry() => {
                    trace!(
                        request = id,
                        %error,
                        delay = ?self.retry_delay,
                        "request failed, retrying"
                    );
                    Self::retry_later(actor, id, self.retry_delay);
                }
                _ => {
                    debug!(request = id, %error, "request failed, will not retry");
                    let error = Error::from_messaging(context.topic(), error);
                    context.complete_with_error(error);
                }
            },
        }

        self.reap(id);
    }

    fn on_timeout(&mut self, id: u64) {
        if let Some(context) = self.requests.get_mut(&id) {
            if context.on_timeout_fired() {
                debug!(
                    request = id,
                    topic = context.topic(),
                    timeout = ?context.timeout(),
                    "request timed out"
                );
            }
        }
        self.reap(id);
    }

    fn retry_later(actor: &ActorControl<Self>, id: u64, delay: Duration) {
        actor.run_delayed(delay, move |state, actor| state.try_to_send(id, actor));
    }

    /// Forgets the request once it has been resolved.
    fn reap(&mut self, id: u64) {
        if self.requests.get(&id).is_some_and(RequestContext::is_done) {
            self.requests.remove(&id);
        }
    }
}

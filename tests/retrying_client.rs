use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use synapse::transport::{
    ClientRequest, ClientTransport, Error, MessagingError, MessagingService, NodeAddress,
    RawRequest, RetryingRequestClient, TransportConfig,
};
use tokio::time::Instant;

const RETRY_DELAY: Duration = Duration::from_millis(10);

/// What the scripted messaging service does for one exchange.
#[derive(Clone)]
enum Outcome {
    Respond(&'static [u8]),
    Fail(MessagingError),
    /// Responds after the delay, ignoring the timeout it was given.
    RespondLate(Duration, &'static [u8]),
}

#[derive(Clone, Debug)]
struct Sent {
    address: NodeAddress,
    topic: String,
    payload: Bytes,
    timeout: Duration,
}

/// Messaging service playing back a script of outcomes, then repeating the
/// fallback forever.
struct ScriptedMessaging {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    sent: Mutex<Vec<Sent>>,
}

impl ScriptedMessaging {
    fn new(script: impl IntoIterator<Item = Outcome>, fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn always(outcome: Outcome) -> Arc<Self> {
        Self::new(Vec::new(), outcome)
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

impl MessagingService for ScriptedMessaging {
    fn send_and_receive(
        &self,
        address: &NodeAddress,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Bytes, MessagingError>> {
        self.sent.lock().unwrap().push(Sent {
            address: address.clone(),
            topic: topic.to_owned(),
            payload,
            timeout,
        });
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        async move {
            match outcome {
                Outcome::Respond(response) => Ok(Bytes::from_static(response)),
                Outcome::Fail(error) => Err(error),
                Outcome::RespondLate(delay, response) => {
                    tokio::time::sleep(delay).await;
                    Ok(Bytes::from_static(response))
                }
            }
        }
        .boxed()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn client(messaging: Arc<ScriptedMessaging>) -> RetryingRequestClient {
    init_tracing();
    let config = TransportConfig::builder().retry_delay(RETRY_DELAY).build();
    RetryingRequestClient::new(messaging, config)
}

fn leader() -> Option<NodeAddress> {
    Some(NodeAddress::from("broker-1:26501"))
}

fn unknown() -> Option<NodeAddress> {
    None
}

/// Resolves to nothing for the first `misses` lookups.
fn resolves_after(misses: usize) -> impl Fn() -> Option<NodeAddress> + Send + 'static {
    let lookups = AtomicUsize::new(0);
    move || {
        if lookups.fetch_add(1, Ordering::SeqCst) < misses {
            None
        } else {
            leader()
        }
    }
}

fn accept_all(_: &[u8]) -> bool {
    true
}

fn reject_all(_: &[u8]) -> bool {
    false
}

fn refused() -> MessagingError {
    MessagingError::ConnectionRefused {
        address: NodeAddress::from("broker-1:26501"),
    }
}

#[tokio::test(start_paused = true)]
async fn sends_to_the_resolved_node_and_topic() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());

    let response = client
        .send(leader, accept_all, 3, b"request", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(response, Bytes::from_static(b"ok"));
    let sent = messaging.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].address, NodeAddress::from("broker-1:26501"));
    assert_eq!(sent[0].topic, "command-api-3");
    assert_eq!(sent[0].payload, Bytes::from_static(b"request"));
    assert!(sent[0].timeout <= Duration::from_secs(5));
    assert!(sent[0].timeout > Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn send_fails_fast_without_an_address() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());
    let start = Instant::now();

    let result = client
        .send(unknown, accept_all, 1, b"request", Duration::from_secs(10))
        .await;

    match result {
        Err(Error::NoRoute { topic }) => assert_eq!(topic, "command-api-1"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(start.elapsed() < RETRY_DELAY);
    assert!(messaging.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_with_retry_waits_for_an_address() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());
    let start = Instant::now();

    let response = client
        .send_with_retry(
            resolves_after(3),
            accept_all,
            1,
            b"request",
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(response, Bytes::from_static(b"ok"));
    assert!(start.elapsed() >= RETRY_DELAY * 3);
    assert_eq!(messaging.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_with_retry_times_out_without_an_address() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());
    let timeout = Duration::from_millis(100);
    let start = Instant::now();

    let result = client
        .send_with_retry(unknown, accept_all, 1, b"request", timeout)
        .await;

    match result {
        Err(Error::Timeout { topic, timeout: t }) => {
            assert_eq!(topic, "command-api-1");
            assert_eq!(t, timeout);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout, "failed early after {elapsed:?}");
    assert!(elapsed < timeout + RETRY_DELAY * 2, "failed late after {elapsed:?}");
    assert!(messaging.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn send_fails_on_the_first_invalid_response() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"stale"));
    let client = client(messaging.clone());

    let result = client
        .send(leader, reject_all, 2, b"request", Duration::from_secs(1))
        .await;

    assert!(matches!(result, Err(Error::InvalidResponse { topic }) if topic == "command-api-2"));
    assert_eq!(messaging.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_with_retry_retries_invalid_responses_until_the_deadline() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"stale"));
    let client = client(messaging.clone());
    let timeout = Duration::from_millis(100);
    let start = Instant::now();

    let result = client
        .send_with_retry(leader, reject_all, 2, b"request", timeout)
        .await;

    assert!(matches!(result, Err(Error::Timeout { .. })));
    assert!(start.elapsed() >= timeout);
    let attempts = messaging.sent().len();
    assert!(attempts > 5, "only {attempts} attempts");
    assert!(attempts <= 11, "{attempts} attempts");
}

#[tokio::test(start_paused = true)]
async fn send_with_retry_accepts_a_valid_response_after_invalid_ones() {
    let messaging = ScriptedMessaging::new(
        [Outcome::Respond(b"stale"), Outcome::Respond(b"stale")],
        Outcome::Respond(b"fresh"),
    );
    let client = client(messaging.clone());

    let response = client
        .send_with_retry(
            leader,
            |response: &[u8]| response == b"fresh",
            1,
            b"request",
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(response, Bytes::from_static(b"fresh"));
    assert_eq!(messaging.sent().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn send_with_retry_recovers_from_a_refused_connection() {
    let messaging =
        ScriptedMessaging::new([Outcome::Fail(refused())], Outcome::Respond(b"ok"));
    let client = client(messaging.clone());

    let response = client
        .send_with_retry(leader, accept_all, 1, b"request", Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(response, Bytes::from_static(b"ok"));
    assert_eq!(messaging.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn send_with_retry_waits_for_a_handler() {
    let no_handler = MessagingError::NoRemoteHandler {
        topic: "command-api-1".into(),
    };
    let messaging = ScriptedMessaging::new(
        [Outcome::Fail(no_handler.clone()), Outcome::Fail(no_handler)],
        Outcome::Respond(b"ok"),
    );
    let client = client(messaging.clone());

    let response = client
        .send_with_retry(leader, accept_all, 1, b"request", Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(response, Bytes::from_static(b"ok"));
    assert_eq!(messaging.sent().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn send_fails_on_a_refused_connection() {
    let messaging =
        ScriptedMessaging::new([Outcome::Fail(refused())], Outcome::Respond(b"ok"));
    let client = client(messaging.clone());
    let start = Instant::now();

    let result = client
        .send(leader, accept_all, 1, b"request", Duration::from_secs(1))
        .await;

    match result {
        Err(Error::Connectivity { topic, source }) => {
            assert_eq!(topic, "command-api-1");
            assert_eq!(source, refused());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(start.elapsed() < RETRY_DELAY);
    assert_eq!(messaging.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unclassified_errors_are_never_retried() {
    let failure = MessagingError::RemoteHandlerFailure("partition 1 is inactive".into());
    let messaging = ScriptedMessaging::new(
        [Outcome::Fail(failure.clone())],
        Outcome::Respond(b"ok"),
    );
    let client = client(messaging.clone());

    let result = client
        .send_with_retry(leader, accept_all, 1, b"request", Duration::from_secs(1))
        .await;

    assert!(matches!(result, Err(Error::Substrate(e)) if e == failure));
    assert_eq!(messaging.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_send_with_the_remaining_timeout() {
    let messaging = ScriptedMessaging::new(
        [Outcome::Fail(refused()), Outcome::Fail(refused())],
        Outcome::Respond(b"ok"),
    );
    let client = client(messaging.clone());

    client
        .send_with_retry(leader, accept_all, 1, b"request", Duration::from_secs(1))
        .await
        .unwrap();

    let timeouts: Vec<_> = messaging.sent().iter().map(|sent| sent.timeout).collect();
    assert_eq!(timeouts.len(), 3);
    assert!(timeouts.windows(2).all(|pair| pair[1] < pair[0]));
    assert!(timeouts[2] <= Duration::from_secs(1) - RETRY_DELAY * 2);
}

#[tokio::test(start_paused = true)]
async fn late_responses_after_a_timeout_are_ignored() {
    let messaging = ScriptedMessaging::always(Outcome::RespondLate(
        Duration::from_millis(200),
        b"ok",
    ));
    let client = client(messaging.clone());

    let result = client
        .send_with_retry(leader, accept_all, 1, b"request", Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })));

    // let the late response reach the client
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.in_flight_requests().await, 0);
    assert_eq!(messaging.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn resolved_requests_are_forgotten() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());

    let pending = client.send_with_retry(
        unknown,
        accept_all,
        1,
        b"request",
        Duration::from_millis(100),
    );
    client
        .send(leader, accept_all, 2, b"request", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(client.in_flight_requests().await, 1);

    assert!(pending.await.is_err());
    assert_eq!(client.in_flight_requests().await, 0);
}

#[tokio::test(start_paused = true)]
async fn unbounded_timeouts_resolve_through_the_future() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());

    let failed = client.send(unknown, accept_all, 1, b"request", Duration::MAX);
    assert!(matches!(failed.await, Err(Error::NoRoute { .. })));

    let response = client
        .send_with_retry(resolves_after(2), accept_all, 1, b"request", Duration::MAX)
        .await
        .unwrap();
    assert_eq!(response, Bytes::from_static(b"ok"));
}

#[tokio::test(start_paused = true)]
async fn payload_is_copied_when_sending() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());

    let mut payload = b"original".to_vec();
    let response = client.send(leader, accept_all, 1, &payload, Duration::from_secs(1));
    payload.copy_from_slice(b"mutated!");
    response.await.unwrap();

    assert_eq!(messaging.sent()[0].payload, Bytes::from_static(b"original"));
}

#[tokio::test(start_paused = true)]
async fn requests_outlive_the_client_handle() {
    let messaging = ScriptedMessaging::always(Outcome::RespondLate(
        Duration::from_millis(20),
        b"ok",
    ));
    let client = client(messaging.clone());

    let response =
        client.send_with_retry(leader, accept_all, 1, b"request", Duration::from_secs(1));
    drop(client);

    assert_eq!(response.await.unwrap(), Bytes::from_static(b"ok"));
}

#[tokio::test(start_paused = true)]
async fn client_requests_are_encoded_once() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());
    let request = RawRequest::new(4, b"raw".to_vec());

    client
        .send_request(leader, accept_all, &request, Duration::from_secs(1))
        .await
        .unwrap();
    client
        .send_request_with_retry(leader, accept_all, &request, Duration::from_secs(1))
        .await
        .unwrap();

    let sent = messaging.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent
        .iter()
        .all(|sent| sent.topic == "command-api-4" && sent.payload == Bytes::from_static(b"raw")));
}

#[tokio::test(start_paused = true)]
async fn requests_behind_a_trait_object_are_sent() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());
    let request: Box<dyn ClientRequest> = Box::new(RawRequest::new(5, b"boxed".to_vec()));

    client
        .send_request_with_retry(leader, accept_all, &*request, Duration::from_secs(1))
        .await
        .unwrap();

    let sent = messaging.sent();
    assert_eq!(sent[0].topic, "command-api-5");
    assert_eq!(sent[0].payload, Bytes::from_static(b"boxed"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_complete_independently() {
    let messaging = ScriptedMessaging::always(Outcome::Respond(b"ok"));
    let client = client(messaging.clone());

    let fast = client.send(leader, accept_all, 1, b"a", Duration::from_secs(1));
    let slow = client.send_with_retry(
        resolves_after(5),
        accept_all,
        2,
        b"b",
        Duration::from_secs(1),
    );
    let failing = client.send(unknown, accept_all, 3, b"c", Duration::from_secs(1));

    let (fast, slow, failing) = tokio::join!(fast, slow, failing);
    assert!(fast.is_ok());
    assert!(slow.is_ok());
    assert!(matches!(failing, Err(Error::NoRoute { .. })));
    assert_eq!(client.in_flight_requests().await, 0);
}

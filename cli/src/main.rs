use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use bytes::Bytes;
use synapse::transport::{
    memory::LocalMessagingService, NodeAddress, RetryingRequestClient,
    TransportConfig,
};
use tracing::{info, warn};

const PARTITION: u32 = 1;
const LEADER: &str = "127.0.0.1:26501";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let network = LocalMessagingService::new();
    let client = RetryingRequestClient::new(
        Arc::new(network.clone()),
        TransportConfig::default(),
    );
    let topic = format!("{}{}", client.config().topic_prefix, PARTITION);
    let leader = || Some(NodeAddress::from(LEADER));
    let accepted = |response: &[u8]| !response.starts_with(b"NOT_LEADER");

    // nobody is listening yet: a single attempt fails right away
    match client
        .send(leader, accepted, PARTITION, b"create-instance", Duration::from_secs(1))
        .await
    {
        Ok(response) => info!("unexpected response {:?}", response),
        Err(e) => warn!("send failed: {}", e),
    }

    // the leader comes up after a while and only accepts commands once it
    // has caught up
    let node = network.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        node.start_node(LEADER).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let handled = Arc::new(AtomicUsize::new(0));
        node.register_handler(LEADER, topic, move |payload: Bytes| {
            let handled = handled.clone();
            async move {
                if handled.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(Bytes::from_static(b"NOT_LEADER"))
                } else {
                    let mut response = b"ACK ".to_vec();
                    response.extend_from_slice(&payload);
                    Ok(Bytes::from(response))
                }
            }
        })
        .await;
    });

    match client
        .send_with_retry(
            leader,
            accepted,
            PARTITION,
            b"create-instance",
            Duration::from_secs(5),
        )
        .await
    {
        Ok(response) => {
            info!("got response {}", String::from_utf8_lossy(&response))
        }
        Err(e) => warn!("send with retry failed: {}", e),
    }

    // no resolvable leader at all: retries end at the deadline
    match client
        .send_with_retry(
            || None,
            accepted,
            PARTITION + 1,
            b"create-instance",
            Duration::from_millis(250),
        )
        .await
    {
        Ok(response) => info!("unexpected response {:?}", response),
        Err(e) => warn!("send with retry failed: {}", e),
    }
}

use std::fmt;

use bytes::Bytes;

/// Identifies the logical shard a request is meant for.
pub type PartitionId = u32;

/// Network locator of a broker node, e.g. `10.0.0.7:26501`.
///
/// Addresses are opaque to the transport; only the messaging service knows
/// how to reach them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for NodeAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// A request that can be serialized for a partition.
pub trait ClientRequest {
    /// The partition this request targets.
    fn partition_id(&self) -> PartitionId;

    /// Exact number of bytes `write` produces.
    fn encoded_len(&self) -> usize;

    /// Writes the request into `buf`, which is exactly `encoded_len()` long.
    fn write(&self, buf: &mut [u8]);
}

/// A request whose payload has already been serialized by the caller.
#[derive(Clone, Debug)]
pub struct RawRequest {
    pub partition_id: PartitionId,
    pub payload: Bytes,
}

impl RawRequest {
    pub fn new(partition_id: PartitionId, payload: impl Into<Bytes>) -> Self {
        Self {
            partition_id,
            payload: payload.into(),
        }
    }
}

impl ClientRequest for RawRequest {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    fn encoded_len(&self) -> usize {
        self.payload.len()
    }

    fn write(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.payload);
    }
}

/// Serializes `request` into a fresh buffer. This is the only copy the
/// transport makes; everything downstream shares it.
pub(crate) fn encode(request: &(impl ClientRequest + ?Sized)) -> Bytes {
    let mut buf = vec![0u8; request.encoded_len()];
    request.write(&mut buf);
    Bytes::from(buf)
}

/// Name of the topic a partition's command handler listens on.
pub(crate) fn topic_name(prefix: &str, partition_id: PartitionId) -> String {
    format!("{prefix}{partition_id}")
}

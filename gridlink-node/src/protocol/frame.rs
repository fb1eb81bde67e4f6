use crate::core::{GridError, MapEvent, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted off the wire
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Correlation id reserved for connection-level frames (heartbeats, setup)
pub const CONTROL_TID: i64 = 0;

/// Metadata document of an exchange: the correlation id plus optional
/// addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    /// Transaction id correlating a request to its reply stream
    pub tid: i64,
    /// Content service path of the addressed asset
    pub csp: Option<String>,
    /// Logical channel id on a shared connection
    pub cid: Option<u64>,
}

impl FrameMeta {
    pub fn for_tid(tid: i64) -> Self {
        Self {
            tid,
            csp: None,
            cid: None,
        }
    }

    pub fn with_csp(mut self, csp: impl Into<String>) -> Self {
        self.csp = Some(csp.into());
        self
    }
}

/// Payload pushed to a subscription, matching its view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushPayload {
    /// Current value of a key or reference subscription; None means absent
    Value { value: Option<Bytes> },
    /// One map change event for an entry subscription
    Event(MapEvent),
    /// One message for a topic subscription
    TopicMessage { topic: String, payload: Bytes },
}

/// Data document of an exchange
///
/// Every recognized event name decodes into exactly one variant at the
/// framing boundary; nothing above this layer dispatches on strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBody {
    /// registerSubscriber: open a subscription described by the URI
    Subscribe { uri: String },
    /// unregisterSubscriber: close the subscription of this frame's tid
    Unsubscribe,
    /// reply: one pushed message for this frame's tid
    Reply { payload: PushPayload },
    /// onEndOfSubscription: server-issued terminal sentinel for this tid
    EndOfSubscription,
    /// publish: fire a message into the addressed asset's topic
    Publish { topic: String, payload: Bytes },
    /// heartbeat: keep-alive, no application data
    Heartbeat,
    /// Liveness parameters, transmitted once by the accepting side at
    /// connection initialize
    HeartbeatConfig { interval_ms: u64, timeout_ms: u64 },
}

/// One framed exchange: metadata document + data document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub meta: FrameMeta,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(tid: i64, body: FrameBody) -> Self {
        Self {
            meta: FrameMeta::for_tid(tid),
            body,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(CONTROL_TID, FrameBody::Heartbeat)
    }

    pub fn tid(&self) -> i64 {
        self.meta.tid
    }

    /// Encode with a u32 big-endian length prefix
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(4 + data.len());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&data);
        Ok(out)
    }

    /// Decode a frame body (without the length prefix)
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let encoded = self.encode()?;
        writer
            .write_all(&encoded)
            .await
            .map_err(|_| GridError::ChannelClosed)?;
        writer.flush().await.map_err(|_| GridError::ChannelClosed)?;
        Ok(())
    }

    /// Read one length-prefixed frame; `None` on clean end of stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(_) => return Err(GridError::ChannelClosed),
        }

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(GridError::InvalidRequest(format!(
                "frame length {} exceeds limit",
                len
            )));
        }

        let mut data = vec![0u8; len as usize];
        reader
            .read_exact(&mut data)
            .await
            .map_err(|_| GridError::ChannelClosed)?;

        Ok(Some(Self::decode(&data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let frame = Frame::new(
            42,
            FrameBody::Reply {
                payload: PushPayload::Value {
                    value: Some(Bytes::from_static(b"world")),
                },
            },
        );

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_end_of_subscription_distinguished_by_kind() {
        let reply = Frame::new(7, FrameBody::Reply {
            payload: PushPayload::Value { value: None },
        });
        let end = Frame::new(7, FrameBody::EndOfSubscription);

        assert_eq!(reply.tid(), end.tid());
        assert_ne!(reply.body, end.body);
    }

    #[test]
    fn test_publish_payload_is_opaque_bytes() {
        // Payload encoding belongs to the collaborator; JSON passes through
        // untouched
        let quote = serde_json::json!({"symbol": "ABC", "px": 101.5});
        let frame = Frame::new(
            3,
            FrameBody::Publish {
                topic: "quotes".to_string(),
                payload: Bytes::from(serde_json::to_vec(&quote).unwrap()),
            },
        );

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded[4..]).unwrap();
        let FrameBody::Publish { payload, .. } = decoded.body else {
            panic!("wrong frame kind");
        };
        let back: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(back, quote);
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let subscribe = Frame {
            meta: FrameMeta::for_tid(1).with_csp("/maps/prices"),
            body: FrameBody::Subscribe {
                uri: "/maps/prices?view=key&key=hello".to_string(),
            },
        };
        let heartbeat = Frame::heartbeat();

        let mut buf = Vec::new();
        subscribe.write_to(&mut buf).await.unwrap();
        heartbeat.write_to(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(
            Frame::read_from(&mut cursor).await.unwrap(),
            Some(subscribe)
        );
        assert_eq!(
            Frame::read_from(&mut cursor).await.unwrap(),
            Some(heartbeat)
        );
        assert_eq!(Frame::read_from(&mut cursor).await.unwrap(), None);
    }
}

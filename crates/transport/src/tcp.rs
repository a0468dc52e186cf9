//! TCP broker and connector.
//!
//! Frames are length-delimited. Inside each frame: one kind byte, a
//! big-endian `u16` topic length, the topic, then the raw payload.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::connector::{Connection, Connector, Publish};
use crate::memory::{InMemoryBroker, SESSION_CAPACITY};
use crate::{Message, Result, TopicFilter, TransportError};

const KIND_HELLO: u8 = 0;
const KIND_SUBSCRIBE: u8 = 1;
const KIND_PUBLISH: u8 = 2;
const KIND_DELIVER: u8 = 3;

const EMPTY: &[u8] = &[];

/// A unit of the broker protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame from a client, naming it.
    Hello(String),
    /// Client asks for messages matching a filter.
    Subscribe(String),
    /// Client publishes a message.
    Publish(Message),
    /// Broker delivers a message to a subscriber.
    Deliver(Message),
}

impl Frame {
    fn to_bytes(&self) -> Result<Bytes> {
        let (kind, topic, payload): (u8, &str, &[u8]) = match self {
            Frame::Hello(client) => (KIND_HELLO, client.as_str(), EMPTY),
            Frame::Subscribe(filter) => (KIND_SUBSCRIBE, filter.as_str(), EMPTY),
            Frame::Publish(msg) => (KIND_PUBLISH, msg.topic.as_str(), &msg.payload[..]),
            Frame::Deliver(msg) => (KIND_DELIVER, msg.topic.as_str(), &msg.payload[..]),
        };

        let topic_len = u16::try_from(topic.len())
            .map_err(|_| TransportError::Frame(format!("topic too long: {} bytes", topic.len())))?;

        let mut buf = BytesMut::with_capacity(3 + topic.len() + payload.len());
        buf.put_u8(kind);
        buf.put_u16(topic_len);
        buf.put_slice(topic.as_bytes());
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    fn parse(mut buf: Bytes) -> Result<Self> {
        if buf.len() < 3 {
            return Err(TransportError::Frame("frame shorter than header".into()));
        }
        let kind = buf.get_u8();
        let topic_len = buf.get_u16() as usize;
        if buf.len() < topic_len {
            return Err(TransportError::Frame("truncated topic".into()));
        }
        let topic = String::from_utf8(buf.split_to(topic_len).to_vec())
            .map_err(|_| TransportError::Frame("topic is not UTF-8".into()))?;

        match kind {
            KIND_HELLO => Ok(Frame::Hello(topic)),
            KIND_SUBSCRIBE => Ok(Frame::Subscribe(topic)),
            KIND_PUBLISH => Ok(Frame::Publish(Message::new(topic, buf))),
            KIND_DELIVER => Ok(Frame::Deliver(Message::new(topic, buf))),
            other => Err(TransportError::Frame(format!("unknown frame kind {other}"))),
        }
    }
}

/// Length-delimited framing plus the frame layout above.
#[derive(Debug, Default)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let bytes = frame.to_bytes()?;
        self.inner.encode(bytes, dst)?;
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.inner.decode(src)? {
            Some(bytes) => Frame::parse(bytes.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

/// A broker serving the frame protocol over TCP.
#[derive(Clone, Default)]
pub struct TcpBroker {
    core: InMemoryBroker,
}

impl TcpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The routing core, for inspection and fault injection.
    pub fn core(&self) -> &InMemoryBroker {
        &self.core
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), "Broker listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Broker shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let core = self.core.clone();
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(core, stream, shutdown).await {
                            tracing::debug!(%peer, error = %e, "Broker client ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_client(
    core: InMemoryBroker,
    stream: TcpStream,
    shutdown: CancellationToken,
) -> Result<()> {
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, FrameCodec::new());
    let mut writer = FramedWrite::new(write, FrameCodec::new());

    let client_id = match reader.next().await {
        Some(Ok(Frame::Hello(client_id))) => client_id,
        Some(Ok(other)) => {
            return Err(TransportError::Frame(format!(
                "expected hello, got {other:?}"
            )));
        }
        Some(Err(e)) => return Err(e),
        None => return Ok(()),
    };

    let (session, mut deliveries) = core.open_session(&client_id, Vec::new()).await?;
    tracing::info!(client_id = %client_id, "Broker client connected");

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            delivery = deliveries.recv() => match delivery {
                Some(msg) => {
                    if let Err(e) = writer.send(Frame::Deliver(msg)).await {
                        break Err(e);
                    }
                }
                // Session dropped by the core (forced disconnect).
                None => break Ok(()),
            },
            frame = reader.next() => match frame {
                Some(Ok(Frame::Subscribe(filter))) => {
                    match TopicFilter::parse(&filter) {
                        Ok(f) => {
                            if let Err(e) = core.subscribe(session, f).await {
                                break Err(e);
                            }
                        }
                        Err(e) => tracing::warn!(client_id = %client_id, error = %e, "Ignoring bad subscription"),
                    }
                }
                Some(Ok(Frame::Publish(msg))) => {
                    if let Err(e) = core.publish(msg).await {
                        tracing::warn!(client_id = %client_id, error = %e, "Dropping publish");
                    }
                }
                Some(Ok(other)) => tracing::warn!(client_id = %client_id, frame = ?other, "Unexpected frame"),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
        }
    };

    core.close_session(session).await;
    tracing::info!(client_id = %client_id, "Broker client disconnected");
    result
}

/// Connects to a [`TcpBroker`].
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

struct TcpPublisher {
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    closed: CancellationToken,
}

#[async_trait]
impl Publish for TcpPublisher {
    async fn publish(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        let mut writer = self.writer.lock().await;
        writer.send(Frame::Publish(message)).await.map_err(|e| {
            tracing::debug!(error = %e, "Publish failed");
            TransportError::Disconnected
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, client_id: &str, subscriptions: &[TopicFilter]) -> Result<Connection> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| TransportError::ConnectionRefused(format!("{}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        let mut writer = FramedWrite::new(write, FrameCodec::new());
        writer.send(Frame::Hello(client_id.to_string())).await?;
        for filter in subscriptions {
            writer
                .send(Frame::Subscribe(filter.as_str().to_string()))
                .await?;
        }

        let closed = CancellationToken::new();
        let (tx, inbound) = mpsc::channel(SESSION_CAPACITY);
        let mut reader = FramedRead::new(read, FrameCodec::new());
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Frame::Deliver(msg)) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(other) => tracing::warn!(frame = ?other, "Unexpected frame from broker"),
                    Err(e) => {
                        tracing::debug!(error = %e, "Broker connection read failed");
                        break;
                    }
                }
            }
            reader_closed.cancel();
        });

        Ok(Connection {
            publisher: Arc::new(TcpPublisher {
                writer: Mutex::new(writer),
                closed,
            }),
            inbound,
        })
    }
}

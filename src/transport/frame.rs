//! Binary wire format shared by the broker and client sides.
//!
//! Every frame is `{kind: u8, topic_len: u16, topic bytes, flags: u8,
//! seq: u64, payload_len: u32, payload bytes}` with all integers
//! little-endian, so independent implementations can interoperate
//! deterministically. Flag bit 0 carries the reliability level; bit 1 marks
//! the subscriber role on `Unregister` frames.
//!
//! The `seq` field is overloaded by direction: client-to-broker frames carry
//! a client-assigned correlation id that `Report` frames echo back, while
//! broker-to-subscriber `Data` frames carry the per-topic sequence number.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::broker::message::Reliability;
use crate::utils::error::{MmwError, Result};

/// Hard upper bound on a frame payload, independent of the configured
/// per-broker maximum (which is enforced with a `Report` instead of a
/// connection teardown).
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const FLAG_RELIABLE: u8 = 0b0000_0001;
const FLAG_SUBSCRIBER_ROLE: u8 = 0b0000_0010;

/// Frame kind tags on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    RegisterPublisher = 1,
    RegisterSubscriber = 2,
    Unregister = 3,
    Data = 4,
    Ack = 5,
    Report = 6,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::RegisterPublisher),
            2 => Ok(FrameKind::RegisterSubscriber),
            3 => Ok(FrameKind::Unregister),
            4 => Ok(FrameKind::Data),
            5 => Ok(FrameKind::Ack),
            6 => Ok(FrameKind::Report),
            other => Err(MmwError::Frame(format!("unknown frame kind {other}"))),
        }
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub reliability: Reliability,
    pub subscriber_role: bool,
    pub seq: u64,
    pub topic: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn register_publisher(topic: &str, corr: u64) -> Self {
        Self::control(FrameKind::RegisterPublisher, topic, corr, false)
    }

    pub fn register_subscriber(topic: &str, corr: u64) -> Self {
        Self::control(FrameKind::RegisterSubscriber, topic, corr, true)
    }

    pub fn unregister(topic: &str, subscriber_role: bool) -> Self {
        Self::control(FrameKind::Unregister, topic, 0, subscriber_role)
    }

    pub fn data(topic: &str, reliability: Reliability, seq: u64, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            reliability,
            subscriber_role: false,
            seq,
            topic: topic.to_string(),
            payload,
        }
    }

    pub fn ack(topic: &str, seq: u64) -> Self {
        Self::control(FrameKind::Ack, topic, seq, false)
    }

    pub fn report(topic: &str, corr: u64, body: ReportBody) -> Self {
        Self {
            kind: FrameKind::Report,
            reliability: Reliability::BestEffort,
            subscriber_role: false,
            seq: corr,
            topic: topic.to_string(),
            payload: body.encode(),
        }
    }

    fn control(kind: FrameKind, topic: &str, seq: u64, subscriber_role: bool) -> Self {
        Self {
            kind,
            reliability: Reliability::BestEffort,
            subscriber_role,
            seq,
            topic: topic.to_string(),
            payload: Bytes::new(),
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.reliability == Reliability::Reliable {
            flags |= FLAG_RELIABLE;
        }
        if self.subscriber_role {
            flags |= FLAG_SUBSCRIBER_ROLE;
        }
        flags
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u16_le(self.topic.len() as u16);
        buf.put_slice(self.topic.as_bytes());
        buf.put_u8(self.flags());
        buf.put_u64_le(self.seq);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

/// Writes one frame and flushes the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let mut buf = BytesMut::with_capacity(16 + frame.topic.len() + frame.payload.len());
    frame.encode(&mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, rejecting payloads longer than `max_payload`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_payload: usize) -> Result<Frame> {
    let kind = FrameKind::from_u8(reader.read_u8().await?)?;
    let topic_len = reader.read_u16_le().await? as usize;
    let mut topic = vec![0u8; topic_len];
    reader.read_exact(&mut topic).await?;
    let topic = String::from_utf8(topic)
        .map_err(|_| MmwError::Frame("topic name is not valid utf-8".into()))?;
    let flags = reader.read_u8().await?;
    let seq = reader.read_u64_le().await?;
    let payload_len = reader.read_u32_le().await? as usize;
    if payload_len > max_payload {
        return Err(MmwError::Frame(format!(
            "payload length {payload_len} exceeds frame limit {max_payload}"
        )));
    }
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    let reliability = if flags & FLAG_RELIABLE != 0 {
        Reliability::Reliable
    } else {
        Reliability::BestEffort
    };

    Ok(Frame {
        kind,
        reliability,
        subscriber_role: flags & FLAG_SUBSCRIBER_ROLE != 0,
        seq,
        topic,
        payload: Bytes::from(payload),
    })
}

/// Outcome carried in a `Report` frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportStatus {
    Ok = 0,
    UnknownTopic = 1,
    PayloadTooLarge = 2,
    Timeout = 3,
}

impl ReportStatus {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ReportStatus::Ok),
            1 => Ok(ReportStatus::UnknownTopic),
            2 => Ok(ReportStatus::PayloadTooLarge),
            3 => Ok(ReportStatus::Timeout),
            other => Err(MmwError::Frame(format!("unknown report status {other}"))),
        }
    }
}

/// Payload of a `Report` frame: `{status: u8, delivered: u32, failed: u32}`,
/// integers little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBody {
    pub status: ReportStatus,
    pub delivered: u32,
    pub failed: u32,
}

impl ReportBody {
    pub fn ok(delivered: u32) -> Self {
        Self { status: ReportStatus::Ok, delivered, failed: 0 }
    }

    pub fn rejected(status: ReportStatus) -> Self {
        Self { status, delivered: 0, failed: 0 }
    }

    pub fn timeout(delivered: u32, failed: u32) -> Self {
        Self { status: ReportStatus::Timeout, delivered, failed }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(self.status as u8);
        buf.put_u32_le(self.delivered);
        buf.put_u32_le(self.failed);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != 9 {
            return Err(MmwError::Frame(format!(
                "report body must be 9 bytes, got {}",
                payload.len()
            )));
        }
        let status = ReportStatus::from_u8(payload[0])?;
        let delivered = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        let failed = u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]);
        Ok(Self { status, delivered, failed })
    }
}

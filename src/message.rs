//! Wire message header and the two port implementations (`TcpPort` for
//! real connections, `LocalPort` for same-process loopback tests).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{Error, NetworkErrorKind, Result};

pub const HEADER_SIZE: usize = 1 + 1 + 2 + 4; // sequence + type/flags + code/status + parameter0

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        const NONE = 0x0;
        const RESPONSE = 0x1;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelCapabilities: u32 {
        const NONE = 0x0;
        const HANDLE_TRANSFER = 0x1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Embedded = 0,
    Data = 1,
    Handles = 2,
}

impl PayloadType {
    fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(PayloadType::Embedded),
            1 => Ok(PayloadType::Data),
            2 => Ok(PayloadType::Handles),
            _ => Err(Error::network(
                NetworkErrorKind::RpcMessageMalformed,
                "unknown payload type",
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Embedded { parameter1: u64 },
    Data { parameter1: u32, bytes: Vec<u8> },
    Handles { parameter1: u32, handles: Vec<u64> },
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Embedded { .. } => PayloadType::Embedded,
            Payload::Data { .. } => PayloadType::Data,
            Payload::Handles { .. } => PayloadType::Handles,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub sequence_number: u8,
    pub flags: MessageFlags,
    pub control_code_or_status: u16,
    pub parameter0: u32,
    pub payload: Payload,
}

impl Message {
    pub fn request(sequence_number: u8, control_code: u16, parameter0: u32, payload: Payload) -> Self {
        Message {
            sequence_number,
            flags: MessageFlags::NONE,
            control_code_or_status: control_code,
            parameter0,
            payload,
        }
    }

    pub fn response(sequence_number: u8, status: u16, parameter0: u32, payload: Payload) -> Self {
        Message {
            sequence_number,
            flags: MessageFlags::RESPONSE,
            control_code_or_status: status,
            parameter0,
            payload,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(MessageFlags::RESPONSE)
    }

    /// Checks the payload matches an expected type and, for `Data`
    /// payloads, an expected length. Mirrors `Message::test` from the
    /// original protocol, used by handlers before touching a session.
    pub fn test(&self, expected: PayloadType, expected_len: Option<usize>) -> bool {
        if self.payload.payload_type() != expected {
            return false;
        }
        if let (Some(len), Payload::Data { bytes, .. }) = (expected_len, &self.payload) {
            return bytes.len() == len;
        }
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.push(self.sequence_number);

        let type_bits = self.payload.payload_type() as u8 & 0x3;
        let flag_bits = (self.flags.bits() & 0x3F) << 2;
        header.push(type_bits | flag_bits);

        WriteBytesExt::write_u16::<LittleEndian>(&mut header, self.control_code_or_status).unwrap();
        WriteBytesExt::write_u32::<LittleEndian>(&mut header, self.parameter0).unwrap();

        match &self.payload {
            Payload::Embedded { parameter1 } => {
                WriteBytesExt::write_u64::<LittleEndian>(&mut header, *parameter1).unwrap();
            }
            Payload::Data { parameter1, bytes } => {
                WriteBytesExt::write_u32::<LittleEndian>(&mut header, *parameter1).unwrap();
                WriteBytesExt::write_u32::<LittleEndian>(&mut header, bytes.len() as u32).unwrap();
                header.extend_from_slice(bytes);
            }
            Payload::Handles { parameter1, handles } => {
                WriteBytesExt::write_u32::<LittleEndian>(&mut header, *parameter1).unwrap();
                WriteBytesExt::write_u32::<LittleEndian>(&mut header, handles.len() as u32).unwrap();
                for h in handles {
                    WriteBytesExt::write_u64::<LittleEndian>(&mut header, *h).unwrap();
                }
            }
        }

        header
    }

    pub fn decode_header(bytes: &[u8]) -> Result<(u8, PayloadType, MessageFlags, u16, u32)> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::network(
                NetworkErrorKind::RpcMessageMalformed,
                "short header",
            ));
        }
        let mut cursor = std::io::Cursor::new(bytes);
        let sequence_number = ReadBytesExt::read_u8(&mut cursor)?;
        let type_and_flags = ReadBytesExt::read_u8(&mut cursor)?;
        let payload_type = PayloadType::from_bits(type_and_flags & 0x3)?;
        let flags = MessageFlags::from_bits_truncate((type_and_flags >> 2) & 0x3F);
        let control_code_or_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
        let parameter0 = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        Ok((sequence_number, payload_type, flags, control_code_or_status, parameter0))
    }
}

fn io_err(_: std::io::Error) -> Error {
    Error::network(NetworkErrorKind::ConnectionClosed, "i/o error on channel")
}

/// Transport-agnostic send/receive, plus the sequence-number and
/// counter bookkeeping every concrete port implementation shares.
pub trait Port: Send + Sync {
    fn send(&mut self, message: &Message) -> Result<()>;
    fn receive(&mut self) -> Result<Message>;
    fn is_connected(&self) -> bool;
    fn capabilities(&self) -> ChannelCapabilities;
}

struct PortCounters {
    last_sequence: u8,
    messages_sent: u64,
    messages_received: u64,
}

impl PortCounters {
    fn new() -> Self {
        PortCounters {
            last_sequence: 0,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    fn check_sequence(&mut self, incoming: u8) -> Result<()> {
        if incoming != self.last_sequence {
            return Err(Error::network(
                NetworkErrorKind::SequenceMismatch,
                format!("expected sequence {}, got {incoming}", self.last_sequence),
            ));
        }
        self.last_sequence = self.last_sequence.wrapping_add(1);
        Ok(())
    }
}

/// Same-process loopback port, backed by a pair of channels. Used by
/// tests that exercise the dispatch layer without a real socket.
pub struct LocalPort {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    counters: PortCounters,
}

impl LocalPort {
    pub fn pair() -> (LocalPort, LocalPort) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            LocalPort {
                tx: tx_a,
                rx: rx_b,
                counters: PortCounters::new(),
            },
            LocalPort {
                tx: tx_b,
                rx: rx_a,
                counters: PortCounters::new(),
            },
        )
    }
}

impl Port for LocalPort {
    fn send(&mut self, message: &Message) -> Result<()> {
        self.counters.messages_sent += 1;
        self.tx
            .send(message.clone())
            .map_err(|_| Error::network(NetworkErrorKind::ConnectionClosed, "peer dropped"))
    }

    fn receive(&mut self) -> Result<Message> {
        let message = self
            .rx
            .blocking_recv()
            .ok_or_else(|| Error::network(NetworkErrorKind::ConnectionClosed, "peer dropped"))?;
        self.counters.check_sequence(message.sequence_number)?;
        self.counters.messages_received += 1;
        Ok(message)
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::HANDLE_TRANSFER
    }
}

/// Async TCP transport. Unlike `Port`, this is driven from an async
/// context directly rather than through the blocking `Port` trait,
/// since the server's accept loop is built on `tokio`.
pub struct TcpPort {
    stream: TcpStream,
    counters: PortCounters,
}

impl TcpPort {
    pub fn new(stream: TcpStream) -> Self {
        TcpPort {
            stream,
            counters: PortCounters::new(),
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = message.encode();
        self.stream.write_all(&bytes).await.map_err(io_err)?;
        self.counters.messages_sent += 1;
        Ok(())
    }

    pub async fn receive(&mut self) -> Result<Message> {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header).await.map_err(io_err)?;
        let (sequence_number, payload_type, flags, code_or_status, parameter0) =
            Message::decode_header(&header)?;
        self.counters.check_sequence(sequence_number)?;

        let payload = match payload_type {
            PayloadType::Embedded => {
                let parameter1 = self.stream.read_u64_le().await.map_err(io_err)?;
                Payload::Embedded { parameter1 }
            }
            PayloadType::Data => {
                let parameter1 = self.stream.read_u32_le().await.map_err(io_err)?;
                let len = self.stream.read_u32_le().await.map_err(io_err)? as usize;
                let mut bytes = vec![0u8; len];
                self.stream.read_exact(&mut bytes).await.map_err(io_err)?;
                Payload::Data { parameter1, bytes }
            }
            PayloadType::Handles => {
                let parameter1 = self.stream.read_u32_le().await.map_err(io_err)?;
                let count = self.stream.read_u32_le().await.map_err(io_err)? as usize;
                let mut handles = Vec::with_capacity(count);
                for _ in 0..count {
                    handles.push(self.stream.read_u64_le().await.map_err(io_err)?);
                }
                Payload::Handles { parameter1, handles }
            }
        };

        self.counters.messages_received += 1;
        Ok(Message {
            sequence_number,
            flags,
            control_code_or_status: code_or_status,
            parameter0,
            payload,
        })
    }

    pub fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_message_round_trips_through_encode_decode_header() {
        let msg = Message::request(0, 0x0010, 7, Payload::Embedded { parameter1: 42 });
        let bytes = msg.encode();
        let (seq, ty, flags, code, param0) = Message::decode_header(&bytes).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(ty, PayloadType::Embedded);
        assert_eq!(flags, MessageFlags::NONE);
        assert_eq!(code, 0x0010);
        assert_eq!(param0, 7);
    }

    #[test]
    fn local_port_rejects_sequence_mismatch() {
        let (mut a, mut b) = LocalPort::pair();
        let mut bad = Message::request(5, 0x0000, 0, Payload::Embedded { parameter1: 0 });
        bad.sequence_number = 5;
        a.send(&bad).unwrap();
        let err = b.receive().unwrap_err();
        assert!(matches!(
            err,
            Error::Network { kind: NetworkErrorKind::SequenceMismatch, .. }
        ));
    }

    #[test]
    fn local_port_accepts_in_order_sequence() {
        let (mut a, mut b) = LocalPort::pair();
        let msg = Message::request(0, 0x0000, 0, Payload::Embedded { parameter1: 0 });
        a.send(&msg).unwrap();
        let received = b.receive().unwrap();
        assert_eq!(received.control_code_or_status, 0x0000);
    }

    #[test]
    fn message_test_checks_payload_type_and_length() {
        let msg = Message::request(
            0,
            0x0030,
            0,
            Payload::Data {
                parameter1: 0,
                bytes: vec![0u8; 16],
            },
        );
        assert!(msg.test(PayloadType::Data, Some(16)));
        assert!(!msg.test(PayloadType::Data, Some(8)));
        assert!(!msg.test(PayloadType::Embedded, None));
    }
}

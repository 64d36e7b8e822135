//! 패킷 코덱
//!
//! 모든 데이터그램은 16바이트 헤더 (32비트 워드 4개, 빅엔디안) 로 시작한다.
//!
//! ```text
//! 컨트롤 패킷
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1|        Type (15)            |        Reserved (0)           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Additional Info                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Timestamp (us)                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Destination Socket ID                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! 데이터 패킷
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0|                 Sequence Number (31)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |FF |O|              Message Number (29)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Timestamp (us)                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Destination Socket ID                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ACK 패킷은 선택 필드 유무에 따라 두 가지 길이를 가지며, 디코딩 시
//! 버퍼 길이로 레이아웃을 결정한다.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::sequence::{MessageNumber, SequenceNumber};
use crate::{Error, Result};

/// 공통 헤더 크기
pub const HEADER_SIZE: usize = 16;

/// 컨트롤 패킷 표시 비트
pub const CONTROL_FLAG: u32 = 0x8000_0000;

/// NAK 범위 시작 표시 비트
const LOSS_RANGE_FLAG: u32 = 0x8000_0000;

/// 소켓 타입 (메시지 단위 전송)
pub const SOCKET_TYPE_DATAGRAM: u32 = 2;

/// 디코딩 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("버퍼가 너무 짧음: {len} bytes")]
    TooShort { len: usize },

    #[error("알 수 없는 컨트롤 타입: {0}")]
    UnknownControlType(u16),

    #[error("{kind} 패킷 길이 불일치: {len} bytes")]
    InvalidLength { kind: &'static str, len: usize },

    #[error("예약 필드가 0이 아님")]
    ReservedBitsSet,

    #[error("유효하지 않은 필드: {0}")]
    InvalidField(&'static str),

    #[error("패킷 타입 불일치: expected {expected}")]
    TypeMismatch { expected: &'static str },
}

/// 컨트롤 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlType {
    Handshake = 0,
    KeepAlive = 1,
    Ack = 2,
    Nak = 3,
    Shutdown = 5,
    AckOfAck = 6,
}

impl ControlType {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Handshake),
            1 => Some(Self::KeepAlive),
            2 => Some(Self::Ack),
            3 => Some(Self::Nak),
            5 => Some(Self::Shutdown),
            6 => Some(Self::AckOfAck),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::KeepAlive => "keep-alive",
            Self::Ack => "ack",
            Self::Nak => "nak",
            Self::Shutdown => "shutdown",
            Self::AckOfAck => "ack-of-ack",
        }
    }

    /// 타입별 길이 검사
    fn accepts_len(self, len: usize) -> bool {
        match self {
            Self::Handshake => len == HandshakePacket::PACKET_SIZE,
            Self::KeepAlive | Self::Shutdown | Self::AckOfAck => len == HEADER_SIZE,
            Self::Ack => len == AckPacket::PACKET_SIZE || len == AckPacket::OPTIONAL_PACKET_SIZE,
            Self::Nak => len > HEADER_SIZE && (len - HEADER_SIZE) % 4 == 0,
        }
    }
}

/// 컨트롤 패킷 공통 헤더 (타입/부가정보 제외)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlHeader {
    /// 송신측 기준 타임스탬프 (마이크로초)
    pub timestamp: u32,

    /// 수신측 소켓 ID
    pub destination_socket_id: u32,
}

impl ControlHeader {
    pub fn new(timestamp: u32, destination_socket_id: u32) -> Self {
        Self {
            timestamp,
            destination_socket_id,
        }
    }

    fn put(&self, buf: &mut impl BufMut, control_type: ControlType, additional_info: u32) {
        buf.put_u32(CONTROL_FLAG | ((control_type as u32) << 16));
        buf.put_u32(additional_info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.destination_socket_id);
    }
}

/// 헤더 파싱 결과
struct RawControl<'a> {
    control_type: ControlType,
    additional_info: u32,
    header: ControlHeader,
    body: &'a [u8],
}

fn parse_control(buffer: &[u8]) -> std::result::Result<RawControl<'_>, DecodeError> {
    if buffer.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort { len: buffer.len() });
    }

    let mut cursor = buffer;
    let first = cursor.get_u32();
    if first & CONTROL_FLAG == 0 {
        return Err(DecodeError::TypeMismatch { expected: "control" });
    }
    if first & 0xFFFF != 0 {
        return Err(DecodeError::ReservedBitsSet);
    }

    let code = ((first & !CONTROL_FLAG) >> 16) as u16;
    let control_type = ControlType::from_code(code).ok_or(DecodeError::UnknownControlType(code))?;
    if !control_type.accepts_len(buffer.len()) {
        return Err(DecodeError::InvalidLength {
            kind: control_type.name(),
            len: buffer.len(),
        });
    }

    let additional_info = cursor.get_u32();
    let timestamp = cursor.get_u32();
    let destination_socket_id = cursor.get_u32();

    Ok(RawControl {
        control_type,
        additional_info,
        header: ControlHeader::new(timestamp, destination_socket_id),
        body: cursor,
    })
}

fn expect_type(
    raw: &RawControl<'_>,
    control_type: ControlType,
) -> std::result::Result<(), DecodeError> {
    if raw.control_type != control_type {
        return Err(DecodeError::TypeMismatch {
            expected: control_type.name(),
        });
    }
    Ok(())
}

fn expect_no_additional_info(raw: &RawControl<'_>) -> std::result::Result<(), DecodeError> {
    if raw.additional_info != 0 {
        return Err(DecodeError::ReservedBitsSet);
    }
    Ok(())
}

fn get_sequence(buf: &mut &[u8]) -> std::result::Result<SequenceNumber, DecodeError> {
    let value = buf.get_u32();
    if value > SequenceNumber::MAX {
        return Err(DecodeError::InvalidField("sequence number"));
    }
    Ok(SequenceNumber::new(value))
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// 핸드쉐이크 연결 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Request,
    Response,
}

impl ConnectionType {
    const REQUEST: u32 = 1;
    const RESPONSE: u32 = 0xFFFF_FFFF; // -1

    fn to_wire(self) -> u32 {
        match self {
            Self::Request => Self::REQUEST,
            Self::Response => Self::RESPONSE,
        }
    }

    fn from_wire(value: u32) -> Option<Self> {
        match value {
            Self::REQUEST => Some(Self::Request),
            Self::RESPONSE => Some(Self::Response),
            _ => None,
        }
    }
}

/// 핸드쉐이크 peer address 의 주소 체계 (포트 뒤 16비트)
const ADDRESS_FAMILY_V4: u16 = 4;
const ADDRESS_FAMILY_V6: u16 = 6;

/// 핸드쉐이크 패킷
///
/// `peer_endpoint` 는 송신자가 바라본 수신자의 주소이며, 수신자는 이를
/// 자신의 외부 (NAT 매핑) 주소로 사용한다. IPv4 주소는 IPv4-mapped IPv6
/// 형식으로 기록되고, 포트 뒤 16비트에 주소 체계 (4/6) 를 남겨 원래
/// 변형으로 복원한다. IPv6 flowinfo / scope id 는 로컬 링크 정보라 싣지 않는다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub header: ControlHeader,
    pub version: u32,
    pub socket_type: u32,
    pub initial_sequence_number: SequenceNumber,
    pub maximum_packet_size: u32,
    pub maximum_flow_window_size: u32,
    pub connection_type: ConnectionType,
    pub socket_id: u32,
    pub syn_cookie: u32,
    pub peer_endpoint: SocketAddr,
}

impl HandshakePacket {
    pub const PACKET_SIZE: usize = HEADER_SIZE + 52;

    pub fn is_valid(buffer: &[u8]) -> bool {
        matches!(parse_control(buffer), Ok(raw) if raw.control_type == ControlType::Handshake)
    }

    pub fn decode(buffer: &[u8]) -> std::result::Result<Self, DecodeError> {
        let raw = parse_control(buffer)?;
        expect_type(&raw, ControlType::Handshake)?;
        expect_no_additional_info(&raw)?;

        let mut body = raw.body;
        let version = body.get_u32();
        let socket_type = body.get_u32();
        let initial_sequence_number = get_sequence(&mut body)?;
        let maximum_packet_size = body.get_u32();
        let maximum_flow_window_size = body.get_u32();
        let connection_type = ConnectionType::from_wire(body.get_u32())
            .ok_or(DecodeError::InvalidField("connection type"))?;
        let socket_id = body.get_u32();
        let syn_cookie = body.get_u32();

        let mut octets = [0u8; 16];
        body.copy_to_slice(&mut octets);
        let port = body.get_u16();

        let ip = Ipv6Addr::from(octets);
        let ip = match body.get_u16() {
            ADDRESS_FAMILY_V4 => IpAddr::V4(
                ip.to_ipv4_mapped()
                    .ok_or(DecodeError::InvalidField("ipv4 peer address"))?,
            ),
            ADDRESS_FAMILY_V6 => IpAddr::V6(ip),
            _ => return Err(DecodeError::InvalidField("address family")),
        };

        Ok(Self {
            header: raw.header,
            version,
            socket_type,
            initial_sequence_number,
            maximum_packet_size,
            maximum_flow_window_size,
            connection_type,
            socket_id,
            syn_cookie,
            peer_endpoint: SocketAddr::new(ip, port),
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> usize {
        self.header.put(buf, ControlType::Handshake, 0);
        buf.put_u32(self.version);
        buf.put_u32(self.socket_type);
        buf.put_u32(self.initial_sequence_number.value());
        buf.put_u32(self.maximum_packet_size);
        buf.put_u32(self.maximum_flow_window_size);
        buf.put_u32(self.connection_type.to_wire());
        buf.put_u32(self.socket_id);
        buf.put_u32(self.syn_cookie);

        let (octets, family) = match self.peer_endpoint.ip() {
            IpAddr::V4(v4) => (v4.to_ipv6_mapped().octets(), ADDRESS_FAMILY_V4),
            IpAddr::V6(v6) => (v6.octets(), ADDRESS_FAMILY_V6),
        };
        buf.put_slice(&octets);
        buf.put_u16(self.peer_endpoint.port());
        buf.put_u16(family);
        Self::PACKET_SIZE
    }
}

// ---------------------------------------------------------------------------
// Ack
// ---------------------------------------------------------------------------

/// ACK 선택 필드 (수신측 성능 샘플)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckStatistics {
    /// RTT (마이크로초)
    pub round_trip_time: u32,

    /// RTT 분산 (마이크로초)
    pub round_trip_time_variance: u32,

    /// 수신 가용 버퍼 (패킷 수)
    pub available_buffer_size: u32,

    /// 수신률 (패킷/초)
    pub packets_receiving_rate: u32,

    /// 링크 용량 추정 (패킷/초)
    pub estimated_link_capacity: u32,
}

/// ACK 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPacket {
    pub header: ControlHeader,

    /// ACK 자체의 일련번호 (ACK-of-ACK 매칭용, 부가정보 필드)
    pub ack_sequence_number: u32,

    /// 연속 수신이 확인된 최고 시퀀스 번호
    pub packet_sequence_number: SequenceNumber,

    pub optional: Option<AckStatistics>,
}

impl AckPacket {
    pub const PACKET_SIZE: usize = HEADER_SIZE + 4;
    pub const OPTIONAL_PACKET_SIZE: usize = HEADER_SIZE + 24;

    pub fn has_optional_fields(&self) -> bool {
        self.optional.is_some()
    }

    pub fn is_valid(buffer: &[u8]) -> bool {
        matches!(parse_control(buffer), Ok(raw) if raw.control_type == ControlType::Ack)
    }

    pub fn decode(buffer: &[u8]) -> std::result::Result<Self, DecodeError> {
        let raw = parse_control(buffer)?;
        expect_type(&raw, ControlType::Ack)?;

        let mut body = raw.body;
        let packet_sequence_number = get_sequence(&mut body)?;
        let optional = if buffer.len() == Self::OPTIONAL_PACKET_SIZE {
            Some(AckStatistics {
                round_trip_time: body.get_u32(),
                round_trip_time_variance: body.get_u32(),
                available_buffer_size: body.get_u32(),
                packets_receiving_rate: body.get_u32(),
                estimated_link_capacity: body.get_u32(),
            })
        } else {
            None
        };

        Ok(Self {
            header: raw.header,
            ack_sequence_number: raw.additional_info,
            packet_sequence_number,
            optional,
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> usize {
        self.header.put(buf, ControlType::Ack, self.ack_sequence_number);
        buf.put_u32(self.packet_sequence_number.value());
        match &self.optional {
            Some(stats) => {
                buf.put_u32(stats.round_trip_time);
                buf.put_u32(stats.round_trip_time_variance);
                buf.put_u32(stats.available_buffer_size);
                buf.put_u32(stats.packets_receiving_rate);
                buf.put_u32(stats.estimated_link_capacity);
                Self::OPTIONAL_PACKET_SIZE
            }
            None => Self::PACKET_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Nak
// ---------------------------------------------------------------------------

/// 손실 구간 (양끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossRange {
    pub first: SequenceNumber,
    pub last: SequenceNumber,
}

impl LossRange {
    pub fn single(seq: SequenceNumber) -> Self {
        Self {
            first: seq,
            last: seq,
        }
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        !self.first.is_after(seq) && seq.is_at_or_before(self.last)
    }
}

/// NAK 패킷 (누락 시퀀스 보고)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPacket {
    pub header: ControlHeader,
    pub losses: Vec<LossRange>,
}

impl NakPacket {
    pub fn is_valid(buffer: &[u8]) -> bool {
        matches!(parse_control(buffer), Ok(raw) if raw.control_type == ControlType::Nak)
    }

    /// 누락 시퀀스 포함 여부
    pub fn contains(&self, seq: SequenceNumber) -> bool {
        self.losses.iter().any(|range| range.contains(seq))
    }

    pub fn decode(buffer: &[u8]) -> std::result::Result<Self, DecodeError> {
        let raw = parse_control(buffer)?;
        expect_type(&raw, ControlType::Nak)?;
        expect_no_additional_info(&raw)?;

        let mut body = raw.body;
        let mut losses = Vec::with_capacity(body.len() / 4);
        while body.has_remaining() {
            let word = body.get_u32();
            if word & LOSS_RANGE_FLAG != 0 {
                if !body.has_remaining() {
                    return Err(DecodeError::InvalidField("unterminated loss range"));
                }
                let first = SequenceNumber::new(word & !LOSS_RANGE_FLAG);
                let last = get_sequence(&mut body)?;
                losses.push(LossRange { first, last });
            } else {
                losses.push(LossRange::single(SequenceNumber::new(word)));
            }
        }

        Ok(Self {
            header: raw.header,
            losses,
        })
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + self
                .losses
                .iter()
                .map(|range| if range.first == range.last { 4 } else { 8 })
                .sum::<usize>()
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> usize {
        self.header.put(buf, ControlType::Nak, 0);
        for range in &self.losses {
            if range.first == range.last {
                buf.put_u32(range.first.value());
            } else {
                buf.put_u32(range.first.value() | LOSS_RANGE_FLAG);
                buf.put_u32(range.last.value());
            }
        }
        self.encoded_len()
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// 메시지 내 패킷 위치
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePosition {
    First,
    Middle,
    Last,
    Solo,
}

impl MessagePosition {
    fn to_bits(self) -> u32 {
        match self {
            Self::First => 0b10,
            Self::Middle => 0b00,
            Self::Last => 0b01,
            Self::Solo => 0b11,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b10 => Self::First,
            0b01 => Self::Last,
            0b11 => Self::Solo,
            _ => Self::Middle,
        }
    }

    pub fn is_first(self) -> bool {
        matches!(self, Self::First | Self::Solo)
    }

    pub fn is_last(self) -> bool {
        matches!(self, Self::Last | Self::Solo)
    }
}

/// 데이터 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sequence_number: SequenceNumber,
    pub position: MessagePosition,
    pub in_order: bool,
    pub message_number: MessageNumber,
    pub timestamp: u32,
    pub destination_socket_id: u32,
    pub payload: Bytes,
}

impl DataPacket {
    pub fn is_valid(buffer: &[u8]) -> bool {
        buffer.len() >= HEADER_SIZE && buffer[0] & 0x80 == 0
    }

    pub fn decode(buffer: &[u8]) -> std::result::Result<Self, DecodeError> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort { len: buffer.len() });
        }

        let mut cursor = buffer;
        let first = cursor.get_u32();
        if first & CONTROL_FLAG != 0 {
            return Err(DecodeError::TypeMismatch { expected: "data" });
        }
        let second = cursor.get_u32();
        let timestamp = cursor.get_u32();
        let destination_socket_id = cursor.get_u32();

        Ok(Self {
            sequence_number: SequenceNumber::new(first),
            position: MessagePosition::from_bits(second >> 30),
            in_order: second & (1 << 29) != 0,
            message_number: MessageNumber::new(second),
            timestamp,
            destination_socket_id,
            payload: Bytes::copy_from_slice(cursor),
        })
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> usize {
        buf.put_u32(self.sequence_number.value());
        let mut second = (self.position.to_bits() << 30) | self.message_number.value();
        if self.in_order {
            second |= 1 << 29;
        }
        buf.put_u32(second);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.destination_socket_id);
        buf.put_slice(&self.payload);
        self.encoded_len()
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// 통합 패킷 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(HandshakePacket),
    KeepAlive(ControlHeader),
    Ack(AckPacket),
    Nak(NakPacket),
    Shutdown(ControlHeader),
    AckOfAck {
        header: ControlHeader,
        ack_sequence_number: u32,
    },
    Data(DataPacket),
}

/// 전체 디코딩 없이 구조 검사 (최소 길이, 타입 태그, 타입별 길이)
pub fn is_valid(buffer: &[u8]) -> bool {
    if buffer.len() < HEADER_SIZE {
        return false;
    }
    let first = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    if first & CONTROL_FLAG == 0 {
        return true;
    }
    match ControlType::from_code(((first & !CONTROL_FLAG) >> 16) as u16) {
        Some(control_type) => first & 0xFFFF == 0 && control_type.accepts_len(buffer.len()),
        None => false,
    }
}

/// 헤더에서 수신 소켓 ID만 읽음 (디스패치용)
pub fn destination_socket_id(buffer: &[u8]) -> Option<u32> {
    if buffer.len() < HEADER_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([buffer[12], buffer[13], buffer[14], buffer[15]]))
}

/// 컨트롤 패킷 여부
pub fn is_control(buffer: &[u8]) -> bool {
    buffer.first().map_or(false, |b| b & 0x80 != 0)
}

impl Packet {
    pub fn decode(buffer: &[u8]) -> std::result::Result<Self, DecodeError> {
        if buffer.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort { len: buffer.len() });
        }
        if !is_control(buffer) {
            return DataPacket::decode(buffer).map(Packet::Data);
        }

        let raw = parse_control(buffer)?;
        match raw.control_type {
            ControlType::Handshake => HandshakePacket::decode(buffer).map(Packet::Handshake),
            ControlType::Ack => AckPacket::decode(buffer).map(Packet::Ack),
            ControlType::Nak => NakPacket::decode(buffer).map(Packet::Nak),
            ControlType::KeepAlive => {
                expect_no_additional_info(&raw)?;
                Ok(Packet::KeepAlive(raw.header))
            }
            ControlType::Shutdown => {
                expect_no_additional_info(&raw)?;
                Ok(Packet::Shutdown(raw.header))
            }
            ControlType::AckOfAck => Ok(Packet::AckOfAck {
                header: raw.header,
                ack_sequence_number: raw.additional_info,
            }),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Handshake(_) => HandshakePacket::PACKET_SIZE,
            Packet::Ack(ack) if ack.has_optional_fields() => AckPacket::OPTIONAL_PACKET_SIZE,
            Packet::Ack(_) => AckPacket::PACKET_SIZE,
            Packet::Nak(nak) => nak.encoded_len(),
            Packet::KeepAlive(_) | Packet::Shutdown(_) | Packet::AckOfAck { .. } => HEADER_SIZE,
            Packet::Data(data) => data.encoded_len(),
        }
    }

    /// 정규 레이아웃으로 기록하고 기록한 바이트 수를 반환
    pub fn encode(&self, buf: &mut impl BufMut) -> usize {
        match self {
            Packet::Handshake(p) => p.encode(buf),
            Packet::Ack(p) => p.encode(buf),
            Packet::Nak(p) => p.encode(buf),
            Packet::KeepAlive(header) => {
                header.put(buf, ControlType::KeepAlive, 0);
                HEADER_SIZE
            }
            Packet::Shutdown(header) => {
                header.put(buf, ControlType::Shutdown, 0);
                HEADER_SIZE
            }
            Packet::AckOfAck {
                header,
                ack_sequence_number,
            } => {
                header.put(buf, ControlType::AckOfAck, *ack_sequence_number);
                HEADER_SIZE
            }
            Packet::Data(p) => p.encode(buf),
        }
    }

    /// 고정 크기 버퍼에 기록
    pub fn encode_to_slice(&self, out: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if out.len() < len {
            return Err(Error::BufferOverflow { max_size: out.len() });
        }
        let mut cursor = &mut out[..len];
        Ok(self.encode(&mut cursor))
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// 수신 소켓 ID
    pub fn destination_socket_id(&self) -> u32 {
        match self {
            Packet::Handshake(p) => p.header.destination_socket_id,
            Packet::Ack(p) => p.header.destination_socket_id,
            Packet::Nak(p) => p.header.destination_socket_id,
            Packet::KeepAlive(h) | Packet::Shutdown(h) => h.destination_socket_id,
            Packet::AckOfAck { header, .. } => header.destination_socket_id,
            Packet::Data(p) => p.destination_socket_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ControlHeader {
        ControlHeader::new(123_456, 0xDEAD_BEEF)
    }

    fn handshake(peer: &str) -> HandshakePacket {
        HandshakePacket {
            header: header(),
            version: crate::PROTOCOL_VERSION,
            socket_type: SOCKET_TYPE_DATAGRAM,
            initial_sequence_number: SequenceNumber::new(0x7FFF_FFF0),
            maximum_packet_size: 1472,
            maximum_flow_window_size: 8192,
            connection_type: ConnectionType::Response,
            socket_id: 42,
            syn_cookie: 7,
            peer_endpoint: peer.parse().unwrap(),
        }
    }

    fn ack(optional: bool) -> AckPacket {
        AckPacket {
            header: header(),
            ack_sequence_number: 9,
            packet_sequence_number: SequenceNumber::new(1000),
            optional: optional.then_some(AckStatistics {
                round_trip_time: 20_000,
                round_trip_time_variance: 5_000,
                available_buffer_size: 4096,
                packets_receiving_rate: 10_000,
                estimated_link_capacity: 80_000,
            }),
        }
    }

    #[test]
    fn test_packet_round_trip() {
        let packets = vec![
            Packet::Handshake(handshake("192.168.1.20:5483")),
            Packet::Handshake(handshake("[2001:db8::7]:9000")),
            Packet::Ack(ack(false)),
            Packet::Ack(ack(true)),
            Packet::Nak(NakPacket {
                header: header(),
                losses: vec![
                    LossRange::single(SequenceNumber::new(5)),
                    LossRange {
                        first: SequenceNumber::new(8),
                        last: SequenceNumber::new(12),
                    },
                ],
            }),
            Packet::KeepAlive(header()),
            Packet::Shutdown(header()),
            Packet::AckOfAck {
                header: header(),
                ack_sequence_number: 77,
            },
            Packet::Data(DataPacket {
                sequence_number: SequenceNumber::new(SequenceNumber::MAX),
                position: MessagePosition::First,
                in_order: true,
                message_number: MessageNumber::new(MessageNumber::MAX),
                timestamp: 1,
                destination_socket_id: 2,
                payload: Bytes::from_static(b"hello"),
            }),
        ];

        for packet in packets {
            let bytes = packet.to_bytes();
            assert_eq!(bytes.len(), packet.encoded_len());
            assert!(is_valid(&bytes), "{:?}", packet);
            assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn test_ack_layout_from_length() {
        let short = Packet::Ack(ack(false)).to_bytes();
        let long = Packet::Ack(ack(true)).to_bytes();
        assert_eq!(short.len(), AckPacket::PACKET_SIZE);
        assert_eq!(long.len(), AckPacket::OPTIONAL_PACKET_SIZE);

        assert!(!AckPacket::decode(&short).unwrap().has_optional_fields());
        assert!(AckPacket::decode(&long).unwrap().has_optional_fields());

        // 중간 길이는 어떤 레이아웃에도 맞지 않음
        let truncated = &long[..AckPacket::PACKET_SIZE + 8];
        assert!(!AckPacket::is_valid(truncated));
        assert!(matches!(
            AckPacket::decode(truncated),
            Err(DecodeError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_short_buffers_rejected() {
        let bytes = Packet::Handshake(handshake("10.0.0.1:1")).to_bytes();
        for len in 0..HEADER_SIZE {
            assert!(!is_valid(&bytes[..len]));
            assert_eq!(
                Packet::decode(&bytes[..len]),
                Err(DecodeError::TooShort { len })
            );
        }
        assert!(destination_socket_id(&bytes[..3]).is_none());
    }

    #[test]
    fn test_unknown_type_and_reserved_bits() {
        let mut bytes = Packet::KeepAlive(header()).to_bytes().to_vec();
        bytes[1] = 0x7F; // 타입 0x7F00 부근
        assert!(!is_valid(&bytes));
        assert!(matches!(
            Packet::decode(&bytes),
            Err(DecodeError::UnknownControlType(_))
        ));

        let mut bytes = Packet::Shutdown(header()).to_bytes().to_vec();
        bytes[3] = 1;
        assert_eq!(Packet::decode(&bytes), Err(DecodeError::ReservedBitsSet));

        let mut bytes = Packet::Handshake(handshake("10.0.0.1:1")).to_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 1;
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::InvalidField("address family"))
        );

        // IPv4 로 표시됐지만 매핑 주소가 아님
        let mut bytes = Packet::Handshake(handshake("[2001:db8::7]:9000")).to_bytes().to_vec();
        bytes[last] = 4;
        assert_eq!(
            Packet::decode(&bytes),
            Err(DecodeError::InvalidField("ipv4 peer address"))
        );
    }

    #[test]
    fn test_handshake_keeps_address_family() {
        // 듀얼 스택 소켓이 보고하는 IPv4 매핑 주소는 IPv6 그대로 유지
        for peer in ["[::ffff:127.0.0.1]:5000", "127.0.0.1:5000", "[::1]:5000"] {
            let packet = handshake(peer);
            let bytes = Packet::Handshake(packet.clone()).to_bytes();
            let decoded = HandshakePacket::decode(&bytes).unwrap();
            assert_eq!(decoded, packet);
            assert_eq!(decoded.peer_endpoint.is_ipv6(), packet.peer_endpoint.is_ipv6());
        }
    }

    #[test]
    fn test_nak_unterminated_range() {
        let mut buf = BytesMut::new();
        header().put(&mut buf, ControlType::Nak, 0);
        buf.put_u32(5 | LOSS_RANGE_FLAG);
        assert!(matches!(
            NakPacket::decode(&buf),
            Err(DecodeError::InvalidField(_))
        ));
    }

    #[test]
    fn test_nak_contains_wraps() {
        let nak = NakPacket {
            header: header(),
            losses: vec![LossRange {
                first: SequenceNumber::new(SequenceNumber::MAX - 1),
                last: SequenceNumber::new(2),
            }],
        };
        assert!(nak.contains(SequenceNumber::new(SequenceNumber::MAX)));
        assert!(nak.contains(SequenceNumber::new(0)));
        assert!(nak.contains(SequenceNumber::new(2)));
        assert!(!nak.contains(SequenceNumber::new(3)));
    }

    #[test]
    fn test_encode_to_slice() {
        let packet = Packet::Ack(ack(true));
        let mut small = [0u8; 20];
        assert!(packet.encode_to_slice(&mut small).is_err());

        let mut buf = [0u8; 64];
        let written = packet.encode_to_slice(&mut buf).unwrap();
        assert_eq!(written, AckPacket::OPTIONAL_PACKET_SIZE);
        assert_eq!(Packet::decode(&buf[..written]).unwrap(), packet);
        assert_eq!(destination_socket_id(&buf), Some(0xDEAD_BEEF));
    }

    #[test]
    fn test_typed_decode_mismatch() {
        let bytes = Packet::KeepAlive(header()).to_bytes();
        assert_eq!(
            AckPacket::decode(&bytes),
            Err(DecodeError::TypeMismatch { expected: "ack" })
        );
        assert!(!HandshakePacket::is_valid(&bytes));
    }
}

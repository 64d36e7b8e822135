//! 피어
//!
//! 세션 하나와 혼잡 제어기, 송신 큐, 재전송 버퍼, 재조립 버퍼를 묶는다.
//!
//! - 송신: 메시지를 데이터 패킷으로 분할해 큐에 넣고 혼잡 윈도우 안에서 전송
//! - 수신: 순서대로 전달, 순서가 어긋난 패킷은 흐름 윈도우 안에서 보관
//! - ACK: 주기적 전체 ACK (선택 필드 포함) 와 수신 패킷 수 기준 빠른 ACK
//! - NAK: 공백 발견 즉시, 공백이 남아 있으면 RTO 마다 반복
//!
//! 모든 메서드는 동기이며 호출 시각을 인자로 받는다. 수신 경로와 타이머
//! 경로의 직렬화는 호출자 (매니저의 피어별 뮤텍스) 가 담당한다.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, trace};

use crate::congestion::CongestionControl;
use crate::multiplexer::Outbound;
use crate::packet::{
    AckPacket, AckStatistics, ControlHeader, DataPacket, HandshakePacket, LossRange,
    MessagePosition, NakPacket, Packet, HEADER_SIZE,
};
use crate::sequence::{MessageNumber, SequenceNumber};
use crate::session::{HandshakeOutcome, Mode, Session, SocketId};
use crate::stats::{PeerStats, ReceiveStats};
use crate::{Config, Error, Result};

/// 수신률 측정 윈도우 (패킷 수)
const ARRIVAL_WINDOW: usize = 64;

/// ACK-of-ACK 를 기다리는 ACK 최대 수
const MAX_PENDING_ACKS: usize = 64;

/// 재전송 타임아웃 지수 백오프 상한 (2^4 배)
const MAX_BACKOFF_SHIFT: u32 = 4;

/// 데이터그램 처리 결과
#[derive(Debug, Default)]
pub struct Incoming {
    /// 완성된 메시지 (전송 순서)
    pub messages: Vec<Bytes>,

    /// 이번 데이터그램으로 연결이 성립했는지
    pub connected: bool,

    /// 상대가 연결을 종료했는지
    pub closed: bool,

    /// 상대가 바라본 우리 쪽 주소 (핸드쉐이크)
    pub observed_endpoint: Option<SocketAddr>,
}

/// 연결 끊김 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    HandshakeTimeout,
    RetransmitLimit,
    Inactivity,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HandshakeTimeout => write!(f, "핸드쉐이크 타임아웃"),
            Self::RetransmitLimit => write!(f, "재전송 한도 초과"),
            Self::Inactivity => write!(f, "수신 없음"),
        }
    }
}

/// 타이머 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Lost(LossReason),
}

/// 재전송 버퍼 항목
#[derive(Debug)]
struct InFlight {
    packet: DataPacket,
    sent_at: Instant,
    retransmits: u32,
}

/// 피어
pub struct Peer {
    config: Arc<Config>,
    session: Session,
    congestion: CongestionControl,
    outbound: Outbound,
    peer_endpoint: SocketAddr,

    /// 타임스탬프 기준 시각
    epoch: Instant,

    stats: PeerStats,
    receive_stats: ReceiveStats,

    // 송신
    next_sequence: SequenceNumber,
    next_message: MessageNumber,
    highest_sent: SequenceNumber,
    send_queue: VecDeque<DataPacket>,
    in_flight: VecDeque<InFlight>,
    consecutive_timeouts: u32,

    // 수신
    next_expected: SequenceNumber,
    highest_received: SequenceNumber,
    out_of_order: HashMap<SequenceNumber, DataPacket>,
    fragments: Vec<Bytes>,
    ack_number: u32,
    pending_acks: VecDeque<(u32, Instant)>,
    last_acked: Option<SequenceNumber>,
    ack_requested: bool,
    received_since_ack: u32,
    last_ack_at: Instant,
    last_nak_at: Instant,

    // 수명
    opened_at: Instant,
    connected_at: Option<Instant>,
    last_activity: Instant,
    last_sent_at: Instant,
    last_handshake_at: Instant,
}

impl Peer {
    pub fn new(config: Arc<Config>, peer_endpoint: SocketAddr, outbound: Outbound) -> Self {
        let now = Instant::now();
        let session = Session::new(
            peer_endpoint,
            config.max_packet_size as u32,
            config.flow_window_size,
        );

        Self {
            session,
            congestion: CongestionControl::new(&config),
            outbound,
            peer_endpoint,
            epoch: now,
            stats: PeerStats::new(),
            receive_stats: ReceiveStats::new(ARRIVAL_WINDOW),
            next_sequence: SequenceNumber::default(),
            next_message: MessageNumber::default(),
            highest_sent: SequenceNumber::default(),
            send_queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            consecutive_timeouts: 0,
            next_expected: SequenceNumber::default(),
            highest_received: SequenceNumber::default(),
            out_of_order: HashMap::new(),
            fragments: Vec::new(),
            ack_number: 0,
            pending_acks: VecDeque::new(),
            last_acked: None,
            ack_requested: false,
            received_since_ack: 0,
            last_ack_at: now,
            last_nak_at: now,
            opened_at: now,
            connected_at: None,
            last_activity: now,
            last_sent_at: now,
            last_handshake_at: now,
            config,
        }
    }

    /// 세션 열기. 클라이언트는 즉시 핸드쉐이크 요청을 보낸다.
    pub fn open(&mut self, id: SocketId, mode: Mode, now: Instant) -> Result<()> {
        self.open_with_sequence(id, mode, SequenceNumber::random(), now)
    }

    pub(crate) fn open_with_sequence(
        &mut self,
        id: SocketId,
        mode: Mode,
        initial: SequenceNumber,
        now: Instant,
    ) -> Result<()> {
        self.session.open(id, initial, mode)?;

        self.next_sequence = initial;
        self.highest_sent = initial.prev();
        self.congestion = CongestionControl::new(&self.config);
        self.congestion.set_initial_sequence(initial);
        self.consecutive_timeouts = 0;
        self.receive_stats.reset();
        self.opened_at = now;
        self.connected_at = None;
        self.last_activity = now;

        debug!(
            "세션 열기: {} (id={}, mode={:?}, isn={})",
            self.peer_endpoint, id, mode, initial
        );

        if let Some(request) = self.session.handshake_request() {
            self.send_handshake(request, now);
        }
        Ok(())
    }

    pub fn id(&self) -> Option<SocketId> {
        self.session.id()
    }

    pub fn mode(&self) -> Option<Mode> {
        self.session.mode()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn peer_endpoint(&self) -> SocketAddr {
        self.peer_endpoint
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn congestion(&self) -> &CongestionControl {
        &self.congestion
    }

    /// 확인되지 않은 패킷 수 (큐 + 재전송 버퍼)
    pub fn pending_packets(&self) -> usize {
        self.send_queue.len() + self.in_flight.len()
    }

    /// 메시지 전송
    ///
    /// 연결 전이면 큐에만 넣고, 연결되면 전송한다. 닫힌 세션은 거부한다.
    pub fn send_message(&mut self, payload: Bytes, now: Instant) -> Result<()> {
        if !self.session.is_open() {
            return Err(Error::NotConnected);
        }
        if payload.len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            });
        }

        let chunk_size = self.payload_size();
        let count = payload.len().div_ceil(chunk_size).max(1);
        let message = self.next_message;
        self.next_message = message.next();

        for index in 0..count {
            let start = index * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            let position = match (index == 0, index + 1 == count) {
                (true, true) => MessagePosition::Solo,
                (true, false) => MessagePosition::First,
                (false, true) => MessagePosition::Last,
                (false, false) => MessagePosition::Middle,
            };

            self.send_queue.push_back(DataPacket {
                sequence_number: self.next_sequence,
                position,
                in_order: true,
                message_number: message,
                timestamp: 0,
                destination_socket_id: 0,
                payload: payload.slice(start..end),
            });
            self.next_sequence = self.next_sequence.next();
        }

        trace!(
            "메시지 {} 큐 추가: {} bytes, {} packets",
            message.value(),
            payload.len(),
            count
        );

        self.flush(now);
        Ok(())
    }

    /// 수신 데이터그램 처리
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) -> Incoming {
        let mut incoming = Incoming::default();

        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("잘못된 패킷 폐기 ({}): {}", self.peer_endpoint, e);
                return incoming;
            }
        };

        match packet {
            Packet::Handshake(handshake) => self.on_handshake(&handshake, now, &mut incoming),
            other => self.on_session_packet(other, now, &mut incoming),
        }
        incoming
    }

    /// 주기 작업: 핸드쉐이크 재전송, ACK/NAK, RTO 재전송, keep-alive, 생존 확인
    pub fn on_tick(&mut self, now: Instant) -> Liveness {
        if !self.session.is_open() {
            return Liveness::Alive;
        }

        if !self.session.is_connected() {
            if now.saturating_duration_since(self.opened_at) >= self.config.connection_timeout() {
                return Liveness::Lost(LossReason::HandshakeTimeout);
            }
            if now.saturating_duration_since(self.last_handshake_at)
                >= self.config.handshake_retry_interval()
            {
                if let Some(request) = self.session.handshake_request() {
                    trace!("핸드쉐이크 재전송: {}", self.peer_endpoint);
                    self.send_handshake(request, now);
                }
            }
            return Liveness::Alive;
        }

        if now.saturating_duration_since(self.last_activity) >= self.config.connection_timeout() {
            return Liveness::Lost(LossReason::Inactivity);
        }

        let watermark = self.next_expected.prev();
        if now.saturating_duration_since(self.last_ack_at) >= self.config.ack_interval()
            && (self.last_acked != Some(watermark) || self.ack_requested)
        {
            self.send_ack(true, now);
        }

        if !self.out_of_order.is_empty()
            && now.saturating_duration_since(self.last_nak_at)
                >= self.congestion.retransmit_timeout()
        {
            let losses = self.missing_ranges();
            if !losses.is_empty() {
                self.send_nak(losses, now);
            }
        }

        if let Some(reason) = self.check_retransmit_timeout(now) {
            return Liveness::Lost(reason);
        }

        if now.saturating_duration_since(self.last_sent_at) >= self.config.keepalive_interval() {
            if let Some(remote) = self.session.remote() {
                let header = ControlHeader::new(self.timestamp(now), remote.socket_id);
                self.transmit(&Packet::KeepAlive(header), now);
            }
        }

        self.flush(now);
        Liveness::Alive
    }

    /// 상대에게 종료를 알리고 닫기
    pub fn shutdown(&mut self, now: Instant) {
        if let Some(remote) = self.session.remote() {
            let header = ControlHeader::new(self.timestamp(now), remote.socket_id);
            self.transmit(&Packet::Shutdown(header), now);
        }
        self.close();
    }

    /// 조용히 닫기
    pub fn close(&mut self) {
        if self.session.is_open() {
            debug!("세션 닫기: {} ({})", self.peer_endpoint, self.stats.summary());
        }
        self.session.close();
        self.send_queue.clear();
        self.in_flight.clear();
        self.out_of_order.clear();
        self.fragments.clear();
        self.pending_acks.clear();
        self.receive_stats.reset();
    }

    // -----------------------------------------------------------------------
    // 수신 처리
    // -----------------------------------------------------------------------

    fn on_handshake(&mut self, handshake: &HandshakePacket, now: Instant, incoming: &mut Incoming) {
        match self.session.handle_handshake(handshake) {
            HandshakeOutcome::Ignored => {}
            HandshakeOutcome::Rejected => {
                debug!(
                    "핸드쉐이크 거부 ({}): socket id {}",
                    self.peer_endpoint, handshake.socket_id
                );
            }
            HandshakeOutcome::Accepted {
                reply,
                newly_connected,
                observed_endpoint,
            } => {
                self.last_activity = now;
                if let Some(reply) = reply {
                    self.send_handshake(reply, now);
                }
                incoming.observed_endpoint = Some(observed_endpoint);
                if newly_connected {
                    self.on_connected(now);
                    incoming.connected = true;
                }
            }
        }
    }

    fn on_connected(&mut self, now: Instant) {
        let Some(remote) = self.session.remote() else {
            return;
        };

        self.congestion
            .set_peer_flow_window(remote.maximum_flow_window_size);
        self.next_expected = remote.initial_sequence_number;
        self.highest_received = remote.initial_sequence_number.prev();
        self.last_acked = Some(self.highest_received);
        self.connected_at = Some(now);
        self.last_ack_at = now;
        self.last_nak_at = now;

        info!(
            "연결 성립: {} (local id={:?}, remote id={})",
            self.peer_endpoint,
            self.session.id(),
            remote.socket_id
        );

        self.flush(now);
    }

    fn on_session_packet(&mut self, packet: Packet, now: Instant, incoming: &mut Incoming) {
        if !self.session.is_connected() {
            trace!("연결 전 패킷 무시: {}", self.peer_endpoint);
            return;
        }
        if Some(packet.destination_socket_id()) != self.session.id() {
            debug!(
                "다른 소켓 ID의 패킷 무시: {} (dest={})",
                self.peer_endpoint,
                packet.destination_socket_id()
            );
            return;
        }

        self.last_activity = now;

        match packet {
            Packet::Data(data) => self.on_data(data, now, &mut incoming.messages),
            Packet::Ack(ack) => self.on_ack(&ack, now),
            Packet::Nak(nak) => self.on_nak(&nak, now),
            Packet::AckOfAck {
                ack_sequence_number,
                ..
            } => self.on_ack_of_ack(ack_sequence_number, now),
            Packet::KeepAlive(_) => trace!("keep-alive: {}", self.peer_endpoint),
            Packet::Shutdown(_) => {
                info!("상대가 연결 종료: {}", self.peer_endpoint);
                self.close();
                incoming.closed = true;
            }
            Packet::Handshake(_) => {}
        }
    }

    fn on_data(&mut self, data: DataPacket, now: Instant, messages: &mut Vec<Bytes>) {
        let seq = data.sequence_number;
        let offset = seq.offset_from(self.next_expected);

        if offset < 0 || self.out_of_order.contains_key(&seq) {
            trace!("중복 패킷 폐기: {}", seq);
            self.stats.duplicate_packets += 1;
            self.ack_requested = true;
            return;
        }
        if offset as u32 >= self.config.flow_window_size {
            debug!("흐름 윈도우 밖 패킷 폐기: {} (expected {})", seq, self.next_expected);
            return;
        }

        self.receive_stats.record_arrival(seq, now);
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.payload.len() as u64;
        self.received_since_ack += 1;

        if seq.is_after(self.highest_received) {
            let gap_start = self.highest_received.next();
            if seq.is_after(gap_start) {
                // 새 공백은 즉시 보고
                self.send_nak(
                    vec![LossRange {
                        first: gap_start,
                        last: seq.prev(),
                    }],
                    now,
                );
            }
            self.highest_received = seq;
        }

        if offset == 0 {
            self.assemble(data, messages);
            self.next_expected = self.next_expected.next();
            while let Some(next) = self.out_of_order.remove(&self.next_expected) {
                self.assemble(next, messages);
                self.next_expected = self.next_expected.next();
            }
        } else {
            self.out_of_order.insert(seq, data);
        }

        if self.received_since_ack >= self.config.light_ack_packets {
            self.send_ack(false, now);
        }
    }

    fn assemble(&mut self, data: DataPacket, messages: &mut Vec<Bytes>) {
        if data.position.is_first() {
            if !self.fragments.is_empty() {
                debug!("미완성 메시지 폐기: {} fragments", self.fragments.len());
                self.fragments.clear();
            }
        } else if self.fragments.is_empty() {
            debug!("시작 조각 없는 패킷 폐기: {}", data.sequence_number);
            return;
        }

        let last = data.position.is_last();
        self.fragments.push(data.payload);
        if !last {
            return;
        }

        let parts = std::mem::take(&mut self.fragments);
        let message = if parts.len() == 1 {
            parts[0].clone()
        } else {
            let total = parts.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for part in &parts {
                buf.extend_from_slice(part);
            }
            buf.freeze()
        };

        self.stats.messages_delivered += 1;
        messages.push(message);
    }

    fn on_ack(&mut self, ack: &AckPacket, now: Instant) {
        self.stats.acks_received += 1;

        let watermark = ack.packet_sequence_number;
        if watermark.is_after(self.highest_sent) {
            debug!(
                "보내지 않은 시퀀스의 ACK 무시: {} (highest sent {})",
                watermark, self.highest_sent
            );
            return;
        }

        let newly_acked = self.congestion.on_ack(ack);
        while let Some(front) = self.in_flight.front() {
            if !front.packet.sequence_number.is_at_or_before(watermark) {
                break;
            }
            self.in_flight.pop_front();
        }
        if newly_acked > 0 {
            self.consecutive_timeouts = 0;
        }

        if ack.has_optional_fields() {
            if let Some(remote) = self.session.remote() {
                let reply = Packet::AckOfAck {
                    header: ControlHeader::new(self.timestamp(now), remote.socket_id),
                    ack_sequence_number: ack.ack_sequence_number,
                };
                self.transmit(&reply, now);
            }
        }

        self.flush(now);
    }

    fn on_nak(&mut self, nak: &NakPacket, now: Instant) {
        self.stats.naks_received += 1;
        self.congestion.on_nak(nak);

        let listed: Vec<usize> = self
            .in_flight
            .iter()
            .enumerate()
            .filter(|(_, entry)| nak.contains(entry.packet.sequence_number))
            .map(|(index, _)| index)
            .collect();

        debug!(
            "NAK 수신 ({}): {} ranges, {} packets 재전송",
            self.peer_endpoint,
            nak.losses.len(),
            listed.len()
        );

        for index in listed {
            self.retransmit(index, now);
        }
        self.flush(now);
    }

    fn on_ack_of_ack(&mut self, ack_number: u32, now: Instant) {
        let Some(position) = self
            .pending_acks
            .iter()
            .position(|(number, _)| *number == ack_number)
        else {
            return;
        };

        let (_, sent_at) = self.pending_acks[position];
        self.pending_acks.drain(..=position);

        let sample = now
            .saturating_duration_since(sent_at)
            .as_micros()
            .min(u32::MAX as u128) as u32;
        self.congestion.on_rtt_sample(sample);
    }

    // -----------------------------------------------------------------------
    // 송신 처리
    // -----------------------------------------------------------------------

    /// 혼잡 윈도우 안에서 큐의 패킷 전송
    fn flush(&mut self, now: Instant) {
        let Some(remote) = self.session.remote() else {
            return;
        };

        let allowed = self.congestion.allowed_in_flight();
        while self.in_flight.len() < allowed {
            let Some(mut packet) = self.send_queue.pop_front() else {
                break;
            };
            packet.destination_socket_id = remote.socket_id;
            packet.timestamp = self.timestamp(now);

            self.stats.packets_sent += 1;
            self.stats.bytes_sent += packet.payload.len() as u64;
            self.highest_sent = packet.sequence_number;
            self.transmit_bytes(encode_data(&packet), now);

            self.in_flight.push_back(InFlight {
                packet,
                sent_at: now,
                retransmits: 0,
            });
        }
    }

    fn retransmit(&mut self, index: usize, now: Instant) {
        let timestamp = self.timestamp(now);
        let Some(entry) = self.in_flight.get_mut(index) else {
            return;
        };
        entry.packet.timestamp = timestamp;
        entry.sent_at = now;
        entry.retransmits += 1;
        trace!(
            "재전송: {} (#{})",
            entry.packet.sequence_number,
            entry.retransmits
        );

        let bytes = encode_data(&entry.packet);
        self.stats.packets_sent += 1;
        self.stats.packets_retransmitted += 1;
        self.transmit_bytes(bytes, now);
    }

    /// RTO 가 지난 패킷만 재전송. 한도를 넘으면 끊김 사유 반환.
    fn check_retransmit_timeout(&mut self, now: Instant) -> Option<LossReason> {
        if self.in_flight.is_empty() {
            return None;
        }

        let backoff = 1u32 << self.consecutive_timeouts.min(MAX_BACKOFF_SHIFT);
        let rto = self.congestion.retransmit_timeout() * backoff;
        let expired: Vec<usize> = self
            .in_flight
            .iter()
            .enumerate()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= rto)
            .map(|(index, _)| index)
            .collect();

        if expired.is_empty() {
            return None;
        }

        self.consecutive_timeouts += 1;
        self.stats.timeouts += 1;
        if self.consecutive_timeouts > self.config.max_retransmits {
            return Some(LossReason::RetransmitLimit);
        }

        self.congestion.on_timeout();
        debug!(
            "재전송 타임아웃 ({}): {} packets, rto={:?}, 연속 {}회",
            self.peer_endpoint,
            expired.len(),
            rto,
            self.consecutive_timeouts
        );
        // 줄어든 윈도우는 새 패킷에만 적용, 만료된 패킷은 모두 재전송
        for index in expired {
            self.retransmit(index, now);
        }
        None
    }

    fn send_ack(&mut self, full: bool, now: Instant) {
        let Some(remote) = self.session.remote() else {
            return;
        };

        let watermark = self.next_expected.prev();
        self.ack_number = self.ack_number.wrapping_add(1);

        let optional = full.then(|| AckStatistics {
            round_trip_time: self.congestion.rtt_us,
            round_trip_time_variance: self.congestion.rtt_var_us,
            available_buffer_size: self
                .config
                .flow_window_size
                .saturating_sub(self.out_of_order.len() as u32),
            packets_receiving_rate: self.receive_stats.receiving_rate(),
            estimated_link_capacity: self.receive_stats.link_capacity(),
        });

        let ack = AckPacket {
            header: ControlHeader::new(self.timestamp(now), remote.socket_id),
            ack_sequence_number: self.ack_number,
            packet_sequence_number: watermark,
            optional,
        };

        if full {
            if self.pending_acks.len() >= MAX_PENDING_ACKS {
                self.pending_acks.pop_front();
            }
            self.pending_acks.push_back((self.ack_number, now));
            self.last_ack_at = now;
        }

        self.transmit(&Packet::Ack(ack), now);
        self.stats.acks_sent += 1;
        self.last_acked = Some(watermark);
        self.ack_requested = false;
        self.received_since_ack = 0;
    }

    fn send_nak(&mut self, mut losses: Vec<LossRange>, now: Instant) {
        let Some(remote) = self.session.remote() else {
            return;
        };

        let max_ranges = (self.config.max_packet_size.saturating_sub(HEADER_SIZE) / 8).max(1);
        losses.truncate(max_ranges);

        let nak = NakPacket {
            header: ControlHeader::new(self.timestamp(now), remote.socket_id),
            losses,
        };
        self.transmit(&Packet::Nak(nak), now);
        self.stats.naks_sent += 1;
        self.last_nak_at = now;
    }

    /// 수신 기준점부터 보관 중인 최고 시퀀스까지의 누락 구간
    fn missing_ranges(&self) -> Vec<LossRange> {
        let expected = self.next_expected;
        let mut offsets: Vec<u32> = self
            .out_of_order
            .keys()
            .map(|&seq| expected.distance_to(seq))
            .collect();
        offsets.sort_unstable();

        let mut ranges = Vec::new();
        let mut cursor = 0u32;
        for offset in offsets {
            if offset > cursor {
                ranges.push(LossRange {
                    first: expected.add(cursor),
                    last: expected.add(offset - 1),
                });
            }
            cursor = offset + 1;
        }
        ranges
    }

    fn send_handshake(&mut self, mut handshake: HandshakePacket, now: Instant) {
        handshake.header.timestamp = self.timestamp(now);
        self.transmit(&Packet::Handshake(handshake), now);
        self.last_handshake_at = now;
    }

    fn transmit(&mut self, packet: &Packet, now: Instant) {
        self.transmit_bytes(packet.to_bytes(), now);
    }

    fn transmit_bytes(&mut self, datagram: Bytes, now: Instant) {
        if let Err(e) = self.outbound.send(datagram, self.peer_endpoint) {
            debug!("송신 큐 닫힘 ({}): {}", self.peer_endpoint, e);
        }
        self.last_sent_at = now;
    }

    fn payload_size(&self) -> usize {
        let local = self.config.max_payload_size();
        let size = match self.session.remote() {
            Some(remote) => {
                local.min((remote.maximum_packet_size as usize).saturating_sub(HEADER_SIZE))
            }
            None => local,
        };
        size.max(1)
    }

    /// 피어 기준 시각 이후 마이크로초 (u32 순환)
    fn timestamp(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_micros() as u32
    }
}

fn encode_data(packet: &DataPacket) -> Bytes {
    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    packet.encode(&mut buf);
    buf.freeze()
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("peer_endpoint", &self.peer_endpoint)
            .field("state", self.session.state())
            .field("in_flight", &self.in_flight.len())
            .field("queued", &self.send_queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// 메모리 상의 두 피어 연결
    struct Link {
        a: Peer,
        b: Peer,
        to_b: UnboundedReceiver<(Bytes, SocketAddr)>,
        to_a: UnboundedReceiver<(Bytes, SocketAddr)>,
        inbox_a: Vec<Bytes>,
        inbox_b: Vec<Bytes>,
        closed_b: bool,
        now: Instant,
    }

    impl Link {
        fn new(config: Config, initial: SequenceNumber) -> Self {
            let config = Arc::new(config);
            let now = Instant::now();
            let (out_a, to_b) = Outbound::channel();
            let (out_b, to_a) = Outbound::channel();

            let mut a = Peer::new(config.clone(), addr(2), out_a);
            let mut b = Peer::new(config, addr(1), out_b);
            a.open_with_sequence(1, Mode::Client, initial, now).unwrap();
            b.open_with_sequence(2, Mode::Server, SequenceNumber::new(500), now)
                .unwrap();

            let mut link = Self {
                a,
                b,
                to_b,
                to_a,
                inbox_a: Vec::new(),
                inbox_b: Vec::new(),
                closed_b: false,
                now,
            };
            link.pump();
            assert!(link.a.is_connected());
            assert!(link.b.is_connected());
            link
        }

        fn pump(&mut self) {
            self.pump_with(|_, _| true);
        }

        /// 큐가 빌 때까지 배달. `keep` 이 false 면 해당 패킷 유실.
        fn pump_with(&mut self, mut keep: impl FnMut(bool, &Packet) -> bool) {
            loop {
                let mut progressed = false;
                while let Ok((datagram, _)) = self.to_b.try_recv() {
                    progressed = true;
                    if keep(true, &Packet::decode(&datagram).unwrap()) {
                        let incoming = self.b.handle_datagram(&datagram, self.now);
                        self.inbox_b.extend(incoming.messages);
                        self.closed_b |= incoming.closed;
                    }
                }
                while let Ok((datagram, _)) = self.to_a.try_recv() {
                    progressed = true;
                    if keep(false, &Packet::decode(&datagram).unwrap()) {
                        let incoming = self.a.handle_datagram(&datagram, self.now);
                        self.inbox_a.extend(incoming.messages);
                    }
                }
                if !progressed {
                    break;
                }
            }
        }

        fn drain_to_b(&mut self) -> Vec<Bytes> {
            let mut datagrams = Vec::new();
            while let Ok((datagram, _)) = self.to_b.try_recv() {
                datagrams.push(datagram);
            }
            datagrams
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            assert_eq!(self.a.on_tick(self.now), Liveness::Alive);
            assert_eq!(self.b.on_tick(self.now), Liveness::Alive);
        }
    }

    fn small_packets() -> Config {
        Config {
            max_packet_size: HEADER_SIZE + 4,
            ..Config::default()
        }
    }

    #[test]
    fn test_handshake_and_fragmented_message() {
        let mut link = Link::new(small_packets(), SequenceNumber::new(10));

        link.a
            .send_message(Bytes::from_static(b"hello world!!"), link.now)
            .unwrap();
        link.a.send_message(Bytes::new(), link.now).unwrap();
        link.pump();

        assert_eq!(
            link.inbox_b,
            vec![Bytes::from_static(b"hello world!!"), Bytes::new()]
        );
        assert_eq!(link.b.stats().packets_received, 5);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let mut link = Link::new(small_packets(), SequenceNumber::new(10));
        link.a
            .send_message(Bytes::from_static(b"0123456789ab"), link.now)
            .unwrap();

        let mut datagrams = link.drain_to_b();
        assert_eq!(datagrams.len(), 3);
        datagrams.reverse();
        for datagram in &datagrams {
            let incoming = link.b.handle_datagram(datagram, link.now);
            link.inbox_b.extend(incoming.messages);
        }

        assert_eq!(link.inbox_b, vec![Bytes::from_static(b"0123456789ab")]);
        // 첫 패킷이 마지막 조각보다 늦게 도착했으므로 NAK 이 나갔어야 함
        let mut saw_nak = false;
        while let Ok((datagram, _)) = link.to_a.try_recv() {
            saw_nak |= matches!(Packet::decode(&datagram).unwrap(), Packet::Nak(_));
        }
        assert!(saw_nak);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut link = Link::new(Config::default(), SequenceNumber::new(10));
        link.a
            .send_message(Bytes::from_static(b"once"), link.now)
            .unwrap();

        let datagrams = link.drain_to_b();
        for _ in 0..3 {
            let incoming = link.b.handle_datagram(&datagrams[0], link.now);
            link.inbox_b.extend(incoming.messages);
        }

        assert_eq!(link.inbox_b, vec![Bytes::from_static(b"once")]);
        assert_eq!(link.b.stats().duplicate_packets, 2);
    }

    #[test]
    fn test_ack_trims_buffer_across_wrap() {
        let initial = SequenceNumber::new(SequenceNumber::MAX - 2);
        let mut link = Link::new(Config::default(), initial);

        for i in 0..6u8 {
            link.a.send_message(Bytes::from(vec![i]), link.now).unwrap();
        }
        link.pump();
        assert_eq!(link.inbox_b.len(), 6);
        assert_eq!(link.a.in_flight.len(), 6);

        // 전체 ACK 와 ACK-of-ACK
        link.advance(Duration::from_millis(20));
        let acks: Vec<Bytes> = {
            let mut acks = Vec::new();
            while let Ok((datagram, _)) = link.to_a.try_recv() {
                acks.push(datagram);
            }
            acks
        };
        assert_eq!(acks.len(), 1);
        let Packet::Ack(ack) = Packet::decode(&acks[0]).unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(ack.packet_sequence_number, initial.add(5));
        assert!(ack.has_optional_fields());

        link.a.handle_datagram(&acks[0], link.now);
        assert_eq!(link.a.in_flight.len(), 0);
        assert_eq!(link.a.congestion().last_ack(), Some(initial.add(5)));

        // 같은 ACK 재처리는 무해
        link.a.handle_datagram(&acks[0], link.now);
        assert_eq!(link.a.in_flight.len(), 0);
        assert_eq!(link.a.pending_packets(), 0);

        link.pump();
        assert!(link.b.pending_acks.is_empty());
    }

    #[test]
    fn test_stale_ack_keeps_newer_packets() {
        let mut link = Link::new(Config::default(), SequenceNumber::new(100));
        for i in 0..4u8 {
            link.a.send_message(Bytes::from(vec![i]), link.now).unwrap();
        }
        link.drain_to_b();

        let ack = |seq: u32| {
            Packet::Ack(AckPacket {
                header: ControlHeader::new(0, 1),
                ack_sequence_number: 1,
                packet_sequence_number: SequenceNumber::new(seq),
                optional: None,
            })
            .to_bytes()
        };

        link.a.handle_datagram(&ack(101), link.now);
        assert_eq!(link.a.in_flight.len(), 2);
        link.a.handle_datagram(&ack(100), link.now);
        assert_eq!(link.a.in_flight.len(), 2);
        // 보내지 않은 시퀀스에 대한 ACK 는 무시
        link.a.handle_datagram(&ack(900), link.now);
        assert_eq!(link.a.in_flight.len(), 2);
    }

    #[test]
    fn test_nak_retransmits_listed_packets() {
        let mut link = Link::new(Config::default(), SequenceNumber::new(10));
        for i in 0..3u8 {
            link.a.send_message(Bytes::from(vec![i]), link.now).unwrap();
        }

        let mut dropped = false;
        link.pump_with(|to_b, packet| match packet {
            Packet::Data(data) if to_b && data.sequence_number.value() == 11 && !dropped => {
                dropped = true;
                false
            }
            _ => true,
        });

        assert_eq!(
            link.inbox_b,
            vec![
                Bytes::from_static(&[0]),
                Bytes::from_static(&[1]),
                Bytes::from_static(&[2])
            ]
        );
        assert_eq!(link.b.stats().naks_sent, 1);
        assert_eq!(link.a.stats().naks_received, 1);
        assert_eq!(link.a.stats().packets_retransmitted, 1);
    }

    #[test]
    fn test_rto_retransmits_and_gives_up() {
        let config = Config {
            max_retransmits: 2,
            ..Config::default()
        };
        let mut link = Link::new(config, SequenceNumber::new(10));
        link.a
            .send_message(Bytes::from_static(b"lost"), link.now)
            .unwrap();
        link.drain_to_b();

        let mut lost = None;
        for _ in 0..100 {
            link.now += Duration::from_millis(50);
            match link.a.on_tick(link.now) {
                Liveness::Alive => {
                    link.drain_to_b();
                }
                Liveness::Lost(reason) => {
                    lost = Some(reason);
                    break;
                }
            }
        }

        assert_eq!(lost, Some(LossReason::RetransmitLimit));
        assert_eq!(link.a.stats().packets_retransmitted, 2);
    }

    #[test]
    fn test_rto_resends_every_expired_packet() {
        let config = Config {
            initial_window: 8,
            window_decrease_factor: 0.5,
            ..Config::default()
        };
        let mut link = Link::new(config, SequenceNumber::new(10));
        for i in 0..8u8 {
            link.a.send_message(Bytes::from(vec![i]), link.now).unwrap();
        }
        assert_eq!(link.drain_to_b().len(), 8);

        link.now += Duration::from_secs(1);
        assert_eq!(link.a.on_tick(link.now), Liveness::Alive);

        let resent = link
            .drain_to_b()
            .iter()
            .filter(|d| matches!(Packet::decode(d).unwrap(), Packet::Data(_)))
            .count();
        assert_eq!(resent, 8);
        assert_eq!(link.a.stats().packets_retransmitted, 8);
        assert_eq!(link.a.congestion().allowed_in_flight(), 4);
    }

    #[test]
    fn test_keepalive_and_inactivity() {
        let mut link = Link::new(Config::default(), SequenceNumber::new(10));
        let keepalive = Config::default().keepalive_interval();

        link.now += keepalive;
        assert_eq!(link.a.on_tick(link.now), Liveness::Alive);
        let sent = link.drain_to_b();
        assert!(sent
            .iter()
            .any(|d| matches!(Packet::decode(d).unwrap(), Packet::KeepAlive(_))));

        link.now += Config::default().connection_timeout();
        assert_eq!(
            link.a.on_tick(link.now),
            Liveness::Lost(LossReason::Inactivity)
        );
    }

    #[test]
    fn test_handshake_retry_and_timeout() {
        let config = Arc::new(Config::default());
        let (outbound, mut rx) = Outbound::channel();
        let mut client = Peer::new(config.clone(), addr(9), outbound);
        let start = Instant::now();
        client.open(7, Mode::Client, start).unwrap();
        assert!(rx.try_recv().is_ok());

        assert_eq!(
            client.on_tick(start + config.handshake_retry_interval()),
            Liveness::Alive
        );
        let (retry, to) = rx.try_recv().unwrap();
        assert_eq!(to, addr(9));
        assert!(HandshakePacket::is_valid(&retry));

        assert_eq!(
            client.on_tick(start + config.connection_timeout()),
            Liveness::Lost(LossReason::HandshakeTimeout)
        );
    }

    #[test]
    fn test_shutdown_closes_both_sides() {
        let mut link = Link::new(Config::default(), SequenceNumber::new(10));
        link.a.shutdown(link.now);
        assert!(matches!(
            link.a.send_message(Bytes::from_static(b"x"), link.now),
            Err(Error::NotConnected)
        ));

        link.pump();
        assert!(link.closed_b);
        assert!(!link.b.is_open());
    }

    #[test]
    fn test_close_clears_receive_samples() {
        let mut link = Link::new(Config::default(), SequenceNumber::new(10));
        for i in 0..4u8 {
            link.a.send_message(Bytes::from(vec![i]), link.now).unwrap();
            link.pump();
            link.now += Duration::from_millis(1);
        }
        assert_eq!(link.inbox_b.len(), 4);
        assert!(link.b.receive_stats.receiving_rate() > 0);

        link.b.close();
        assert_eq!(link.b.receive_stats.receiving_rate(), 0);
        assert_eq!(link.b.receive_stats.link_capacity(), 0);
    }

    #[test]
    fn test_malformed_datagram_ignored() {
        let mut link = Link::new(Config::default(), SequenceNumber::new(10));
        let incoming = link.b.handle_datagram(&[0x80, 0x02, 0, 0, 1], link.now);
        assert!(incoming.messages.is_empty());
        assert!(!incoming.closed);
        assert!(link.b.is_connected());
    }
}

//! 세션 (핸드쉐이크 상태 머신)
//!
//! ```text
//!  Unopened ──open──▶ AwaitingHandshake ──handshake──▶ Connected
//!     ▲                      │                             │
//!     └──────── open ─── Closed ◀──────── close ───────────┘
//! ```
//!
//! 클라이언트는 요청을 보내고, 서버는 요청에 응답한 뒤 연결된다.
//! 양쪽이 동시에 클라이언트로 열려도 요청을 받은 쪽이 응답을 돌려주므로
//! 어떤 도착 순서에서도 양쪽 모두 Connected 로 수렴한다.

use std::net::SocketAddr;

use tracing::debug;

use crate::packet::{
    ConnectionType, ControlHeader, HandshakePacket, HEADER_SIZE, SOCKET_TYPE_DATAGRAM,
};
use crate::sequence::SequenceNumber;
use crate::{Error, Result, PROTOCOL_VERSION};

/// 소켓 ID
pub type SocketId = u32;

/// 세션 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// 핸드쉐이크로 알게 된 상대 소켓 정보
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSocket {
    pub socket_id: SocketId,
    pub initial_sequence_number: SequenceNumber,
    pub maximum_packet_size: u32,
    pub maximum_flow_window_size: u32,
}

/// 세션 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    AwaitingHandshake {
        id: SocketId,
        initial_sequence_number: SequenceNumber,
        mode: Mode,
    },
    Connected {
        id: SocketId,
        initial_sequence_number: SequenceNumber,
        mode: Mode,
        remote: RemoteSocket,
    },
    Closed,
}

/// 핸드쉐이크 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// 형식 오류, 미개방 세션, 잘못된 주소 지정 - 조용히 폐기
    Ignored,

    /// 연결 중 다른 상대의 핸드쉐이크 - 연결은 유지
    Rejected,

    Accepted {
        /// 상대에게 돌려보낼 핸드쉐이크
        reply: Option<HandshakePacket>,

        /// 이번 패킷으로 연결이 성립했는지
        newly_connected: bool,

        /// 상대가 바라본 우리 쪽 주소
        observed_endpoint: SocketAddr,
    },
}

/// 세션
#[derive(Debug)]
pub struct Session {
    peer_endpoint: SocketAddr,
    state: SessionState,
    maximum_packet_size: u32,
    maximum_flow_window_size: u32,
}

impl Session {
    pub fn new(peer_endpoint: SocketAddr, maximum_packet_size: u32, flow_window_size: u32) -> Self {
        Self {
            peer_endpoint,
            state: SessionState::Unopened,
            maximum_packet_size,
            maximum_flow_window_size: flow_window_size,
        }
    }

    /// 클라이언트 또는 서버로 세션 열기
    pub fn open(
        &mut self,
        id: SocketId,
        initial_sequence_number: SequenceNumber,
        mode: Mode,
    ) -> Result<()> {
        match self.state {
            SessionState::Unopened | SessionState::Closed => {
                self.state = SessionState::AwaitingHandshake {
                    id,
                    initial_sequence_number,
                    mode,
                };
                Ok(())
            }
            _ => Err(Error::SessionAlreadyOpen),
        }
    }

    /// 열려 있는지 (연결 여부와 무관)
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            SessionState::AwaitingHandshake { .. } | SessionState::Connected { .. }
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected { .. })
    }

    pub fn id(&self) -> Option<SocketId> {
        match self.state {
            SessionState::AwaitingHandshake { id, .. } | SessionState::Connected { id, .. } => {
                Some(id)
            }
            _ => None,
        }
    }

    pub fn mode(&self) -> Option<Mode> {
        match self.state {
            SessionState::AwaitingHandshake { mode, .. }
            | SessionState::Connected { mode, .. } => Some(mode),
            _ => None,
        }
    }

    pub fn initial_sequence_number(&self) -> Option<SequenceNumber> {
        match self.state {
            SessionState::AwaitingHandshake {
                initial_sequence_number,
                ..
            }
            | SessionState::Connected {
                initial_sequence_number,
                ..
            } => Some(initial_sequence_number),
            _ => None,
        }
    }

    pub fn remote(&self) -> Option<RemoteSocket> {
        match self.state {
            SessionState::Connected { remote, .. } => Some(remote),
            _ => None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn peer_endpoint(&self) -> SocketAddr {
        self.peer_endpoint
    }

    /// 세션 닫기. ID와 시퀀스 상태를 지운다.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// 클라이언트가 (재)전송할 핸드쉐이크 요청
    pub fn handshake_request(&self) -> Option<HandshakePacket> {
        match self.state {
            SessionState::AwaitingHandshake {
                id,
                initial_sequence_number,
                mode: Mode::Client,
            } => Some(self.build(ConnectionType::Request, 0, id, initial_sequence_number)),
            _ => None,
        }
    }

    /// 핸드쉐이크 패킷 처리
    pub fn handle_handshake(&mut self, packet: &HandshakePacket) -> HandshakeOutcome {
        if let Err(reason) = validate(packet) {
            debug!("핸드쉐이크 폐기 ({}): {}", self.peer_endpoint, reason);
            return HandshakeOutcome::Ignored;
        }

        match self.state.clone() {
            SessionState::Unopened | SessionState::Closed => {
                debug!("열리지 않은 세션의 핸드쉐이크 무시: {}", self.peer_endpoint);
                HandshakeOutcome::Ignored
            }

            SessionState::AwaitingHandshake {
                id,
                initial_sequence_number,
                mode,
            } => {
                let destination = packet.header.destination_socket_id;
                let addressed = match packet.connection_type {
                    ConnectionType::Request => destination == 0 || destination == id,
                    ConnectionType::Response => destination == id,
                };
                if !addressed {
                    debug!(
                        "주소가 맞지 않는 핸드쉐이크 무시: dest={}, local={}",
                        destination, id
                    );
                    return HandshakeOutcome::Ignored;
                }

                let remote = RemoteSocket {
                    socket_id: packet.socket_id,
                    initial_sequence_number: packet.initial_sequence_number,
                    maximum_packet_size: packet.maximum_packet_size,
                    maximum_flow_window_size: packet.maximum_flow_window_size,
                };

                let reply = if mode == Mode::Server
                    || packet.connection_type == ConnectionType::Request
                {
                    Some(self.build(
                        ConnectionType::Response,
                        remote.socket_id,
                        id,
                        initial_sequence_number,
                    ))
                } else {
                    None
                };

                self.state = SessionState::Connected {
                    id,
                    initial_sequence_number,
                    mode,
                    remote,
                };

                HandshakeOutcome::Accepted {
                    reply,
                    newly_connected: true,
                    observed_endpoint: packet.peer_endpoint,
                }
            }

            SessionState::Connected {
                id,
                initial_sequence_number,
                remote,
                ..
            } => {
                if packet.socket_id != remote.socket_id {
                    debug!(
                        "연결 중 다른 소켓의 핸드쉐이크 거부: got={}, expected={}",
                        packet.socket_id, remote.socket_id
                    );
                    return HandshakeOutcome::Rejected;
                }

                // 응답이 유실되어 상대가 요청을 재전송한 경우 다시 응답
                let reply = (packet.connection_type == ConnectionType::Request).then(|| {
                    self.build(
                        ConnectionType::Response,
                        remote.socket_id,
                        id,
                        initial_sequence_number,
                    )
                });

                HandshakeOutcome::Accepted {
                    reply,
                    newly_connected: false,
                    observed_endpoint: packet.peer_endpoint,
                }
            }
        }
    }

    fn build(
        &self,
        connection_type: ConnectionType,
        destination: SocketId,
        id: SocketId,
        initial_sequence_number: SequenceNumber,
    ) -> HandshakePacket {
        HandshakePacket {
            header: ControlHeader::new(0, destination),
            version: PROTOCOL_VERSION,
            socket_type: SOCKET_TYPE_DATAGRAM,
            initial_sequence_number,
            maximum_packet_size: self.maximum_packet_size,
            maximum_flow_window_size: self.maximum_flow_window_size,
            connection_type,
            socket_id: id,
            syn_cookie: 0,
            peer_endpoint: self.peer_endpoint,
        }
    }
}

fn validate(packet: &HandshakePacket) -> std::result::Result<(), &'static str> {
    if packet.version != PROTOCOL_VERSION {
        return Err("protocol version");
    }
    if packet.socket_type != SOCKET_TYPE_DATAGRAM {
        return Err("socket type");
    }
    if packet.socket_id == 0 {
        return Err("socket id");
    }
    if (packet.maximum_packet_size as usize) <= HEADER_SIZE {
        return Err("maximum packet size");
    }
    if packet.maximum_flow_window_size == 0 {
        return Err("flow window");
    }
    Ok(())
}

//! # RUDP (Reliable UDP)
//!
//! UDP 위의 신뢰성 있는 순서 보장 전송과 연결 관리자
//!
//! ## 핵심 특징
//! - **UDT 스타일 패킷**: 16바이트 헤더, 컨트롤/데이터 패킷, 빅엔디안
//! - **대칭 핸드쉐이크**: 동시 개방 지원, NAT 외부 주소 학습
//! - **ACK/NAK 기반 재전송**: 누적 ACK, 손실 구간 NAK, RTO 재전송
//! - **AIMD 혼잡제어**: 슬로우 스타트 / 혼잡 회피, 수신률 기반 윈도우
//! - **멀티플렉싱**: 소켓 하나를 여러 세션이 공유, 소켓 ID 기반 디스패치
//! - **연결 관리자**: 부트스트랩, 엔드포인트 협상, 검증 데이터 교환, 이벤트 큐

pub mod config;
pub mod congestion;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod multiplexer;
pub mod packet;
pub mod peer;
pub mod sequence;
pub mod session;
pub mod stats;

pub use config::Config;
pub use endpoint::EndpointPair;
pub use error::{Error, Result, ReturnCode};
pub use manager::{ConnectionInfo, ConnectionManager, Event, EventReceiver};
pub use packet::{DecodeError, Packet};
pub use sequence::{MessageNumber, SequenceNumber};
pub use session::{Mode, Session, SocketId};

/// 프로토콜 버전 (핸드쉐이크 version 필드)
pub const PROTOCOL_VERSION: u32 = 4;

/// 기본 최대 패킷 크기 (바이트, 이더넷 MTU - IP/UDP 헤더)
pub const MAX_PACKET_SIZE: usize = 1472;

/// 기본 흐름 윈도우 (패킷 수)
pub const DEFAULT_FLOW_WINDOW_SIZE: u32 = 8192;

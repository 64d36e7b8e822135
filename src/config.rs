//! 프로토콜 설정

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_FLOW_WINDOW_SIZE, MAX_PACKET_SIZE};

/// RUDP 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 최대 UDP 페이로드 크기 (헤더 포함, 바이트)
    pub max_packet_size: usize,

    /// 수신 흐름 윈도우 (패킷 수)
    /// 핸드쉐이크와 ACK의 가용 버퍼 필드로 상대에게 알린다
    pub flow_window_size: u32,

    /// 초기 혼잡 윈도우 (패킷 수)
    pub initial_window: u32,

    /// 혼잡 윈도우 하한 (패킷 수)
    pub min_window: u32,

    /// 손실 시 윈도우 감소 배율
    pub window_decrease_factor: f64,

    /// 초기 RTT 추정값 (밀리초)
    pub initial_rtt_ms: u64,

    /// 재전송 타임아웃 하한 (밀리초)
    pub min_retransmit_timeout_ms: u64,

    /// ACK 없이 허용되는 연속 재전송 타임아웃 횟수
    pub max_retransmits: u32,

    /// 전체 ACK 전송 주기 (밀리초)
    pub ack_interval_ms: u64,

    /// 빠른 ACK 전송 기준 (수신 패킷 수)
    pub light_ack_packets: u32,

    /// Keep-alive 전송 주기 (밀리초)
    pub keepalive_interval_ms: u64,

    /// 수신이 없을 때 연결 끊김으로 판단하는 시간 (밀리초)
    pub connection_timeout_ms: u64,

    /// 핸드쉐이크 재전송 간격 (밀리초)
    pub handshake_retry_interval_ms: u64,

    /// Add 핸드쉐이크 완료 대기 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// 부트스트랩 후보당 대기 타임아웃 (밀리초)
    pub bootstrap_timeout_ms: u64,

    /// 타이머 주기 (밀리초)
    pub tick_interval_ms: u64,

    /// 검증 데이터 최대 크기 (바이트)
    pub max_validation_data_size: usize,

    /// 메시지 최대 크기 (바이트)
    pub max_message_size: usize,

    /// 최대 로컬 전송 소켓 수
    pub max_transports: usize,

    /// 소켓당 최대 피어 수
    pub max_peers_per_transport: usize,

    /// 이벤트 큐 크기
    pub event_queue_size: usize,

    /// 알 수 없는 엔드포인트의 핸드쉐이크 요청 수락 여부
    pub accept_unknown_peers: bool,

    /// 로컬 주소를 지정하지 않았을 때 바인드할 주소
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            flow_window_size: DEFAULT_FLOW_WINDOW_SIZE,
            initial_window: 16,
            min_window: 2,
            window_decrease_factor: 0.875,
            initial_rtt_ms: 100,
            min_retransmit_timeout_ms: 50,
            max_retransmits: 16,
            ack_interval_ms: 10,
            light_ack_packets: 64,
            keepalive_interval_ms: 500,
            connection_timeout_ms: 10_000,
            handshake_retry_interval_ms: 100,
            handshake_timeout_ms: 3_000,
            bootstrap_timeout_ms: 3_000,
            tick_interval_ms: 10,
            max_validation_data_size: 4096,
            max_message_size: 16 * 1024 * 1024, // 16MB
            max_transports: 8,
            max_peers_per_transport: 64,
            event_queue_size: 1024,
            accept_unknown_peers: true,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 패킷당 최대 데이터 크기
    pub fn max_payload_size(&self) -> usize {
        self.max_packet_size.saturating_sub(crate::packet::HEADER_SIZE)
    }

    pub fn initial_rtt(&self) -> Duration {
        Duration::from_millis(self.initial_rtt_ms)
    }

    pub fn min_retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.min_retransmit_timeout_ms)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn handshake_retry_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// 로컬 네트워크용 설정
    pub fn lan() -> Self {
        Self {
            initial_window: 32,
            initial_rtt_ms: 10,
            min_retransmit_timeout_ms: 20,
            keepalive_interval_ms: 250,
            connection_timeout_ms: 3_000,
            handshake_retry_interval_ms: 50,
            handshake_timeout_ms: 1_000,
            bootstrap_timeout_ms: 1_000,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            initial_window: 8,
            min_window: 4,
            window_decrease_factor: 0.9,        // 완만한 감소
            initial_rtt_ms: 300,
            min_retransmit_timeout_ms: 200,
            max_retransmits: 32,
            keepalive_interval_ms: 1_000,
            connection_timeout_ms: 30_000,
            handshake_retry_interval_ms: 250,
            handshake_timeout_ms: 10_000,
            bootstrap_timeout_ms: 10_000,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_keep_invariants() {
        for config in [Config::default(), Config::lan(), Config::lossy_network()] {
            assert!(config.min_window >= 1);
            assert!(config.initial_window >= config.min_window);
            assert!(config.window_decrease_factor > 0.0 && config.window_decrease_factor < 1.0);
            assert!(config.max_payload_size() > 0);
            assert!(config.max_validation_data_size <= config.max_message_size);
        }
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::lan();
        let bytes = bincode::serialize(&config).unwrap();
        let restored: Config = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.handshake_timeout_ms, config.handshake_timeout_ms);
        assert_eq!(restored.listen_addr, config.listen_addr);
    }
}

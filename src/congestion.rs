//! 혼잡 제어
//!
//! ACK 의 선택 필드 (RTT, 수신 버퍼, 수신률, 링크 용량) 로 전송 윈도우를 조절한다.
//! - 슬로우 스타트: 확인된 패킷 수만큼 윈도우 증가
//! - 혼잡 회피: 윈도우당 1 패킷 증가
//! - NAK / 타임아웃: 배율 감소, 하한 유지

use std::time::Duration;

use crate::config::Config;
use crate::packet::{AckPacket, NakPacket};
use crate::sequence::SequenceNumber;

/// RTT 평활 계수 (1/8)
const RTT_SHIFT: u32 = 3;

/// RTT 분산 평활 계수 (1/4)
const RTT_VAR_SHIFT: u32 = 2;

/// 속도 기반 윈도우의 여유분 (패킷)
const RATE_WINDOW_SLACK: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SlowStart,
    CongestionAvoidance,
}

#[derive(Debug)]
pub struct CongestionControl {
    /// 평활 RTT (마이크로초)
    pub rtt_us: u32,

    /// RTT 분산 (마이크로초)
    pub rtt_var_us: u32,

    /// 상대가 알린 가용 버퍼 (패킷)
    pub peer_buffer: u32,

    /// 상대의 수신률 (패킷/초), 0이면 아직 샘플 없음
    pub receive_rate: u32,

    /// 링크 용량 추정 (패킷/초), 0이면 아직 샘플 없음
    pub link_capacity: u32,

    window: f64,
    phase: Phase,

    // parameters
    min_window: f64,
    max_window: f64,
    decrease_factor: f64,
    min_rto: Duration,
    ack_interval_us: u64,

    last_ack: Option<SequenceNumber>,
}

impl CongestionControl {
    pub fn new(config: &Config) -> Self {
        let rtt_us = config.initial_rtt().as_micros().min(u32::MAX as u128) as u32;
        let min_window = config.min_window.max(1) as f64;

        Self {
            rtt_us,
            rtt_var_us: rtt_us / 2,
            peer_buffer: config.flow_window_size,
            receive_rate: 0,
            link_capacity: 0,
            window: (config.initial_window as f64).max(min_window),
            phase: Phase::SlowStart,
            min_window,
            max_window: config.flow_window_size.max(1) as f64,
            decrease_factor: config.window_decrease_factor,
            min_rto: config.min_retransmit_timeout(),
            ack_interval_us: config.ack_interval().as_micros() as u64,
            last_ack: None,
        }
    }

    /// 핸드쉐이크에서 받은 상대 흐름 윈도우
    pub fn set_peer_flow_window(&mut self, packets: u32) {
        self.peer_buffer = packets;
        self.max_window = self.max_window.min(packets.max(1) as f64).max(self.min_window);
    }

    /// 누적 ACK 기준점
    ///
    /// 아직 아무것도 확인되지 않았으면 첫 전송 시퀀스의 바로 앞을 기준으로 한다.
    pub fn set_initial_sequence(&mut self, initial: SequenceNumber) {
        self.last_ack = Some(initial.prev());
    }

    pub fn last_ack(&self) -> Option<SequenceNumber> {
        self.last_ack
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// ACK 처리. 새로 확인된 패킷 수를 반환한다.
    pub fn on_ack(&mut self, ack: &AckPacket) -> u32 {
        let watermark = ack.packet_sequence_number;
        let newly_acked = match self.last_ack {
            Some(last) if !watermark.is_after(last) => 0,
            Some(last) => last.distance_to(watermark),
            None => 1,
        };
        if newly_acked > 0 {
            self.last_ack = Some(watermark);
        }

        let Some(stats) = ack.optional else {
            // 순수 누적 ACK: 기준점만 이동
            return newly_acked;
        };

        self.on_rtt_sample(stats.round_trip_time);
        self.peer_buffer = stats.available_buffer_size;
        if stats.packets_receiving_rate > 0 {
            self.receive_rate = smooth(self.receive_rate, stats.packets_receiving_rate);
        }
        if stats.estimated_link_capacity > 0 {
            self.link_capacity = smooth(self.link_capacity, stats.estimated_link_capacity);
        }

        if newly_acked > 0 {
            self.grow(newly_acked);
        }
        newly_acked
    }

    /// RTT 샘플 반영
    pub fn on_rtt_sample(&mut self, sample_us: u32) {
        let rtt = self.rtt_us as i64;
        let sample = sample_us as i64;
        // 분산은 갱신 전 추정값과의 편차로 계산
        let deviation = (sample - rtt).abs();
        let new_rtt = rtt + ((sample - rtt) >> RTT_SHIFT);

        let var = self.rtt_var_us as i64;
        let new_var = var + ((deviation - var) >> RTT_VAR_SHIFT);

        self.rtt_us = new_rtt.clamp(1, u32::MAX as i64) as u32;
        self.rtt_var_us = new_var.clamp(0, u32::MAX as i64) as u32;
    }

    pub fn on_nak(&mut self, nak: &NakPacket) {
        if nak.losses.is_empty() {
            return;
        }
        self.decrease();
    }

    /// 재전송 타임아웃 발생
    pub fn on_timeout(&mut self) {
        self.decrease();
    }

    /// 허용되는 미확인 패킷 수
    pub fn allowed_in_flight(&self) -> usize {
        let mut allowed = (self.window as u64).min(self.peer_buffer as u64);
        if let Some(rate_window) = self.rate_window() {
            allowed = allowed.min(rate_window);
        }
        allowed.max(1) as usize
    }

    /// 재전송 타임아웃
    pub fn retransmit_timeout(&self) -> Duration {
        let rto_us = self.rtt_us as u64 + 4 * self.rtt_var_us as u64;
        Duration::from_micros(rto_us).max(self.min_rto)
    }

    fn rate_window(&self) -> Option<u64> {
        if self.receive_rate == 0 {
            return None;
        }
        let span_us = self.rtt_us as u64 + self.ack_interval_us;
        let by_rate = self.receive_rate as u64 * span_us / 1_000_000 + RATE_WINDOW_SLACK;
        if self.link_capacity == 0 {
            return Some(by_rate);
        }
        let by_capacity = self.link_capacity as u64 * span_us / 1_000_000 + RATE_WINDOW_SLACK;
        Some(by_rate.min(by_capacity))
    }

    fn grow(&mut self, newly_acked: u32) {
        match self.phase {
            Phase::SlowStart => {
                self.window += newly_acked as f64;
                if let Some(rate_window) = self.rate_window() {
                    if self.window >= rate_window as f64 {
                        self.phase = Phase::CongestionAvoidance;
                    }
                }
            }
            Phase::CongestionAvoidance => {
                self.window += newly_acked as f64 / self.window;
            }
        }
        self.window = self.window.min(self.max_window).max(self.min_window);
    }

    fn decrease(&mut self) {
        self.phase = Phase::CongestionAvoidance;
        self.window = (self.window * self.decrease_factor).max(self.min_window);
    }
}

fn smooth(old: u32, sample: u32) -> u32 {
    if old == 0 {
        return sample;
    }
    ((old as u64 * 7 + sample as u64) >> 3) as u32
}

//! 전송 통계
//!
//! - 수신측 샘플: 수신률, 링크 용량 (ACK 선택 필드로 보고)
//! - 피어별 누적 카운터

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::sequence::SequenceNumber;

/// 패킷 쌍 측정 간격 (시퀀스 번호 기준)
const PROBE_INTERVAL: u32 = 16;

/// 링크 용량 추정에 사용할 최대 샘플 수
const PROBE_WINDOW: usize = 16;

/// 수신측 샘플러
#[derive(Debug, Clone)]
pub struct ReceiveStats {
    /// 최근 패킷 도착 시각
    arrivals: VecDeque<Instant>,

    /// 윈도우 크기
    window_size: usize,

    /// 패킷 쌍 도착 간격 (마이크로초)
    probe_intervals: VecDeque<u64>,

    /// 직전 도착 (시각, 시퀀스)
    last_arrival: Option<(Instant, SequenceNumber)>,
}

impl ReceiveStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            arrivals: VecDeque::with_capacity(window_size),
            window_size: window_size.max(2),
            probe_intervals: VecDeque::with_capacity(PROBE_WINDOW),
            last_arrival: None,
        }
    }

    /// 데이터 패킷 도착 기록
    pub fn record_arrival(&mut self, seq: SequenceNumber, now: Instant) {
        if self.arrivals.len() >= self.window_size {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(now);

        // 연속된 두 패킷 중 두 번째가 프로브 위치면 간격을 기록
        if let Some((prev_time, prev_seq)) = self.last_arrival {
            if prev_seq.next() == seq && seq.value() % PROBE_INTERVAL == 1 {
                if self.probe_intervals.len() >= PROBE_WINDOW {
                    self.probe_intervals.pop_front();
                }
                let interval = now.saturating_duration_since(prev_time).as_micros() as u64;
                self.probe_intervals.push_back(interval.max(1));
            }
        }
        self.last_arrival = Some((now, seq));
    }

    /// 수신률 (패킷/초), 샘플 부족 시 0
    pub fn receiving_rate(&self) -> u32 {
        if self.arrivals.len() < 2 {
            return 0;
        }

        let first = self.arrivals[0];
        let last = self.arrivals[self.arrivals.len() - 1];
        let duration = last.duration_since(first);

        if duration.is_zero() {
            return 0;
        }

        ((self.arrivals.len() - 1) as f64 / duration.as_secs_f64()).min(u32::MAX as f64) as u32
    }

    /// 링크 용량 추정 (패킷/초), 샘플 없으면 0
    pub fn link_capacity(&self) -> u32 {
        if self.probe_intervals.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.probe_intervals.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2];
        (1_000_000 / median).min(u32::MAX as u64) as u32
    }

    pub fn reset(&mut self) {
        self.arrivals.clear();
        self.probe_intervals.clear();
        self.last_arrival = None;
    }
}

/// 피어별 전송 통계
#[derive(Debug, Clone)]
pub struct PeerStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송한 데이터 패킷 수 (재전송 포함)
    pub packets_sent: u64,

    /// 재전송한 데이터 패킷 수
    pub packets_retransmitted: u64,

    /// 수신한 데이터 패킷 수 (중복 제외)
    pub packets_received: u64,

    /// 중복 수신 패킷 수
    pub duplicate_packets: u64,

    /// 전송 바이트 (페이로드)
    pub bytes_sent: u64,

    /// 수신 바이트 (페이로드)
    pub bytes_received: u64,

    pub acks_sent: u64,
    pub acks_received: u64,
    pub naks_sent: u64,
    pub naks_received: u64,

    /// 재전송 타임아웃 횟수
    pub timeouts: u64,

    /// 전달한 메시지 수
    pub messages_delivered: u64,
}

impl PeerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_sent: 0,
            packets_retransmitted: 0,
            packets_received: 0,
            duplicate_packets: 0,
            bytes_sent: 0,
            bytes_received: 0,
            acks_sent: 0,
            acks_received: 0,
            naks_sent: 0,
            naks_received: 0,
            timeouts: 0,
            messages_delivered: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_retransmitted as f64 / self.packets_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} pkts ({} bytes) | Retransmit: {:.2}% | Received: {} pkts ({} bytes, {} dup) | ACK {}/{} | NAK {}/{} | Messages: {}",
            self.elapsed().as_secs_f64(),
            self.packets_sent,
            self.bytes_sent,
            self.retransmit_ratio() * 100.0,
            self.packets_received,
            self.bytes_received,
            self.duplicate_packets,
            self.acks_sent,
            self.acks_received,
            self.naks_sent,
            self.naks_received,
            self.messages_delivered,
        )
    }
}

impl Default for PeerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiving_rate() {
        let mut stats = ReceiveStats::new(100);
        let start = Instant::now();
        assert_eq!(stats.receiving_rate(), 0);

        // 1ms 간격으로 11개 -> 약 1000 pkt/s
        for i in 0..11u32 {
            stats.record_arrival(SequenceNumber::new(i), start + Duration::from_millis(i as u64));
        }
        let rate = stats.receiving_rate();
        assert!((990..=1010).contains(&rate), "rate={}", rate);
    }

    #[test]
    fn test_link_capacity_from_packet_pairs() {
        let mut stats = ReceiveStats::new(100);
        let start = Instant::now();
        assert_eq!(stats.link_capacity(), 0);

        // 16의 배수 + 1 위치 패킷은 직전 패킷 100us 뒤에 도착
        let mut now = start;
        for i in 0..64u32 {
            now += if i % PROBE_INTERVAL == 1 {
                Duration::from_micros(100)
            } else {
                Duration::from_millis(1)
            };
            stats.record_arrival(SequenceNumber::new(i), now);
        }
        assert_eq!(stats.link_capacity(), 10_000);
    }

    #[test]
    fn test_summary() {
        let mut stats = PeerStats::new();
        stats.packets_sent = 10;
        stats.packets_retransmitted = 1;
        assert!((stats.retransmit_ratio() - 0.1).abs() < 1e-9);
        assert!(stats.summary().contains("Retransmit: 10.00%"));
    }
}

//! 멀티플렉서
//!
//! UDP 소켓 하나를 여러 피어가 공유한다.
//! - 송신: 단일 FIFO 큐를 writer 태스크가 소비 (피어별 순서 보존)
//! - 수신: 매니저의 수신 루프가 `recv` 후 헤더의 수신 소켓 ID로 디스패치
//! - 외부 주소: 상대 핸드쉐이크의 peer address 필드로 학습

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::endpoint::EndpointPair;
use crate::{Error, Result};

/// 송신 큐 항목
type Datagram = (Bytes, SocketAddr);

/// 송신 큐 핸들
///
/// 피어는 소켓 대신 이 핸들만 가진다.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Datagram>,
}

impl Outbound {
    /// 소켓 없이 큐만 생성 (writer 는 호출자가 담당)
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, datagram: Bytes, to: SocketAddr) -> Result<()> {
        self.tx.send((datagram, to)).map_err(|_| Error::ChannelError)
    }
}

/// UDP 소켓 하나와 송신 경로
pub struct Multiplexer {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    external: RwLock<Option<SocketAddr>>,
    outbound: Outbound,
}

impl Multiplexer {
    /// 소켓 바인딩 및 writer 태스크 시작
    ///
    /// writer 는 모든 `Outbound` 핸들이 사라지면 남은 큐를 비우고 종료한다.
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;

        let (outbound, mut rx) = Outbound::channel();
        let writer_socket = socket.clone();
        tokio::spawn(async move {
            while let Some((datagram, to)) = rx.recv().await {
                trace!("송신 {} bytes -> {}", datagram.len(), to);
                if let Err(e) = writer_socket.send_to(&datagram, to).await {
                    warn!("송신 에러 ({}): {}", to, e);
                }
            }
        });

        info!("멀티플렉서 바인딩: {}", local);

        Ok(Arc::new(Self {
            socket,
            local,
            external: RwLock::new(None),
            outbound,
        }))
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    /// 외부 주소 (모르면 로컬 주소)
    pub fn external_endpoint(&self) -> SocketAddr {
        (*self.external.read()).unwrap_or(self.local)
    }

    pub fn has_external(&self) -> bool {
        self.external.read().is_some()
    }

    /// 관측된 외부 주소 기록. 값이 바뀌었으면 true.
    pub fn record_external(&self, observed: SocketAddr) -> bool {
        if observed.ip().is_unspecified() || observed.port() == 0 {
            debug!("유효하지 않은 외부 주소 무시: {}", observed);
            return false;
        }

        let mut external = self.external.write();
        if *external == Some(observed) {
            return false;
        }
        if let Some(previous) = *external {
            debug!("외부 주소 변경: {} -> {}", previous, observed);
        }
        *external = Some(observed);
        true
    }

    pub fn endpoint_pair(&self) -> EndpointPair {
        EndpointPair::new(self.local, self.external_endpoint())
    }

    /// 주어진 주소가 이 소켓을 가리키는지
    pub fn matches(&self, addr: SocketAddr) -> bool {
        if addr == self.local || Some(addr) == *self.external.read() {
            return true;
        }
        self.local.ip().is_unspecified() && self.local.port() == addr.port()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("local", &self.local)
            .field("external", &*self.external.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbound_order_and_recv() {
        let a = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let outbound = a.outbound();
        for i in 0..10u8 {
            outbound
                .send(Bytes::from(vec![i; 4]), b.local_endpoint())
                .unwrap();
        }

        let mut buf = [0u8; 64];
        for i in 0..10u8 {
            let (len, from) = b.recv(&mut buf).await.unwrap();
            assert_eq!(from, a.local_endpoint());
            assert_eq!(&buf[..len], &[i; 4]);
        }
    }

    #[tokio::test]
    async fn test_external_endpoint() {
        let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(!mux.has_external());
        assert_eq!(mux.external_endpoint(), mux.local_endpoint());

        let observed: SocketAddr = "203.0.113.5:61000".parse().unwrap();
        assert!(mux.record_external(observed));
        assert!(!mux.record_external(observed));
        assert!(!mux.record_external("0.0.0.0:1".parse().unwrap()));

        let pair = mux.endpoint_pair();
        assert_eq!(pair.local, mux.local_endpoint());
        assert_eq!(pair.external, observed);
        assert!(mux.matches(observed));
        assert!(!mux.matches("203.0.113.5:61001".parse().unwrap()));
    }
}

//! 엔드포인트 쌍
//!
//! 새 연결을 맺기 전에 애플리케이션끼리 (대역 외로) 교환하는 주소 정보.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::Result;

/// 로컬 소켓 주소와 외부에서 보이는 (NAT 매핑) 주소
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair {
    pub local: SocketAddr,
    pub external: SocketAddr,
}

impl EndpointPair {
    pub fn new(local: SocketAddr, external: SocketAddr) -> Self {
        Self { local, external }
    }

    /// 외부 주소를 아직 모를 때
    pub fn local_only(local: SocketAddr) -> Self {
        Self {
            local,
            external: local,
        }
    }

    /// 상대가 접속할 주소
    pub fn advertised(&self) -> SocketAddr {
        self.external
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for EndpointPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (external {})", self.local, self.external)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bincode_exchange() {
        let pair = EndpointPair::new(
            "192.168.0.10:5483".parse().unwrap(),
            "[2001:db8::1]:40000".parse().unwrap(),
        );
        let bytes = pair.to_bytes().unwrap();
        assert_eq!(EndpointPair::from_bytes(&bytes).unwrap(), pair);
        assert!(EndpointPair::from_bytes(&bytes[..3]).is_err());
    }

    #[test]
    fn test_local_only() {
        let local: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(EndpointPair::local_only(local).advertised(), local);
    }
}

//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

use crate::packet::DecodeError;

/// RUDP 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("패킷 디코딩 에러: {0}")]
    Decode(#[from] DecodeError),

    #[error("버퍼 오버플로우: 최대 크기 {max_size} 초과")]
    BufferOverflow { max_size: usize },

    #[error("세션이 이미 열려 있음")]
    SessionAlreadyOpen,

    #[error("연결되지 않은 세션")]
    NotConnected,

    #[error("이미 연결된 피어: {0}")]
    AlreadyConnected(SocketAddr),

    #[error("핸드쉐이크 타임아웃")]
    Timeout,

    #[error("사용 가능한 로컬 엔드포인트 없음")]
    NoEndpointAvailable,

    #[error("연결 가능한 부트스트랩 엔드포인트 없음")]
    NoEndpointReachable,

    #[error("알 수 없는 로컬 엔드포인트: {0}")]
    UnknownLocalEndpoint(SocketAddr),

    #[error("알 수 없는 피어: {0}")]
    UnknownPeer(SocketAddr),

    #[error("검증 데이터 크기 초과: {size} > {max}")]
    ValidationDataTooLarge { size: usize, max: usize },

    #[error("메시지 크기 초과: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 상위 계층에 노출되는 상태 코드
    pub fn code(&self) -> ReturnCode {
        match self {
            Error::AlreadyConnected(_) => ReturnCode::AlreadyConnected,
            Error::Timeout => ReturnCode::Timeout,
            Error::NoEndpointAvailable => ReturnCode::NoEndpointAvailable,
            Error::NoEndpointReachable => ReturnCode::NoEndpointReachable,
            Error::UnknownLocalEndpoint(_) => ReturnCode::InvalidEndpoint,
            Error::UnknownPeer(_) => ReturnCode::UnknownPeer,
            Error::ValidationDataTooLarge { .. } | Error::MessageTooLarge { .. } => {
                ReturnCode::MessageTooLarge
            }
            Error::NotConnected | Error::ConnectionClosed => ReturnCode::NotConnected,
            Error::Io(_) => ReturnCode::SocketError,
            _ => ReturnCode::GeneralError,
        }
    }
}

/// 상태 코드
///
/// 성공은 0, 실패는 음수로 구분된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReturnCode {
    Success = 0,
    GeneralError = -1,
    AlreadyConnected = -2,
    Timeout = -3,
    NoEndpointAvailable = -4,
    NoEndpointReachable = -5,
    InvalidEndpoint = -6,
    UnknownPeer = -7,
    MessageTooLarge = -8,
    NotConnected = -9,
    SocketError = -10,
}

impl<T> From<&Result<T>> for ReturnCode {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ReturnCode::Success,
            Err(e) => e.code(),
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_codes_are_distinct() {
        let addr: SocketAddr = "127.0.0.1:5483".parse().unwrap();
        assert_eq!(Error::AlreadyConnected(addr).code(), ReturnCode::AlreadyConnected);
        assert_eq!(Error::Timeout.code(), ReturnCode::Timeout);
        assert_eq!(Error::NoEndpointAvailable.code(), ReturnCode::NoEndpointAvailable);
        assert_ne!(ReturnCode::Timeout as i32, ReturnCode::AlreadyConnected as i32);

        let ok: Result<()> = Ok(());
        assert_eq!(ReturnCode::from(&ok), ReturnCode::Success);
    }
}

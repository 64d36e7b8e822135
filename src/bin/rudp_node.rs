//! RUDP 노드 - 연결 관리자 데모
//!
//! 부트스트랩 후보에 접속하고, 지정한 피어와 연결을 맺은 뒤
//! 받은 메시지와 연결 끊김 이벤트를 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin rudp-node -- [OPTIONS]
//!
//! 예시:
//!   # 첫 노드 (대기만)
//!   cargo run --release --bin rudp-node -- --bind 0.0.0.0:5483
//!
//!   # 두 번째 노드 (부트스트랩 + 연결 + 메시지)
//!   cargo run --release --bin rudp-node -- -b 0.0.0.0:5484 --bootstrap 10.0.0.1:5483 \
//!       --peer 10.0.0.1:5483 --message hello

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rudp::{Config, ConnectionManager, Event, ReturnCode};

/// 노드 설정
struct NodeConfig {
    bind_addr: SocketAddr,
    bootstrap: Vec<SocketAddr>,
    peers: Vec<SocketAddr>,
    message: Option<String>,
    count: usize,
    config: Config,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5483)),
            bootstrap: Vec::new(),
            peers: Vec::new(),
            message: None,
            count: 1,
            config: Config::default(),
        }
    }
}

fn parse_addr(value: &str) -> SocketAddr {
    match value.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("유효한 주소 필요: {}", value);
            std::process::exit(2);
        }
    }
}

fn parse_args() -> NodeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = NodeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = parse_addr(&args[i + 1]);
                    i += 1;
                }
            }
            "--bootstrap" => {
                if i + 1 < args.len() {
                    // 쉼표로 여러 후보 지정 가능
                    config
                        .bootstrap
                        .extend(args[i + 1].split(',').map(parse_addr));
                    i += 1;
                }
            }
            "--peer" | "-p" => {
                if i + 1 < args.len() {
                    config.peers.push(parse_addr(&args[i + 1]));
                    i += 1;
                }
            }
            "--message" | "-m" => {
                if i + 1 < args.len() {
                    config.message = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    config.count = args[i + 1].parse().unwrap_or(1);
                    i += 1;
                }
            }
            "--preset" => {
                if i + 1 < args.len() {
                    config.config = match args[i + 1].as_str() {
                        "lan" => Config::lan(),
                        "lossy" => Config::lossy_network(),
                        _ => Config::default(),
                    };
                    i += 1;
                }
            }
            "--reject-unknown" => {
                config.config.accept_unknown_peers = false;
            }
            "--help" | "-h" => {
                println!(
                    r#"RUDP Node - 신뢰성 UDP 연결 관리자 데모

사용법: rudp-node [OPTIONS]

옵션:
  -b, --bind <ADDR>         로컬 바인드 주소 (기본: 0.0.0.0:5483)
      --bootstrap <ADDRS>   부트스트랩 후보 (쉼표 구분, 반복 가능)
  -p, --peer <ADDR>         연결할 피어 (반복 가능)
  -m, --message <TEXT>      연결 후 보낼 메시지
  -n, --count <N>           메시지 반복 횟수 (기본: 1)
      --preset <NAME>       설정 프리셋: default, lan, lossy
      --reject-unknown      알 수 없는 피어의 연결 요청 거부
  -h, --help                도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (예: RUST_LOG=rudp=debug)

예시:
  # 부트스트랩 노드
  cargo run --release --bin rudp-node -- --bind 0.0.0.0:5483

  # 참여 노드
  cargo run --release --bin rudp-node -- -b 0.0.0.0:5484 --bootstrap 10.0.0.1:5483 -p 10.0.0.1:5483 -m hi
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node = parse_args();

    info!("RUDP node starting...");
    info!("Bind address: {}", node.bind_addr);
    info!("Max packet size: {} bytes", node.config.max_packet_size);
    info!("Flow window: {} packets", node.config.flow_window_size);

    let (manager, mut events) = ConnectionManager::new(node.config.clone());

    // 부트스트랩 (후보가 없으면 주 소켓만 바인딩)
    match manager.bootstrap(&node.bootstrap, Some(node.bind_addr)).await {
        Ok(endpoint) => info!("Bootstrapped via {}", endpoint),
        Err(e) if node.bootstrap.is_empty() => info!("Waiting for peers ({})", e),
        Err(e) => {
            warn!("Bootstrap failed: {} ({:?})", e, e.code());
            return Err(e.into());
        }
    }

    if let Some(pair) = manager.endpoint_pair() {
        info!("Local endpoint: {}", pair);
    }

    for &peer in &node.peers {
        let pair = manager.get_available_endpoint(peer).await?;
        let validation = Bytes::from(format!("hello from {}", pair.advertised()));
        let result = manager.add(pair.local, peer, validation).await;
        let code = ReturnCode::from(&result);
        match result {
            Ok(()) => info!("Connected: {} -> {}", pair.local, peer),
            Err(e) => warn!("Add failed for {}: {} ({:?})", peer, e, code),
        }
    }

    if let Some(message) = &node.message {
        for &peer in &node.peers {
            for _ in 0..node.count {
                if let Err(e) = manager.send(peer, Bytes::from(message.clone())) {
                    warn!("Send failed for {}: {}", peer, e);
                    break;
                }
            }
        }
    }

    let mut report = tokio::time::interval(Duration::from_secs(10));
    report.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::Message { peer, payload }) => {
                    info!(
                        "Message from {}: {} bytes {:?}",
                        peer,
                        payload.len(),
                        String::from_utf8_lossy(&payload)
                    );
                }
                Some(Event::ConnectionLost { peer }) => {
                    info!("Connection lost: {}", peer);
                }
                None => break,
            },
            _ = report.tick() => {
                let connections = manager.connections();
                info!("Connections: {}", connections.len());
                for info in connections {
                    info!(
                        "  {} via {} (id={}, managed={}, connected={})",
                        info.peer, info.local.local, info.socket_id, info.managed, info.connected
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                manager.shutdown();
                // 종료 패킷이 나갈 시간
                tokio::time::sleep(Duration::from_millis(100)).await;
                break;
            }
        }
    }

    Ok(())
}

//! 연결 관리자
//!
//! 여러 멀티플렉서 위의 세션을 관리한다.
//! - 레지스트리: 원격 엔드포인트 색인 (RwLock, 변경 직렬화) + 소켓 ID 아레나 (DashMap)
//! - 태스크: 멀티플렉서당 수신 루프, 매니저당 타이머
//! - 이벤트: 메시지 / 연결 끊김을 bounded 채널로 전달 (모든 락 해제 후)
//!
//! 부트스트랩과 수락된 연결은 "비관리" 상태로 등록되고, `add` 가 이를
//! 관리 상태로 승격한다. 이미 관리 중인 피어에 대한 `add` 는 실패한다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::endpoint::EndpointPair;
use crate::multiplexer::Multiplexer;
use crate::packet::{self, HandshakePacket};
use crate::peer::{Incoming, Liveness, Peer};
use crate::session::{Mode, SocketId};
use crate::{Config, Error, Result};

/// 수신 버퍼 크기
const RECV_BUFFER_SIZE: usize = 65_536;

/// 애플리케이션 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// 재조립된 메시지 (피어별 전송 순서)
    Message { peer: SocketAddr, payload: Bytes },

    /// 연결된 적 있는 피어가 레지스트리에서 제거됨
    ConnectionLost { peer: SocketAddr },
}

/// 이벤트 수신기 타입
pub type EventReceiver = mpsc::Receiver<Event>;

/// 연결 정보 스냅샷
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub local: EndpointPair,
    pub socket_id: SocketId,
    pub managed: bool,
    pub connected: bool,
    pub created_at: Instant,
    pub connected_at: Option<Instant>,
    pub last_activity: Instant,
}

/// 핸드쉐이크 진행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Connected,
    Closed,
}

/// 레지스트리 항목
struct Entry {
    id: SocketId,
    endpoint: SocketAddr,
    multiplexer: Arc<Multiplexer>,
    peer: Mutex<Peer>,
    managed: AtomicBool,
    status: watch::Sender<Status>,
    created_at: Instant,
}

enum Inserted {
    New(Arc<Entry>),
    Existing(Arc<Entry>),
}

/// 연결 레지스트리
struct Registry {
    by_endpoint: RwLock<HashMap<SocketAddr, SocketId>>,
    entries: DashMap<SocketId, Arc<Entry>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            by_endpoint: RwLock::new(HashMap::new()),
            entries: DashMap::new(),
        }
    }

    fn get(&self, id: SocketId) -> Option<Arc<Entry>> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    fn lookup(&self, endpoint: SocketAddr) -> Option<Arc<Entry>> {
        let id = *self.by_endpoint.read().get(&endpoint)?;
        self.get(id)
    }

    /// 엔드포인트에 항목이 없으면 새로 만든다
    fn insert_with(
        &self,
        endpoint: SocketAddr,
        build: impl FnOnce(SocketId) -> Result<Entry>,
    ) -> Result<Inserted> {
        let mut index = self.by_endpoint.write();
        if let Some(&id) = index.get(&endpoint) {
            if let Some(existing) = self.get(id) {
                return Ok(Inserted::Existing(existing));
            }
        }

        let id = self.allocate_id();
        let entry = Arc::new(build(id)?);
        self.entries.insert(id, entry.clone());
        index.insert(endpoint, id);
        Ok(Inserted::New(entry))
    }

    /// 0이 아니고 사용 중이지 않은 임의의 소켓 ID
    fn allocate_id(&self) -> SocketId {
        loop {
            let id: SocketId = rand::random();
            if id != 0 && !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// 제거. 이 호출이 제거했으면 true.
    fn remove(&self, entry: &Entry) -> bool {
        let mut index = self.by_endpoint.write();
        if self.entries.remove(&entry.id).is_none() {
            return false;
        }
        if index.get(&entry.endpoint) == Some(&entry.id) {
            index.remove(&entry.endpoint);
        }
        true
    }

    fn snapshot(&self) -> Vec<Arc<Entry>> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    fn count_on(&self, multiplexer: &Arc<Multiplexer>) -> usize {
        self.entries
            .iter()
            .filter(|entry| Arc::ptr_eq(&entry.multiplexer, multiplexer))
            .count()
    }
}

/// 태스크와 공유하는 내부 상태
struct Inner {
    config: Arc<Config>,
    registry: Registry,
    multiplexers: RwLock<Vec<Arc<Multiplexer>>>,
    bind_lock: tokio::sync::Mutex<()>,
    events: mpsc::Sender<Event>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn primary(&self) -> Option<Arc<Multiplexer>> {
        self.multiplexers.read().first().cloned()
    }

    fn find_multiplexer(&self, local: SocketAddr) -> Option<Arc<Multiplexer>> {
        self.multiplexers
            .read()
            .iter()
            .find(|multiplexer| multiplexer.matches(local))
            .cloned()
    }

    /// 새 소켓 바인딩 및 수신 루프 시작. `bind_lock` 을 쥔 채 호출한다.
    async fn bind(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Multiplexer>> {
        let count = self.multiplexers.read().len();
        if count >= self.config.max_transports {
            debug!("전송 소켓 한도 도달: {}", count);
            return Err(Error::NoEndpointAvailable);
        }

        let multiplexer = Multiplexer::bind(addr).await?;
        self.multiplexers.write().push(multiplexer.clone());

        let task = tokio::spawn(Self::run_receiver(self.clone(), multiplexer.clone()));
        self.tasks.lock().push(task);
        Ok(multiplexer)
    }

    async fn primary_or_bind(self: &Arc<Self>, preferred: Option<SocketAddr>) -> Result<Arc<Multiplexer>> {
        let _guard = self.bind_lock.lock().await;
        let primary = self.primary();
        if let Some(primary) = primary {
            return Ok(primary);
        }
        self.bind(preferred.unwrap_or(self.config.listen_addr)).await
    }

    fn new_entry(
        &self,
        id: SocketId,
        endpoint: SocketAddr,
        multiplexer: &Arc<Multiplexer>,
        mode: Mode,
        managed: bool,
        now: Instant,
    ) -> Result<Entry> {
        let mut peer = Peer::new(self.config.clone(), endpoint, multiplexer.outbound());
        peer.open(id, mode, now)?;
        let (status, _) = watch::channel(Status::Pending);

        Ok(Entry {
            id,
            endpoint,
            multiplexer: multiplexer.clone(),
            peer: Mutex::new(peer),
            managed: AtomicBool::new(managed),
            status,
            created_at: now,
        })
    }

    /// 클라이언트 피어 생성 (이미 있으면 기존 항목)
    fn connect(
        &self,
        multiplexer: &Arc<Multiplexer>,
        endpoint: SocketAddr,
        managed: bool,
    ) -> Result<Inserted> {
        let now = Instant::now();
        self.registry.insert_with(endpoint, |id| {
            self.new_entry(id, endpoint, multiplexer, Mode::Client, managed, now)
        })
    }

    /// 알 수 없는 엔드포인트의 핸드쉐이크 요청 수락 (서버 모드)
    fn accept(
        &self,
        multiplexer: &Arc<Multiplexer>,
        endpoint: SocketAddr,
        now: Instant,
    ) -> Option<Arc<Entry>> {
        if !self.config.accept_unknown_peers {
            debug!("알 수 없는 피어의 핸드쉐이크 무시: {}", endpoint);
            return None;
        }
        if self.registry.count_on(multiplexer) >= self.config.max_peers_per_transport {
            debug!(
                "피어 한도 초과로 수락 거부: {} on {}",
                endpoint,
                multiplexer.local_endpoint()
            );
            return None;
        }

        let inserted = self.registry.insert_with(endpoint, |id| {
            self.new_entry(id, endpoint, multiplexer, Mode::Server, false, now)
        });
        match inserted {
            Ok(Inserted::New(entry)) => {
                debug!("새 피어 수락: {} (id={})", endpoint, entry.id);
                Some(entry)
            }
            Ok(Inserted::Existing(entry)) => Some(entry),
            Err(e) => {
                warn!("피어 수락 실패 ({}): {}", endpoint, e);
                None
            }
        }
    }

    /// 핸드쉐이크 완료 대기
    async fn wait_connected(&self, entry: &Entry, timeout: Duration) -> bool {
        let mut status = entry.status.subscribe();
        let connected =
            match tokio::time::timeout(timeout, status.wait_for(|s| *s != Status::Pending)).await {
                Ok(Ok(current)) => *current == Status::Connected,
                _ => false,
            };
        connected
    }

    /// 레지스트리에서 제거하고 피어를 닫는다.
    ///
    /// 실제로 제거한 호출만 이벤트를 받으며, 연결된 적 없는 피어는 이벤트가 없다.
    fn drop_entry(&self, entry: &Entry, notify_peer: bool, now: Instant) -> Option<Event> {
        if !self.registry.remove(entry) {
            return None;
        }

        let was_connected = {
            let mut peer = entry.peer.lock();
            let was_connected = peer.connected_at().is_some();
            if notify_peer {
                peer.shutdown(now);
            } else {
                peer.close();
            }
            was_connected
        };
        entry.status.send_replace(Status::Closed);

        debug!("레지스트리 제거: {} (id={})", entry.endpoint, entry.id);
        was_connected.then_some(Event::ConnectionLost {
            peer: entry.endpoint,
        })
    }

    /// 대기가 끝난 항목 정리
    ///
    /// 타임아웃과 제거 사이에 연결이 성립했을 수 있으므로 상대에게 종료를
    /// 알리고, 그 경우의 연결 끊김 이벤트도 낸다.
    async fn abandon(&self, entry: &Entry) {
        let events: Vec<Event> = self
            .drop_entry(entry, true, Instant::now())
            .into_iter()
            .collect();
        self.emit(events).await;
    }

    async fn emit(&self, events: Vec<Event>) {
        for event in events {
            if self.events.send(event).await.is_err() {
                trace!("이벤트 수신자 없음");
            }
        }
    }

    async fn run_receiver(self: Arc<Self>, multiplexer: Arc<Multiplexer>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match multiplexer.recv(&mut buf).await {
                Ok((len, from)) => {
                    let events = self.dispatch(&multiplexer, &buf[..len], from, Instant::now());
                    self.emit(events).await;
                }
                Err(e) => {
                    warn!("수신 에러 ({}): {}", multiplexer.local_endpoint(), e);
                }
            }
        }
    }

    /// 수신 소켓 ID로 피어를 찾아 전달
    fn dispatch(
        &self,
        multiplexer: &Arc<Multiplexer>,
        datagram: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Event> {
        if !packet::is_valid(datagram) {
            trace!("잘못된 데이터그램 폐기: {} bytes from {}", datagram.len(), from);
            return Vec::new();
        }
        let Some(destination) = packet::destination_socket_id(datagram) else {
            return Vec::new();
        };

        let entry = if destination == 0 {
            // 수신 ID 0은 핸드쉐이크 요청만 허용
            if !HandshakePacket::is_valid(datagram) {
                debug!("수신 ID 0의 비 핸드쉐이크 패킷 폐기: {}", from);
                return Vec::new();
            }
            match self.registry.lookup(from) {
                Some(entry) => entry,
                None => match self.accept(multiplexer, from, now) {
                    Some(entry) => entry,
                    None => return Vec::new(),
                },
            }
        } else {
            match self.registry.get(destination) {
                Some(entry) => entry,
                None => {
                    trace!("알 수 없는 소켓 ID {} ({})", destination, from);
                    return Vec::new();
                }
            }
        };

        if entry.endpoint != from || !Arc::ptr_eq(&entry.multiplexer, multiplexer) {
            debug!(
                "엔드포인트 불일치 패킷 폐기: id={}, from={}, expected={}",
                entry.id, from, entry.endpoint
            );
            return Vec::new();
        }

        let incoming = entry.peer.lock().handle_datagram(datagram, now);
        self.settle(&entry, incoming, now)
    }

    fn settle(&self, entry: &Entry, incoming: Incoming, now: Instant) -> Vec<Event> {
        if let Some(observed) = incoming.observed_endpoint {
            if entry.multiplexer.record_external(observed) {
                info!(
                    "외부 주소 확인: {} -> {}",
                    entry.multiplexer.local_endpoint(),
                    observed
                );
            }
        }

        if incoming.connected {
            entry.status.send_replace(Status::Connected);
        }

        let mut events: Vec<Event> = incoming
            .messages
            .into_iter()
            .map(|payload| Event::Message {
                peer: entry.endpoint,
                payload,
            })
            .collect();

        if incoming.closed {
            events.extend(self.drop_entry(entry, false, now));
        }
        events
    }

    async fn run_timer(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let events = self.tick(Instant::now());
            self.emit(events).await;
        }
    }

    fn tick(&self, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();
        for entry in self.registry.snapshot() {
            let liveness = entry.peer.lock().on_tick(now);
            if let Liveness::Lost(reason) = liveness {
                info!("연결 끊김: {} ({})", entry.endpoint, reason);
                events.extend(self.drop_entry(&entry, false, now));
            }
        }
        events
    }
}

/// 연결 관리자
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// 새 관리자 생성. tokio 런타임 안에서 호출해야 한다.
    pub fn new(config: Config) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::channel(config.event_queue_size.max(1));
        let inner = Arc::new(Inner {
            config: Arc::new(config),
            registry: Registry::new(),
            multiplexers: RwLock::new(Vec::new()),
            bind_lock: tokio::sync::Mutex::new(()),
            events,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let timer = tokio::spawn(Inner::run_timer(inner.clone()));
        inner.tasks.lock().push(timer);

        (Self { inner }, receiver)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// 네트워크 참여
    ///
    /// 주 소켓을 바인딩하고 후보를 순서대로 시도해 처음으로 핸드쉐이크가
    /// 완료된 엔드포인트를 반환한다. 상대가 먼저 보낸 요청으로 이미 생긴
    /// 항목은 그대로 사용한다.
    pub async fn bootstrap(
        &self,
        candidates: &[SocketAddr],
        preferred_local: Option<SocketAddr>,
    ) -> Result<SocketAddr> {
        self.inner.ensure_open()?;
        let multiplexer = self.inner.primary_or_bind(preferred_local).await?;
        let local = multiplexer.local_endpoint();

        for &candidate in candidates {
            let is_self = candidate == local
                || (multiplexer.has_external() && candidate == multiplexer.external_endpoint());
            if is_self {
                debug!("자기 자신 후보 건너뜀: {}", candidate);
                continue;
            }

            let entry = match self.inner.connect(&multiplexer, candidate, false) {
                Ok(Inserted::New(entry)) | Ok(Inserted::Existing(entry)) => entry,
                Err(e) => {
                    debug!("부트스트랩 후보 실패 ({}): {}", candidate, e);
                    continue;
                }
            };

            if self
                .inner
                .wait_connected(&entry, self.inner.config.bootstrap_timeout())
                .await
            {
                info!("부트스트랩 완료: {} via {}", candidate, local);
                return Ok(candidate);
            }

            debug!("부트스트랩 후보 응답 없음: {}", candidate);
            if !entry.managed.load(Ordering::SeqCst) {
                self.inner.abandon(&entry).await;
            }
        }

        warn!("연결 가능한 부트스트랩 엔드포인트 없음 ({} candidates)", candidates.len());
        Err(Error::NoEndpointReachable)
    }

    /// 새 연결에 쓸 로컬 엔드포인트 쌍
    ///
    /// 1. 힌트 피어와 이미 연결된 소켓
    /// 2. 여유가 있는 기존 소켓
    /// 3. 새로 바인딩한 소켓 (외부 주소는 주 소켓의 외부 IP + 새 포트)
    pub async fn get_available_endpoint(&self, peer_hint: SocketAddr) -> Result<EndpointPair> {
        self.inner.ensure_open()?;

        if let Some(entry) = self.inner.registry.lookup(peer_hint) {
            return Ok(entry.multiplexer.endpoint_pair());
        }

        let _guard = self.inner.bind_lock.lock().await;
        let existing: Vec<Arc<Multiplexer>> = self.inner.multiplexers.read().clone();

        let spare = existing.iter().find(|multiplexer| {
            self.inner.registry.count_on(multiplexer) < self.inner.config.max_peers_per_transport
        });
        if let Some(multiplexer) = spare {
            return Ok(multiplexer.endpoint_pair());
        }

        let addr = match existing.first() {
            Some(primary) => SocketAddr::new(primary.local_endpoint().ip(), 0),
            None => self.inner.config.listen_addr,
        };
        let multiplexer = self.inner.bind(addr).await?;

        if let Some(primary) = existing.first() {
            if primary.has_external() {
                let external = SocketAddr::new(
                    primary.external_endpoint().ip(),
                    multiplexer.local_endpoint().port(),
                );
                multiplexer.record_external(external);
            }
        }

        debug!("새 엔드포인트 할당: {}", multiplexer.endpoint_pair());
        Ok(multiplexer.endpoint_pair())
    }

    /// 연결 추가
    ///
    /// 핸드쉐이크가 완료되면 검증 데이터를 첫 메시지로 보낸다.
    pub async fn add(&self, local: SocketAddr, peer: SocketAddr, validation: Bytes) -> Result<()> {
        self.inner.ensure_open()?;
        let config = &self.inner.config;

        if validation.len() > config.max_validation_data_size {
            return Err(Error::ValidationDataTooLarge {
                size: validation.len(),
                max: config.max_validation_data_size,
            });
        }

        let multiplexer = self
            .inner
            .find_multiplexer(local)
            .ok_or(Error::UnknownLocalEndpoint(local))?;

        let entry = match self.inner.connect(&multiplexer, peer, true)? {
            Inserted::New(entry) => {
                debug!("새 연결 시작: {} -> {} (id={})", local, peer, entry.id);
                entry
            }
            Inserted::Existing(entry) => {
                if entry.managed.swap(true, Ordering::SeqCst) {
                    return Err(Error::AlreadyConnected(peer));
                }
                debug!("기존 연결 승격: {} (id={})", peer, entry.id);
                entry
            }
        };

        if !self
            .inner
            .wait_connected(&entry, config.handshake_timeout())
            .await
        {
            warn!("핸드쉐이크 타임아웃: {} -> {}", local, peer);
            self.inner.abandon(&entry).await;
            return Err(Error::Timeout);
        }

        entry.peer.lock().send_message(validation, Instant::now())?;
        info!("연결 추가: {} -> {}", local, peer);
        Ok(())
    }

    /// 연결된 피어에게 메시지 전송
    pub fn send(&self, peer: SocketAddr, payload: Bytes) -> Result<()> {
        let entry = self
            .inner
            .registry
            .lookup(peer)
            .ok_or(Error::UnknownPeer(peer))?;

        let mut session = entry.peer.lock();
        if !session.is_connected() {
            return Err(Error::NotConnected);
        }
        session.send_message(payload, Instant::now())
    }

    /// 연결 제거. 상대에게 종료를 알리고 연결 끊김 이벤트를 한 번 낸다.
    pub async fn remove(&self, peer: SocketAddr) -> Result<()> {
        let entry = self
            .inner
            .registry
            .lookup(peer)
            .ok_or(Error::UnknownPeer(peer))?;

        let events: Vec<Event> = self
            .inner
            .drop_entry(&entry, true, Instant::now())
            .into_iter()
            .collect();
        self.inner.emit(events).await;

        info!("연결 제거: {}", peer);
        Ok(())
    }

    /// 모든 피어에게 종료를 알리고 태스크 정지. 이벤트는 내지 않는다.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        for entry in self.inner.registry.snapshot() {
            let _ = self.inner.drop_entry(&entry, true, now);
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.multiplexers.write().clear();

        info!("연결 관리자 종료");
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|entry| {
                let peer = entry.peer.lock();
                ConnectionInfo {
                    peer: entry.endpoint,
                    local: entry.multiplexer.endpoint_pair(),
                    socket_id: entry.id,
                    managed: entry.managed.load(Ordering::SeqCst),
                    connected: peer.is_connected(),
                    created_at: entry.created_at,
                    connected_at: peer.connected_at(),
                    last_activity: peer.last_activity(),
                }
            })
            .collect()
    }

    /// 주 소켓의 로컬 주소
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.inner.primary().map(|primary| primary.local_endpoint())
    }

    /// 주 소켓의 엔드포인트 쌍
    pub fn endpoint_pair(&self) -> Option<EndpointPair> {
        self.inner.primary().map(|primary| primary.endpoint_pair())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // 종료 패킷 없이 태스크만 정지
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

//! AP accept loop and per-connection protocol handling.

use crate::config::{GatewayConfig, IdleTimeoutPolicy};
use crate::error::SendError;
use crate::model::ap_key;
use crate::session::{writer_loop, ApSession, SessionSnapshot, SessionState};
use chrono::{DateTime, Utc};
use esl_core::frame::DATA_ACK;
use esl_core::inbound::{parse_result_frame, ResultFrame};
use esl_core::reassembly::{FrameAssembler, InboundFrame};
use esl_core::registration::{parse_registration, Registration};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

const READ_BUFFER_BYTES: usize = 8096;
const OUTBOUND_QUEUE: usize = 64;

/// Connection-level happenings forwarded to the gateway.
#[derive(Debug, Clone)]
pub enum StationEvent {
    Online {
        registration: Registration,
        remote: SocketAddr,
        with_data: bool,
    },
    Offline {
        store_code: String,
        ap_id: String,
    },
    Heartbeat {
        store_code: String,
        ap_id: String,
    },
    Results {
        store_code: String,
        ap_id: String,
        frame: ResultFrame,
    },
}

/// Session table keyed by store code + AP id.
pub struct ApRegistry {
    config: Arc<GatewayConfig>,
    conn_counter: AtomicU64,
    sessions: RwLock<HashMap<String, Arc<ApSession>>>,
    events: mpsc::Sender<StationEvent>,
}

impl ApRegistry {
    pub fn new(config: Arc<GatewayConfig>, events: mpsc::Sender<StationEvent>) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("ap-conn-{id}")
    }

    async fn emit(&self, event: StationEvent) {
        if self.events.send(event).await.is_err() {
            debug!(event = "esl_station_event_dropped");
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let conn_id = self.next_conn_id();
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        let mut buf = vec![0u8; READ_BUFFER_BYTES];

        let read = match tokio::time::timeout(
            self.config.registration_timeout(),
            reader.read(&mut buf),
        )
        .await
        {
            Ok(Ok(read)) if read > 0 => read,
            Ok(Ok(_)) => {
                debug!(event = "esl_registration_eof", conn_id = %conn_id, remote = %remote);
                return;
            }
            Ok(Err(err)) => {
                warn!(event = "esl_registration_invalid", conn_id = %conn_id, remote = %remote, error = %err);
                return;
            }
            Err(_) => {
                warn!(event = "esl_registration_invalid", conn_id = %conn_id, remote = %remote, error = "timeout");
                return;
            }
        };

        let registration = match parse_registration(&buf[..read]) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    event = "esl_registration_invalid",
                    conn_id = %conn_id,
                    remote = %remote,
                    error = %err,
                    raw = %String::from_utf8_lossy(&buf[..read])
                );
                return;
            }
        };

        let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let session = Arc::new(ApSession::new(
            conn_id.clone(),
            registration.clone(),
            remote,
            tx,
        ));
        self.install(&session).await;

        let writer_registry = self.clone();
        let writer_session = session.clone();
        let write_timeout = self.config.write_timeout();
        let writer_task = tokio::spawn(async move {
            let conn_id = writer_session.conn_id.clone();
            if writer_loop(conn_id, writer, rx, write_timeout).await.is_err() {
                writer_session.mark_faulted();
                writer_registry
                    .close_session(&writer_session, "SEND_ERROR")
                    .await;
            }
        });

        if let Err(err) = session.activate() {
            warn!(event = "esl_activate_failed", conn_id = %conn_id, error = %err);
            self.close_session(&session, "ACTIVATE_ERROR").await;
            let _ = writer_task.await;
            return;
        }
        info!(
            event = "esl_ap_registered",
            conn_id = %conn_id,
            store = %registration.store_code,
            ap_id = %registration.ap_id,
            mac = %registration.mac,
            remote = %remote,
            backlog = registration.has_backlog
        );
        self.emit(StationEvent::Online {
            with_data: registration.has_backlog,
            registration,
            remote,
        })
        .await;

        let reason = self.read_loop(&session, &mut reader, &mut buf).await;
        if let Some(reason) = reason {
            self.close_session(&session, reason).await;
        }
        drop(reader);
        let _ = writer_task.await;
    }

    /// Returns the close reason, or `None` when the session was stopped
    /// from elsewhere.
    async fn read_loop(
        self: &Arc<Self>,
        session: &Arc<ApSession>,
        reader: &mut OwnedReadHalf,
        buf: &mut [u8],
    ) -> Option<&'static str> {
        let mut stop = session.stop_signal();
        let mut assembler = FrameAssembler::default();
        if session.is_closed() {
            return None;
        }
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return None;
                    }
                }
                read = reader.read(buf) => {
                    match read {
                        Ok(0) => return Some("REMOTE_DISCONNECT"),
                        Ok(read) => self.on_receive(session, &mut assembler, &buf[..read]).await,
                        Err(err) => {
                            warn!(event = "esl_read_error", conn_id = %session.conn_id, error = %err);
                            return Some("RECEIVE_ERROR");
                        }
                    }
                }
            }
        }
    }

    async fn on_receive(
        self: &Arc<Self>,
        session: &Arc<ApSession>,
        assembler: &mut FrameAssembler,
        data: &[u8],
    ) {
        if data.len() == 1 {
            if data[0] == b'$' {
                debug!(event = "esl_ap_ping", store = %session.store_code(), ap_id = %session.ap_id());
                self.arm_watchdog(session, self.config.ping_watchdog());
            } else {
                debug!(event = "esl_ap_stray_byte", conn_id = %session.conn_id, byte = data[0]);
            }
            return;
        }

        session.cancel_watchdog();
        session.mark_received(Utc::now());
        if let Err(err) = session.enqueue(DATA_ACK.to_vec()) {
            debug!(event = "esl_ack_failed", conn_id = %session.conn_id, error = %err);
        }

        let report = assembler.push_chunk(data);
        for err in report.errors {
            debug!(event = "esl_frame_discarded", conn_id = %session.conn_id, error = %err);
        }
        for frame in report.frames {
            match frame {
                InboundFrame::Heartbeat(_) => {
                    self.readmit(session).await;
                    self.emit(StationEvent::Heartbeat {
                        store_code: session.store_code().to_string(),
                        ap_id: session.ap_id().to_string(),
                    })
                    .await;
                }
                InboundFrame::Result(text) => match parse_result_frame(&text) {
                    Ok(frame) => {
                        if !frame.code.is_ok() {
                            warn!(
                                event = "esl_ap_result_code",
                                store = %session.store_code(),
                                ap_id = %session.ap_id(),
                                code = %frame.code
                            );
                        }
                        self.emit(StationEvent::Results {
                            store_code: session.store_code().to_string(),
                            ap_id: session.ap_id().to_string(),
                            frame,
                        })
                        .await;
                    }
                    Err(err) => {
                        warn!(
                            event = "esl_result_parse_error",
                            store = %session.store_code(),
                            ap_id = %session.ap_id(),
                            error = %err
                        );
                    }
                },
            }
        }
    }

    /// Claims the session's key and closes whichever session held it. The
    /// swap happens under one write lock so concurrent registrations for a
    /// key never leave an untracked session running.
    async fn install(&self, session: &Arc<ApSession>) {
        let superseded = self
            .sessions
            .write()
            .await
            .insert(session.key(), session.clone());
        if let Some(existing) = superseded {
            warn!(
                event = "esl_ap_duplicate",
                store = %session.store_code(),
                ap_id = %session.ap_id(),
                old_conn_id = %existing.conn_id,
                conn_id = %session.conn_id
            );
            self.close_session(&existing, "DUP_ERROR").await;
        }
    }

    /// Puts a live session back in the table if it fell out, e.g. after a
    /// heartbeat on a connection the table no longer tracks.
    async fn readmit(&self, session: &Arc<ApSession>) {
        if session.is_closed() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        let key = session.key();
        let vacant = match sessions.get(&key) {
            Some(current) => current.is_closed(),
            None => true,
        };
        if vacant {
            sessions.insert(key, session.clone());
            info!(event = "esl_ap_readmitted", conn_id = %session.conn_id);
        }
    }

    fn arm_watchdog(self: &Arc<Self>, session: &Arc<ApSession>, after: Duration) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let target: Weak<ApSession> = Arc::downgrade(session);
        let policy = self.config.idle_timeout_policy;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let (Some(registry), Some(session)) = (registry.upgrade(), target.upgrade()) else {
                return;
            };
            session.detach_watchdog();
            let snapshot = session.snapshot();
            let now = Utc::now();
            warn!(
                event = "esl_session_timeout",
                conn_id = %snapshot.conn_id,
                store = %snapshot.store_code,
                ap_id = %snapshot.ap_id,
                air_ms = elapsed_ms(snapshot.last_recv, now),
                line_ms = elapsed_ms(snapshot.last_send, now),
                policy = %policy
            );
            if policy == IdleTimeoutPolicy::Close {
                registry.close_session(&session, "TIMEOUT").await;
            }
        });
        session.replace_watchdog(handle);
    }

    /// Sends a command frame to an idle AP and arms its reply watchdog.
    pub async fn send(
        self: &Arc<Self>,
        store_code: &str,
        ap_id: &str,
        frame: Vec<u8>,
    ) -> Result<(), SendError> {
        let session = self
            .session(store_code, ap_id)
            .await
            .ok_or_else(|| SendError::UnknownAp {
                store: store_code.to_string(),
                ap_id: ap_id.to_string(),
            })?;
        session.begin_send(frame, Utc::now())?;
        self.arm_watchdog(&session, self.config.send_watchdog());
        Ok(())
    }

    /// Closes a session once and evicts it, unless a newer connection has
    /// already taken its key. Only a session that was activated reports
    /// `Offline`; one closed during its handshake was never announced.
    pub async fn close_session(&self, session: &Arc<ApSession>, reason: &str) {
        let Some(previous) = session.shutdown() else {
            return;
        };
        {
            let key = session.key();
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(&key)
                .is_some_and(|current| current.conn_id == session.conn_id)
            {
                sessions.remove(&key);
            }
        }
        warn!(
            event = "esl_session_closed",
            conn_id = %session.conn_id,
            store = %session.store_code(),
            ap_id = %session.ap_id(),
            previous = ?previous,
            reason = reason
        );
        if previous != SessionState::Offline {
            self.emit(StationEvent::Offline {
                store_code: session.store_code().to_string(),
                ap_id: session.ap_id().to_string(),
            })
            .await;
        }
    }

    pub async fn close_all(&self, reason: &str) {
        let sessions = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for session in sessions {
            self.close_session(&session, reason).await;
        }
    }

    pub async fn session(&self, store_code: &str, ap_id: &str) -> Option<Arc<ApSession>> {
        self.sessions
            .read()
            .await
            .get(&ap_key(store_code, ap_id))
            .cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Store codes with at least one registered AP.
    pub async fn stores(&self) -> BTreeSet<String> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| session.store_code().to_string())
            .collect()
    }

    pub async fn snapshots(&self, store_code: Option<&str>) -> Vec<SessionSnapshot> {
        let mut snapshots = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| store_code.map_or(true, |store| session.store_code() == store))
            .map(|session| session.snapshot())
            .collect::<Vec<_>>();
        snapshots.sort_by(|a, b| (&a.store_code, &a.ap_id).cmp(&(&b.store_code, &b.ap_id)));
        snapshots
    }

    async fn ap_ids_where(&self, store_code: &str, keep: fn(SessionState) -> bool) -> Vec<String> {
        self.snapshots(Some(store_code))
            .await
            .into_iter()
            .filter(|snapshot| keep(snapshot.state))
            .map(|snapshot| snapshot.ap_id)
            .collect()
    }

    pub async fn online_ap_ids(&self, store_code: &str) -> Vec<String> {
        self.ap_ids_where(store_code, |state| {
            matches!(state, SessionState::Idle | SessionState::Working)
        })
        .await
    }

    pub async fn idle_ap_ids(&self, store_code: &str) -> Vec<String> {
        self.ap_ids_where(store_code, |state| state == SessionState::Idle)
            .await
    }

    pub async fn working_ap_ids(&self, store_code: &str) -> Vec<String> {
        self.ap_ids_where(store_code, |state| state == SessionState::Working)
            .await
    }
}

fn elapsed_ms(since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    since.map_or(-1, |at| (now - at).num_milliseconds())
}

/// Accepts AP connections until `shutdown` flips.
pub async fn serve(
    registry: Arc<ApRegistry>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(
        event = "esl_listener_start",
        addr = %local_addr,
        max_sessions = registry.config.max_sessions
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, remote)) => {
                        if registry.session_count().await >= registry.config.max_sessions {
                            warn!(event = "esl_session_limit", remote = %remote, max_sessions = registry.config.max_sessions);
                            drop(stream);
                            continue;
                        }
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            registry.handle_connection(stream, remote).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "esl_accept_error", error = %err);
                    }
                }
            }
        }
    }

    info!(event = "esl_listener_stop", addr = %local_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::task::JoinHandle;

    const HANDSHAKE: &str = "01,0,6,0001A1B2C3D4E5F6V100V001.00212345678";

    struct Harness {
        addr: SocketAddr,
        registry: Arc<ApRegistry>,
        events: mpsc::Receiver<StationEvent>,
        shutdown_tx: watch::Sender<bool>,
        handle: JoinHandle<io::Result<()>>,
    }

    async fn launch_listener(config: GatewayConfig) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, events) = mpsc::channel(64);
        let registry = Arc::new(ApRegistry::new(Arc::new(config), tx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(serve(registry.clone(), listener, shutdown_rx));
        Harness {
            addr,
            registry,
            events,
            shutdown_tx,
            handle,
        }
    }

    async fn read_some(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read");
        buf.truncate(read);
        buf
    }

    async fn next_event(events: &mut mpsc::Receiver<StationEvent>) -> StationEvent {
        tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("event timed out")
            .expect("event channel open")
    }

    async fn register(addr: SocketAddr, handshake: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(handshake.as_bytes())
            .await
            .expect("write handshake");
        let ack = read_some(&mut stream).await;
        assert!(ack.starts_with(b"ok \""), "unexpected ack {ack:?}");
        stream
    }

    async fn stop(harness: Harness) {
        let _ = harness.shutdown_tx.send(true);
        let result = harness.handle.await.expect("join listener");
        assert!(result.is_ok(), "listener returned error: {result:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registration_acknowledged_and_tracked() {
        let mut harness = launch_listener(GatewayConfig::default()).await;
        let _ap = register(harness.addr, HANDSHAKE).await;

        match next_event(&mut harness.events).await {
            StationEvent::Online {
                registration,
                with_data,
                ..
            } => {
                assert_eq!(registration.key(), "000101");
                assert!(!with_data);
            }
            other => panic!("expected online, got {other:?}"),
        }
        assert_eq!(harness.registry.idle_ap_ids("0001").await, vec!["01"]);
        assert_eq!(harness.registry.online_ap_ids("0001").await, vec!["01"]);
        assert!(harness.registry.working_ap_ids("0001").await.is_empty());
        stop(harness).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_handshake_is_dropped() {
        let harness = launch_listener(GatewayConfig::default()).await;
        let mut stream = TcpStream::connect(harness.addr).await.expect("connect");
        stream.write_all(b"hello there").await.expect("write");
        assert!(read_some(&mut stream).await.is_empty());
        assert_eq!(harness.registry.session_count().await, 0);
        stop(harness).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_registration_supersedes_old_connection() {
        let mut harness = launch_listener(GatewayConfig::default()).await;
        let mut first = register(harness.addr, HANDSHAKE).await;
        let first_conn = harness
            .registry
            .session("0001", "01")
            .await
            .expect("first session")
            .conn_id
            .clone();
        let _second = register(harness.addr, HANDSHAKE).await;

        assert!(read_some(&mut first).await.is_empty());
        let current = harness
            .registry
            .session("0001", "01")
            .await
            .expect("second session");
        assert_ne!(current.conn_id, first_conn);
        assert_eq!(harness.registry.session_count().await, 1);

        assert!(matches!(next_event(&mut harness.events).await, StationEvent::Online { .. }));
        assert!(matches!(next_event(&mut harness.events).await, StationEvent::Offline { .. }));
        assert!(matches!(next_event(&mut harness.events).await, StationEvent::Online { .. }));
        stop(harness).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn data_is_acknowledged_and_frames_dispatched() {
        let mut harness = launch_listener(GatewayConfig::default()).await;
        let mut ap = register(harness.addr, HANDSHAKE).await;
        let _online = next_event(&mut harness.events).await;

        harness
            .registry
            .send("0001", "01", b"E000010FFFFFEdata".to_vec())
            .await
            .expect("send");
        assert_eq!(read_some(&mut ap).await, b"E000010FFFFFEdata");
        assert_eq!(harness.registry.working_ap_ids("0001").await, vec!["01"]);
        assert!(matches!(
            harness.registry.send("0001", "01", b"x".to_vec()).await,
            Err(SendError::Busy(_))
        ));

        ap.write_all(b"-0004BEEF").await.expect("heartbeat");
        assert_eq!(read_some(&mut ap).await, DATA_ACK);
        assert!(matches!(
            next_event(&mut harness.events).await,
            StationEvent::Heartbeat { .. }
        ));
        assert_eq!(harness.registry.idle_ap_ids("0001").await, vec!["01"]);

        let node = "0123456789ABC41EV01S2900010A";
        let result = format!("<{:06X}{node}", node.len());
        ap.write_all(result.as_bytes()).await.expect("result");
        assert_eq!(read_some(&mut ap).await, DATA_ACK);
        match next_event(&mut harness.events).await {
            StationEvent::Results { ap_id, frame, .. } => {
                assert_eq!(ap_id, "01");
                assert_eq!(frame.reports.len(), 1);
                assert_eq!(frame.reports[0].tag_id, "0123456789AB");
            }
            other => panic!("expected results, got {other:?}"),
        }
        stop(harness).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remote_disconnect_evicts_session() {
        let mut harness = launch_listener(GatewayConfig::default()).await;
        let ap = register(harness.addr, HANDSHAKE).await;
        let _online = next_event(&mut harness.events).await;
        drop(ap);

        match next_event(&mut harness.events).await {
            StationEvent::Offline { store_code, ap_id } => {
                assert_eq!(store_code, "0001");
                assert_eq!(ap_id, "01");
            }
            other => panic!("expected offline, got {other:?}"),
        }
        assert_eq!(harness.registry.session_count().await, 0);
        stop(harness).await;
    }

    #[tokio::test]
    async fn stale_close_keeps_newer_session() {
        let (tx, mut events) = mpsc::channel(8);
        let registry = ApRegistry::new(Arc::new(GatewayConfig::default()), tx);
        let registration = parse_registration(HANDSHAKE.as_bytes()).expect("registration");
        let remote: SocketAddr = "127.0.0.1:50000".parse().expect("addr");
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);
        let old = Arc::new(ApSession::new(
            "ap-conn-1".to_string(),
            registration.clone(),
            remote,
            old_tx,
        ));
        let new = Arc::new(ApSession::new(
            "ap-conn-2".to_string(),
            registration,
            remote,
            new_tx,
        ));
        old.activate().expect("activate");
        new.activate().expect("activate");
        registry
            .sessions
            .write()
            .await
            .insert(new.key(), new.clone());

        registry.close_session(&old, "TIMEOUT").await;
        let current = registry.session("0001", "01").await.expect("newer kept");
        assert_eq!(current.conn_id, "ap-conn-2");
        assert!(matches!(events.recv().await, Some(StationEvent::Offline { .. })));

        registry.close_session(&old, "TIMEOUT").await;
        assert!(events.try_recv().is_err());
    }

    fn detached_session(conn_id: &str) -> (Arc<ApSession>, mpsc::Receiver<Vec<u8>>) {
        let registration = parse_registration(HANDSHAKE.as_bytes()).expect("registration");
        let remote: SocketAddr = "127.0.0.1:50000".parse().expect("addr");
        let (tx, rx) = mpsc::channel(4);
        (
            Arc::new(ApSession::new(conn_id.to_string(), registration, remote, tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn install_swaps_and_closes_previous_holder() {
        let (tx, mut events) = mpsc::channel(8);
        let registry = ApRegistry::new(Arc::new(GatewayConfig::default()), tx);
        let (first, _first_rx) = detached_session("ap-conn-1");
        let (second, _second_rx) = detached_session("ap-conn-2");
        let (third, _third_rx) = detached_session("ap-conn-3");
        first.activate().expect("activate");

        registry.install(&first).await;
        registry.install(&second).await;
        assert!(first.is_closed());
        assert!(matches!(events.try_recv(), Ok(StationEvent::Offline { .. })));

        registry.install(&third).await;
        assert!(second.is_closed());
        assert!(matches!(second.activate(), Err(SendError::SessionClosed(_))));
        assert!(events.try_recv().is_err());

        assert_eq!(registry.session_count().await, 1);
        let current = registry.session("0001", "01").await.expect("latest kept");
        assert_eq!(current.conn_id, "ap-conn-3");
        assert!(!third.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_duplicates_leave_one_live_session() {
        let harness = launch_listener(GatewayConfig::default()).await;
        let mut clients = Vec::new();
        for _ in 0..8 {
            let addr = harness.addr;
            clients.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.expect("connect");
                stream
                    .write_all(HANDSHAKE.as_bytes())
                    .await
                    .expect("write handshake");
                stream
            }));
        }
        let mut streams = Vec::new();
        for client in clients {
            streams.push(client.await.expect("join client"));
        }

        let mut settled = false;
        for _ in 0..150 {
            let live = harness.registry.session("0001", "01").await;
            if live.is_some_and(|session| session.state() == SessionState::Idle) {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(settled, "no session settled");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.registry.session_count().await, 1);
        let current = harness.registry.session("0001", "01").await.expect("session");
        assert!(!current.is_closed());
        drop(streams);
        stop(harness).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_policy_evicts_idle_session() {
        let config = GatewayConfig {
            ping_watchdog_secs: 1,
            idle_timeout_policy: IdleTimeoutPolicy::Close,
            ..GatewayConfig::default()
        };
        let mut harness = launch_listener(config).await;
        let mut ap = register(harness.addr, HANDSHAKE).await;
        let _online = next_event(&mut harness.events).await;

        ap.write_all(b"$").await.expect("ping");
        assert!(matches!(
            next_event(&mut harness.events).await,
            StationEvent::Offline { .. }
        ));
        assert!(read_some(&mut ap).await.is_empty());
        stop(harness).await;
    }
}

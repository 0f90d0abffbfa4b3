use crate::error::SendError;
use chrono::{DateTime, Local, Utc};
use esl_core::frame::registration_ack;
use esl_core::registration::Registration;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Offline,
    Idle,
    Working,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub conn_id: String,
    pub store_code: String,
    pub ap_id: String,
    pub remote: String,
    pub state: SessionState,
    pub last_send: Option<DateTime<Utc>>,
    pub last_recv: Option<DateTime<Utc>>,
}

struct SessionInner {
    state: SessionState,
    last_send: Option<DateTime<Utc>>,
    last_recv: Option<DateTime<Utc>>,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    watchdog: Option<JoinHandle<()>>,
}

/// One registered AP connection. Socket I/O runs in the listener's reader
/// task and a writer task fed through `outbound`.
pub struct ApSession {
    pub conn_id: String,
    pub registration: Registration,
    pub remote: SocketAddr,
    inner: Mutex<SessionInner>,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
}

impl ApSession {
    pub fn new(
        conn_id: String,
        registration: Registration,
        remote: SocketAddr,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            conn_id,
            registration,
            remote,
            inner: Mutex::new(SessionInner {
                state: SessionState::Offline,
                last_send: None,
                last_recv: None,
                outbound: Some(outbound),
                watchdog: None,
            }),
            closed: AtomicBool::new(false),
            stop,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store_code(&self) -> &str {
        &self.registration.store_code
    }

    pub fn ap_id(&self) -> &str {
        &self.registration.ap_id
    }

    pub fn key(&self) -> String {
        self.registration.key()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been shut down.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Accepts the handshake: acknowledges it and opens the session for
    /// traffic. An AP with backlog starts out busy.
    pub fn activate(&self) -> Result<(), SendError> {
        let mut inner = self.lock();
        if inner.outbound.is_none() {
            return Err(SendError::SessionClosed(self.conn_id.clone()));
        }
        inner.state = if self.registration.has_backlog {
            SessionState::Working
        } else {
            SessionState::Idle
        };
        self.push(&inner, registration_ack(Local::now().naive_local()))
    }

    /// Substantive data from the AP means it is ready for the next command.
    pub fn mark_received(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.last_recv = Some(now);
        if matches!(inner.state, SessionState::Idle | SessionState::Working) {
            inner.state = SessionState::Idle;
        }
    }

    pub fn enqueue(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        let inner = self.lock();
        self.push(&inner, bytes)
    }

    /// Queues a command frame for an idle AP and marks it busy.
    pub fn begin_send(&self, frame: Vec<u8>, now: DateTime<Utc>) -> Result<(), SendError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Offline => return Err(SendError::Offline(self.key())),
            SessionState::Error => return Err(SendError::Faulted(self.key())),
            SessionState::Working => return Err(SendError::Busy(self.key())),
            SessionState::Idle => {}
        }
        self.push(&inner, frame)?;
        inner.state = SessionState::Working;
        inner.last_send = Some(now);
        Ok(())
    }

    fn push(&self, inner: &SessionInner, bytes: Vec<u8>) -> Result<(), SendError> {
        let Some(outbound) = inner.outbound.as_ref() else {
            return Err(SendError::SessionClosed(self.conn_id.clone()));
        };
        outbound.try_send(bytes).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::ChannelFull(self.conn_id.clone()),
            mpsc::error::TrySendError::Closed(_) => SendError::SessionClosed(self.conn_id.clone()),
        })
    }

    pub fn mark_faulted(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::Offline {
            inner.state = SessionState::Error;
        }
    }

    /// Installs a new watchdog, cancelling the previous one.
    pub(crate) fn replace_watchdog(&self, handle: JoinHandle<()>) {
        let mut inner = self.lock();
        if self.is_closed() {
            handle.abort();
            return;
        }
        if let Some(previous) = inner.watchdog.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_watchdog(&self) {
        if let Some(handle) = self.lock().watchdog.take() {
            handle.abort();
        }
    }

    /// Called by a watchdog that has fired, so closing does not abort it.
    pub(crate) fn detach_watchdog(&self) {
        let _ = self.lock().watchdog.take();
    }

    /// Tears the session down once. Returns the state it was in, or `None`
    /// when it was already closed.
    pub fn shutdown(&self) -> Option<SessionState> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let mut inner = self.lock();
        inner.outbound = None;
        if let Some(handle) = inner.watchdog.take() {
            handle.abort();
        }
        let previous = inner.state;
        inner.state = SessionState::Offline;
        drop(inner);
        self.stop.send_replace(true);
        Some(previous)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            conn_id: self.conn_id.clone(),
            store_code: self.registration.store_code.clone(),
            ap_id: self.registration.ap_id.clone(),
            remote: self.remote.to_string(),
            state: inner.state,
            last_send: inner.last_send,
            last_recv: inner.last_recv,
        }
    }
}

/// Drains queued frames onto the socket. Returns an error when a write fails
/// or stalls past `write_timeout`; a closed queue ends the loop cleanly.
pub(crate) async fn writer_loop(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
) -> io::Result<()> {
    let mut outcome = Ok(());
    while let Some(frame) = rx.recv().await {
        let send = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {
                debug!(event = "esl_frame_sent", conn_id = %conn_id, bytes = frame.len());
            }
            Ok(Err(err)) => {
                warn!(event = "esl_write_error", conn_id = %conn_id, error = %err);
                outcome = Err(err);
                break;
            }
            Err(_) => {
                warn!(event = "esl_write_timeout", conn_id = %conn_id);
                outcome = Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use esl_core::registration::parse_registration;

    fn new_session(backlog: bool, capacity: usize) -> (ApSession, mpsc::Receiver<Vec<u8>>) {
        let flag = if backlog { "1" } else { "0" };
        let raw = format!("01,{flag},6,0001A1B2C3D4E5F6V100V001.00212345678");
        let registration = parse_registration(raw.as_bytes()).expect("registration");
        let (tx, rx) = mpsc::channel(capacity);
        let remote: SocketAddr = "127.0.0.1:50000".parse().expect("addr");
        (
            ApSession::new("conn-1".to_string(), registration, remote, tx),
            rx,
        )
    }

    #[tokio::test]
    async fn activation_acknowledges_registration() {
        let (idle, mut rx) = new_session(false, 4);
        assert_eq!(idle.state(), SessionState::Offline);
        idle.activate().expect("activate");
        assert_eq!(idle.state(), SessionState::Idle);
        let ack = rx.recv().await.expect("ack queued");
        assert!(ack.starts_with(b"ok \""));

        let (busy, _rx) = new_session(true, 4);
        busy.activate().expect("activate");
        assert_eq!(busy.state(), SessionState::Working);
    }

    #[tokio::test]
    async fn send_requires_idle_session() {
        let (session, mut rx) = new_session(false, 4);
        assert_eq!(
            session.begin_send(b"frame".to_vec(), Utc::now()),
            Err(SendError::Offline("000101".to_string()))
        );

        session.activate().expect("activate");
        let _ack = rx.recv().await;
        session.begin_send(b"frame".to_vec(), Utc::now()).expect("send");
        assert_eq!(session.state(), SessionState::Working);
        assert_eq!(
            session.begin_send(b"again".to_vec(), Utc::now()),
            Err(SendError::Busy("000101".to_string()))
        );

        session.mark_received(Utc::now());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.snapshot().last_send.is_some());

        session.mark_faulted();
        assert!(matches!(
            session.begin_send(b"x".to_vec(), Utc::now()),
            Err(SendError::Faulted(_))
        ));
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (session, _rx) = new_session(false, 1);
        session.activate().expect("activate");
        assert_eq!(
            session.enqueue(b"$".to_vec()),
            Err(SendError::ChannelFull("conn-1".to_string()))
        );
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (session, mut rx) = new_session(false, 4);
        session.activate().expect("activate");
        let mut stop = session.stop_signal();

        assert_eq!(session.shutdown(), Some(SessionState::Idle));
        assert_eq!(session.shutdown(), None);
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Offline);
        assert!(*stop.borrow_and_update());
        assert!(matches!(
            session.enqueue(b"$".to_vec()),
            Err(SendError::SessionClosed(_))
        ));

        let _ack = rx.recv().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_session_cannot_be_activated() {
        let (closed, _rx) = new_session(false, 4);
        assert_eq!(closed.shutdown(), Some(SessionState::Offline));
        assert!(matches!(closed.activate(), Err(SendError::SessionClosed(_))));
        assert_eq!(closed.state(), SessionState::Offline);
    }

    #[tokio::test]
    async fn watchdog_replaced_after_close_is_aborted() {
        let (session, _rx) = new_session(false, 4);
        session.shutdown();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        session.replace_watchdog(handle);
        assert!(session.lock().watchdog.is_none());
    }
}

//! Caller-facing gateway: owns the AP registry, the tag inventory and the
//! background loops, and exposes the push/broadcast/query surface.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Outcome};
use crate::fanout::EventFanout;
use crate::listener::{self, ApRegistry, StationEvent};
use crate::model::{
    ap_key, Ap, ApStatus, ApStatusEvent, ServerInfo, Tag, TaskData, TaskResult, TaskResultBatch,
};
use crate::scheduler::Dispatcher;
use crate::session::SessionSnapshot;
use crate::tagx::TagX;
use crate::throttle::{ErrorThrottle, LOOP_ERROR_EVERY};
use chrono::{DateTime, Utc};
use esl_core::frame::{encode_broadcast, Broadcast};
use esl_core::{is_store_code, is_tag_id, Page};
use futures_util::FutureExt;
use image::RgbImage;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared by the gateway handle and its background loops.
pub(crate) struct GatewayInner {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) registry: Arc<ApRegistry>,
    pub(crate) fanout: Arc<EventFanout>,
    tags: RwLock<HashMap<String, Arc<TagX>>>,
    aps: RwLock<HashMap<String, Ap>>,
}

impl GatewayInner {
    pub(crate) async fn tag_handles(&self) -> Vec<Arc<TagX>> {
        self.tags.read().await.values().cloned().collect()
    }

    async fn tag_or_insert(&self, tag_id: &str, store_code: &str) -> Arc<TagX> {
        if let Some(existing) = self.tags.read().await.get(tag_id) {
            return existing.clone();
        }
        self.tags
            .write()
            .await
            .entry(tag_id.to_string())
            .or_insert_with(|| Arc::new(TagX::new(Tag::new(tag_id, store_code))))
            .clone()
    }

    /// Mutates the AP record (creating it when unknown) and publishes the
    /// resulting status change.
    async fn update_ap<F>(&self, store_code: &str, ap_id: &str, reported: Option<ApStatus>, apply: F)
    where
        F: FnOnce(&mut Ap),
    {
        let event = {
            let mut aps = self.aps.write().await;
            let ap = aps
                .entry(ap_key(store_code, ap_id))
                .or_insert_with(|| Ap::new(store_code, ap_id));
            apply(ap);
            ApStatusEvent {
                store_code: ap.store_code.clone(),
                ap_id: ap.ap_id.clone(),
                status: reported.unwrap_or(ap.status),
                timestamp: Utc::now(),
            }
        };
        self.fanout.publish_status(event);
    }

    pub(crate) async fn note_ap_working(
        &self,
        store_code: &str,
        ap_id: &str,
        tasks: usize,
        now: DateTime<Utc>,
    ) {
        self.update_ap(store_code, ap_id, None, |ap| {
            ap.status = ApStatus::Working;
            ap.current_tasks = tasks;
            ap.last_send = Some(now);
        })
        .await;
    }

    async fn apply_station_event(&self, event: StationEvent) {
        let now = Utc::now();
        match event {
            StationEvent::Online {
                registration,
                remote,
                with_data,
            } => {
                let fresh = Ap::from_registration(&registration, Some(remote.to_string()));
                self.update_ap(&registration.store_code, &registration.ap_id, None, |ap| {
                    ap.remote = fresh.remote;
                    ap.mac = fresh.mac;
                    ap.hardware = fresh.hardware;
                    ap.firmware = fresh.firmware;
                    ap.status = if with_data {
                        ApStatus::Working
                    } else {
                        ApStatus::Online
                    };
                    ap.last_online = Some(now);
                })
                .await;
            }
            StationEvent::Offline { store_code, ap_id } => {
                self.update_ap(&store_code, &ap_id, None, |ap| {
                    ap.status = ApStatus::Offline;
                    ap.last_offline = Some(now);
                    ap.current_tasks = 0;
                })
                .await;
            }
            StationEvent::Heartbeat { store_code, ap_id } => {
                self.update_ap(&store_code, &ap_id, Some(ApStatus::Heartbeat), |ap| {
                    ap.status = ApStatus::Online;
                    ap.last_heartbeat = Some(now);
                })
                .await;
            }
            StationEvent::Results {
                store_code,
                ap_id,
                frame,
            } => {
                self.update_ap(&store_code, &ap_id, None, |ap| {
                    ap.status = ApStatus::Online;
                    ap.current_tasks = 0;
                })
                .await;

                let handles = {
                    let tags = self.tags.read().await;
                    frame
                        .reports
                        .iter()
                        .map(|report| (report, tags.get(&report.tag_id).cloned()))
                        .collect::<Vec<_>>()
                };
                let mut notify = Vec::new();
                for (report, tagx) in handles {
                    let Some(tagx) = tagx else {
                        debug!(event = "esl_report_unknown_tag", ap_id = %ap_id, tag_id = %report.tag_id);
                        continue;
                    };
                    if let Some(result) = tagx.write_b(
                        &ap_id,
                        report,
                        now,
                        self.config.retry_ceiling,
                        self.config.retry_ceiling_policy,
                    ) {
                        notify.push(result);
                    }
                }
                debug!(
                    event = "esl_results_applied",
                    store = %store_code,
                    ap_id = %ap_id,
                    reports = frame.reports.len(),
                    notified = notify.len()
                );
                self.fanout.publish_results(notify);
            }
        }
    }
}

/// Applies session events until shutdown, then hands the receiver back so
/// events raised while closing can still be applied.
fn spawn_station_pump(
    inner: Arc<GatewayInner>,
    mut rx: mpsc::Receiver<StationEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<mpsc::Receiver<StationEvent>> {
    tokio::spawn(async move {
        let mut throttle = ErrorThrottle::new("station_pump", LOOP_ERROR_EVERY);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let applied = AssertUnwindSafe(inner.apply_station_event(event))
                        .catch_unwind()
                        .await;
                    if applied.is_err() {
                        throttle.record("station event handler panicked");
                    }
                }
            }
        }
        rx
    })
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    listener: JoinHandle<io::Result<()>>,
    pump: JoinHandle<mpsc::Receiver<StationEvent>>,
    tasks: Vec<JoinHandle<()>>,
    drain_tx: watch::Sender<bool>,
    drains: Vec<JoinHandle<()>>,
}

enum RunState {
    Idle(Option<mpsc::Receiver<StationEvent>>),
    Running(Running),
    Stopped,
}

/// One gateway per listener. Construct it, register observers, `start` it
/// and `shutdown` it once; a stopped gateway cannot be restarted.
pub struct Gateway {
    inner: Arc<GatewayInner>,
    run: tokio::sync::Mutex<RunState>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let config = Arc::new(config);
        let (station_tx, station_rx) = mpsc::channel(config.station_queue_capacity.max(1));
        let registry = Arc::new(ApRegistry::new(config.clone(), station_tx));
        let fanout = Arc::new(EventFanout::new(config.event_queue_capacity));
        Self {
            inner: Arc::new(GatewayInner {
                config,
                registry,
                fanout,
                tags: RwLock::new(HashMap::new()),
                aps: RwLock::new(HashMap::new()),
            }),
            run: tokio::sync::Mutex::new(RunState::Idle(Some(station_rx))),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Binds the listener and starts the background loops.
    pub async fn start(&self) -> Result<SocketAddr, GatewayError> {
        let mut run = self.run.lock().await;
        let station_rx = match &mut *run {
            RunState::Running(running) => {
                return Err(GatewayError::AlreadyRunning(running.local_addr.to_string()))
            }
            RunState::Stopped => return Err(GatewayError::Stopped),
            RunState::Idle(station_rx) => station_rx.take(),
        };
        let Some(station_rx) = station_rx else {
            return Err(GatewayError::Stopped);
        };

        let config = &self.inner.config;
        let socket = match TcpListener::bind(&config.listen_addr).await {
            Ok(socket) => socket,
            Err(source) => {
                *run = RunState::Idle(Some(station_rx));
                return Err(GatewayError::Bind {
                    addr: config.listen_addr.clone(),
                    source,
                });
            }
        };
        let local_addr = socket.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Drains stop last so events raised while closing still reach observers.
        let (drain_tx, drain_rx) = watch::channel(false);
        let drains = self.inner.fanout.clone().spawn_drains(drain_rx);
        let tasks = vec![Dispatcher::spawn(self.inner.clone(), shutdown_rx.clone())];
        let pump = spawn_station_pump(self.inner.clone(), station_rx, shutdown_rx.clone());
        let listener = tokio::spawn(listener::serve(
            self.inner.registry.clone(),
            socket,
            shutdown_rx,
        ));

        info!(
            event = "esl_gateway_start",
            addr = %local_addr,
            dispatch_interval_ms = config.dispatch_interval_ms,
            idle_timeout_policy = %config.idle_timeout_policy,
            retry_ceiling = config.retry_ceiling,
            retry_ceiling_policy = %config.retry_ceiling_policy
        );
        *run = RunState::Running(Running {
            local_addr,
            shutdown_tx,
            listener,
            pump,
            tasks,
            drain_tx,
            drains,
        });
        Ok(local_addr)
    }

    /// Stops accepting, closes every session and joins the background loops.
    pub async fn shutdown(&self) {
        let mut run = self.run.lock().await;
        let running = match std::mem::replace(&mut *run, RunState::Stopped) {
            RunState::Running(running) => running,
            _ => return,
        };

        let _ = running.shutdown_tx.send(true);
        match running.listener.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(event = "esl_listener_error", error = %err),
            Err(err) => warn!(event = "esl_task_join_error", task = "listener", error = %err),
        }
        self.inner.registry.close_all("SHUTDOWN").await;

        match running.pump.await {
            Ok(mut rx) => {
                while let Ok(event) = rx.try_recv() {
                    self.inner.apply_station_event(event).await;
                }
            }
            Err(err) => warn!(event = "esl_task_join_error", task = "station_pump", error = %err),
        }
        for task in running.tasks {
            if let Err(err) = task.await {
                warn!(event = "esl_task_join_error", error = %err);
            }
        }
        let _ = running.drain_tx.send(true);
        for drain in running.drains {
            if let Err(err) = drain.await {
                warn!(event = "esl_task_join_error", task = "event_drain", error = %err);
            }
        }
        info!(event = "esl_gateway_stop", addr = %running.local_addr);
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.run.lock().await {
            RunState::Running(running) => Some(running.local_addr),
            _ => None,
        }
    }

    pub fn on_task_results<F>(&self, observer: F)
    where
        F: Fn(TaskResultBatch) + Send + Sync + 'static,
    {
        self.inner.fanout.on_task_results(Arc::new(observer));
    }

    pub fn on_ap_status<F>(&self, observer: F)
    where
        F: Fn(ApStatusEvent) + Send + Sync + 'static,
    {
        self.inner.fanout.on_ap_status(Arc::new(observer));
    }

    /// Seeds the inventory. Known tags keep their state; malformed ids are
    /// skipped.
    pub async fn load_basic_data(&self, tags: Vec<Tag>) -> Outcome {
        if tags.is_empty() {
            return Outcome::NullData;
        }
        let mut inventory = self.inner.tags.write().await;
        let mut added = 0usize;
        for tag in tags {
            if !is_tag_id(&tag.tag_id) {
                warn!(event = "esl_basic_data_rejected", tag_id = %tag.tag_id);
                continue;
            }
            if !inventory.contains_key(&tag.tag_id) {
                inventory.insert(tag.tag_id.clone(), Arc::new(TagX::new(tag)));
                added += 1;
            }
        }
        info!(event = "esl_basic_data_loaded", added = added, total = inventory.len());
        Outcome::Ok
    }

    /// Queues one full-screen image update.
    pub async fn push_image(&self, store_code: &str, tag_id: &str, image: RgbImage) -> Outcome {
        if !is_store_code(store_code) {
            return Outcome::InvalidStoreCode;
        }
        if !is_tag_id(tag_id) {
            return Outcome::InvalidTagId;
        }
        if image.width() == 0 || image.height() == 0 {
            return Outcome::InvalidImage;
        }
        self.push(store_code, vec![TaskData::image(tag_id, image)])
            .await
    }

    /// Decodes an encoded picture (PNG or BMP) and queues it.
    pub async fn push_image_bytes(&self, store_code: &str, tag_id: &str, bytes: &[u8]) -> Outcome {
        match image::load_from_memory(bytes) {
            Ok(decoded) => self.push_image(store_code, tag_id, decoded.to_rgb8()).await,
            Err(err) => {
                warn!(event = "esl_image_decode_failed", tag_id = %tag_id, error = %err);
                Outcome::InvalidImage
            }
        }
    }

    /// Installs one request per task. Unknown tags are created in
    /// `store_code`; a tag seen under another store moves to this one.
    pub async fn push(&self, store_code: &str, tasks: Vec<TaskData>) -> Outcome {
        if !is_store_code(store_code) {
            return Outcome::InvalidStoreCode;
        }
        if tasks.is_empty() {
            return Outcome::NullData;
        }

        let online = self.inner.registry.online_ap_ids(store_code).await;
        let mut created = 0usize;
        let mut rejected = 0usize;
        let mut dropped = Vec::new();
        for task in tasks {
            if !is_tag_id(&task.tag_id) {
                warn!(event = "esl_task_rejected", tag_id = %task.tag_id, reason = "invalid_tag_id");
                rejected += 1;
                continue;
            }
            if !task.is_complete() {
                warn!(event = "esl_task_rejected", tag_id = %task.tag_id, reason = "missing_image");
                rejected += 1;
                continue;
            }
            let tagx = self.inner.tag_or_insert(&task.tag_id, store_code).await;
            tagx.set_store_code(store_code);
            match tagx.write_a(&task, &online) {
                Ok(previous) => {
                    created += 1;
                    if let Some(previous) = previous {
                        debug!(event = "esl_task_dropped", tag_id = %previous.tag_id, task_id = %previous.task_id);
                        dropped.push(previous);
                    }
                }
                Err(err) => {
                    warn!(event = "esl_task_rejected", tag_id = %task.tag_id, reason = "encode", error = %err);
                    rejected += 1;
                }
            }
        }
        self.inner.fanout.publish_results(dropped);

        debug!(event = "esl_push", store = %store_code, created = created, rejected = rejected);
        match (created, rejected) {
            (0, _) => Outcome::NoTaskCreate,
            (_, 0) => Outcome::Ok,
            _ => Outcome::NotAllTaskCreate,
        }
    }

    /// Uses the configured default store code.
    pub async fn push_default(&self, tasks: Vec<TaskData>) -> Outcome {
        let store_code = self.inner.config.default_store_code.clone();
        self.push(&store_code, tasks).await
    }

    pub async fn led(
        &self,
        store_code: &str,
        red: bool,
        green: bool,
        blue: bool,
        times: i64,
        tag_ids: &[String],
    ) -> Outcome {
        let tasks = tag_ids
            .iter()
            .map(|tag_id| TaskData::led(tag_id, red, green, blue, times))
            .collect();
        self.push(store_code, tasks).await
    }

    pub async fn switch_page(&self, store_code: &str, tag_ids: &[String], page: i64) -> Outcome {
        let tasks = tag_ids
            .iter()
            .map(|tag_id| TaskData::switch_page(tag_id, page))
            .collect();
        self.push(store_code, tasks).await
    }

    pub async fn switch_page_all(&self, store_code: &str, page: i64) -> Outcome {
        let page = Page::clamped(page).index();
        self.broadcast(store_code, Broadcast::SwitchPage { page })
            .await
    }

    pub async fn display_barcode_all(&self, store_code: &str) -> Outcome {
        self.broadcast(store_code, Broadcast::DisplayBarcode).await
    }

    pub async fn shift_speed_all(&self, store_code: &str, fast: bool) -> Outcome {
        self.broadcast(store_code, Broadcast::ShiftSpeed { fast })
            .await
    }

    /// Broadcasts need at least one online AP and none working.
    async fn check_broadcast(&self, store_code: &str) -> Result<Vec<String>, Outcome> {
        let registry = &self.inner.registry;
        if registry.online_ap_ids(store_code).await.is_empty() {
            return Err(Outcome::NoApOnline);
        }
        if !registry.working_ap_ids(store_code).await.is_empty() {
            return Err(Outcome::ApBusy);
        }
        let idle = registry.idle_ap_ids(store_code).await;
        if idle.is_empty() {
            return Err(Outcome::NoApIdle);
        }
        Ok(idle)
    }

    async fn broadcast(&self, store_code: &str, command: Broadcast) -> Outcome {
        if !is_store_code(store_code) {
            return Outcome::InvalidStoreCode;
        }
        let idle = match self.check_broadcast(store_code).await {
            Ok(idle) => idle,
            Err(outcome) => return outcome,
        };

        let frame = encode_broadcast(command, 0);
        let now = Utc::now();
        let mut delivered = 0usize;
        for ap_id in idle {
            match self
                .inner
                .registry
                .send(store_code, &ap_id, frame.clone())
                .await
            {
                Ok(()) => {
                    delivered += 1;
                    self.inner.note_ap_working(store_code, &ap_id, 0, now).await;
                }
                Err(err) => {
                    warn!(event = "esl_broadcast_failed", store = %store_code, ap_id = %ap_id, command = ?command, error = %err);
                }
            }
        }
        info!(event = "esl_broadcast", store = %store_code, command = ?command, delivered = delivered);
        if delivered > 0 {
            Outcome::Ok
        } else {
            Outcome::Error
        }
    }

    /// Tags of one store, or every tag when `store_code` is `None`.
    pub async fn tags(&self, store_code: Option<&str>) -> Vec<Tag> {
        let mut tags = self
            .inner
            .tag_handles()
            .await
            .iter()
            .map(|tagx| tagx.tag())
            .filter(|tag| store_code.map_or(true, |store| tag.store_code == store))
            .collect::<Vec<_>>();
        tags.sort_by(|a, b| a.tag_id.cmp(&b.tag_id));
        tags
    }

    pub async fn tag(&self, tag_id: &str) -> Option<Tag> {
        self.inner.tags.read().await.get(tag_id).map(|tagx| tagx.tag())
    }

    /// The most recent in-flight snapshot for a tag.
    pub async fn task_result(&self, tag_id: &str) -> Option<TaskResult> {
        self.inner
            .tags
            .read()
            .await
            .get(tag_id)
            .and_then(|tagx| tagx.result())
    }

    pub async fn aps(&self, store_code: Option<&str>) -> Vec<Ap> {
        let mut aps = self
            .inner
            .aps
            .read()
            .await
            .values()
            .filter(|ap| store_code.map_or(true, |store| ap.store_code == store))
            .cloned()
            .collect::<Vec<_>>();
        aps.sort_by(|a, b| a.key().cmp(&b.key()));
        aps
    }

    pub async fn online_aps(&self, store_code: &str) -> Vec<String> {
        self.inner.registry.online_ap_ids(store_code).await
    }

    pub async fn idle_aps(&self, store_code: &str) -> Vec<String> {
        self.inner.registry.idle_ap_ids(store_code).await
    }

    pub async fn working_aps(&self, store_code: &str) -> Vec<String> {
        self.inner.registry.working_ap_ids(store_code).await
    }

    pub async fn sessions(&self, store_code: Option<&str>) -> Vec<SessionSnapshot> {
        self.inner.registry.snapshots(store_code).await
    }

    pub async fn server_info(&self) -> ServerInfo {
        let ceiling = self.inner.config.retry_ceiling;
        let tags = self.inner.tag_handles().await;
        let (ap_count, online_ap_count) = {
            let aps = self.inner.aps.read().await;
            let online = aps
                .values()
                .filter(|ap| matches!(ap.status, ApStatus::Online | ApStatus::Working))
                .count();
            (aps.len(), online)
        };
        ServerInfo {
            listen_addr: self.local_addr().await.map(|addr| addr.to_string()),
            ap_count,
            online_ap_count,
            tag_count: tags.len(),
            pending_work: tags.iter().filter(|tagx| tagx.has_pending_work(ceiling)).count(),
            in_flight: tags.iter().filter(|tagx| tagx.is_working(ceiling)).count(),
        }
    }
}

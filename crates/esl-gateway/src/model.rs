use chrono::{DateTime, Utc};
use esl_core::entity::{Flash, LedSignal};
use esl_core::inbound::{TagOutcome, TagReport};
use esl_core::registration::Registration;
use esl_core::{Page, Pattern};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Route history entries kept per task result.
pub const MAX_ROUTE_RECORDS: usize = 10;
/// Consecutive failures after which a tag is considered lost.
pub const LOST_AFTER_FAILURES: u32 = 255;
/// Battery level (volts) under which a tag reports low power.
pub const LOW_BATTERY_VOLTS: f32 = 2.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApStatus {
    Init,
    Online,
    Working,
    Offline,
    Error,
    Heartbeat,
}

impl Default for ApStatus {
    fn default() -> Self {
        Self::Init
    }
}

impl ApStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApStatus::Init => "init",
            ApStatus::Online => "online",
            ApStatus::Working => "working",
            ApStatus::Offline => "offline",
            ApStatus::Error => "error",
            ApStatus::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for ApStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ap {
    pub store_code: String,
    pub ap_id: String,
    pub remote: Option<String>,
    pub mac: String,
    pub hardware: String,
    pub firmware: String,
    pub status: ApStatus,
    pub last_online: Option<DateTime<Utc>>,
    pub last_offline: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_send: Option<DateTime<Utc>>,
    pub current_tasks: usize,
}

impl Ap {
    pub fn new(store_code: &str, ap_id: &str) -> Self {
        Self {
            store_code: store_code.to_string(),
            ap_id: ap_id.to_string(),
            remote: None,
            mac: String::new(),
            hardware: String::new(),
            firmware: String::new(),
            status: ApStatus::Init,
            last_online: None,
            last_offline: None,
            last_heartbeat: None,
            last_send: None,
            current_tasks: 0,
        }
    }

    pub fn from_registration(registration: &Registration, remote: Option<String>) -> Self {
        let mut ap = Self::new(&registration.store_code, &registration.ap_id);
        ap.remote = remote;
        ap.mac = registration.mac.clone();
        ap.hardware = registration.hardware.clone();
        ap.firmware = registration.firmware.clone();
        ap
    }

    pub fn key(&self) -> String {
        ap_key(&self.store_code, &self.ap_id)
    }
}

pub fn ap_key(store_code: &str, ap_id: &str) -> String {
    format!("{store_code}{ap_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagStatus {
    Init,
    Idle,
    Working,
    LowPower,
    Error,
    Lost,
}

impl Default for TagStatus {
    fn default() -> Self {
        Self::Init
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub tag_id: String,
    pub store_code: String,
    /// Last AP that delivered successfully; preferred route for new work.
    pub default_ap: Option<String>,
    /// Token of the most recently requested task.
    pub token: u16,
    pub battery: Option<f32>,
    pub temperature: Option<i32>,
    pub rf_power: Option<i32>,
    pub status: TagStatus,
    pub version: String,
    pub screen: String,
    pub total_send: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub last_send: Option<DateTime<Utc>>,
    pub last_recv: Option<DateTime<Utc>>,
}

impl Tag {
    pub fn new(tag_id: &str, store_code: &str) -> Self {
        Self {
            tag_id: tag_id.to_string(),
            store_code: store_code.to_string(),
            default_ap: None,
            token: 0,
            battery: None,
            temperature: None,
            rf_power: None,
            status: TagStatus::Init,
            version: String::new(),
            screen: String::new(),
            total_send: 0,
            error_count: 0,
            consecutive_errors: 0,
            last_send: None,
            last_recv: None,
        }
    }

    pub(crate) fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = TagStatus::Working;
        self.total_send += 1;
        self.last_send = Some(now);
    }

    /// Folds one report into the device health record. The token is left
    /// alone; it tracks requests, not acknowledgments.
    pub(crate) fn apply_report(&mut self, ap_id: &str, report: &TagReport, now: DateTime<Utc>) {
        self.last_recv = Some(now);
        match report.outcome() {
            TagOutcome::Success => {
                self.default_ap = Some(ap_id.to_string());
                self.rf_power = Some(report.rf_power);
                self.temperature = Some(report.temperature);
                self.consecutive_errors = 0;
                if !report.version.is_empty() {
                    self.version = report.version.clone();
                }
                if !report.screen.is_empty() {
                    self.screen = report.screen.clone();
                }
                self.status = TagStatus::Idle;
                if let Some(volts) = battery_volts(report.battery) {
                    self.battery = Some(volts);
                    if volts < LOW_BATTERY_VOLTS {
                        self.status = TagStatus::LowPower;
                    }
                }
            }
            TagOutcome::Failed | TagOutcome::Unknown => {
                self.error_count += 1;
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                self.status = if self.consecutive_errors > LOST_AFTER_FAILURES {
                    TagStatus::Lost
                } else {
                    TagStatus::Error
                };
            }
        }
    }
}

pub(crate) fn battery_volts(raw: u8) -> Option<f32> {
    (raw != 0).then(|| raw as f32 / 10.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Init,
    Sending,
    Success,
    Failed,
    Lost,
    Drop,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Init
    }
}

/// One delivery attempt as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub tag_id: String,
    pub route_record: Vec<String>,
    pub status: TaskStatus,
    pub send_count: u32,
    pub first_send: Option<DateTime<Utc>>,
    pub last_send: Option<DateTime<Utc>>,
    pub last_recv: Option<DateTime<Utc>>,
    pub token: u16,
    pub battery: Option<f32>,
    pub temperature: Option<i32>,
    pub rf_power: Option<i32>,
    pub version: String,
    pub screen: String,
}

impl TaskResult {
    pub fn new(task_id: Uuid, tag_id: &str, token: u16) -> Self {
        Self {
            task_id,
            tag_id: tag_id.to_string(),
            route_record: Vec::new(),
            status: TaskStatus::Init,
            send_count: 0,
            first_send: None,
            last_send: None,
            last_recv: None,
            token,
            battery: None,
            temperature: None,
            rf_power: None,
            version: String::new(),
            screen: String::new(),
        }
    }

    pub(crate) fn record_route(&mut self, ap_id: &str) {
        self.route_record.push(ap_id.to_string());
        if self.route_record.len() > MAX_ROUTE_RECORDS {
            let excess = self.route_record.len() - MAX_ROUTE_RECORDS;
            self.route_record.drain(..excess);
        }
    }
}

/// A caller request for one tag.
#[derive(Debug, Clone)]
pub struct TaskData {
    pub task_id: Uuid,
    pub tag_id: String,
    /// Pin delivery to one AP instead of the tag's usual routes.
    pub ap_id: Option<String>,
    pub image: Option<Arc<RgbImage>>,
    pub pattern: Pattern,
    pub page: Page,
    pub led: LedSignal,
}

impl TaskData {
    pub fn image(tag_id: &str, image: RgbImage) -> Self {
        Self::with_image(tag_id, Arc::new(image), Pattern::UpdateDisplay, Page::P0)
    }

    pub fn with_image(tag_id: &str, image: Arc<RgbImage>, pattern: Pattern, page: Page) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            tag_id: tag_id.to_string(),
            ap_id: None,
            image: Some(image),
            pattern,
            page,
            led: LedSignal::default(),
        }
    }

    /// LED flash request; `times` of -1 flashes until replaced.
    pub fn led(tag_id: &str, red: bool, green: bool, blue: bool, times: i64) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            tag_id: tag_id.to_string(),
            ap_id: None,
            image: None,
            pattern: Pattern::Led,
            page: Page::P0,
            led: LedSignal {
                red,
                green,
                blue,
                flash: Flash::from_request(times),
            },
        }
    }

    pub fn switch_page(tag_id: &str, page: i64) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            tag_id: tag_id.to_string(),
            ap_id: None,
            image: None,
            pattern: Pattern::Display,
            page: Page::clamped(page),
            led: LedSignal::default(),
        }
    }

    pub fn via_ap(mut self, ap_id: &str) -> Self {
        self.ap_id = Some(ap_id.to_string());
        self
    }

    /// Image patterns must carry pixels to be encodable.
    pub fn is_complete(&self) -> bool {
        !self.pattern.carries_image() || self.image.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApStatusEvent {
    pub store_code: String,
    pub ap_id: String,
    pub status: ApStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultBatch {
    pub results: Vec<TaskResult>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub listen_addr: Option<String>,
    pub ap_count: usize,
    pub online_ap_count: usize,
    pub tag_count: usize,
    pub pending_work: usize,
    pub in_flight: usize,
}

//! Per-tag task versions.
//!
//! `A` is the latest request, `B` the copy handed to an AP. Both carry the
//! request token; equal tokens mean nothing new is waiting behind the copy in
//! flight. Every transition happens under the tag's own lock so a new request,
//! a transfer to an AP and an incoming result never interleave.

use crate::config::RetryCeilingPolicy;
use crate::model::{battery_volts, Tag, TaskData, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use esl_core::entity::{encode_entity, TagCommand};
use esl_core::inbound::{TagOutcome, TagReport};
use esl_core::CodecError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct TagState {
    tag: Tag,
    a: Option<TaskResult>,
    b: Option<TaskResult>,
    payload: Option<Arc<Vec<u8>>>,
    routes: Vec<String>,
    /// Sends of the current token.
    attempts: u32,
}

impl TagState {
    fn same_token(&self) -> bool {
        match (&self.a, &self.b) {
            (Some(a), Some(b)) => a.token == b.token,
            (None, None) => true,
            _ => false,
        }
    }
}

pub struct TagX {
    tag_id: String,
    state: Mutex<TagState>,
}

impl TagX {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag_id: tag.tag_id.clone(),
            state: Mutex::new(TagState {
                tag,
                a: None,
                b: None,
                payload: None,
                routes: Vec::new(),
                attempts: 0,
            }),
        }
    }

    pub fn tag_id(&self) -> &str {
        &self.tag_id
    }

    fn lock(&self) -> MutexGuard<'_, TagState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a new request. The payload is encoded before any state
    /// changes, so a rejected task leaves the tag untouched. Returns the
    /// previous request as `Drop` when it never made it into flight.
    pub fn write_a(
        &self,
        task: &TaskData,
        store_aps: &[String],
    ) -> Result<Option<TaskResult>, CodecError> {
        let mut state = self.lock();
        let token = state.tag.token.wrapping_add(1);

        let mut command = TagCommand::new(&self.tag_id, token, task.pattern);
        command.page = task.page;
        command.led = task.led;
        command.image = task.image.as_deref();
        let payload = encode_entity(&command)?;

        let superseded = !state.same_token();
        let previous = match state.a.take() {
            Some(mut previous) if superseded => {
                previous.status = TaskStatus::Drop;
                Some(previous)
            }
            _ => None,
        };

        state.routes = if let Some(ap_id) = task.ap_id.as_ref().filter(|id| !id.is_empty()) {
            vec![ap_id.clone()]
        } else if let Some(default_ap) = state.tag.default_ap.clone() {
            vec![default_ap]
        } else {
            store_aps.to_vec()
        };
        state.a = Some(TaskResult::new(task.task_id, &self.tag_id, token));
        state.tag.token = token;
        state.payload = Some(Arc::new(payload));
        state.attempts = 0;
        Ok(previous)
    }

    /// Hands the current request to `ap_id`. Returns the payload that was
    /// actually transferred with the in-flight snapshot.
    pub fn transfer(&self, ap_id: &str, now: DateTime<Utc>) -> Option<(Arc<Vec<u8>>, TaskResult)> {
        let mut state = self.lock();
        let a = state.a.clone()?;
        let payload = state.payload.clone()?;

        state.attempts += 1;
        let mut b = match state.b.take() {
            Some(previous) if previous.token == a.token => previous,
            _ => a,
        };
        b.status = TaskStatus::Sending;
        b.send_count = state.attempts;
        b.first_send.get_or_insert(now);
        b.last_send = Some(now);
        state.b = Some(b.clone());

        state.routes.retain(|route| route != ap_id);
        state.tag.mark_sent(now);
        Some((payload, b))
    }

    /// Applies an AP report to the in-flight copy. Reports for any other
    /// token are stale and change nothing. Returns a snapshot only when
    /// observers must hear about it: the first success, or a failure once
    /// the retry ceiling is reached.
    pub fn write_b(
        &self,
        ap_id: &str,
        report: &TagReport,
        now: DateTime<Utc>,
        retry_ceiling: u32,
        policy: RetryCeilingPolicy,
    ) -> Option<TaskResult> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let b = state.b.as_mut().filter(|b| b.token == report.token)?;

        let outcome = report.outcome();
        let succeeded = outcome == TagOutcome::Success;
        let previous = b.status;
        let mut notify = None;

        if previous != TaskStatus::Success || succeeded {
            b.record_route(ap_id);
            b.rf_power = Some(report.rf_power);
            b.battery = battery_volts(report.battery);
            b.temperature = Some(report.temperature);
            b.version = report.version.clone();
            b.screen = report.screen.clone();
            b.last_recv = Some(now);
            if succeeded {
                b.status = TaskStatus::Success;
                if previous != TaskStatus::Success {
                    notify = Some(b.clone());
                }
            } else {
                let exhausted = b.send_count >= retry_ceiling;
                b.status = if exhausted && policy == RetryCeilingPolicy::MarkLost {
                    TaskStatus::Lost
                } else {
                    TaskStatus::Failed
                };
                if exhausted && !matches!(previous, TaskStatus::Failed | TaskStatus::Lost) {
                    notify = Some(b.clone());
                }
            }
        }

        state.tag.apply_report(ap_id, report, now);
        notify
    }

    /// Scheduling predicate. Refills the route list from `store_aps` when
    /// work remains and none of its routes is currently online.
    pub fn need_work_for(
        &self,
        store_aps: &[String],
        now: DateTime<Utc>,
        in_flight_grace: Duration,
        retry_ceiling: u32,
    ) -> bool {
        let mut state = self.lock();
        if state.payload.is_none() {
            return false;
        }
        let Some(a_token) = state.a.as_ref().map(|a| a.token) else {
            return false;
        };
        if let Some(b) = state.b.as_ref().filter(|b| b.token == a_token) {
            if matches!(b.status, TaskStatus::Success | TaskStatus::Lost) {
                return false;
            }
            if b.send_count >= retry_ceiling {
                return false;
            }
            if b.status == TaskStatus::Sending {
                let elapsed = b
                    .last_send
                    .and_then(|sent| (now - sent).to_std().ok())
                    .unwrap_or_default();
                if elapsed < in_flight_grace {
                    return false;
                }
            }
        }
        if !state.routes.iter().any(|route| store_aps.contains(route)) {
            state.routes = store_aps.to_vec();
        }
        true
    }

    /// True while anything is undelivered and not yet abandoned.
    pub fn has_pending_work(&self, retry_ceiling: u32) -> bool {
        let state = self.lock();
        let unfinished = state.b.as_ref().is_some_and(|b| {
            !matches!(b.status, TaskStatus::Success | TaskStatus::Lost)
                && b.send_count < retry_ceiling
        });
        unfinished || !state.same_token()
    }

    pub fn is_working(&self, retry_ceiling: u32) -> bool {
        self.lock()
            .b
            .as_ref()
            .is_some_and(|b| b.status == TaskStatus::Sending && b.send_count < retry_ceiling)
    }

    pub fn same_way(&self, ap_id: &str) -> bool {
        self.lock().routes.iter().any(|route| route == ap_id)
    }

    pub fn payload_len(&self) -> Option<usize> {
        self.lock().payload.as_ref().map(|payload| payload.len())
    }

    pub fn last_send(&self) -> Option<DateTime<Utc>> {
        self.lock().b.as_ref().and_then(|b| b.last_send)
    }

    pub fn store_code(&self) -> String {
        self.lock().tag.store_code.clone()
    }

    pub fn set_store_code(&self, store_code: &str) {
        let mut state = self.lock();
        if state.tag.store_code != store_code {
            state.tag.store_code = store_code.to_string();
        }
    }

    pub fn tag(&self) -> Tag {
        self.lock().tag.clone()
    }

    /// The in-flight snapshot, if anything has been sent.
    pub fn result(&self) -> Option<TaskResult> {
        self.lock().b.clone()
    }

    pub fn tokens(&self) -> (Option<u16>, Option<u16>) {
        let state = self.lock();
        (
            state.a.as_ref().map(|a| a.token),
            state.b.as_ref().map(|b| b.token),
        )
    }

    #[cfg(test)]
    fn routes(&self) -> Vec<String> {
        self.lock().routes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TagStatus;

    const TAG: &str = "300123456789";
    const GRACE: Duration = Duration::from_secs(300);
    const CEILING: u32 = 256;

    fn aps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn led_task() -> TaskData {
        TaskData::led(TAG, true, false, false, 3)
    }

    fn report(token: u16, rf_power: i32) -> TagReport {
        TagReport {
            tag_id: TAG.to_string(),
            rf_power,
            token,
            battery: 30,
            version: "V01".to_string(),
            screen: "S29".to_string(),
            temperature: 22,
            query: None,
        }
    }

    fn write_b(tagx: &TagX, token: u16, rf_power: i32) -> Option<TaskResult> {
        tagx.write_b("01", &report(token, rf_power), Utc::now(), CEILING, RetryCeilingPolicy::Abandon)
    }

    #[test]
    fn tokens_advance_and_wrap() {
        let mut tag = Tag::new(TAG, "0001");
        tag.token = 0xFFFE;
        let tagx = TagX::new(tag);
        tagx.write_a(&led_task(), &aps(&["01"])).expect("write");
        assert_eq!(tagx.tokens().0, Some(0xFFFF));
        tagx.write_a(&led_task(), &aps(&["01"])).expect("write");
        assert_eq!(tagx.tokens().0, Some(0));

        let (_, b) = tagx.transfer("01", Utc::now()).expect("transfer");
        assert_eq!(b.token, 0);
        assert_eq!(tagx.tokens(), (Some(0), Some(0)));
    }

    #[test]
    fn overwrite_before_send_reports_drop() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        let first = led_task();
        assert!(tagx.write_a(&first, &aps(&["01"])).expect("write").is_none());

        let dropped = tagx
            .write_a(&led_task(), &aps(&["01"]))
            .expect("write")
            .expect("previous request surfaced");
        assert_eq!(dropped.status, TaskStatus::Drop);
        assert_eq!(dropped.task_id, first.task_id);

        tagx.transfer("01", Utc::now()).expect("transfer");
        assert!(tagx.write_a(&led_task(), &aps(&["01"])).expect("write").is_none());
    }

    #[test]
    fn one_copy_in_flight_until_answered() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        let now = Utc::now();
        tagx.write_a(&led_task(), &aps(&["01", "02"])).expect("write");
        assert!(tagx.need_work_for(&aps(&["01", "02"]), now, GRACE, CEILING));

        let (_, b) = tagx.transfer("01", now).expect("transfer");
        assert_eq!(b.status, TaskStatus::Sending);
        assert_eq!(b.send_count, 1);
        assert_eq!(tagx.routes(), aps(&["02"]));
        assert!(tagx.is_working(CEILING));
        assert!(!tagx.need_work_for(&aps(&["01", "02"]), now, GRACE, CEILING));

        let later = now + chrono::Duration::seconds(301);
        assert!(tagx.need_work_for(&aps(&["01", "02"]), later, GRACE, CEILING));
    }

    #[test]
    fn stale_ack_changes_nothing() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        tagx.write_a(&led_task(), &aps(&["01"])).expect("write");
        let (_, sent) = tagx.transfer("01", Utc::now()).expect("transfer");
        let tag_before = tagx.tag();

        assert!(write_b(&tagx, sent.token.wrapping_add(7), -60).is_none());
        assert_eq!(tagx.result(), Some(sent));
        assert_eq!(tagx.tag(), tag_before);
    }

    #[test]
    fn success_notifies_once() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        tagx.write_a(&led_task(), &aps(&["01"])).expect("write");
        let (_, sent) = tagx.transfer("01", Utc::now()).expect("transfer");

        let done = write_b(&tagx, sent.token, -60).expect("first success notifies");
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.route_record, aps(&["01"]));
        assert_eq!(done.battery, Some(3.0));
        assert!(write_b(&tagx, sent.token, -60).is_none());

        assert!(write_b(&tagx, sent.token, -256).is_none());
        assert_eq!(tagx.result().map(|b| b.status), Some(TaskStatus::Success));

        let tag = tagx.tag();
        assert_eq!(tag.status, TagStatus::Error);
        assert_eq!(tag.default_ap.as_deref(), Some("01"));
        assert!(!tagx.has_pending_work(CEILING));
        assert!(!tagx.need_work_for(&aps(&["01"]), Utc::now(), GRACE, CEILING));
    }

    #[test]
    fn failure_retries_then_abandons_at_ceiling() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        let ceiling = 3;
        let mut now = Utc::now();
        tagx.write_a(&led_task(), &aps(&["01"])).expect("write");

        for attempt in 1..=ceiling {
            assert!(tagx.need_work_for(&aps(&["01"]), now, GRACE, ceiling));
            let (_, sent) = tagx.transfer("01", now).expect("transfer");
            assert_eq!(sent.send_count, attempt);
            let notified = tagx.write_b(
                "01",
                &report(sent.token, -256),
                now,
                ceiling,
                RetryCeilingPolicy::Abandon,
            );
            assert_eq!(notified.is_some(), attempt == ceiling);
            now += chrono::Duration::seconds(1);
        }

        assert_eq!(tagx.result().map(|b| b.status), Some(TaskStatus::Failed));
        assert!(!tagx.need_work_for(&aps(&["01"]), now, GRACE, ceiling));
        assert!(!tagx.has_pending_work(ceiling));
        assert!(!tagx.is_working(ceiling));
    }

    #[test]
    fn mark_lost_policy_reports_lost() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        tagx.write_a(&led_task(), &aps(&["01"])).expect("write");
        let (_, sent) = tagx.transfer("01", Utc::now()).expect("transfer");
        let lost = tagx
            .write_b("01", &report(sent.token, -256), Utc::now(), 1, RetryCeilingPolicy::MarkLost)
            .expect("ceiling reached");
        assert_eq!(lost.status, TaskStatus::Lost);
        assert!(!tagx.need_work_for(&aps(&["01"]), Utc::now(), GRACE, 1));
    }

    #[test]
    fn exhausted_routes_refill_from_store() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        let now = Utc::now();
        tagx.write_a(&led_task().via_ap("07"), &aps(&["01", "02"])).expect("write");
        assert_eq!(tagx.routes(), aps(&["07"]));

        let (_, sent) = tagx.transfer("07", now).expect("transfer");
        assert!(tagx.routes().is_empty());
        write_b(&tagx, sent.token, -256);

        assert!(tagx.need_work_for(&aps(&["01", "02"]), now, GRACE, CEILING));
        assert!(tagx.same_way("01"));
        assert!(tagx.same_way("02"));
        assert!(!tagx.same_way("07"));
    }

    #[test]
    fn default_ap_preferred_after_success() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        tagx.write_a(&led_task(), &aps(&["01", "02"])).expect("write");
        let (_, sent) = tagx.transfer("02", Utc::now()).expect("transfer");
        tagx.write_b("02", &report(sent.token, -50), Utc::now(), CEILING, RetryCeilingPolicy::Abandon);

        tagx.write_a(&led_task(), &aps(&["01", "02", "03"])).expect("write");
        assert_eq!(tagx.routes(), aps(&["02"]));
    }

    #[test]
    fn superseded_request_skips_in_flight_wait() {
        let tagx = TagX::new(Tag::new(TAG, "0001"));
        let now = Utc::now();
        tagx.write_a(&led_task(), &aps(&["01"])).expect("write");
        tagx.transfer("01", now).expect("transfer");
        assert!(!tagx.need_work_for(&aps(&["01"]), now, GRACE, CEILING));

        tagx.write_a(&led_task(), &aps(&["01"])).expect("write");
        assert!(tagx.has_pending_work(CEILING));
        assert!(tagx.need_work_for(&aps(&["01"]), now, GRACE, CEILING));
        let (_, resent) = tagx.transfer("01", now).expect("transfer");
        assert_eq!(resent.send_count, 1);
    }

    #[test]
    fn invalid_request_leaves_state_untouched() {
        let tagx = TagX::new(Tag::new("not-a-tag-id", "0001"));
        assert!(tagx.write_a(&TaskData::led("not-a-tag-id", true, true, true, 1), &[]).is_err());
        assert_eq!(tagx.tokens(), (None, None));
        assert!(tagx.payload_len().is_none());
        assert!(!tagx.need_work_for(&aps(&["01"]), Utc::now(), GRACE, CEILING));
    }
}

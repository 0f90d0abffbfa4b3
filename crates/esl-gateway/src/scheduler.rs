//! Periodic matching of pending tag work against idle APs.

use crate::gateway::GatewayInner;
use crate::model::TaskResult;
use crate::tagx::TagX;
use crate::throttle::{ErrorThrottle, StallCounter, LOOP_ERROR_EVERY};
use chrono::{DateTime, Utc};
use esl_core::frame::encode_batch;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_tags: usize,
    pub max_bytes: usize,
}

/// Entities packed for one AP in one cycle.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ap_id: String,
    pub entities: Vec<Arc<Vec<u8>>>,
    pub bytes: usize,
    pub results: Vec<TaskResult>,
}

impl Batch {
    fn new(ap_id: &str) -> Self {
        Self {
            ap_id: ap_id.to_string(),
            entities: Vec::new(),
            bytes: 0,
            results: Vec::new(),
        }
    }

    fn has_room(&self, len: usize, limits: BatchLimits) -> bool {
        self.entities.len() < limits.max_tags && self.bytes + len <= limits.max_bytes
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Greedy assignment for one store. `candidates` must already be filtered
/// to tags that need work and sorted oldest-send first. A tag may land in
/// several batches when more than one idle AP is on its route list.
pub fn plan_store(
    candidates: &[Arc<TagX>],
    idle_aps: &[String],
    limits: BatchLimits,
    now: DateTime<Utc>,
) -> Vec<Batch> {
    let mut batches = idle_aps
        .iter()
        .map(|ap_id| Batch::new(ap_id))
        .collect::<Vec<_>>();

    for tagx in candidates {
        let Some(len) = tagx.payload_len() else {
            continue;
        };
        for batch in batches.iter_mut() {
            if !batch.has_room(len, limits) || !tagx.same_way(&batch.ap_id) {
                continue;
            }
            if let Some((payload, result)) = tagx.transfer(&batch.ap_id, now) {
                batch.bytes += payload.len();
                batch.entities.push(payload);
                batch.results.push(result);
            }
        }
    }

    batches.retain(|batch| !batch.is_empty());
    batches
}

/// Oldest attempt first; never-sent tags lead.
pub(crate) fn sort_by_last_send(candidates: &mut [Arc<TagX>]) {
    candidates.sort_by_key(|tagx| tagx.last_send());
}

#[derive(Default)]
struct StoreStalls {
    no_idle_ap: Option<StallCounter>,
    no_work: Option<StallCounter>,
}

pub(crate) struct Dispatcher {
    inner: Arc<GatewayInner>,
    throttle: ErrorThrottle,
    stalls: HashMap<String, StoreStalls>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        inner: Arc<GatewayInner>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut dispatcher = Dispatcher {
            inner,
            throttle: ErrorThrottle::new("dispatcher", LOOP_ERROR_EVERY),
            stalls: HashMap::new(),
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dispatcher.inner.config.dispatch_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let cycle = AssertUnwindSafe(dispatcher.cycle()).catch_unwind().await;
                        if let Err(panic) = cycle {
                            let message = panic
                                .downcast_ref::<&str>()
                                .map(|text| text.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "dispatch cycle panicked".to_string());
                            dispatcher.throttle.record(&message);
                        }
                    }
                }
            }
        })
    }

    async fn cycle(&mut self) {
        let inner = self.inner.clone();
        let config = &inner.config;
        let stores = inner.registry.stores().await;
        let tags = inner.tag_handles().await;
        if stores.is_empty() || tags.is_empty() {
            return;
        }

        let limits = BatchLimits {
            max_tags: config.batch_max_tags,
            max_bytes: config.batch_max_bytes,
        };
        let now = Utc::now();
        let mut sent = 0usize;

        for store in stores {
            let idle = inner.registry.idle_ap_ids(&store).await;
            let stalls = self.stalls.entry(store.clone()).or_default();
            if idle.is_empty() {
                let counter = stalls
                    .no_idle_ap
                    .get_or_insert_with(|| StallCounter::new(config.stall_log_every));
                if counter.tick() {
                    warn!(event = "esl_dispatch_no_idle_ap", store = %store, cycles = config.stall_log_every);
                }
                continue;
            }
            if let Some(counter) = stalls.no_idle_ap.as_mut() {
                counter.reset();
            }

            let online = inner.registry.online_ap_ids(&store).await;
            let mut candidates = tags
                .iter()
                .filter(|tagx| tagx.store_code() == store)
                .filter(|tagx| {
                    tagx.need_work_for(&online, now, config.in_flight_grace(), config.retry_ceiling)
                })
                .cloned()
                .collect::<Vec<_>>();
            if candidates.is_empty() {
                let counter = stalls
                    .no_work
                    .get_or_insert_with(|| StallCounter::new(config.stall_log_every));
                if counter.tick() {
                    warn!(event = "esl_dispatch_no_work", store = %store, cycles = config.stall_log_every);
                }
                continue;
            }
            if let Some(counter) = stalls.no_work.as_mut() {
                counter.reset();
            }

            sort_by_last_send(&mut candidates);
            for batch in plan_store(&candidates, &idle, limits, now) {
                let entities = batch
                    .entities
                    .iter()
                    .map(|payload| payload.as_slice())
                    .collect::<Vec<_>>();
                let frame = match encode_batch(&entities) {
                    Ok(frame) => frame,
                    Err(err) => {
                        self.throttle.record(&err.to_string());
                        continue;
                    }
                };
                match inner.registry.send(&store, &batch.ap_id, frame).await {
                    Ok(()) => {
                        sent += batch.len();
                        debug!(
                            event = "esl_batch_sent",
                            store = %store,
                            ap_id = %batch.ap_id,
                            tags = batch.len(),
                            bytes = batch.bytes
                        );
                        inner
                            .note_ap_working(&store, &batch.ap_id, batch.len(), now)
                            .await;
                        inner.fanout.publish_results(batch.results);
                    }
                    Err(err) => {
                        warn!(
                            event = "esl_dispatch_send_failed",
                            store = %store,
                            ap_id = %batch.ap_id,
                            tags = batch.len(),
                            error = %err
                        );
                    }
                }
            }
        }

        let pending = tags
            .iter()
            .filter(|tagx| tagx.has_pending_work(config.retry_ceiling))
            .count();
        let in_flight = tags
            .iter()
            .filter(|tagx| tagx.is_working(config.retry_ceiling))
            .count();
        debug!(event = "esl_dispatch_cycle", pending = pending, in_flight = in_flight, sent = sent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Tag, TaskData, TaskStatus};
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    const LIMITS: BatchLimits = BatchLimits {
        max_tags: 0xD0,
        max_bytes: 0x80000,
    };
    const GRACE: Duration = Duration::from_secs(300);
    const CEILING: u32 = 256;

    fn aps(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn led_tags(count: usize, store_aps: &[String]) -> Vec<Arc<TagX>> {
        (0..count)
            .map(|index| {
                let tag_id = format!("3000{index:08X}");
                let tagx = Arc::new(TagX::new(Tag::new(&tag_id, "0001")));
                tagx.write_a(&TaskData::led(&tag_id, true, false, false, 2), store_aps)
                    .expect("write");
                tagx
            })
            .collect()
    }

    fn noisy_image(width: u32, height: u32) -> RgbImage {
        let mut seed = 0x2545_F491u32;
        RgbImage::from_fn(width, height, |_, _| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 3 {
                0 => Rgb([0, 0, 0]),
                1 => Rgb([255, 0, 0]),
                _ => Rgb([255, 255, 255]),
            }
        })
    }

    #[test]
    fn tag_count_quota_defers_excess() {
        let store_aps = aps(&["01"]);
        let tags = led_tags(250, &store_aps);
        let now = Utc::now();

        let first = plan_store(&tags, &store_aps, LIMITS, now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].len(), 208);
        assert_eq!(first[0].results.len(), 208);
        assert!(first[0].results.iter().all(|r| r.status == TaskStatus::Sending));

        let remaining = tags
            .iter()
            .filter(|tagx| tagx.need_work_for(&store_aps, now, GRACE, CEILING))
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(remaining.len(), 42);
        let second = plan_store(&remaining, &store_aps, LIMITS, now);
        assert_eq!(second[0].len(), 42);
    }

    #[test]
    fn byte_quota_defers_excess() {
        let store_aps = aps(&["01"]);
        let image = Arc::new(noisy_image(800, 480));
        let tags = (0..8)
            .map(|index| {
                let tag_id = format!("4400{index:08X}");
                let tagx = Arc::new(TagX::new(Tag::new(&tag_id, "0001")));
                let task = TaskData::with_image(
                    &tag_id,
                    image.clone(),
                    esl_core::Pattern::UpdateDisplay,
                    esl_core::Page::P0,
                );
                tagx.write_a(&task, &store_aps).expect("write");
                tagx
            })
            .collect::<Vec<_>>();
        let payload = tags[0].payload_len().expect("payload");
        assert!(payload * tags.len() > LIMITS.max_bytes);

        let batches = plan_store(&tags, &store_aps, LIMITS, Utc::now());
        assert_eq!(batches.len(), 1);
        assert!(batches[0].bytes <= LIMITS.max_bytes);
        assert_eq!(batches[0].len(), LIMITS.max_bytes / payload);
        assert!(batches[0].len() < tags.len());
    }

    #[test]
    fn only_routed_aps_receive_work() {
        let tags = led_tags(3, &aps(&["01"]));
        let pinned = Arc::new(TagX::new(Tag::new("3000AAAAAAAA", "0001")));
        pinned
            .write_a(&TaskData::led("3000AAAAAAAA", false, true, false, 1).via_ap("02"), &[])
            .expect("write");
        let mut candidates = tags.clone();
        candidates.push(pinned);

        let batches = plan_store(&candidates, &aps(&["01", "02"]), LIMITS, Utc::now());
        let by_ap = batches
            .iter()
            .map(|batch| (batch.ap_id.as_str(), batch.len()))
            .collect::<HashMap<_, _>>();
        assert_eq!(by_ap.get("01"), Some(&3));
        assert_eq!(by_ap.get("02"), Some(&1));
    }

    #[test]
    fn oldest_attempt_sorts_first() {
        let store_aps = aps(&["01"]);
        let tags = led_tags(3, &store_aps);
        let now = Utc::now();
        tags[0].transfer("01", now);
        tags[1].transfer("01", now - chrono::Duration::seconds(30));

        let mut ordered = tags.clone();
        sort_by_last_send(&mut ordered);
        assert_eq!(ordered[0].tag_id(), tags[2].tag_id());
        assert_eq!(ordered[1].tag_id(), tags[1].tag_id());
        assert_eq!(ordered[2].tag_id(), tags[0].tag_id());
    }
}

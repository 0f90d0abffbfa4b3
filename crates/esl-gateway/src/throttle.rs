use tracing::error;

/// Repeat period shared by every background loop's error log.
pub(crate) const LOOP_ERROR_EVERY: u64 = 256;

/// Rate limit for errors raised by a background loop. The first occurrence
/// of a message is logged, then every `every`-th repeat of the same message.
pub(crate) struct ErrorThrottle {
    loop_name: &'static str,
    every: u64,
    count: u64,
    last: Option<String>,
}

impl ErrorThrottle {
    pub(crate) fn new(loop_name: &'static str, every: u64) -> Self {
        Self {
            loop_name,
            every: every.max(1),
            count: 0,
            last: None,
        }
    }

    /// Returns the repeat count when this occurrence should be logged.
    pub(crate) fn admit(&mut self, message: &str) -> Option<u64> {
        if self.last.as_deref() != Some(message) {
            self.last = Some(message.to_string());
            self.count = 1;
            return Some(1);
        }
        self.count += 1;
        (self.count % self.every == 0).then_some(self.count)
    }

    pub(crate) fn record(&mut self, message: &str) {
        if let Some(repeats) = self.admit(message) {
            error!(
                event = "esl_loop_error",
                loop_name = self.loop_name,
                repeats = repeats,
                error = message
            );
        }
    }
}

/// Counts consecutive idle cycles and fires once per `every` of them.
pub(crate) struct StallCounter {
    every: u32,
    count: u32,
}

impl StallCounter {
    pub(crate) fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    pub(crate) fn tick(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.every {
            self.count = 0;
            return true;
        }
        false
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }
}

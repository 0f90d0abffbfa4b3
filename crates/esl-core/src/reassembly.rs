use crate::error::CodecError;
use crate::wire::parse_hex_field;

pub const DEFAULT_MAX_PENDING_BYTES: usize = 256 * 1024;

/// A chunk at least this long that opens with a frame marker is treated as a
/// fresh transmission and replaces any partial frame still buffered.
const RESTART_MIN_CHUNK: usize = 33;
const HEADER_OVERHEAD: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Heartbeat(String),
    Result(String),
}

#[derive(Debug, Default)]
pub struct AssemblyReport {
    pub frames: Vec<InboundFrame>,
    pub errors: Vec<CodecError>,
}

fn is_marker(c: char) -> bool {
    matches!(c, '<' | '>' | '-')
}

fn starts_with_marker(text: &str) -> bool {
    text.chars().next().is_some_and(is_marker)
}

/// Collects AP output until the length declared in the frame header is met.
pub struct FrameAssembler {
    max_pending_bytes: usize,
    pending: String,
}

impl FrameAssembler {
    pub fn new(max_pending_bytes: usize) -> Self {
        Self {
            max_pending_bytes,
            pending: String::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> AssemblyReport {
        let mut report = AssemblyReport::default();
        let decoded = String::from_utf8_lossy(chunk);
        let text = decoded.strip_prefix('$').unwrap_or(&decoded);
        if text.is_empty() {
            return report;
        }

        if !self.pending.is_empty() && starts_with_marker(text) && text.len() >= RESTART_MIN_CHUNK
        {
            self.pending.clear();
        }
        self.pending.push_str(text);

        if !starts_with_marker(&self.pending) {
            report.errors.push(CodecError::Unframed {
                len: self.pending.len(),
            });
            self.pending.clear();
            return report;
        }

        match self.declared_total() {
            Ok(Some(total)) if self.pending.len() >= total => {
                let frame = std::mem::take(&mut self.pending);
                if frame.starts_with('-') {
                    report.frames.push(InboundFrame::Heartbeat(frame));
                } else {
                    report.frames.push(InboundFrame::Result(frame));
                }
            }
            Ok(_) => {
                if self.pending.len() > self.max_pending_bytes {
                    report.errors.push(CodecError::OversizedBuffer {
                        size: self.pending.len(),
                        max: self.max_pending_bytes,
                    });
                    self.pending.clear();
                }
            }
            Err(err) => {
                report.errors.push(err);
                self.pending.clear();
            }
        }
        report
    }

    /// Total characters the buffered frame needs, once its header is present.
    fn declared_total(&self) -> Result<Option<usize>, CodecError> {
        let width = if self.pending.starts_with('-') { 4 } else { 6 };
        let Some(field) = self.pending.get(1..1 + width) else {
            return Ok(None);
        };
        parse_hex_field(field)
            .map(|declared| Some(declared as usize + HEADER_OVERHEAD))
            .ok_or_else(|| CodecError::LengthField(field.to_string()))
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_frame(payload_len: usize) -> String {
        let payload = "A".repeat(payload_len);
        format!("<{:06X}{payload}", payload_len + 2)
    }

    #[test]
    fn heartbeat_completes_in_one_chunk() {
        let mut assembler = FrameAssembler::default();
        let report = assembler.push_chunk(b"-0004BEEF");
        assert_eq!(
            report.frames,
            vec![InboundFrame::Heartbeat("-0004BEEF".to_string())]
        );
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn result_frame_split_across_chunks() {
        let frame = result_frame(56);
        let (head, tail) = frame.split_at(20);
        let mut assembler = FrameAssembler::default();

        let first = assembler.push_chunk(head.as_bytes());
        assert!(first.frames.is_empty());
        assert!(first.errors.is_empty());

        let second = assembler.push_chunk(tail.as_bytes());
        assert_eq!(second.frames, vec![InboundFrame::Result(frame)]);
    }

    #[test]
    fn leading_ack_byte_is_stripped() {
        let mut assembler = FrameAssembler::default();
        let report = assembler.push_chunk(b"$-0002OK");
        assert_eq!(
            report.frames,
            vec![InboundFrame::Heartbeat("-0002OK".to_string())]
        );
    }

    #[test]
    fn fresh_marker_chunk_discards_stale_partial() {
        let stale = result_frame(80);
        let fresh = result_frame(40);
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push_chunk(&stale.as_bytes()[..30]).frames.is_empty());

        let report = assembler.push_chunk(fresh.as_bytes());
        assert_eq!(report.frames, vec![InboundFrame::Result(fresh)]);
    }

    #[test]
    fn short_marker_chunk_extends_partial() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push_chunk(b"-0008AB").frames.is_empty());
        let report = assembler.push_chunk(b"-CDEFG");
        assert_eq!(
            report.frames,
            vec![InboundFrame::Heartbeat("-0008AB-CDEFG".to_string())]
        );
    }

    #[test]
    fn bytes_outside_a_frame_are_dropped() {
        let mut assembler = FrameAssembler::default();
        let report = assembler.push_chunk(b"noise");
        assert!(report.frames.is_empty());
        assert_eq!(report.errors, vec![CodecError::Unframed { len: 5 }]);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn unreadable_length_resets() {
        let mut assembler = FrameAssembler::default();
        let report = assembler.push_chunk(b"<00XX00rest");
        assert!(matches!(report.errors[0], CodecError::LengthField(_)));
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn oversized_partial_is_discarded() {
        let mut assembler = FrameAssembler::new(64);
        let report = assembler.push_chunk(format!("<FFFFFF{}", "A".repeat(100)).as_bytes());
        assert!(matches!(
            report.errors[0],
            CodecError::OversizedBuffer { max: 64, .. }
        ));
        assert_eq!(assembler.pending_len(), 0);
    }
}

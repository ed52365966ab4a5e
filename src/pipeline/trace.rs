//! Per-stage trace events, appended in stage order to `trace.jsonl`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::artifacts::{TraceEvent, SCHEMA_VERSION};
use crate::context::Clock;

/// Handle for a running stage.
#[derive(Debug)]
pub struct StageTimer {
    stage_id: String,
    start: DateTime<Utc>,
}

impl StageTimer {
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }
}

pub struct TraceRecorder {
    clock: Arc<dyn Clock>,
    events: Vec<TraceEvent>,
}

impl TraceRecorder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            events: Vec::new(),
        }
    }

    pub fn start(&self, stage_id: &str) -> StageTimer {
        StageTimer {
            stage_id: stage_id.to_string(),
            start: self.clock.now(),
        }
    }

    pub fn finish(
        &mut self,
        timer: StageTimer,
        inputs: Vec<String>,
        outputs: Vec<String>,
        retry_count: u32,
        error: Option<String>,
    ) {
        let end = self.clock.now();
        let duration_ms = (end - timer.start).num_milliseconds().max(0);
        tracing::debug!(stage = %timer.stage_id, duration_ms, ok = error.is_none(), "Stage finished");
        self.events.push(TraceEvent {
            schema_version: SCHEMA_VERSION.to_string(),
            stage_id: timer.stage_id,
            start: timer.start,
            end,
            duration_ms,
            inputs,
            outputs,
            retry_count,
            error,
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.stage_id.as_str()).collect()
    }

    pub fn durations_ms(&self) -> BTreeMap<String, i64> {
        self.events
            .iter()
            .map(|e| (e.stage_id.clone(), e.duration_ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FixedClock;

    #[test]
    fn records_events_in_call_order() {
        let mut trace = TraceRecorder::new(Arc::new(FixedClock::at("2024-01-01T00:00:00Z")));
        let a = trace.start("parse");
        trace.finish(a, vec!["a.pdf".into()], vec![], 0, None);
        let b = trace.start("ocr");
        trace.finish(b, vec![], vec![], 1, Some("boom".into()));

        assert_eq!(trace.stage_ids(), vec!["parse", "ocr"]);
        assert_eq!(trace.events()[1].retry_count, 1);
        assert_eq!(trace.events()[0].duration_ms, 0);
        assert_eq!(trace.durations_ms().len(), 2);
    }
}

//! Time windows and the window ring
//!
//! Windows are half-open event-time intervals `[start, end)` of fixed width,
//! aligned to a global anchor, with contiguous ids from 0. Lifecycle is
//! one-way: OPEN → CLOSED → SIMULATED, with SKIPPED as the cache-hit
//! terminal.

use chrono::{DateTime, Duration, Utc};

use opendt_core::Task;

use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    Open,
    Closed,
    Simulated,
    Skipped,
}

#[derive(Debug)]
pub struct TimeWindow {
    pub window_id: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub state: WindowState,
}

/// Append-only ring of windows plus the ingestion state: anchor, watermark,
/// and the head (highest window touched by any task or heartbeat).
pub struct WindowRing {
    width_ms: i64,
    anchor: Option<DateTime<Utc>>,
    watermark: Option<DateTime<Utc>>,
    windows: Vec<TimeWindow>,
    head: Option<u64>,
    /// Next window id eligible for closure.
    next_to_close: u64,
}

impl WindowRing {
    pub fn new(width_ms: i64, anchor: Option<DateTime<Utc>>) -> Self {
        Self {
            width_ms,
            anchor,
            watermark: None,
            windows: Vec::new(),
            head: None,
            next_to_close: 0,
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn anchor(&self) -> Option<DateTime<Utc>> {
        self.anchor
    }

    pub fn window(&self, window_id: u64) -> Option<&TimeWindow> {
        self.windows.get(window_id as usize)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn count_in_state(&self, state: WindowState) -> usize {
        self.windows.iter().filter(|w| w.state == state).count()
    }

    fn window_start(&self, anchor: DateTime<Utc>, window_id: u64) -> DateTime<Utc> {
        anchor + Duration::milliseconds(self.width_ms * window_id as i64)
    }

    /// Floor the first observed timestamp to a whole multiple of the width.
    fn init_anchor(&mut self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        *self.anchor.get_or_insert_with(|| {
            let ms = timestamp.timestamp_millis();
            DateTime::from_timestamp_millis(ms - ms.rem_euclid(self.width_ms))
                .unwrap_or(timestamp)
        })
    }

    fn window_index(&self, anchor: DateTime<Utc>, timestamp: DateTime<Utc>) -> i64 {
        (timestamp.timestamp_millis() - anchor.timestamp_millis()).div_euclid(self.width_ms)
    }

    fn ensure_windows(&mut self, anchor: DateTime<Utc>, up_to: u64) {
        while self.windows.len() <= up_to as usize {
            let window_id = self.windows.len() as u64;
            let start = self.window_start(anchor, window_id);
            self.windows.push(TimeWindow {
                window_id,
                start,
                end: start + Duration::milliseconds(self.width_ms),
                tasks: Vec::new(),
                state: WindowState::Open,
            });
        }
    }

    fn advance_watermark(&mut self, timestamp: DateTime<Utc>) {
        if self.watermark.map_or(true, |w| timestamp > w) {
            self.watermark = Some(timestamp);
        }
    }

    /// Ingest one task. Returns the window id it landed in, or
    /// `InvalidEvent` for a late arrival behind the head window.
    pub fn ingest_task(&mut self, timestamp: DateTime<Utc>, task: Task) -> Result<u64> {
        let anchor = self.init_anchor(timestamp);
        let index = self.window_index(anchor, timestamp);
        if index < 0 {
            return Err(EngineError::InvalidEvent(format!(
                "task {} at {timestamp} predates the window anchor {anchor}",
                task.id
            )));
        }
        let window_id = index as u64;

        if let Some(head) = self.head {
            let head_start = self.window_start(anchor, head);
            if timestamp < head_start {
                return Err(EngineError::InvalidEvent(format!(
                    "task {} at {timestamp} is behind window {head} starting {head_start}",
                    task.id
                )));
            }
        }

        self.ensure_windows(anchor, window_id);
        self.windows[window_id as usize].tasks.push(task);
        self.head = Some(self.head.map_or(window_id, |h| h.max(window_id)));
        self.advance_watermark(timestamp);
        Ok(window_id)
    }

    /// Ingest a heartbeat: advance the watermark and materialize every
    /// window the heartbeat has passed over, so gaps become empty windows.
    pub fn ingest_heartbeat(&mut self, timestamp: DateTime<Utc>) {
        let anchor = self.init_anchor(timestamp);
        let index = self.window_index(anchor, timestamp);
        if index >= 0 {
            let window_id = index as u64;
            self.ensure_windows(anchor, window_id);
            self.head = Some(self.head.map_or(window_id, |h| h.max(window_id)));
        }
        self.advance_watermark(timestamp);
    }

    /// Close the next eligible window, if any: the watermark has passed its
    /// end and every earlier window already left OPEN.
    pub fn close_next(&mut self) -> Option<u64> {
        let watermark = self.watermark?;
        let window = self.windows.get_mut(self.next_to_close as usize)?;
        if watermark < window.end {
            return None;
        }
        debug_assert_eq!(window.state, WindowState::Open);
        window.state = WindowState::Closed;
        let closed = window.window_id;
        self.next_to_close += 1;
        tracing::debug!(window_id = closed, tasks = window.tasks.len(), "window closed");
        Some(closed)
    }

    /// Terminal transition after dispatch resolved the window.
    pub fn finish(&mut self, window_id: u64, state: WindowState) {
        debug_assert!(matches!(state, WindowState::Simulated | WindowState::Skipped));
        if let Some(window) = self.windows.get_mut(window_id as usize) {
            debug_assert_eq!(window.state, WindowState::Closed);
            window.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const W: i64 = 300_000; // 5 minutes

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn task(id: i64, secs: i64) -> Task {
        Task {
            id,
            submission_time: ts(secs),
            duration_ms: 1000,
            cpu_count: 1,
            cpu_capacity_mhz: 1000.0,
            mem_capacity_mb: 1024,
            fragments: vec![],
        }
    }

    #[test]
    fn test_anchor_floors_first_timestamp() {
        let mut ring = WindowRing::new(W, None);
        ring.ingest_task(ts(120), task(1, 120)).unwrap();
        assert_eq!(ring.anchor(), Some(ts(0)));
        assert_eq!(ring.window(0).unwrap().start, ts(0));
        assert_eq!(ring.window(0).unwrap().end, ts(300));
    }

    #[test]
    fn test_tasks_land_in_their_window_in_arrival_order() {
        let mut ring = WindowRing::new(W, Some(ts(0)));
        ring.ingest_task(ts(120), task(1, 120)).unwrap();
        ring.ingest_task(ts(270), task(2, 270)).unwrap();
        ring.ingest_task(ts(330), task(3, 330)).unwrap();

        let w0 = ring.window(0).unwrap();
        assert_eq!(w0.tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ring.window(1).unwrap().tasks.len(), 1);
    }

    #[test]
    fn test_closure_requires_watermark_past_end() {
        let mut ring = WindowRing::new(W, Some(ts(0)));
        ring.ingest_task(ts(120), task(1, 120)).unwrap();
        assert_eq!(ring.close_next(), None, "watermark at 02:00 cannot close [0,5m)");

        ring.ingest_heartbeat(ts(300));
        assert_eq!(ring.close_next(), Some(0));
        assert_eq!(ring.close_next(), None);
        assert_eq!(ring.window(0).unwrap().state, WindowState::Closed);
    }

    #[test]
    fn test_heartbeats_materialize_empty_windows() {
        let mut ring = WindowRing::new(W, Some(ts(0)));
        ring.ingest_task(ts(60), task(1, 60)).unwrap();
        ring.ingest_heartbeat(ts(300));
        ring.ingest_heartbeat(ts(600));
        ring.ingest_heartbeat(ts(900));

        assert_eq!(ring.close_next(), Some(0));
        assert_eq!(ring.close_next(), Some(1));
        assert_eq!(ring.close_next(), Some(2));
        assert_eq!(ring.close_next(), None);
        assert!(ring.window(1).unwrap().tasks.is_empty());
        assert!(ring.window(2).unwrap().tasks.is_empty());
    }

    #[test]
    fn test_late_task_behind_head_is_rejected() {
        let mut ring = WindowRing::new(W, Some(ts(0)));
        ring.ingest_task(ts(60), task(1, 60)).unwrap();
        ring.ingest_heartbeat(ts(300));
        assert_eq!(ring.close_next(), Some(0));

        let err = ring.ingest_task(ts(180), task(2, 180)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidEvent(_)));
        assert!(ring.window(0).unwrap().tasks.len() == 1);
    }

    #[test]
    fn test_out_of_order_within_open_window_accepted() {
        let mut ring = WindowRing::new(W, Some(ts(0)));
        ring.ingest_task(ts(420), task(1, 420)).unwrap();
        // Earlier than the previous task but still inside open window 1
        ring.ingest_task(ts(330), task(2, 330)).unwrap();
        assert_eq!(
            ring.window(1).unwrap().tasks.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_closure_is_in_window_id_order() {
        let mut ring = WindowRing::new(W, Some(ts(0)));
        ring.ingest_heartbeat(ts(900));
        let mut closed = Vec::new();
        while let Some(id) = ring.close_next() {
            closed.push(id);
        }
        assert_eq!(closed, vec![0, 1, 2]);
    }
}

//! Sliding-window activity accounting.
//!
//! Each tracked column (input lines, output lines, compressed bytes, …)
//! keeps two rotating 5-minute windows. Derived figures always combine
//! both windows so a snapshot taken just after rotation still covers up to
//! ten minutes of history. Five minutes of silence resets the column.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    actions: u64,
    bytes: u64,
    max_delay_ms: i64,
    delay_sum_ms: i64,
    delayed_actions: u64,
}

#[derive(Debug)]
struct ColumnState {
    current: Window,
    previous: Window,
    rotated_at: Instant,
    last_action: Option<Instant>,
}

/// One activity column.
#[derive(Debug)]
pub struct ActivityColumn {
    state: Mutex<ColumnState>,
}

/// Point-in-time summary of a column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivitySnapshot {
    pub actions_per_minute: f64,
    pub bytes_per_second: f64,
    pub average_delay_ms: f64,
    pub max_delay_ms: i64,
}

impl Default for ActivityColumn {
    fn default() -> Self {
        ActivityColumn {
            state: Mutex::new(ColumnState {
                current: Window::default(),
                previous: Window::default(),
                rotated_at: Instant::now(),
                last_action: None,
            }),
        }
    }
}

impl ActivityColumn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one action. `delay_ms` is the clock-diff-adjusted age of the
    /// time-stamped item, when the item carried a timestamp.
    pub fn record(&self, bytes: u64, delay_ms: Option<i64>) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("stats poisoned");
        self.roll(&mut state, now);
        state.last_action = Some(now);
        let w = &mut state.current;
        w.actions += 1;
        w.bytes += bytes;
        if let Some(delay) = delay_ms {
            w.delayed_actions += 1;
            w.delay_sum_ms += delay;
            w.max_delay_ms = w.max_delay_ms.max(delay);
        }
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let now = Instant::now();
        let mut state = self.state.lock().expect("stats poisoned");
        self.roll(&mut state, now);
        let span = now
            .duration_since(state.rotated_at)
            .saturating_add(if state.previous.actions > 0 { WINDOW } else { Duration::ZERO });
        let secs = span.as_secs_f64().max(1.0);
        let actions = state.current.actions + state.previous.actions;
        let bytes = state.current.bytes + state.previous.bytes;
        let delayed = state.current.delayed_actions + state.previous.delayed_actions;
        let delay_sum = state.current.delay_sum_ms + state.previous.delay_sum_ms;
        ActivitySnapshot {
            actions_per_minute: actions as f64 * 60.0 / secs,
            bytes_per_second: bytes as f64 / secs,
            average_delay_ms: if delayed == 0 {
                0.0
            } else {
                delay_sum as f64 / delayed as f64
            },
            max_delay_ms: state.current.max_delay_ms.max(state.previous.max_delay_ms),
        }
    }

    fn roll(&self, state: &mut ColumnState, now: Instant) {
        if let Some(last) = state.last_action {
            // Idle columns restart from scratch.
            if now.duration_since(last) >= WINDOW {
                state.current = Window::default();
                state.previous = Window::default();
                state.rotated_at = now;
                state.last_action = None;
                return;
            }
        }
        if now.duration_since(state.rotated_at) >= WINDOW {
            state.previous = state.current;
            state.current = Window::default();
            state.rotated_at = now;
        }
    }
}

/// The standard per-channel column set.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub input: ActivityColumn,
    pub output: ActivityColumn,
    pub compressed_in: ActivityColumn,
    pub compressed_out: ActivityColumn,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_into_the_snapshot() {
        let col = ActivityColumn::new();
        col.record(100, Some(20));
        col.record(50, Some(40));
        col.record(10, None);
        let snap = col.snapshot();
        assert!(snap.actions_per_minute > 0.0);
        assert!(snap.bytes_per_second > 0.0);
        assert_eq!(snap.max_delay_ms, 40);
        assert!((snap.average_delay_ms - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_column_snapshot_is_zero() {
        let col = ActivityColumn::new();
        let snap = col.snapshot();
        assert_eq!(snap.max_delay_ms, 0);
        assert!((snap.actions_per_minute).abs() < f64::EPSILON);
        assert!((snap.average_delay_ms).abs() < f64::EPSILON);
    }
}

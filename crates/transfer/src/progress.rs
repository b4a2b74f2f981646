use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::types::SessionId;

/// Aggregate progress for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProgress {
    pub session: SessionId,
    pub transferred: u64,
    pub total: u64,
    pub bytes_per_second: f64,
}

impl SessionProgress {
    /// Returns the upload progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.transferred as f64 / self.total as f64 * 100.0
    }
}

/// Tracks bytes sent per (session, chunk) pair.
///
/// Chunk counters are replaced, not summed, so a retried chunk restarts
/// from zero instead of double counting.
pub struct ProgressTracker {
    inner: RwLock<HashMap<SessionId, SessionEntry>>,
}

struct SessionEntry {
    total: u64,
    chunks: HashMap<u32, u64>,
    speed: SpeedCalculator,
}

impl SessionEntry {
    fn transferred(&self) -> u64 {
        self.chunks.values().sum::<u64>().min(self.total)
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Begins tracking a session of `total` bytes.
    pub fn track(&self, session: &SessionId, total: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.insert(
            session.clone(),
            SessionEntry {
                total,
                chunks: HashMap::new(),
                speed: SpeedCalculator::default(),
            },
        );
    }

    /// Stops tracking a session.
    pub fn untrack(&self, session: &SessionId) {
        self.inner.write().unwrap().remove(session);
    }

    /// Records that `sent` bytes of chunk `chunk` have gone out.
    pub fn update(&self, session: &SessionId, chunk: u32, sent: u64) -> Option<SessionProgress> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner.get_mut(session)?;
        let previous = entry.chunks.insert(chunk, sent).unwrap_or(0);
        if sent > previous {
            entry.speed.add_sample(sent - previous);
        }
        Some(SessionProgress {
            session: session.clone(),
            transferred: entry.transferred(),
            total: entry.total,
            bytes_per_second: entry.speed.bytes_per_second(),
        })
    }

    /// Forgets a chunk's progress before it is retried.
    pub fn restart_chunk(&self, session: &SessionId, chunk: u32) {
        if let Some(entry) = self.inner.write().unwrap().get_mut(session) {
            entry.chunks.remove(&chunk);
        }
    }

    /// Forgets all chunk progress for a session (after a reset).
    pub fn clear(&self, session: &SessionId) {
        if let Some(entry) = self.inner.write().unwrap().get_mut(session) {
            entry.chunks.clear();
            entry.speed.reset();
        }
    }

    pub fn snapshot(&self, session: &SessionId) -> Option<SessionProgress> {
        let inner = self.inner.read().unwrap();
        let entry = inner.get(session)?;
        Some(SessionProgress {
            session: session.clone(),
            transferred: entry.transferred(),
            total: entry.total,
            bytes_per_second: entry.speed.bytes_per_second(),
        })
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

/// Transfer speed over a sliding time window.
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 100)
    }
}

impl SpeedCalculator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
        }
    }

    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(Instant::now(), bytes);
    }

    fn add_sample_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        while let Some(&(ts, _)) = self.samples.front() {
            if at.duration_since(ts) > self.window || self.samples.len() > self.max_samples {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average bytes/second within the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.0.duration_since(first.0);
        if self.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the window start; its bytes predate it.
        let bytes: u64 = self.samples.iter().skip(1).map(|(_, b)| b).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_updates_replace_not_accumulate() {
        let tracker = ProgressTracker::new();
        let id = SessionId::from("s1");
        tracker.track(&id, 100);

        tracker.update(&id, 0, 20);
        tracker.update(&id, 0, 40);
        let p = tracker.update(&id, 1, 10).unwrap();
        assert_eq!(p.transferred, 50);
        assert_eq!(p.total, 100);
        assert!((p.percentage() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn restart_chunk_drops_its_bytes() {
        let tracker = ProgressTracker::new();
        let id = SessionId::from("s1");
        tracker.track(&id, 100);
        tracker.update(&id, 0, 30);
        tracker.update(&id, 1, 30);
        tracker.restart_chunk(&id, 1);
        assert_eq!(tracker.snapshot(&id).unwrap().transferred, 30);

        tracker.clear(&id);
        assert_eq!(tracker.snapshot(&id).unwrap().transferred, 0);
    }

    #[test]
    fn untracked_session_ignored() {
        let tracker = ProgressTracker::new();
        let id = SessionId::from("nope");
        assert!(tracker.update(&id, 0, 10).is_none());
        tracker.track(&id, 10);
        tracker.untrack(&id);
        assert!(tracker.snapshot(&id).is_none());
    }

    #[test]
    fn speed_over_window() {
        let mut calc = SpeedCalculator::default();
        let t0 = Instant::now();
        calc.add_sample_at(t0, 0);
        calc.add_sample_at(t0 + Duration::from_secs(1), 1000);
        calc.add_sample_at(t0 + Duration::from_secs(2), 1000);
        assert!((calc.bytes_per_second() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn speed_needs_two_samples() {
        let mut calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        calc.add_sample(500);
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn old_samples_pruned() {
        let mut calc = SpeedCalculator::new(Duration::from_secs(2), 100);
        let t0 = Instant::now();
        calc.add_sample_at(t0, 1_000_000);
        calc.add_sample_at(t0 + Duration::from_secs(10), 100);
        calc.add_sample_at(t0 + Duration::from_secs(11), 100);
        assert!((calc.bytes_per_second() - 100.0).abs() < 1e-6);
    }
}

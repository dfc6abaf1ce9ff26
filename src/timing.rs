//! Time-to-first-content measurement and the thinking indicator policy.

use crate::types::ReasoningEffort;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingState {
    NotStarted,
    Running { started_at: Instant },
    Recorded { started_at: Instant, elapsed: Duration },
}

/// Exactly-once "thinking" timer: `running` from dispatch, frozen on the
/// first content fragment, never recomputed afterwards.
#[derive(Debug, Clone)]
pub struct TimingTracker {
    state: TimingState,
}

impl Default for TimingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingTracker {
    pub fn new() -> Self {
        Self {
            state: TimingState::NotStarted,
        }
    }

    pub fn state(&self) -> TimingState {
        self.state
    }

    /// Starts the clock. A second call is a no-op.
    pub fn start(&mut self, now: Instant) {
        if self.state == TimingState::NotStarted {
            self.state = TimingState::Running { started_at: now };
        }
    }

    /// Records the first content fragment. Returns the frozen elapsed time
    /// only on the transition into `Recorded`.
    pub fn record_first_content(&mut self, now: Instant) -> Option<Duration> {
        match self.state {
            TimingState::Running { started_at } => {
                let elapsed = now.saturating_duration_since(started_at);
                self.state = TimingState::Recorded {
                    started_at,
                    elapsed,
                };
                tracing::debug!("[TIMING] First content after {:?}", elapsed);
                Some(elapsed)
            }
            _ => None,
        }
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match self.state {
            TimingState::Recorded { elapsed, .. } => Some(elapsed),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<Instant> {
        match self.state {
            TimingState::NotStarted => None,
            TimingState::Running { started_at } | TimingState::Recorded { started_at, .. } => {
                Some(started_at)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingIndicator {
    Thinking,
    ThinkingLonger,
}

/// Display policy for the thinking indicator. Effort may only escalate the
/// indicator within a session, never demote it.
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingDisplay {
    effort: Option<ReasoningEffort>,
    indicator: ThinkingIndicator,
}

impl Default for ThinkingDisplay {
    fn default() -> Self {
        Self {
            effort: None,
            indicator: ThinkingIndicator::Thinking,
        }
    }
}

impl ThinkingDisplay {
    pub fn new(initial: Option<ReasoningEffort>) -> Self {
        let mut display = Self::default();
        if let Some(effort) = initial {
            display.observe_effort(effort);
        }
        display
    }

    /// Returns true when the indicator was promoted by this observation.
    pub fn observe_effort(&mut self, effort: ReasoningEffort) -> bool {
        let escalated = match self.effort {
            Some(current) => effort > current,
            None => true,
        };
        if escalated {
            self.effort = Some(effort);
        }
        if effort.is_extended() && self.indicator == ThinkingIndicator::Thinking {
            self.indicator = ThinkingIndicator::ThinkingLonger;
            return true;
        }
        false
    }

    pub fn effort(&self) -> Option<ReasoningEffort> {
        self.effort
    }

    pub fn indicator(&self) -> ThinkingIndicator {
        self.indicator
    }
}

/// Timing as shown next to a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkingTiming {
    pub started_at: Instant,
    pub first_token_at: Option<Instant>,
    pub elapsed_ms: Option<u64>,
    pub label: String,
    pub effort: Option<ReasoningEffort>,
}

impl ThinkingTiming {
    pub fn from_parts(tracker: &TimingTracker, display: &ThinkingDisplay, now: Instant) -> Self {
        let started_at = match tracker.started_at() {
            Some(t) => t,
            None => now,
        };
        let elapsed = tracker.elapsed();
        Self {
            started_at,
            first_token_at: elapsed.map(|e| started_at + e),
            elapsed_ms: elapsed.map(|e| e.as_millis() as u64),
            label: thinking_label(elapsed, display.indicator()),
            effort: display.effort(),
        }
    }
}

pub fn thinking_label(elapsed: Option<Duration>, indicator: ThinkingIndicator) -> String {
    match (elapsed, indicator) {
        (Some(e), _) => format!("Thought for {:.1}s", e.as_secs_f64()),
        (None, ThinkingIndicator::Thinking) => "Thinking".to_string(),
        (None, ThinkingIndicator::ThinkingLonger) => "Thinking longer".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_exactly_once() {
        let t0 = Instant::now();
        let mut tracker = TimingTracker::new();
        assert_eq!(tracker.record_first_content(t0), None);

        tracker.start(t0);
        let first = tracker.record_first_content(t0 + Duration::from_millis(1500));
        assert_eq!(first, Some(Duration::from_millis(1500)));

        let second = tracker.record_first_content(t0 + Duration::from_secs(9));
        assert_eq!(second, None);
        assert_eq!(tracker.elapsed(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_restart_does_not_reset() {
        let t0 = Instant::now();
        let mut tracker = TimingTracker::new();
        tracker.start(t0);
        tracker.record_first_content(t0 + Duration::from_millis(200));
        tracker.start(t0 + Duration::from_secs(5));
        assert_eq!(tracker.elapsed(), Some(Duration::from_millis(200)));
        assert_eq!(tracker.started_at(), Some(t0));
    }

    #[test]
    fn test_low_effort_never_promotes() {
        for effort in [
            ReasoningEffort::None,
            ReasoningEffort::Minimal,
            ReasoningEffort::Low,
        ] {
            let display = ThinkingDisplay::new(Some(effort));
            assert_eq!(display.indicator(), ThinkingIndicator::Thinking);
        }
    }

    #[test]
    fn test_escalation_promotes_and_never_demotes() {
        let mut display = ThinkingDisplay::new(Some(ReasoningEffort::Low));
        assert!(display.observe_effort(ReasoningEffort::High));
        assert_eq!(display.indicator(), ThinkingIndicator::ThinkingLonger);

        assert!(!display.observe_effort(ReasoningEffort::Low));
        assert_eq!(display.indicator(), ThinkingIndicator::ThinkingLonger);
        assert_eq!(display.effort(), Some(ReasoningEffort::High));
    }

    #[test]
    fn test_labels() {
        assert_eq!(thinking_label(None, ThinkingIndicator::Thinking), "Thinking");
        assert_eq!(
            thinking_label(Some(Duration::from_millis(2340)), ThinkingIndicator::Thinking),
            "Thought for 2.3s"
        );
    }
}

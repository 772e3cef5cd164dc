//! Client-side submission throttle.
//!
//! Two independent conditions close the gate: a submission in flight, and a
//! cooldown window that has not elapsed yet. While either holds, a ticker
//! republishes the run-button label so displays can follow the countdown; it
//! stops on its own once both conditions clear.

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::debug;

/// Longest cooldown the gate will honor; longer server waits are capped.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

fn deadline(now: Instant, wait: Duration) -> Instant {
    now + wait.min(MAX_COOLDOWN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateLabel {
    Ready,
    Running,
    /// Whole seconds left, rounded up.
    Cooldown(u64),
}

impl fmt::Display for GateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateLabel::Ready => write!(f, "実行"),
            GateLabel::Running => write!(f, "実行..."),
            GateLabel::Cooldown(secs) => write!(f, "実行({})", secs),
        }
    }
}

struct State {
    cooldown_ends_at: Instant,
    in_flight: bool,
    ticker: Option<JoinHandle<()>>,
}

impl State {
    fn open_at(&self, now: Instant) -> bool {
        !self.in_flight && now >= self.cooldown_ends_at
    }

    fn label_at(&self, now: Instant) -> GateLabel {
        if self.in_flight {
            return GateLabel::Running;
        }
        let remaining = self.cooldown_ends_at.saturating_duration_since(now);
        if remaining.is_zero() {
            GateLabel::Ready
        } else {
            GateLabel::Cooldown(remaining.as_millis().div_ceil(1000) as u64)
        }
    }
}

struct Inner {
    state: Mutex<State>,
    labels: watch::Sender<GateLabel>,
    tick: Duration,
}

impl Inner {
    fn publish(&self, label: GateLabel) {
        self.labels.send_if_modified(|current| {
            if *current == label {
                return false;
            }
            *current = label;
            true
        });
    }
}

#[derive(Clone)]
pub struct Throttle {
    inner: Arc<Inner>,
    default_window: Duration,
}

impl Throttle {
    pub fn new(default_window: Duration, tick: Duration) -> Self {
        let (labels, _) = watch::channel(GateLabel::Ready);
        let state = State { cooldown_ends_at: Instant::now(), in_flight: false, ticker: None };
        Self {
            inner: Arc::new(Inner { state: Mutex::new(state), labels, tick }),
            default_window,
        }
    }

    /// Whether a new submission may start now.
    pub fn allowed(&self) -> bool {
        self.inner.state.lock().open_at(Instant::now())
    }

    pub fn label(&self) -> GateLabel {
        self.inner.state.lock().label_at(Instant::now())
    }

    pub fn remaining(&self) -> Duration {
        self.inner.state.lock().cooldown_ends_at.saturating_duration_since(Instant::now())
    }

    /// Labels as the ticker publishes them.
    pub fn subscribe(&self) -> watch::Receiver<GateLabel> {
        self.inner.labels.subscribe()
    }

    #[cfg(test)]
    pub fn is_ticking(&self) -> bool {
        self.inner.state.lock().ticker.is_some()
    }

    /// Marks a submission as started and opens the default cooldown window.
    pub fn begin(&self) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.in_flight = true;
        let until = deadline(now, self.default_window);
        if until > state.cooldown_ends_at {
            state.cooldown_ends_at = until;
        }
        self.inner.publish(state.label_at(now));
        self.ensure_ticker(&mut state);
    }

    /// Pushes the cooldown out to at least `duration` from now. Never shortens it.
    pub fn extend_cooldown(&self, duration: Duration) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let until = deadline(now, duration);
        if until > state.cooldown_ends_at {
            debug!(target: "hibiki", secs = duration.as_secs_f64(), "cooldown extended");
            state.cooldown_ends_at = until;
        }
        self.inner.publish(state.label_at(now));
        if !state.open_at(now) {
            self.ensure_ticker(&mut state);
        }
    }

    /// Marks the submission as finished. The cooldown keeps running.
    pub fn end(&self) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.in_flight = false;
        self.inner.publish(state.label_at(now));
    }

    /// Drops any remaining cooldown.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        state.cooldown_ends_at = now;
        self.inner.publish(state.label_at(now));
    }

    fn ensure_ticker(&self, state: &mut State) {
        if state.ticker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        state.ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval(inner.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let mut state = inner.state.lock();
                inner.publish(state.label_at(now));
                if state.open_at(now) {
                    state.ticker = None;
                    break;
                }
            }
        }));
    }
}

//! Purpose-keyed one-shot timers that deliver into an event inbox.
//!
//! Each [`TimerKind`] has at most one armed timer. Arming a kind replaces
//! whatever was armed before, and every arm gets a fresh token. A fire is
//! only honoured if its token still matches the armed one, so a sleep task
//! that was aborted too late cannot trigger stale work.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Boot timeout while waiting for readiness.
    Readiness,
    /// Quiet period between a crash and its analysis.
    AnalysisDebounce,
    /// Maximum age of a pending log batch.
    LogFlush,
}

/// A timer that went off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFire {
    pub kind: TimerKind,
    pub token: u64,
}

struct Armed {
    token: u64,
    handle: JoinHandle<()>,
}

pub struct TimerSet<E> {
    tx: UnboundedSender<E>,
    armed: HashMap<TimerKind, Armed>,
    next_token: u64,
}

impl<E> TimerSet<E>
where
    E: From<TimerFire> + Send + 'static,
{
    pub fn new(tx: UnboundedSender<E>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            next_token: 1,
        }
    }

    /// Arm `kind` to fire after `delay`, replacing any armed timer of that kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) -> u64 {
        self.cancel(kind);

        let token = self.next_token;
        self.next_token += 1;

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFire { kind, token }.into());
        });
        trace!(?kind, token, ?delay, "timer armed");
        self.armed.insert(kind, Armed { token, handle });
        token
    }

    /// Cancel `kind`. Returns whether a timer was armed.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some(armed) => {
                armed.handle.abort();
                trace!(?kind, token = armed.token, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Claim a fire. True only for the currently armed token, which is then
    /// disarmed; stale or cancelled fires return false.
    pub fn accept(&mut self, fire: TimerFire) -> bool {
        match self.armed.get(&fire.kind) {
            Some(armed) if armed.token == fire.token => {
                self.armed.remove(&fire.kind);
                true
            }
            _ => {
                trace!(kind = ?fire.kind, token = fire.token, "stale timer fire ignored");
                false
            }
        }
    }
}

impl<E> Drop for TimerSet<E> {
    fn drop(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn next_fire(rx: &mut mpsc::UnboundedReceiver<TimerFire>) -> Option<TimerFire> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn armed_timer_fires_and_is_accepted_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        let token = timers.arm(TimerKind::Readiness, Duration::from_millis(10));

        let fire = next_fire(&mut rx).await.unwrap();
        assert_eq!(fire, TimerFire { kind: TimerKind::Readiness, token });
        assert!(timers.accept(fire));
        assert!(!timers.accept(fire));
        assert!(!timers.is_armed(TimerKind::Readiness));
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel::<TimerFire>();
        let mut timers = TimerSet::new(tx);
        timers.arm(TimerKind::AnalysisDebounce, Duration::from_millis(20));
        assert!(timers.cancel(TimerKind::AnalysisDebounce));
        assert!(!timers.cancel(TimerKind::AnalysisDebounce));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rearming_replaces_previous_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        let first = timers.arm(TimerKind::AnalysisDebounce, Duration::from_millis(20));
        let second = timers.arm(TimerKind::AnalysisDebounce, Duration::from_millis(40));
        assert_ne!(first, second);

        let fire = next_fire(&mut rx).await.unwrap();
        assert_eq!(fire.token, second);
        assert!(timers.accept(fire));
        assert!(!timers.accept(TimerFire { kind: TimerKind::AnalysisDebounce, token: first }));
    }

    #[tokio::test]
    async fn kinds_are_independent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = TimerSet::new(tx);
        timers.arm(TimerKind::LogFlush, Duration::from_millis(10));
        timers.arm(TimerKind::Readiness, Duration::from_secs(60));

        let fire = next_fire(&mut rx).await.unwrap();
        assert_eq!(fire.kind, TimerKind::LogFlush);
        assert!(timers.accept(fire));
        assert!(timers.is_armed(TimerKind::Readiness));

        timers.cancel_all();
        assert!(!timers.is_armed(TimerKind::Readiness));
    }
}

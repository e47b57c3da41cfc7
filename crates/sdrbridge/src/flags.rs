//! Acquisition flags shared by a control session and its streaming worker.
//!
//! `armed` and `one_shot` live in a single atomic word together with an arm
//! generation counter:
//!
//! ```text
//! bit 0      armed
//! bit 1      one-shot
//! bits 2..   generation, bumped by every arm
//! ```
//!
//! The control session is the only writer of the word except at one-shot
//! completion, where the worker clears `armed` with a compare-exchange
//! against the word it saw at block start. If the client re-armed in the
//! meantime the generation differs, the exchange fails and the new arm
//! survives.
//!
//! `quit` is a [`CancellationToken`]: a one-way trip that can be both
//! polled and awaited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const ARMED: u64 = 1 << 0;
const ONE_SHOT: u64 = 1 << 1;
const GENERATION_SHIFT: u32 = 2;
const GENERATION_ONE: u64 = 1 << GENERATION_SHIFT;

/// A point-in-time copy of the armed/one-shot word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmState(u64);

impl ArmState {
    pub fn armed(self) -> bool {
        self.0 & ARMED != 0
    }

    pub fn one_shot(self) -> bool {
        self.0 & ONE_SHOT != 0
    }

    /// Number of arms issued before this snapshot was taken.
    pub fn generation(self) -> u64 {
        self.0 >> GENERATION_SHIFT
    }
}

/// Armed, one-shot and quit flags for one session.
#[derive(Debug)]
pub struct AcquisitionFlags {
    word: AtomicU64,
    quit: CancellationToken,
    changed: Notify,
}

impl AcquisitionFlags {
    pub fn new() -> Self {
        AcquisitionFlags {
            word: AtomicU64::new(0),
            quit: CancellationToken::new(),
            changed: Notify::new(),
        }
    }

    pub fn snapshot(&self) -> ArmState {
        ArmState(self.word.load(Ordering::Acquire))
    }

    pub fn is_armed(&self) -> bool {
        self.snapshot().armed()
    }

    /// Arm acquisition, replacing any previous arm.
    pub fn arm(&self, one_shot: bool) {
        let mode = if one_shot { ARMED | ONE_SHOT } else { ARMED };
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let next = (current & !(ARMED | ONE_SHOT)).wrapping_add(GENERATION_ONE) | mode;
            match self
                .word
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.changed.notify_one();
    }

    /// Disarm continuous acquisition.
    ///
    /// A one-shot arm is committed once issued: its block is still captured
    /// and delivered, after which the worker disarms. Returns whether the
    /// word changed.
    pub fn disarm(&self) -> bool {
        let changed = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                (w & ARMED != 0 && w & ONE_SHOT == 0).then_some(w & !ARMED)
            })
            .is_ok();
        if changed {
            self.changed.notify_one();
        }
        changed
    }

    /// Clear `armed` after a one-shot block, unless the client re-armed
    /// since `at_start` was taken. Returns whether `armed` was cleared.
    pub fn complete_one_shot(&self, at_start: ArmState) -> bool {
        self.word
            .compare_exchange(
                at_start.0,
                at_start.0 & !ARMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Ask the worker to stop. Irreversible.
    pub fn quit(&self) {
        self.quit.cancel();
        self.changed.notify_one();
    }

    pub fn is_quit(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// A token that is cancelled when [`quit`](Self::quit) is called.
    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    /// Sleep until a flag changes or `poll` elapses, whichever is first.
    pub async fn wait_for_change(&self, poll: Duration) {
        tokio::select! {
            _ = self.changed.notified() => {}
            _ = self.quit.cancelled() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

impl Default for AcquisitionFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn starts_disarmed() {
        let flags = AcquisitionFlags::new();
        let s = flags.snapshot();
        assert!(!s.armed());
        assert!(!s.one_shot());
        assert_eq!(s.generation(), 0);
        assert!(!flags.is_quit());
    }

    #[test]
    fn arm_bumps_generation() {
        let flags = AcquisitionFlags::new();
        flags.arm(false);
        let first = flags.snapshot();
        assert!(first.armed());
        assert!(!first.one_shot());

        flags.arm(true);
        let second = flags.snapshot();
        assert!(second.armed());
        assert!(second.one_shot());
        assert_eq!(second.generation(), first.generation() + 1);
    }

    #[test]
    fn disarm_stops_continuous() {
        let flags = AcquisitionFlags::new();
        flags.arm(false);
        assert!(flags.disarm());
        assert!(!flags.is_armed());
        // Already disarmed.
        assert!(!flags.disarm());
    }

    #[test]
    fn disarm_leaves_one_shot_pending() {
        let flags = AcquisitionFlags::new();
        flags.arm(true);
        assert!(!flags.disarm());
        assert!(flags.is_armed());

        let at_start = flags.snapshot();
        assert!(flags.complete_one_shot(at_start));
        assert!(!flags.is_armed());
    }

    #[test]
    fn rearm_during_one_shot_survives_completion() {
        let flags = AcquisitionFlags::new();
        flags.arm(true);
        let at_start = flags.snapshot();

        // Client re-arms for continuous while the one-shot block is in flight.
        flags.arm(false);
        assert!(!flags.complete_one_shot(at_start));
        let now = flags.snapshot();
        assert!(now.armed());
        assert!(!now.one_shot());
    }

    #[test]
    fn rearm_same_mode_survives_completion() {
        let flags = AcquisitionFlags::new();
        flags.arm(true);
        let at_start = flags.snapshot();
        flags.arm(true);
        assert!(!flags.complete_one_shot(at_start));
        assert!(flags.is_armed());
    }

    #[test]
    fn quit_is_sticky() {
        let flags = AcquisitionFlags::new();
        let token = flags.quit_token();
        flags.quit();
        assert!(flags.is_quit());
        assert!(token.is_cancelled());
        flags.arm(false);
        assert!(flags.is_quit());
    }

    #[tokio::test]
    async fn wait_wakes_on_arm() {
        let flags = Arc::new(AcquisitionFlags::new());
        let waiter = {
            let flags = flags.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                flags.wait_for_change(Duration::from_secs(10)).await;
                start.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flags.arm(false);
        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn wait_falls_back_to_poll_interval() {
        let flags = AcquisitionFlags::new();
        let start = Instant::now();
        flags.wait_for_change(Duration::from_millis(5)).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn concurrent_arms_are_all_counted() {
        let flags = Arc::new(AcquisitionFlags::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let flags = flags.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        flags.arm(i % 2 == 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(flags.snapshot().generation(), 4000);
    }
}

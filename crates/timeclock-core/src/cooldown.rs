//! Debouncing of repeated recognitions.
//!
//! A continuous detection loop sees the same face many times per second.
//! [`CooldownState`] decides which of those observations are new events and
//! which are repeats. Time is always passed in, so the state machine can be
//! driven from tests without a running loop.

use crate::types::IdentityId;
use std::time::{Duration, Instant};

/// Default suppression window after a recognition.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);

/// Outcome of feeding one resolution result into the cooldown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// A new recognition event; the caller should notify its sink.
    Fire,
    /// Same identity as the active cooldown; no event.
    Suppress,
    /// Nothing matched; the state is now idle.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Active {
    identity: IdentityId,
    expires_at: Instant,
}

/// Per-loop debounce state. At most one identity is cooling at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CooldownState {
    active: Option<Active>,
}

impl CooldownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolution result observed at `now`.
    ///
    /// `matched` is the resolved identity, or `None` when a face was found but
    /// did not match anyone. "No face in frame" must not be reported here:
    /// a brief occlusion keeps the cooldown, see [`CooldownState::expire`].
    pub fn observe(
        &mut self,
        matched: Option<&IdentityId>,
        now: Instant,
        window: Duration,
    ) -> Verdict {
        let Some(id) = matched else {
            self.active = None;
            return Verdict::Idle;
        };

        let verdict = match &self.active {
            Some(active) if &active.identity == id && now < active.expires_at => {
                return Verdict::Suppress;
            }
            // Expired while the same face stayed in view: extend the window.
            // A face that leaves the frame past expiry is cleared by `expire`.
            Some(active) if &active.identity == id => Verdict::Suppress,
            _ => Verdict::Fire,
        };

        self.active = Some(Active {
            identity: id.clone(),
            expires_at: now + window,
        });
        verdict
    }

    /// Clear the cooldown for `id` after its event has been acted on.
    ///
    /// Returns `false` (and changes nothing) if `id` is not the active identity.
    pub fn consume(&mut self, id: &IdentityId) -> bool {
        match &self.active {
            Some(active) if &active.identity == id => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    /// Drop a cooldown whose window has elapsed by `now`.
    ///
    /// Called when the frame has no face, so a person who walks away and
    /// returns after the window is recognized again.
    pub fn expire(&mut self, now: Instant) -> bool {
        match &self.active {
            Some(active) if now >= active.expires_at => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    pub fn active_identity(&self) -> Option<&IdentityId> {
        self.active.as_ref().map(|a| &a.identity)
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.active.as_ref().map(|a| a.expires_at)
    }

    /// Whether an identity is cooling and its window has not yet elapsed.
    pub fn is_cooling(&self, now: Instant) -> bool {
        self.active.as_ref().is_some_and(|a| now < a.expires_at)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(3);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_first_match_fires_and_starts_cooling() {
        let t0 = Instant::now();
        let mut state = CooldownState::new();
        let a = IdentityId::from("a");

        assert_eq!(state.observe(Some(&a), t0, WINDOW), Verdict::Fire);
        assert_eq!(state.active_identity(), Some(&a));
        assert_eq!(state.expires_at(), Some(t0 + WINDOW));
        assert!(state.is_cooling(t0 + ms(2999)));
        assert!(!state.is_cooling(t0 + WINDOW));
    }

    #[test]
    fn test_repeats_within_window_fire_once() {
        let t0 = Instant::now();
        let mut state = CooldownState::new();
        let a = IdentityId::from("a");

        let fired = (0..10)
            .map(|i| state.observe(Some(&a), t0 + ms(i * 250), WINDOW))
            .filter(|v| *v == Verdict::Fire)
            .count();
        assert_eq!(fired, 1);
        // suppressed repeats do not push the expiry out
        assert_eq!(state.expires_at(), Some(t0 + WINDOW));
    }

    #[test]
    fn test_expired_same_identity_refreshes_but_stays_suppressed() {
        let t0 = Instant::now();
        let mut state = CooldownState::new();
        let a = IdentityId::from("a");

        state.observe(Some(&a), t0, WINDOW);
        let later = t0 + WINDOW + ms(1);
        assert_eq!(state.observe(Some(&a), later, WINDOW), Verdict::Suppress);
        assert_eq!(state.expires_at(), Some(later + WINDOW));
    }

    #[test]
    fn test_expire_after_window_rearms_same_identity() {
        let t0 = Instant::now();
        let mut state = CooldownState::new();
        let a = IdentityId::from("a");

        state.observe(Some(&a), t0, WINDOW);
        assert!(!state.expire(t0 + ms(2999)));
        assert_eq!(state.active_identity(), Some(&a));

        let eight_hours = Duration::from_secs(8 * 3600);
        assert!(state.expire(t0 + eight_hours));
        assert!(state.is_idle());
        assert_eq!(state.observe(Some(&a), t0 + eight_hours, WINDOW), Verdict::Fire);
    }

    #[test]
    fn test_switching_identity_fires_immediately() {
        let t0 = Instant::now();
        let mut state = CooldownState::new();
        let a = IdentityId::from("a");
        let b = IdentityId::from("b");

        assert_eq!(state.observe(Some(&a), t0, WINDOW), Verdict::Fire);
        assert_eq!(state.observe(Some(&b), t0 + ms(100), WINDOW), Verdict::Fire);
        assert_eq!(state.active_identity(), Some(&b));
        assert_eq!(state.expires_at(), Some(t0 + ms(100) + WINDOW));
    }

    #[test]
    fn test_no_match_resets_to_idle() {
        let t0 = Instant::now();
        let mut state = CooldownState::new();
        let a = IdentityId::from("a");

        state.observe(Some(&a), t0, WINDOW);
        assert_eq!(state.observe(None, t0 + ms(10), WINDOW), Verdict::Idle);
        assert!(state.is_idle());
        assert_eq!(state.observe(Some(&a), t0 + ms(20), WINDOW), Verdict::Fire);
    }

    #[test]
    fn test_consume_allows_immediate_refire() {
        let t0 = Instant::now();
        let mut state = CooldownState::new();
        let a = IdentityId::from("a");

        state.observe(Some(&a), t0, WINDOW);
        assert!(state.consume(&a));
        assert!(state.is_idle());
        assert_eq!(state.observe(Some(&a), t0 + ms(10), WINDOW), Verdict::Fire);
    }

    #[test]
    fn test_consume_of_other_identity_is_noop() {
        let t0 = Instant::now();
        let mut state = CooldownState::new();
        let a = IdentityId::from("a");

        state.observe(Some(&a), t0, WINDOW);
        assert!(!state.consume(&IdentityId::from("b")));
        assert_eq!(state.active_identity(), Some(&a));
        assert!(!CooldownState::new().consume(&a));
    }

    #[test]
    fn test_idle_no_match_stays_idle() {
        let mut state = CooldownState::new();
        assert_eq!(state.observe(None, Instant::now(), WINDOW), Verdict::Idle);
        assert!(state.is_idle());
    }
}

//! Quota and storage admission
//!
//! One mutex guards the reservation table; the critical section never does
//! I/O. Callers read subscription and ledger state first, then bring the
//! snapshots here. A [`Reservation`] releases itself on drop, so every exit
//! path of the pipeline settles the books.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{CoreError, Result};

#[derive(Default, Debug)]
struct GovernorState {
    reserved: HashMap<String, u64>,
    total_reserved: u64,
}

/// Subscription budget snapshot taken before admission.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionBudget {
    pub limit_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Clone)]
pub struct QuotaGovernor {
    state: Arc<Mutex<GovernorState>>,
    relay_cap: Option<u64>,
    warn_threshold_percent: u8,
}

impl QuotaGovernor {
    pub fn new(relay_cap: Option<u64>, warn_threshold_percent: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(GovernorState::default())),
            relay_cap,
            warn_threshold_percent,
        }
    }

    pub fn relay_cap(&self) -> Option<u64> {
        self.relay_cap
    }

    pub fn warn_threshold_percent(&self) -> u8 {
        self.warn_threshold_percent
    }

    pub fn total_reserved(&self) -> u64 {
        self.state.lock().expect("governor lock").total_reserved
    }

    pub fn reserved_for(&self, owner: &str) -> u64 {
        self.state
            .lock()
            .expect("governor lock")
            .reserved
            .get(owner)
            .copied()
            .unwrap_or(0)
    }

    fn check(
        state: &GovernorState,
        owner: Option<&str>,
        requested: u64,
        budget: Option<&SubscriptionBudget>,
        live_bytes: u64,
        relay_cap: Option<u64>,
    ) -> Result<()> {
        if let (Some(owner), Some(budget)) = (owner, budget) {
            let reserved = state.reserved.get(owner).copied().unwrap_or(0);
            if budget.used_bytes + reserved + requested > budget.limit_bytes {
                return Err(CoreError::QuotaExceeded(format!(
                    "subscription budget: {} used + {} reserved + {} requested > {} limit",
                    budget.used_bytes, reserved, requested, budget.limit_bytes
                )));
            }
        }
        if let Some(cap) = relay_cap {
            if live_bytes + state.total_reserved + requested > cap {
                return Err(CoreError::QuotaExceeded(format!(
                    "relay cap: {} live + {} reserved + {} requested > {} cap",
                    live_bytes, state.total_reserved, requested, cap
                )));
            }
        }
        Ok(())
    }

    /// Admission test without claiming anything.
    pub fn preflight(
        &self,
        owner: Option<&str>,
        requested: u64,
        budget: Option<&SubscriptionBudget>,
        live_bytes: u64,
    ) -> Result<()> {
        let state = self.state.lock().expect("governor lock");
        Self::check(&state, owner, requested, budget, live_bytes, self.relay_cap)
    }

    /// Claims `requested` bytes against the subscription and global caps.
    pub fn reserve(
        &self,
        owner: Option<&str>,
        requested: u64,
        budget: Option<SubscriptionBudget>,
        live_bytes: u64,
    ) -> Result<Reservation> {
        let mut state = self.state.lock().expect("governor lock");
        Self::check(
            &state,
            owner,
            requested,
            budget.as_ref(),
            live_bytes,
            self.relay_cap,
        )?;
        if let Some(owner) = owner {
            *state.reserved.entry(owner.to_string()).or_insert(0) += requested;
        }
        state.total_reserved += requested;
        debug!(?owner, requested, total = state.total_reserved, "reserved");

        Ok(Reservation {
            state: Arc::clone(&self.state),
            owner: owner.map(str::to_string),
            bytes: requested,
            budget,
            live_bytes,
            relay_cap: self.relay_cap,
            released: false,
        })
    }
}

/// A claimed slice of quota, held for the duration of one upload.
#[derive(Debug)]
pub struct Reservation {
    state: Arc<Mutex<GovernorState>>,
    owner: Option<String>,
    bytes: u64,
    budget: Option<SubscriptionBudget>,
    live_bytes: u64,
    relay_cap: Option<u64>,
    released: bool,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Replaces the estimate with the actual byte count once streaming has
    /// finished. Growing past either cap fails and leaves the original
    /// claim in place for the caller to release.
    pub fn adjust(&mut self, actual: u64) -> Result<()> {
        let mut state = self.state.lock().expect("governor lock");
        if actual > self.bytes {
            let grow = actual - self.bytes;
            QuotaGovernor::check(
                &state,
                self.owner.as_deref(),
                grow,
                self.budget.as_ref(),
                self.live_bytes,
                self.relay_cap,
            )?;
        }
        let delta_out = self.bytes;
        if let Some(owner) = &self.owner {
            if let Some(r) = state.reserved.get_mut(owner) {
                *r = r.saturating_sub(delta_out) + actual;
            }
        }
        state.total_reserved = state.total_reserved.saturating_sub(delta_out) + actual;
        self.bytes = actual;
        Ok(())
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.state.lock().expect("governor lock");
        if let Some(owner) = &self.owner {
            if let Some(r) = state.reserved.get_mut(owner) {
                *r = r.saturating_sub(self.bytes);
                if *r == 0 {
                    state.reserved.remove(owner);
                }
            }
        }
        state.total_reserved = state.total_reserved.saturating_sub(self.bytes);
    }

    pub fn release(mut self) {
        self.release_inner();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(limit: u64, used: u64) -> SubscriptionBudget {
        SubscriptionBudget {
            limit_bytes: limit,
            used_bytes: used,
        }
    }

    #[test]
    fn reserve_and_release_settle_to_zero() {
        let governor = QuotaGovernor::new(None, 80);
        let reservation = governor
            .reserve(Some("0xabc"), 100, Some(budget(1000, 0)), 0)
            .unwrap();
        assert_eq!(governor.total_reserved(), 100);
        assert_eq!(governor.reserved_for("0xabc"), 100);
        reservation.release();
        assert_eq!(governor.total_reserved(), 0);
        assert_eq!(governor.reserved_for("0xabc"), 0);
    }

    #[test]
    fn drop_releases_implicitly() {
        let governor = QuotaGovernor::new(None, 80);
        {
            let _r = governor
                .reserve(Some("0xabc"), 100, Some(budget(1000, 0)), 0)
                .unwrap();
            assert_eq!(governor.total_reserved(), 100);
        }
        assert_eq!(governor.total_reserved(), 0);
    }

    #[test]
    fn subscription_budget_is_enforced() {
        let governor = QuotaGovernor::new(None, 80);
        let _held = governor
            .reserve(Some("0xabc"), 600, Some(budget(1000, 0)), 0)
            .unwrap();
        // 600 reserved + 500 requested > 1000 limit
        let err = governor
            .reserve(Some("0xabc"), 500, Some(budget(1000, 0)), 0)
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded(_)));
        // A different owner is unaffected.
        assert!(governor
            .reserve(Some("0xdef"), 500, Some(budget(1000, 0)), 0)
            .is_ok());
    }

    #[test]
    fn used_bytes_count_against_the_budget() {
        let governor = QuotaGovernor::new(None, 80);
        let err = governor
            .reserve(Some("0xabc"), 200, Some(budget(1000, 900)), 0)
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded(_)));
    }

    #[test]
    fn relay_cap_applies_to_everyone() {
        let governor = QuotaGovernor::new(Some(1000), 80);
        let _held = governor.reserve(Some("0xabc"), 700, None, 0).unwrap();
        let err = governor.reserve(Some("0xdef"), 400, None, 0).unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded(_)));
        // Live bytes already on the relay also count.
        drop(_held);
        let err = governor.reserve(Some("0xdef"), 400, None, 700).unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded(_)));
    }

    #[test]
    fn adjust_shrinks_and_grows() {
        let governor = QuotaGovernor::new(Some(1000), 80);
        let mut reservation = governor.reserve(Some("0xabc"), 500, None, 0).unwrap();
        reservation.adjust(200).unwrap();
        assert_eq!(governor.total_reserved(), 200);

        // Growing within the cap is fine...
        reservation.adjust(900).unwrap();
        assert_eq!(governor.total_reserved(), 900);

        // ...growing past it is not, and the claim is unchanged.
        assert!(reservation.adjust(1200).is_err());
        assert_eq!(governor.total_reserved(), 900);
    }

    #[test]
    fn concurrent_reservations_never_oversubscribe() {
        let governor = QuotaGovernor::new(Some(10_000), 80);
        let mut handles = Vec::new();
        for i in 0..32 {
            let g = governor.clone();
            handles.push(std::thread::spawn(move || {
                let owner = format!("0x{i}");
                g.reserve(Some(&owner), 1_000, None, 0).map(|r| {
                    std::thread::yield_now();
                    r.release();
                })
            }));
        }
        let admitted = handles
            .into_iter()
            .map(|h| h.join())
            .filter(|r| matches!(r, Ok(Ok(()))))
            .count();
        // With a 10k cap and 1k slices, at most 10 can hold simultaneously,
        // but sequential release lets more through; the invariant is that
        // the table settles to zero.
        assert!(admitted >= 10);
        assert_eq!(governor.total_reserved(), 0);
    }
}

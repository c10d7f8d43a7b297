//! Instance state machine.
//!
//! ```text
//!                ┌──────────── retrying ◄──────────┐
//!                ▼                │                 │
//! requested ─► provisioning ─► running ⇄ reconfiguring
//!     │            │               │
//!     │            └──► failed ◄───┘
//!     │                   │
//!     └──► deprovisioning ◄┘ (any non-terminal state on deletion)
//!                 │
//!                 ▼
//!              deleted
//! ```

use std::time::Duration;

use berth_state::{Instance, InstanceState};
use tracing::warn;

use InstanceState::*;

/// Whether `from → to` is a legal move. Staying put is always legal.
pub fn can_transition(from: InstanceState, to: InstanceState) -> bool {
    if from == to {
        return true;
    }
    match from {
        Requested => matches!(to, Provisioning | Deprovisioning | Deleted),
        Provisioning => matches!(to, Running | Retrying | Failed | Deprovisioning),
        Retrying => matches!(to, Provisioning | Failed | Deprovisioning),
        Running => matches!(to, Reconfiguring | Failed | Deprovisioning),
        Reconfiguring => matches!(to, Running | Failed | Deprovisioning),
        Deprovisioning => matches!(to, Deleted | Failed),
        Failed => matches!(to, Retrying | Deprovisioning),
        Deleted => false,
    }
}

/// Move `instance` to `to` if legal. Re-entering the current state keeps
/// its entry time.
pub fn transition(instance: &mut Instance, to: InstanceState, now: u64) -> bool {
    if instance.state == to {
        return true;
    }
    if !can_transition(instance.state, to) {
        warn!(
            instance_id = %instance.id,
            from = %instance.state,
            to = %to,
            "illegal state transition refused"
        );
        return false;
    }
    instance.enter(to, now);
    true
}

/// States the provision handler picks up from.
pub fn awaits_provisioning(state: InstanceState) -> bool {
    matches!(state, Requested | Retrying | Provisioning)
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::SizeClass;
    use berth_state::Blueprint;
    use std::collections::BTreeMap;

    fn instance() -> Instance {
        let blueprint = Blueprint {
            id: "bp".into(),
            name: "bp".into(),
            driver: "dummy".into(),
            size_class: SizeClass::Small,
            image: "img".into(),
            enabled: true,
            max_lifetime: None,
            config: BTreeMap::new(),
        };
        Instance::new("inst-1".into(), "pb-1".into(), &blueprint, "alice", 100)
    }

    #[test]
    fn happy_path_is_legal() {
        let path = [Requested, Provisioning, Running, Reconfiguring, Running, Deprovisioning, Deleted];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failure_and_respawn_loop() {
        assert!(can_transition(Provisioning, Failed));
        assert!(can_transition(Running, Failed));
        assert!(can_transition(Deprovisioning, Failed));
        assert!(can_transition(Failed, Retrying));
        assert!(can_transition(Retrying, Provisioning));
    }

    #[test]
    fn every_live_state_can_be_deleted() {
        for state in [Requested, Provisioning, Retrying, Running, Reconfiguring, Failed] {
            assert!(can_transition(state, Deprovisioning), "{state}");
        }
    }

    #[test]
    fn deleted_is_terminal() {
        for state in [Requested, Provisioning, Running, Failed, Deprovisioning] {
            assert!(!can_transition(Deleted, state));
        }
        assert!(!can_transition(Requested, Running));
        assert!(!can_transition(Failed, Running));
    }

    #[test]
    fn transition_stamps_entry_time_only_on_change() {
        let mut inst = instance();
        assert!(transition(&mut inst, Provisioning, 110));
        assert_eq!(inst.state_entered_at, 110);
        assert!(transition(&mut inst, Provisioning, 120));
        assert_eq!(inst.state_entered_at, 110);
        assert!(!transition(&mut inst, Deleted, 130));
        assert_eq!(inst.state, Provisioning);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        assert_eq!(backoff(base, max, 1), Duration::from_secs(5));
        assert_eq!(backoff(base, max, 2), Duration::from_secs(10));
        assert_eq!(backoff(base, max, 4), Duration::from_secs(40));
        assert_eq!(backoff(base, max, 5), Duration::from_secs(60));
        assert_eq!(backoff(base, max, 40), Duration::from_secs(60));
    }
}

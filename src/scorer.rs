//! Candidate scoring for multi-instance selection.
//!
//! When several instances could serve an intent, the gate picks the one
//! with the highest score. The score rewards low risk, purpose
//! alignment, a live connection, and an active lifecycle; higher is
//! preferred. Ties are broken deterministically by the caller (stable
//! order on instance id).

use crate::instance::{ConnectionStatus, Instance, InstancePurpose, LifecycleStatus, RiskLevel};
use crate::model::IntentSource;

/// Score an instance as a candidate for an intent with this purpose.
pub fn score(instance: &Instance, intent_purpose: IntentSource) -> i32 {
    risk_score(instance) + purpose_score(instance, intent_purpose) + connection_score(instance)
        + lifecycle_score(instance)
}

fn risk_score(instance: &Instance) -> i32 {
    match instance.reputation.risk_level() {
        RiskLevel::Low => 30,
        RiskLevel::Medium => 10,
        RiskLevel::High => 0,
    }
}

/// Reward purpose/intent alignment.
///
/// A WARMUP intent fits a warm-up-only instance best and a dispatch-only
/// instance not at all. A real-traffic intent fits a dispatch-only
/// instance best; warm-up-only instances never reach scoring for real
/// traffic (the gate excludes them earlier), so they score zero.
fn purpose_score(instance: &Instance, intent_purpose: IntentSource) -> i32 {
    let warm_up_intent = intent_purpose == IntentSource::Warmup;

    match (warm_up_intent, instance.purpose) {
        (true, InstancePurpose::Warmup) => 20,
        (true, InstancePurpose::Mixed) => 10,
        (true, InstancePurpose::Dispatch) => 0,
        (false, InstancePurpose::Dispatch) => 20,
        (false, InstancePurpose::Mixed) => 10,
        (false, InstancePurpose::Warmup) => 0,
    }
}

fn connection_score(instance: &Instance) -> i32 {
    if instance.connection == ConnectionStatus::Connected {
        30
    } else {
        0
    }
}

fn lifecycle_score(instance: &Instance) -> i32 {
    if instance.lifecycle == LifecycleStatus::Active {
        20
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn instance(purpose: InstancePurpose) -> Instance {
        let mut inst = Instance::new("inst-1", "org-1", purpose, Utc::now());
        inst.record_connected();
        inst
    }

    #[test]
    fn test_best_case_score() {
        // Low risk (30) + matching purpose (20) + connected (30) + active (20).
        let inst = instance(InstancePurpose::Dispatch);
        assert_eq!(score(&inst, IntentSource::Schedule), 100);

        let inst = instance(InstancePurpose::Warmup);
        assert_eq!(score(&inst, IntentSource::Warmup), 100);
    }

    #[test]
    fn test_purpose_alignment() {
        let mixed = instance(InstancePurpose::Mixed);
        let dispatch = instance(InstancePurpose::Dispatch);

        // Warm-up intent prefers mixed over dispatch-only.
        assert!(score(&mixed, IntentSource::Warmup) > score(&dispatch, IntentSource::Warmup));

        // Real traffic prefers dispatch-only over mixed.
        assert!(score(&dispatch, IntentSource::Reply) > score(&mixed, IntentSource::Reply));
    }

    #[test]
    fn test_risk_degrades_score() {
        let mut low = instance(InstancePurpose::Mixed);
        let mut medium = instance(InstancePurpose::Mixed);
        let mut high = instance(InstancePurpose::Mixed);
        low.reputation.risk_flags = 0;
        medium.reputation.risk_flags = 4;
        high.reputation.risk_flags = 7;

        let l = score(&low, IntentSource::Reply);
        let m = score(&medium, IntentSource::Reply);
        let h = score(&high, IntentSource::Reply);

        assert!(l > m && m > h);
        assert_eq!(l - m, 20);
        assert_eq!(m - h, 10);
    }

    #[test]
    fn test_disconnected_loses_connection_points() {
        let connected = instance(InstancePurpose::Mixed);
        let mut disconnected = instance(InstancePurpose::Mixed);
        disconnected.record_disconnected();

        assert_eq!(
            score(&connected, IntentSource::Reply) - score(&disconnected, IntentSource::Reply),
            30
        );
    }
}

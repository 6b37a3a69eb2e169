//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// Condition types written by the reconciler
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_STALLED: &str = "Stalled";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Update or add a condition in the conditions list.
///
/// An existing condition of the same type is updated in place; the
/// transition time changes only when the status actually flips, so watchers
/// can tell a refresh from a real transition.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let status_changed = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;

        if status_changed {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "MinimumReplicasAvailable",
            "1 of 1 replicas are available",
            Some(3),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_eq!(conditions[0].observed_generation, Some(3));
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_flip() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_READY.to_string(),
            status: CONDITION_STATUS_FALSE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "NoReplicasAvailable".to_string(),
            message: "0 of 1 replicas are available".to_string(),
            observed_generation: Some(1),
        }];

        let old_time = conditions[0].last_transition_time.clone();
        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "MinimumReplicasAvailable",
            "1 of 1 replicas are available",
            Some(2),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, CONDITION_STATUS_TRUE);
        assert_ne!(conditions[0].last_transition_time, old_time);
    }

    #[test]
    fn test_set_condition_keeps_transition_time_on_refresh() {
        let mut conditions = vec![Condition {
            type_: CONDITION_TYPE_READY.to_string(),
            status: CONDITION_STATUS_TRUE.to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            reason: "MinimumReplicasAvailable".to_string(),
            message: "1 of 1 replicas are available".to_string(),
            observed_generation: Some(1),
        }];

        set_condition(
            &mut conditions,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            "MinimumReplicasAvailable",
            "2 of 2 replicas are available",
            Some(1),
        );

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].message, "2 of 2 replicas are available");
    }

    #[test]
    fn test_is_condition_true() {
        let conditions = vec![Condition::ready(true, "MinimumReplicasAvailable", "ok")];

        assert!(is_condition_true(&conditions, CONDITION_TYPE_READY));
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_STALLED));
    }

    #[test]
    fn test_find_condition() {
        let mut conditions = vec![Condition::ready(false, "Deploying", "rollout in progress")];
        set_condition(
            &mut conditions,
            CONDITION_TYPE_PROGRESSING,
            CONDITION_STATUS_TRUE,
            "Deploying",
            "applying workload",
            None,
        );

        assert!(find_condition(&conditions, CONDITION_TYPE_READY).is_some());
        assert!(find_condition(&conditions, CONDITION_TYPE_PROGRESSING).is_some());
        assert!(find_condition(&conditions, CONDITION_TYPE_STALLED).is_none());
    }
}

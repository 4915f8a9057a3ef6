use crate::crds::ClusterCondition;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_CONFIG_INVALID: &str = "ConfigInvalid";
pub const CONDITION_BUILD_SUCCEEDED: &str = "BuildSucceeded";
pub const CONDITION_BUILD_STALE: &str = "BuildStale";
pub const CONDITION_TUNNEL_READY: &str = "TunnelReady";

/// Upsert a condition. The transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<ClusterCondition>,
    condition_type: &str,
    status: bool,
    reason: &str,
    message: impl Into<String>,
    now: &str,
) {
    let status = if status { "True" } else { "False" }.to_string();
    let message = Some(message.into());
    let reason = Some(reason.to_string());

    match conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        Some(existing) => {
            if existing.status != status {
                existing.last_transition_time = Some(now.to_string());
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
        }
        None => conditions.push(ClusterCondition {
            condition_type: condition_type.to_string(),
            status,
            last_transition_time: Some(now.to_string()),
            reason,
            message,
        }),
    }
}

pub fn remove_condition(conditions: &mut Vec<ClusterCondition>, condition_type: &str) {
    conditions.retain(|c| c.condition_type != condition_type);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_moves_only_on_status_flip() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_READY, false, "Building", "building", "t1");
        set_condition(&mut conditions, CONDITION_READY, false, "Building", "still", "t2");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("t1"));
        assert_eq!(conditions[0].message.as_deref(), Some("still"));

        set_condition(&mut conditions, CONDITION_READY, true, "Converged", "ok", "t3");
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("t3"));
    }

    #[test]
    fn remove_drops_only_named_condition() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, CONDITION_READY, true, "Converged", "", "t");
        set_condition(&mut conditions, CONDITION_BUILD_STALE, true, "Stale", "", "t");
        remove_condition(&mut conditions, CONDITION_BUILD_STALE);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].condition_type, CONDITION_READY);
    }
}

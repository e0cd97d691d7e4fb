// Authorization recovery policy
// Decides the next step after a protected call from its outcome tag alone

use crate::transport::TransportOutcome;

/// Which try of a protected call just completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Retry,
}

/// What to do with a protected call's outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Hand the outcome to the caller as-is
    Complete,
    /// Refresh the session once, then retry the call once
    RefreshAndRetry,
    /// Still unauthorized after refreshing: end the session
    ForceLogout,
}

pub fn next_step(outcome: &TransportOutcome, attempt: Attempt) -> RecoveryStep {
    if !outcome.is_unauthorized() {
        return RecoveryStep::Complete;
    }
    match attempt {
        Attempt::First => RecoveryStep::RefreshAndRetry,
        Attempt::Retry => RecoveryStep::ForceLogout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_unauthorized_refreshes_once_then_logs_out() {
        assert_eq!(
            next_step(&TransportOutcome::Unauthorized, Attempt::First),
            RecoveryStep::RefreshAndRetry
        );
        assert_eq!(
            next_step(&TransportOutcome::Unauthorized, Attempt::Retry),
            RecoveryStep::ForceLogout
        );
    }

    #[test]
    fn test_other_outcomes_complete() {
        let outcomes = [
            TransportOutcome::Ok(Value::Null),
            TransportOutcome::NetworkError("reset".to_string()),
            TransportOutcome::ServerError {
                status: 500,
                message: String::new(),
            },
        ];
        for outcome in &outcomes {
            assert_eq!(next_step(outcome, Attempt::First), RecoveryStep::Complete);
            assert_eq!(next_step(outcome, Attempt::Retry), RecoveryStep::Complete);
        }
    }
}

/// Config size guardrails — enforced from day 1.
///
/// Every variable-length field has a hard maximum **byte** length (UTF-8
/// bytes, not characters), and each namespace's aggregate encoded state must
/// fit the storage network's payload ceiling. Oversized input is rejected,
/// never truncated.

/// Max contact/profile/group name length.
pub const MAX_NAME_BYTES: usize = 100;

/// Max per-contact nickname length.
pub const MAX_NICKNAME_BYTES: usize = 100;

/// Max group description length.
pub const MAX_DESCRIPTION_BYTES: usize = 600;

/// Max display-picture URL length.
pub const MAX_URL_BYTES: usize = 223;

/// Display-picture decryption keys are exactly this long.
pub const DISPLAY_PIC_KEY_BYTES: usize = 32;

/// Max derived non-admin group auth blob length.
pub const MAX_AUTH_DATA_BYTES: usize = 100;

/// Max community room token length.
pub const MAX_ROOM_BYTES: usize = 64;

/// Max canonical community base-URL length.
pub const MAX_COMMUNITY_URL_BYTES: usize = 262;

/// Max encoded namespace state — the storage network's payload ceiling net of
/// encryption overhead. A mutation that would push the aggregate past this
/// fails with `ConfigTooLarge`; nothing is silently dropped.
pub const CIPHERTEXT_BUDGET_BYTES: usize = 76_800;

/// Warn once the aggregate encoded state crosses this fraction of the budget.
pub const NEAR_BUDGET_BYTES: usize = CIPHERTEXT_BUDGET_BYTES / 10 * 9;

/// Defensive iteration ceiling. Record iteration must terminate; past this
/// many steps the iterator fails fast instead of hanging on malformed state.
pub const LOOP_LIMIT: usize = 10_000;

/// Budget status for a namespace's aggregate encoded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Under the warning threshold, all mutations allowed.
    Ok,
    /// Approaching the ceiling — callers should surface a warning.
    NearBudget,
    /// Over the ceiling — the mutation that got here must be rejected.
    OverBudget,
}

/// Check an aggregate encoded size against the ciphertext budget.
pub fn check_budget(encoded_len: usize) -> BudgetStatus {
    if encoded_len > CIPHERTEXT_BUDGET_BYTES {
        BudgetStatus::OverBudget
    } else if encoded_len >= NEAR_BUDGET_BYTES {
        BudgetStatus::NearBudget
    } else {
        BudgetStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_ok() {
        assert_eq!(check_budget(0), BudgetStatus::Ok);
        assert_eq!(check_budget(50_000), BudgetStatus::Ok);
        assert_eq!(check_budget(NEAR_BUDGET_BYTES - 1), BudgetStatus::Ok);
    }

    #[test]
    fn test_budget_near() {
        assert_eq!(check_budget(NEAR_BUDGET_BYTES), BudgetStatus::NearBudget);
        assert_eq!(
            check_budget(CIPHERTEXT_BUDGET_BYTES),
            BudgetStatus::NearBudget
        );
    }

    #[test]
    fn test_budget_over() {
        assert_eq!(
            check_budget(CIPHERTEXT_BUDGET_BYTES + 1),
            BudgetStatus::OverBudget
        );
    }
}

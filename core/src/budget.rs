//! Budget split arithmetic.
//!
//! The organizer divides the money collected from all participants between
//! free-text roles. Only the percentage sum is validated; role names are not.

use crate::error::LifecycleError;
use crate::model::{BudgetAllocation, RoleShare};

/// Upper bound for the sum of all role percentages
pub const MAX_PERCENTAGE_TOTAL: f64 = 100.0;

/// Slack for binary floating point (`33.3 + 33.3 + 33.4`)
const PERCENTAGE_EPSILON: f64 = 1e-9;

/// Sum of all role percentages
#[must_use]
pub fn percentage_total(shares: &[RoleShare]) -> f64 {
    shares.iter().map(|share| share.percentage).sum()
}

/// Check a budget split before it is persisted
///
/// # Errors
///
/// - [`LifecycleError::Validation`] if a percentage is negative or not finite
/// - [`LifecycleError::InvalidPercentageSum`] if the percentages add up to more than 100
pub fn validate_role_percentages(shares: &[RoleShare]) -> Result<(), LifecycleError> {
    if let Some(share) = shares
        .iter()
        .find(|share| !share.percentage.is_finite() || share.percentage < 0.0)
    {
        return Err(LifecycleError::Validation(format!(
            "percentage for role '{}' must be a non-negative number (got {})",
            share.role, share.percentage
        )));
    }

    let sum = percentage_total(shares);
    if sum > MAX_PERCENTAGE_TOTAL + PERCENTAGE_EPSILON {
        return Err(LifecycleError::InvalidPercentageSum { sum });
    }

    Ok(())
}

/// Budget collected when every seat is taken
#[must_use]
pub fn total_budget(budget_per_person: f64, participant_limit: u32) -> f64 {
    budget_per_person * f64::from(participant_limit)
}

/// Compute the per-role allocation, in the order the roles were given
///
/// Each entry is `budget × participant_limit × percentage / 100`, rounded to
/// two decimals.
#[must_use]
pub fn allocate(
    budget_per_person: f64,
    participant_limit: u32,
    shares: &[RoleShare],
) -> Vec<BudgetAllocation> {
    let total = total_budget(budget_per_person, participant_limit);

    shares
        .iter()
        .map(|share| BudgetAllocation {
            role: share.role.clone(),
            percentage: share.percentage,
            allocated_budget: round_cents(total * share.percentage / 100.0),
        })
        .collect()
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_over_hundred_is_rejected() {
        let shares = vec![RoleShare::new("A", 40.0), RoleShare::new("B", 70.0)];
        let err = validate_role_percentages(&shares).unwrap_err();
        assert_eq!(err, LifecycleError::InvalidPercentageSum { sum: 110.0 });
    }

    #[test]
    fn test_exactly_hundred_is_accepted() {
        let shares = vec![
            RoleShare::new("Food", 33.3),
            RoleShare::new("Drinks", 33.3),
            RoleShare::new("Music", 33.4),
        ];
        assert!(validate_role_percentages(&shares).is_ok());
    }

    #[test]
    fn test_empty_split_is_accepted() {
        assert!(validate_role_percentages(&[]).is_ok());
    }

    #[test]
    fn test_negative_percentage_is_a_validation_error() {
        let shares = vec![RoleShare::new("Food", -5.0)];
        assert!(matches!(
            validate_role_percentages(&shares),
            Err(LifecycleError::Validation(_))
        ));
    }

    #[test]
    fn test_allocation_rounds_to_cents() {
        let shares = vec![RoleShare::new("Food", 33.333), RoleShare::new("Drinks", 12.5)];
        let allocations = allocate(2.0, 5, &shares);

        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].role, "Food");
        // 10 * 0.33333 = 3.3333
        assert_eq!(allocations[0].allocated_budget, 3.33);
        assert_eq!(allocations[1].allocated_budget, 1.25);
    }

    #[test]
    fn test_allocation_keeps_role_order() {
        let shares = vec![RoleShare::new("Z", 10.0), RoleShare::new("A", 20.0)];
        let roles: Vec<_> = allocate(10.0, 10, &shares)
            .into_iter()
            .map(|allocation| allocation.role)
            .collect();
        assert_eq!(roles, vec!["Z", "A"]);
    }
}

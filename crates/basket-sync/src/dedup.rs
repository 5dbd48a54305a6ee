//! Narrows the cheap transaction listing to orders not yet stored.

use std::collections::BTreeSet;

use basket_core::{SourceTransaction, UserId};
use basket_storage::{OrderStore, StoreError};

/// Unique, non-empty order numbers of a listing.
pub fn candidate_order_numbers(transactions: &[SourceTransaction]) -> BTreeSet<String> {
    transactions
        .iter()
        .filter_map(|t| t.order_number.as_deref())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn filter_new_orders(
    store: &dyn OrderStore,
    user_id: UserId,
    candidates: &BTreeSet<String>,
) -> Result<Vec<String>, StoreError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let listed: Vec<String> = candidates.iter().cloned().collect();
    let existing = store.existing_order_numbers(user_id, &listed).await?;
    Ok(listed
        .into_iter()
        .filter(|n| !existing.contains(n))
        .collect())
}

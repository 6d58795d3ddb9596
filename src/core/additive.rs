//! Additive engine - Applies and reverses contract amendments.
//!
//! Percentage additives (QUANTITY, VALUE, MIXED) are bounded by a legal cap on the
//! sum of active percentages per contract. The cap is checked every time a
//! percentage is created, edited or applied, inside the same transaction that
//! writes the result, because a sibling additive may have changed meanwhile.
//!
//! Applying a quantity additive records one [`additive_line_item`] row per touched
//! line with a `quantity_delta` computed from the line's baseline, and raises the
//! line's `current_limit` by that delta. Reverting subtracts the stored delta, so
//! apply followed by revert is an exact inverse.

use crate::{
    config::LedgerConfig,
    core::{
        journal,
        line_item::{lock_contract_line_items, lock_line_item, set_current_limit},
        retry::{RetryPolicy, with_retry},
        round_money, round_quantity,
    },
    entities::{Additive, AdditiveKind, AdditiveLineItem, additive, additive_line_item, contract_line_item},
    errors::{Error, Result},
};
use rust_decimal::Decimal;
use sea_orm::{DatabaseTransaction, PaginatorTrait, QueryOrder, Set, TransactionTrait, prelude::*};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of a successful cap check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitCheck {
    /// Always `true`; a failing check is returned as `Error::LegalCapExceeded`
    pub ok: bool,
    /// Sum of the other active percentages plus the candidate
    pub accumulated_percent: Decimal,
    /// Headroom under the cap before the candidate
    pub available_percent: Decimal,
}

/// Input for recording a new, pending additive.
#[derive(Debug, Clone)]
pub struct NewAdditive {
    /// Contract being amended
    pub contract_id: i64,
    /// Kind of amendment
    pub kind: AdditiveKind,
    /// Required for percentage kinds, forbidden for TERM
    pub percentage_increase: Option<Decimal>,
    /// Free-text description
    pub description: Option<String>,
    /// When the amendment was signed
    pub signed_at: Option<DateTimeUtc>,
}

/// One line of an item-scoped apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecificItem {
    /// Line item to amend
    pub contract_line_item_id: i64,
    /// Percentage applied to this line only
    pub percentage: Decimal,
}

/// Figures computed for one line when an additive is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LineAmendment {
    pub quantity_delta: Decimal,
    pub quantity_after: Decimal,
    pub value_delta: Decimal,
}

/// Computes the delta of `percentage` on a line. The delta compounds off the
/// baseline, never off the already-amended current limit.
pub(crate) fn amend_line(line: &contract_line_item::Model, percentage: Decimal) -> LineAmendment {
    let quantity_delta = round_quantity(*line.baseline_limit * percentage / Decimal::ONE_HUNDRED);
    LineAmendment {
        quantity_delta,
        quantity_after: *line.current_limit + quantity_delta,
        value_delta: round_money(quantity_delta * *line.unit_price),
    }
}

fn validate_percentage(percentage: Decimal) -> Result<()> {
    if percentage <= Decimal::ZERO {
        return Err(Error::InvalidPercentage { percentage });
    }
    Ok(())
}

async fn find_additive<C>(db: &C, additive_id: i64) -> Result<additive::Model>
where
    C: ConnectionTrait,
{
    Additive::find_by_id(additive_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("additive", additive_id))
}

async fn rows_for_additive<C>(db: &C, additive_id: i64) -> Result<Vec<additive_line_item::Model>>
where
    C: ConnectionTrait,
{
    AdditiveLineItem::find()
        .filter(additive_line_item::Column::AdditiveId.eq(additive_id))
        .order_by_asc(additive_line_item::Column::ContractLineItemId)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Checks a candidate percentage against the cap.
///
/// Sums `percentage_increase` over the contract's active QUANTITY, VALUE and MIXED
/// additives, skipping `exclude_additive_id` so an edit does not count its own
/// previous value.
pub(crate) async fn validate_limits_in<C>(
    db: &C,
    cap: Decimal,
    contract_id: i64,
    kind: AdditiveKind,
    percentage: Decimal,
    exclude_additive_id: Option<i64>,
) -> Result<LimitCheck>
where
    C: ConnectionTrait,
{
    if percentage.is_sign_negative() {
        return Err(Error::InvalidPercentage { percentage });
    }

    let percentage_kinds = [AdditiveKind::Quantity, AdditiveKind::Value, AdditiveKind::Mixed]
        .map(|k| k.as_str().to_string());

    let mut query = Additive::find()
        .filter(additive::Column::ContractId.eq(contract_id))
        .filter(additive::Column::Active.eq(true))
        .filter(additive::Column::Kind.is_in(percentage_kinds));
    if let Some(excluded) = exclude_additive_id {
        query = query.filter(additive::Column::Id.ne(excluded));
    }

    let existing: Decimal = query
        .all(db)
        .await?
        .iter()
        .filter_map(|a| a.percentage_increase.map(Decimal::from))
        .sum();

    let candidate = if kind.is_percentage() {
        percentage
    } else {
        Decimal::ZERO
    };
    let accumulated = existing + candidate;
    let available = (cap - existing).max(Decimal::ZERO);

    if accumulated > cap {
        return Err(Error::LegalCapExceeded {
            accumulated,
            available,
            cap,
        });
    }

    Ok(LimitCheck {
        ok: true,
        accumulated_percent: accumulated,
        available_percent: available,
    })
}

async fn insert_amendment<C>(
    txn: &C,
    additive_id: i64,
    line: contract_line_item::Model,
    percentage: Decimal,
) -> Result<additive_line_item::Model>
where
    C: ConnectionTrait,
{
    let amendment = amend_line(&line, percentage);

    let row = additive_line_item::ActiveModel {
        additive_id: Set(additive_id),
        contract_line_item_id: Set(line.id),
        original_quantity: Set(line.baseline_limit),
        percentage_increase: Set(percentage.into()),
        quantity_delta: Set(amendment.quantity_delta.into()),
        quantity_after: Set(amendment.quantity_after.into()),
        unit_price: Set(line.unit_price),
        value_delta: Set(amendment.value_delta.into()),
        ..Default::default()
    }
    .insert(txn)
    .await?;

    set_current_limit(txn, line, amendment.quantity_after).await?;
    Ok(row)
}

/// Loads an active, approved quantity additive that has not been applied yet.
async fn applicable_additive<C>(txn: &C, additive_id: i64) -> Result<additive::Model>
where
    C: ConnectionTrait,
{
    let additive = find_additive(txn, additive_id).await?;
    let kind = additive.additive_kind().map_err(Error::Database)?;
    let reason = if !kind.affects_quantity() {
        Some(format!("{kind} additives do not change line item quantities"))
    } else if !additive.active {
        Some("additive is inactive".to_string())
    } else if !additive.is_approved() {
        Some("additive is pending approval".to_string())
    } else {
        None
    };
    if let Some(reason) = reason {
        return Err(Error::AdditiveNotApplicable { additive_id, reason });
    }

    let applied = AdditiveLineItem::find()
        .filter(additive_line_item::Column::AdditiveId.eq(additive_id))
        .count(txn)
        .await?;
    if applied > 0 {
        return Err(Error::AdditiveAlreadyApplied { additive_id });
    }

    Ok(additive)
}

async fn record_applied<C>(
    txn: &C,
    additive: additive::Model,
    percentage: Decimal,
    item_scoped: bool,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let mut active_model: additive::ActiveModel = additive.into();
    active_model.percentage_increase = Set(Some(percentage.into()));
    active_model.item_scoped = Set(item_scoped);
    active_model.update(txn).await?;
    Ok(())
}

pub(crate) async fn apply_global_in<C>(
    txn: &C,
    cap: Decimal,
    additive_id: i64,
    percentage: Decimal,
) -> Result<Vec<additive_line_item::Model>>
where
    C: ConnectionTrait,
{
    validate_percentage(percentage)?;
    let additive = applicable_additive(txn, additive_id).await?;
    let kind = additive.additive_kind().map_err(Error::Database)?;
    validate_limits_in(txn, cap, additive.contract_id, kind, percentage, Some(additive_id)).await?;

    let lines = lock_contract_line_items(txn, additive.contract_id).await?;
    if lines.is_empty() {
        return Err(Error::not_found("contract line items", additive.contract_id));
    }

    let mut rows = Vec::with_capacity(lines.len());
    for line in lines {
        rows.push(insert_amendment(txn, additive_id, line, percentage).await?);
    }

    record_applied(txn, additive, percentage, false).await?;
    Ok(rows)
}

pub(crate) async fn apply_specific_in<C>(
    txn: &C,
    cap: Decimal,
    additive_id: i64,
    items: &[SpecificItem],
) -> Result<Vec<additive_line_item::Model>>
where
    C: ConnectionTrait,
{
    // One entry per line; a repeated id keeps its last percentage.
    let per_line: BTreeMap<i64, Decimal> = items
        .iter()
        .map(|item| (item.contract_line_item_id, item.percentage))
        .collect();
    for percentage in per_line.values() {
        validate_percentage(*percentage)?;
    }

    let additive = applicable_additive(txn, additive_id).await?;
    let Some(largest) = per_line.values().copied().max() else {
        warn!(additive_id, "Item-scoped apply called without items");
        return Ok(Vec::new());
    };

    // The additive's contractual percentage is its largest per-line increase.
    let kind = additive.additive_kind().map_err(Error::Database)?;
    validate_limits_in(txn, cap, additive.contract_id, kind, largest, Some(additive_id)).await?;

    let mut rows = Vec::with_capacity(per_line.len());
    for (&line_item_id, &percentage) in &per_line {
        let line = lock_line_item(txn, line_item_id)
            .await?
            .filter(|line| line.contract_id == additive.contract_id)
            .ok_or(Error::LineItemNotFound {
                line_item_id,
                contract_id: additive.contract_id,
            })?;
        rows.push(insert_amendment(txn, additive_id, line, percentage).await?);
    }

    record_applied(txn, additive, largest, true).await?;
    Ok(rows)
}

/// Subtracts every stored delta of an additive and deletes its rows.
///
/// A line is never taken below its baseline plus the deltas other additives
/// still hold on it.
pub(crate) async fn revert_in<C>(txn: &C, additive_id: i64) -> Result<Vec<additive_line_item::Model>>
where
    C: ConnectionTrait,
{
    find_additive(txn, additive_id).await?;
    let rows = rows_for_additive(txn, additive_id).await?;

    for row in &rows {
        let line = lock_line_item(txn, row.contract_line_item_id)
            .await?
            .ok_or(Error::UnknownLineItem {
                line_item_id: row.contract_line_item_id,
            })?;

        let other_deltas: Decimal = AdditiveLineItem::find()
            .filter(additive_line_item::Column::ContractLineItemId.eq(line.id))
            .filter(additive_line_item::Column::AdditiveId.ne(additive_id))
            .all(txn)
            .await?
            .iter()
            .map(|other| *other.quantity_delta)
            .sum();

        let floor = *line.baseline_limit + other_deltas;
        let target = *line.current_limit - *row.quantity_delta;
        if target < floor {
            warn!(
                additive_id,
                line_item_id = line.id,
                %target,
                %floor,
                "Reverting additive would cut into other amendments, clamping"
            );
        }
        set_current_limit(txn, line, target.max(floor)).await?;
    }

    AdditiveLineItem::delete_many()
        .filter(additive_line_item::Column::AdditiveId.eq(additive_id))
        .exec(txn)
        .await?;

    Ok(rows)
}

/// Re-applies an approved quantity additive with its current figures.
///
/// Global additives use `percentage_increase`; item-scoped ones re-apply the same
/// lines with the percentages recorded on their rows.
pub(crate) async fn reapply_in<C>(
    txn: &C,
    cap: Decimal,
    additive_id: i64,
) -> Result<Vec<additive_line_item::Model>>
where
    C: ConnectionTrait,
{
    let additive = find_additive(txn, additive_id).await?;
    let kind = additive.additive_kind().map_err(Error::Database)?;

    let Some(percentage) = additive.percentage_increase.map(Decimal::from) else {
        debug!(additive_id, "Additive has no percentage, nothing to re-apply");
        return Ok(Vec::new());
    };
    if !additive.active || !additive.is_approved() || !kind.affects_quantity() {
        debug!(additive_id, "Additive is not an active, approved quantity additive");
        return Ok(Vec::new());
    }

    if additive.item_scoped {
        let items: Vec<SpecificItem> = rows_for_additive(txn, additive_id)
            .await?
            .iter()
            .map(|row| SpecificItem {
                contract_line_item_id: row.contract_line_item_id,
                percentage: *row.percentage_increase,
            })
            .collect();
        revert_in(txn, additive_id).await?;
        apply_specific_in(txn, cap, additive_id, &items).await
    } else {
        revert_in(txn, additive_id).await?;
        apply_global_in(txn, cap, additive_id, percentage).await
    }
}

/// Additive API handed to the contract-management layer.
#[derive(Debug, Clone)]
pub struct Additives {
    db: DatabaseConnection,
    config: Arc<LedgerConfig>,
    retry: RetryPolicy,
}

impl Additives {
    /// Creates the engine over a connection and ledger policy.
    #[must_use]
    pub fn new(db: DatabaseConnection, config: Arc<LedgerConfig>) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self { db, config, retry }
    }

    /// Replaces the retry policy derived from the configuration.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn cap(&self) -> Decimal {
        self.config.legal_cap_percent
    }

    async fn begin(&self) -> Result<DatabaseTransaction> {
        self.db.begin().await.map_err(Into::into)
    }

    /// Checks whether `percentage` still fits under the legal cap for the contract.
    ///
    /// # Errors
    /// Returns `Error::LegalCapExceeded` when the accumulated percentage would
    /// exceed the configured cap.
    pub async fn validate_limits(
        &self,
        contract_id: i64,
        kind: AdditiveKind,
        percentage: Decimal,
        exclude_additive_id: Option<i64>,
    ) -> Result<LimitCheck> {
        validate_limits_in(
            &self.db,
            self.cap(),
            contract_id,
            kind,
            percentage,
            exclude_additive_id,
        )
        .await
    }

    /// Records a pending additive. Percentage kinds are checked against the cap.
    #[instrument(skip(self, new_additive), fields(contract_id = new_additive.contract_id))]
    pub async fn create(&self, new_additive: NewAdditive) -> Result<additive::Model> {
        match (new_additive.kind.is_percentage(), new_additive.percentage_increase) {
            (true, Some(percentage)) => validate_percentage(percentage)?,
            (true, None) => {
                return Err(Error::InvalidPercentage {
                    percentage: Decimal::ZERO,
                });
            }
            (false, Some(percentage)) => return Err(Error::InvalidPercentage { percentage }),
            (false, None) => {}
        }

        let txn = self.begin().await?;
        if let Some(percentage) = new_additive.percentage_increase {
            validate_limits_in(
                &txn,
                self.cap(),
                new_additive.contract_id,
                new_additive.kind,
                percentage,
                None,
            )
            .await?;
        }

        let created = additive::ActiveModel {
            contract_id: Set(new_additive.contract_id),
            kind: Set(new_additive.kind.as_str().to_string()),
            percentage_increase: Set(new_additive.percentage_increase.map(Into::into)),
            active: Set(true),
            approved_by: Set(None),
            item_scoped: Set(false),
            description: Set(new_additive.description),
            signed_at: Set(new_additive.signed_at),
            created_at: Set(chrono::Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(additive_id = created.id, kind = %created.kind, "Additive recorded as pending");
        Ok(created)
    }

    /// Finds an additive by id.
    pub async fn get(&self, additive_id: i64) -> Result<Option<additive::Model>> {
        Additive::find_by_id(additive_id)
            .one(&self.db)
            .await
            .map_err(Into::into)
    }

    /// Retrieves every additive of a contract, oldest first.
    pub async fn list_for_contract(&self, contract_id: i64) -> Result<Vec<additive::Model>> {
        Additive::find()
            .filter(additive::Column::ContractId.eq(contract_id))
            .order_by_asc(additive::Column::Id)
            .all(&self.db)
            .await
            .map_err(Into::into)
    }

    /// Rows an additive currently holds, ordered by line item.
    pub async fn line_items(&self, additive_id: i64) -> Result<Vec<additive_line_item::Model>> {
        rows_for_additive(&self.db, additive_id).await
    }

    /// Applies `percentage` to every line of the additive's contract, all or nothing.
    ///
    /// # Errors
    /// - `Error::LegalCapExceeded` before any row is written
    /// - `Error::NotFound` for an unknown additive or a contract without lines
    /// - `Error::AdditiveAlreadyApplied` if the additive already holds rows
    #[instrument(skip(self))]
    pub async fn apply_global(
        &self,
        additive_id: i64,
        percentage: Decimal,
    ) -> Result<Vec<additive_line_item::Model>> {
        with_retry(&self.retry, "apply_global", || async move {
            let txn = self.begin().await?;
            let rows = apply_global_in(&txn, self.cap(), additive_id, percentage).await?;
            txn.commit().await?;
            info!(additive_id, lines = rows.len(), %percentage, "Additive applied globally");
            Ok(rows)
        })
        .await
    }

    /// Applies per-line percentages to the given lines only, all or nothing.
    ///
    /// # Errors
    /// Returns `Error::LineItemNotFound` if a line does not belong to the
    /// additive's contract, plus the errors of [`Self::apply_global`].
    #[instrument(skip(self, items))]
    pub async fn apply_specific(
        &self,
        additive_id: i64,
        items: &[SpecificItem],
    ) -> Result<Vec<additive_line_item::Model>> {
        with_retry(&self.retry, "apply_specific", || async move {
            let txn = self.begin().await?;
            let rows = apply_specific_in(&txn, self.cap(), additive_id, items).await?;
            txn.commit().await?;
            info!(additive_id, lines = rows.len(), "Additive applied to specific lines");
            Ok(rows)
        })
        .await
    }

    /// Undoes an apply, returning the rows that were removed.
    #[instrument(skip(self))]
    pub async fn revert(&self, additive_id: i64) -> Result<Vec<additive_line_item::Model>> {
        with_retry(&self.retry, "revert", || async move {
            let txn = self.begin().await?;
            let rows = revert_in(&txn, additive_id).await?;
            txn.commit().await?;
            info!(additive_id, lines = rows.len(), "Additive reverted");
            Ok(rows)
        })
        .await
    }

    /// Reverts an additive and removes it together with the movements it owns.
    ///
    /// # Errors
    /// Returns `Error::ConcurrentUpdate` when every attempt hit a write conflict.
    #[instrument(skip(self))]
    pub async fn delete(&self, additive_id: i64) -> Result<()> {
        with_retry(&self.retry, "delete_additive", || async move {
            let txn = self.begin().await?;
            revert_in(&txn, additive_id).await?;
            let removed = journal::delete_for_additive(&txn, additive_id).await?;
            Additive::delete_by_id(additive_id).exec(&txn).await?;
            txn.commit().await?;
            info!(additive_id, owned_movements = removed, "Additive deleted");
            Ok(())
        })
        .await
    }

    /// Reverts and re-applies an approved quantity additive with its current
    /// figures. A no-op for pending, inactive or non-quantity additives.
    #[instrument(skip(self))]
    pub async fn reapply(&self, additive_id: i64) -> Result<Vec<additive_line_item::Model>> {
        with_retry(&self.retry, "reapply", || async move {
            let txn = self.begin().await?;
            let rows = reapply_in(&txn, self.cap(), additive_id).await?;
            txn.commit().await?;
            Ok(rows)
        })
        .await
    }

    /// Records the approver and re-applies the additive.
    #[instrument(skip(self))]
    pub async fn approve(
        &self,
        additive_id: i64,
        approver_id: i64,
    ) -> Result<Vec<additive_line_item::Model>> {
        with_retry(&self.retry, "approve", || async move {
            let txn = self.begin().await?;
            let additive = find_additive(&txn, additive_id).await?;
            let mut active_model: additive::ActiveModel = additive.into();
            active_model.approved_by = Set(Some(approver_id));
            active_model.update(&txn).await?;

            let rows = reapply_in(&txn, self.cap(), additive_id).await?;
            txn.commit().await?;
            info!(additive_id, approver_id, lines = rows.len(), "Additive approved");
            Ok(rows)
        })
        .await
    }

    /// Edits the percentage of an additive, re-checking the cap without its own
    /// previous value, and re-applies it when it is active and approved.
    ///
    /// An item-scoped additive keeps its set of lines and takes the new
    /// percentage on each of them.
    #[instrument(skip(self))]
    pub async fn update_percentage(
        &self,
        additive_id: i64,
        percentage: Decimal,
    ) -> Result<Vec<additive_line_item::Model>> {
        validate_percentage(percentage)?;

        with_retry(&self.retry, "update_percentage", || async move {
            let txn = self.begin().await?;
            let additive = find_additive(&txn, additive_id).await?;
            let kind = additive.additive_kind().map_err(Error::Database)?;
            if !kind.is_percentage() {
                return Err(Error::AdditiveNotApplicable {
                    additive_id,
                    reason: format!("{kind} additives carry no percentage"),
                });
            }
            validate_limits_in(
                &txn,
                self.cap(),
                additive.contract_id,
                kind,
                percentage,
                Some(additive_id),
            )
            .await?;

            let moves_quantity =
                additive.active && additive.is_approved() && kind.affects_quantity();
            let item_scoped = additive.item_scoped;
            let mut active_model: additive::ActiveModel = additive.into();
            active_model.percentage_increase = Set(Some(percentage.into()));
            active_model.update(&txn).await?;

            let rows = if !moves_quantity {
                Vec::new()
            } else if item_scoped {
                let items: Vec<SpecificItem> = revert_in(&txn, additive_id)
                    .await?
                    .iter()
                    .map(|row| SpecificItem {
                        contract_line_item_id: row.contract_line_item_id,
                        percentage,
                    })
                    .collect();
                apply_specific_in(&txn, self.cap(), additive_id, &items).await?
            } else {
                revert_in(&txn, additive_id).await?;
                apply_global_in(&txn, self.cap(), additive_id, percentage).await?
            };

            txn.commit().await?;
            info!(additive_id, %percentage, "Additive percentage updated");
            Ok(rows)
        })
        .await
    }

    /// Marks an additive inactive and reverts its deltas, so it no longer counts
    /// toward the cap or the balance.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, additive_id: i64) -> Result<additive::Model> {
        with_retry(&self.retry, "deactivate", || async move {
            let txn = self.begin().await?;
            revert_in(&txn, additive_id).await?;
            let additive = find_additive(&txn, additive_id).await?;
            let mut active_model: additive::ActiveModel = additive.into();
            active_model.active = Set(false);
            let updated = active_model.update(&txn).await?;
            txn.commit().await?;
            Ok(updated)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::balance::project;
    use crate::core::journal::NewMovement;
    use crate::core::line_item::{create_line_item, get_line_item};
    use crate::entities::{Movement, MovementKind};
    use crate::test_utils::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amend_line_compounds_off_baseline() {
        let line = contract_line_item::Model {
            id: 1,
            contract_id: 1,
            product_id: 1,
            unit_price: dec!(10).into(),
            current_limit: dec!(120).into(),
            baseline_limit: dec!(100).into(),
            created_at: chrono::Utc::now(),
        };
        let amendment = amend_line(&line, dec!(5));
        assert_eq!(amendment.quantity_delta, dec!(5));
        assert_eq!(amendment.quantity_after, dec!(125));
        assert_eq!(amendment.value_delta, dec!(50));
    }

    #[test]
    fn test_amend_line_rounds_quantity_and_money() {
        let line = contract_line_item::Model {
            id: 1,
            contract_id: 1,
            product_id: 1,
            unit_price: dec!(3.333).into(),
            current_limit: dec!(7).into(),
            baseline_limit: dec!(7).into(),
            created_at: chrono::Utc::now(),
        };
        let amendment = amend_line(&line, dec!(12.5));
        assert_eq!(amendment.quantity_delta, dec!(0.875));
        assert_eq!(amendment.value_delta, dec!(2.92));
    }

    #[tokio::test]
    async fn test_create_validation() -> Result<()> {
        let db = setup_test_db().await?;
        let additives = test_additives(&db);

        let missing_percentage = additives
            .create(NewAdditive {
                contract_id: 1,
                kind: AdditiveKind::Quantity,
                percentage_increase: None,
                description: None,
                signed_at: None,
            })
            .await;
        assert!(matches!(
            missing_percentage.unwrap_err(),
            Error::InvalidPercentage { .. }
        ));

        let term_with_percentage = additives
            .create(NewAdditive {
                contract_id: 1,
                kind: AdditiveKind::Term,
                percentage_increase: Some(dec!(5)),
                description: None,
                signed_at: None,
            })
            .await;
        assert!(matches!(
            term_with_percentage.unwrap_err(),
            Error::InvalidPercentage { .. }
        ));

        let negative = additives
            .create(NewAdditive {
                contract_id: 1,
                kind: AdditiveKind::Value,
                percentage_increase: Some(dec!(-5)),
                description: None,
                signed_at: None,
            })
            .await;
        assert!(matches!(negative.unwrap_err(), Error::InvalidPercentage { .. }));
        assert!(additives.list_for_contract(1).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_validate_limits_sums_active_percentage_additives() -> Result<()> {
        let db = setup_test_db().await?;
        let additives = test_additives(&db);

        let first = create_pending_additive(&db, 1, dec!(10)).await?;
        create_custom_additive(&db, 1, AdditiveKind::Value, Some(dec!(5))).await?;
        create_custom_additive(&db, 1, AdditiveKind::Term, None).await?;
        // Other contracts never count.
        create_pending_additive(&db, 2, dec!(20)).await?;

        let check = additives
            .validate_limits(1, AdditiveKind::Quantity, dec!(10), None)
            .await?;
        assert!(check.ok);
        assert_eq!(check.accumulated_percent, dec!(25));
        assert_eq!(check.available_percent, dec!(10));

        let exceeded = additives
            .validate_limits(1, AdditiveKind::Mixed, dec!(10.01), None)
            .await;
        assert!(matches!(
            exceeded.unwrap_err(),
            Error::LegalCapExceeded { accumulated, available, cap }
                if accumulated == dec!(25.01) && available == dec!(10) && cap == dec!(25)
        ));

        // Editing the first additive excludes its own 10%.
        let edit = additives
            .validate_limits(1, AdditiveKind::Quantity, dec!(20), Some(first.id))
            .await?;
        assert_eq!(edit.accumulated_percent, dec!(25));

        // TERM additives never consume headroom.
        let term = additives
            .validate_limits(1, AdditiveKind::Term, dec!(0), None)
            .await?;
        assert_eq!(term.accumulated_percent, dec!(15));

        Ok(())
    }

    #[tokio::test]
    async fn test_inactive_additives_do_not_count() -> Result<()> {
        let db = setup_test_db().await?;
        let additives = test_additives(&db);

        let old = create_pending_additive(&db, 1, dec!(20)).await?;
        additives.deactivate(old.id).await?;

        let check = additives
            .validate_limits(1, AdditiveKind::Quantity, dec!(25), None)
            .await?;
        assert_eq!(check.accumulated_percent, dec!(25));

        Ok(())
    }

    #[tokio::test]
    async fn test_apply_global_example() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);
        let additive = create_approved_additive(&db, line.contract_id, dec!(20)).await?;

        let rows = additives.apply_global(additive.id, dec!(20)).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].original_quantity, dec!(100));
        assert_eq!(rows[0].quantity_delta, dec!(20));
        assert_eq!(rows[0].quantity_after, dec!(120));
        assert_eq!(rows[0].value_delta, dec!(200));

        let updated = get_line_item(&db, line.id).await?.unwrap();
        assert_eq!(updated.current_limit, dec!(120));
        assert_eq!(updated.baseline_limit, dec!(100));

        let stored = additives.get(additive.id).await?.unwrap();
        assert!(!stored.item_scoped);
        assert_eq!(stored.percentage_increase, Some(dec!(20).into()));

        Ok(())
    }

    #[tokio::test]
    async fn test_apply_global_compounds_off_baseline() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);

        let first = create_approved_additive(&db, line.contract_id, dec!(10)).await?;
        additives.apply_global(first.id, dec!(10)).await?;
        let second = create_approved_additive(&db, line.contract_id, dec!(10)).await?;
        let rows = additives.apply_global(second.id, dec!(10)).await?;

        assert_eq!(rows[0].quantity_delta, dec!(10));
        assert_eq!(rows[0].quantity_after, dec!(120));

        Ok(())
    }

    #[tokio::test]
    async fn test_second_additive_over_cap_writes_nothing() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);

        let first = create_approved_additive(&db, line.contract_id, dec!(15)).await?;
        additives.apply_global(first.id, dec!(15)).await?;

        // Recorded directly so the cap check at apply time is the one that fires.
        let second = create_custom_additive(&db, line.contract_id, AdditiveKind::Quantity, None).await?;
        let result = additives.apply_global(second.id, dec!(15)).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::LegalCapExceeded { accumulated, .. } if accumulated == dec!(30)
        ));

        assert!(additives.line_items(second.id).await?.is_empty());
        let unchanged = get_line_item(&db, line.id).await?.unwrap();
        assert_eq!(unchanged.current_limit, dec!(115));

        Ok(())
    }

    #[tokio::test]
    async fn test_apply_global_is_all_or_nothing() -> Result<()> {
        let db = setup_test_db().await?;
        let additives = test_additives(&db);

        let additive = create_approved_additive(&db, 5, dec!(10)).await?;
        let result = additives.apply_global(additive.id, dec!(10)).await;
        assert!(matches!(result.unwrap_err(), Error::NotFound { .. }));

        let result = additives.apply_global(999, dec!(10)).await;
        assert!(matches!(result.unwrap_err(), Error::NotFound { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_apply_global_twice_is_rejected() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);
        let additive = create_approved_additive(&db, line.contract_id, dec!(10)).await?;

        additives.apply_global(additive.id, dec!(10)).await?;
        let again = additives.apply_global(additive.id, dec!(10)).await;
        assert!(matches!(
            again.unwrap_err(),
            Error::AdditiveAlreadyApplied { additive_id } if additive_id == additive.id
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_value_additive_cannot_move_quantities() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);
        let value = create_custom_additive(&db, line.contract_id, AdditiveKind::Value, Some(dec!(5))).await?;

        let result = additives.apply_global(value.id, dec!(5)).await;
        assert!(matches!(result.unwrap_err(), Error::AdditiveNotApplicable { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_apply_requires_active_approved_additive() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);

        let pending = create_pending_additive(&db, line.contract_id, dec!(10)).await?;
        let result = additives.apply_global(pending.id, dec!(10)).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::AdditiveNotApplicable { additive_id, .. } if additive_id == pending.id
        ));
        let result = additives
            .apply_specific(
                pending.id,
                &[SpecificItem {
                    contract_line_item_id: line.id,
                    percentage: dec!(10),
                }],
            )
            .await;
        assert!(matches!(result.unwrap_err(), Error::AdditiveNotApplicable { .. }));
        assert!(additives.line_items(pending.id).await?.is_empty());

        let withdrawn = create_approved_additive(&db, line.contract_id, dec!(5)).await?;
        additives.deactivate(withdrawn.id).await?;
        let result = additives.apply_global(withdrawn.id, dec!(5)).await;
        assert!(matches!(result.unwrap_err(), Error::AdditiveNotApplicable { .. }));
        assert!(additives.line_items(withdrawn.id).await?.is_empty());

        let unchanged = get_line_item(&db, line.id).await?.unwrap();
        assert_eq!(unchanged.current_limit, dec!(100));
        let snapshot = project(&db, line.id, dec!(0.9)).await?;
        assert_eq!(snapshot.total_qty, *unchanged.current_limit);

        Ok(())
    }

    #[tokio::test]
    async fn test_apply_specific_asymmetric() -> Result<()> {
        let db = setup_test_db().await?;
        let additives = test_additives(&db);
        let rice = create_line_item(&db, 1, 10, dec!(5), dec!(100)).await?;
        let beans = create_line_item(&db, 1, 11, dec!(8), dec!(40)).await?;
        let oil = create_line_item(&db, 1, 12, dec!(9), dec!(10)).await?;
        let additive = create_approved_additive(&db, 1, dec!(25)).await?;

        let rows = additives
            .apply_specific(
                additive.id,
                &[
                    SpecificItem {
                        contract_line_item_id: beans.id,
                        percentage: dec!(25),
                    },
                    SpecificItem {
                        contract_line_item_id: rice.id,
                        percentage: dec!(10),
                    },
                ],
            )
            .await?;

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].contract_line_item_id, rice.id);
        assert_eq!(rows[0].quantity_delta, dec!(10));
        assert_eq!(rows[1].contract_line_item_id, beans.id);
        assert_eq!(rows[1].quantity_delta, dec!(10));
        assert_eq!(rows[1].value_delta, dec!(80));

        assert_eq!(get_line_item(&db, oil.id).await?.unwrap().current_limit, dec!(10));
        let stored = additives.get(additive.id).await?.unwrap();
        assert!(stored.item_scoped);
        assert_eq!(stored.percentage_increase, Some(dec!(25).into()));

        Ok(())
    }

    #[tokio::test]
    async fn test_apply_specific_foreign_line_rolls_back() -> Result<()> {
        let db = setup_test_db().await?;
        let additives = test_additives(&db);
        let own = create_line_item(&db, 1, 10, dec!(5), dec!(100)).await?;
        let foreign = create_line_item(&db, 2, 10, dec!(5), dec!(100)).await?;
        let additive = create_approved_additive(&db, 1, dec!(10)).await?;

        let result = additives
            .apply_specific(
                additive.id,
                &[
                    SpecificItem {
                        contract_line_item_id: own.id,
                        percentage: dec!(10),
                    },
                    SpecificItem {
                        contract_line_item_id: foreign.id,
                        percentage: dec!(10),
                    },
                ],
            )
            .await;
        assert!(matches!(
            result.unwrap_err(),
            Error::LineItemNotFound { line_item_id, contract_id: 1 } if line_item_id == foreign.id
        ));

        assert_eq!(get_line_item(&db, own.id).await?.unwrap().current_limit, dec!(100));
        assert!(additives.line_items(additive.id).await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_revert_is_exact_inverse() -> Result<()> {
        let db = setup_test_db().await?;
        let additives = test_additives(&db);
        let a = create_line_item(&db, 1, 10, dec!(2.5), dec!(30)).await?;
        let b = create_line_item(&db, 1, 11, dec!(4), dec!(7)).await?;

        let earlier = create_approved_additive(&db, 1, dec!(10)).await?;
        additives.apply_global(earlier.id, dec!(10)).await?;
        let before_a = get_line_item(&db, a.id).await?.unwrap().current_limit;
        let before_b = get_line_item(&db, b.id).await?.unwrap().current_limit;
        assert_eq!(before_a, dec!(33));
        assert_eq!(before_b, dec!(7.7));

        let later = create_approved_additive(&db, 1, dec!(5)).await?;
        additives.apply_global(later.id, dec!(5)).await?;
        let removed = additives.revert(later.id).await?;
        assert_eq!(removed.len(), 2);

        assert_eq!(get_line_item(&db, a.id).await?.unwrap().current_limit, before_a);
        assert_eq!(get_line_item(&db, b.id).await?.unwrap().current_limit, before_b);
        assert!(additives.line_items(later.id).await?.is_empty());
        assert_eq!(additives.line_items(earlier.id).await?.len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_revert_never_cuts_into_other_additives() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);

        let kept = create_approved_additive(&db, line.contract_id, dec!(10)).await?;
        additives.apply_global(kept.id, dec!(10)).await?;
        let reverted = create_approved_additive(&db, line.contract_id, dec!(10)).await?;
        additives.apply_global(reverted.id, dec!(10)).await?;

        // Simulate an out-of-band write that lowered the limit.
        {
            let txn = db.begin().await?;
            let locked = lock_line_item(&txn, line.id).await?.unwrap();
            set_current_limit(&txn, locked, dec!(105)).await?;
            txn.commit().await?;
        }

        additives.revert(reverted.id).await?;
        assert_eq!(get_line_item(&db, line.id).await?.unwrap().current_limit, dec!(110));

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_removes_additive_rows_and_owned_movements() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);
        let additive = create_approved_additive(&db, line.contract_id, dec!(20)).await?;
        additives.apply_global(additive.id, dec!(20)).await?;

        journal::append(
            &db,
            NewMovement::new(line.id, MovementKind::Adjustment, dec!(4), dec!(40), 1)
                .owned_by_additive(additive.id),
        )
        .await?;
        let independent = journal::append(
            &db,
            NewMovement::new(line.id, MovementKind::Consumption, dec!(1), dec!(10), 1),
        )
        .await?;

        additives.delete(additive.id).await?;

        assert!(additives.get(additive.id).await?.is_none());
        assert!(additives.line_items(additive.id).await?.is_empty());
        assert_eq!(get_line_item(&db, line.id).await?.unwrap().current_limit, dec!(100));
        assert_eq!(Movement::find().all(&db).await?, vec![independent]);

        let missing = additives.delete(additive.id).await;
        assert!(matches!(missing.unwrap_err(), Error::NotFound { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_reapply_is_noop_for_pending_additive() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);
        let pending = create_pending_additive(&db, line.contract_id, dec!(10)).await?;

        assert!(additives.reapply(pending.id).await?.is_empty());
        assert_eq!(get_line_item(&db, line.id).await?.unwrap().current_limit, dec!(100));

        Ok(())
    }

    #[tokio::test]
    async fn test_approve_applies_and_feeds_balance() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);
        let pending = create_pending_additive(&db, line.contract_id, dec!(20)).await?;

        let rows = additives.approve(pending.id, 77).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(additives.get(pending.id).await?.unwrap().approved_by, Some(77));

        let snapshot = project(&db, line.id, dec!(0.9)).await?;
        assert_eq!(snapshot.additive_qty, dec!(20));
        assert_eq!(snapshot.total_qty, dec!(120));

        Ok(())
    }

    #[tokio::test]
    async fn test_update_percentage_reapplies() -> Result<()> {
        let (db, line) = setup_with_line_item().await?;
        let additives = test_additives(&db);
        let additive = create_pending_additive(&db, line.contract_id, dec!(10)).await?;
        additives.approve(additive.id, 1).await?;

        let rows = additives.update_percentage(additive.id, dec!(25)).await?;
        assert_eq!(rows[0].quantity_delta, dec!(25));
        assert_eq!(get_line_item(&db, line.id).await?.unwrap().current_limit, dec!(125));

        let too_much = create_pending_additive(&db, line.contract_id, dec!(0.01)).await;
        assert!(matches!(too_much.unwrap_err(), Error::LegalCapExceeded { .. }));

        let rows = additives.update_percentage(additive.id, dec!(5)).await?;
        assert_eq!(rows[0].quantity_delta, dec!(5));
        assert_eq!(get_line_item(&db, line.id).await?.unwrap().current_limit, dec!(105));

        Ok(())
    }

    #[tokio::test]
    async fn test_reapply_item_scoped_keeps_lines() -> Result<()> {
        let db = setup_test_db().await?;
        let additives = test_additives(&db);
        let rice = create_line_item(&db, 1, 10, dec!(5), dec!(100)).await?;
        let beans = create_line_item(&db, 1, 11, dec!(8), dec!(40)).await?;
        let additive = create_approved_additive(&db, 1, dec!(20)).await?;

        additives
            .apply_specific(
                additive.id,
                &[SpecificItem {
                    contract_line_item_id: beans.id,
                    percentage: dec!(20),
                }],
            )
            .await?;
        let rows = additives.reapply(additive.id).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].contract_line_item_id, beans.id);
        assert_eq!(get_line_item(&db, beans.id).await?.unwrap().current_limit, dec!(48));
        assert_eq!(get_line_item(&db, rice.id).await?.unwrap().current_limit, dec!(100));

        let rows = additives.update_percentage(additive.id, dec!(10)).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(get_line_item(&db, beans.id).await?.unwrap().current_limit, dec!(44));

        Ok(())
    }
}

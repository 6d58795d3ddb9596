//! Balance projector - Derives the current availability of a contract line item.
//!
//! A snapshot is always folded from the journal plus the deltas of active, approved
//! additives; no stored counter is consulted. Called with a transaction, the
//! projection sees exactly what the writer holding that transaction sees, which is
//! what makes reservation check-then-append safe.

use crate::{
    config::LedgerConfig,
    entities::{
        AdditiveLineItem, MovementKind, additive, additive_line_item, contract_line_item,
        movement,
    },
    errors::{Error, Result},
};
use rust_decimal::Decimal;
use sea_orm::{JoinType, QuerySelect, RelationTrait, prelude::*};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Availability classification of a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BalanceStatus {
    /// Balance remains and consumption is below the LOW threshold
    Available,
    /// consumed/total reached the LOW threshold
    Low,
    /// Nothing left to consume
    Exhausted,
}

impl BalanceStatus {
    /// Upper-case label used in reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Low => "LOW",
            Self::Exhausted => "EXHAUSTED",
        }
    }
}

/// Point-in-time availability figures of one line item. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    /// Line item the snapshot describes
    pub contract_line_item_id: i64,
    /// Quantity signed before any additive
    pub original_qty: Decimal,
    /// Sum of deltas from active, approved additives
    pub additive_qty: Decimal,
    /// `original_qty + additive_qty`
    pub total_qty: Decimal,
    /// Consumption minus reversals plus adjustments
    pub consumed_qty: Decimal,
    /// Reserved quantity not yet released or consumed
    pub reserved_qty: Decimal,
    /// `total_qty - consumed_qty - reserved_qty`
    pub available_qty: Decimal,
    /// Classification of the balance
    pub status: BalanceStatus,
}

/// Running totals of one reservation lot: the movements of one line item that
/// share a reference document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LotTotals {
    pub reserved_qty: Decimal,
    pub reserved_value: Decimal,
    pub released_qty: Decimal,
    pub consumed_qty: Decimal,
}

impl LotTotals {
    /// Reserved quantity not yet released.
    fn held(&self) -> Decimal {
        (self.reserved_qty - self.released_qty).max(Decimal::ZERO)
    }

    /// Part of the held quantity already covered by consumption.
    pub fn settled(&self) -> Decimal {
        self.consumed_qty.min(self.held())
    }

    /// Quantity still on hold.
    pub fn outstanding(&self) -> Decimal {
        self.held() - self.settled()
    }

    /// Value of one reserved unit, used to price consumption and releases.
    pub fn unit_value(&self) -> Decimal {
        if self.reserved_qty.is_zero() {
            Decimal::ZERO
        } else {
            self.reserved_value / self.reserved_qty
        }
    }

    fn record(&mut self, kind: MovementKind, movement: &movement::Model) {
        match kind {
            MovementKind::Reservation => {
                self.reserved_qty += *movement.quantity;
                self.reserved_value += *movement.value;
            }
            MovementKind::ReservationRelease => self.released_qty += *movement.quantity,
            MovementKind::Consumption => self.consumed_qty += *movement.quantity,
            MovementKind::Reversal | MovementKind::Adjustment => {}
        }
    }
}

/// Groups the movements of one line item into lots keyed by reference document.
pub(crate) fn lot_totals(
    movements: &[movement::Model],
) -> Result<BTreeMap<Option<String>, LotTotals>> {
    let mut lots: BTreeMap<Option<String>, LotTotals> = BTreeMap::new();
    for m in movements {
        let kind = m.movement_kind().map_err(Error::Database)?;
        lots.entry(m.reference_document.clone())
            .or_default()
            .record(kind, m);
    }
    Ok(lots)
}

/// Groups the movements of one reference document into lots keyed by line item.
pub(crate) fn lots_by_line_item(movements: &[movement::Model]) -> Result<BTreeMap<i64, LotTotals>> {
    let mut lots: BTreeMap<i64, LotTotals> = BTreeMap::new();
    for m in movements {
        let kind = m.movement_kind().map_err(Error::Database)?;
        lots.entry(m.contract_line_item_id)
            .or_default()
            .record(kind, m);
    }
    Ok(lots)
}

/// Folds a line item, its journal and its additive deltas into a snapshot.
///
/// `movements` must all belong to `line_item`.
pub fn fold(
    line_item: &contract_line_item::Model,
    movements: &[movement::Model],
    additive_qty: Decimal,
    low_balance_threshold: Decimal,
) -> Result<BalanceSnapshot> {
    let mut consumed_qty = Decimal::ZERO;
    for m in movements {
        match m.movement_kind().map_err(Error::Database)? {
            MovementKind::Consumption | MovementKind::Adjustment => consumed_qty += *m.quantity,
            MovementKind::Reversal => consumed_qty -= *m.quantity,
            MovementKind::Reservation | MovementKind::ReservationRelease => {}
        }
    }

    let reserved_qty = lot_totals(movements)?
        .values()
        .map(LotTotals::outstanding)
        .sum::<Decimal>();

    let original_qty = *line_item.baseline_limit;
    let total_qty = original_qty + additive_qty;
    let available_qty = total_qty - consumed_qty - reserved_qty;

    let status = if total_qty - consumed_qty <= Decimal::ZERO {
        BalanceStatus::Exhausted
    } else if total_qty > Decimal::ZERO && consumed_qty / total_qty >= low_balance_threshold {
        BalanceStatus::Low
    } else {
        BalanceStatus::Available
    };

    Ok(BalanceSnapshot {
        contract_line_item_id: line_item.id,
        original_qty,
        additive_qty,
        total_qty,
        consumed_qty,
        reserved_qty,
        available_qty,
        status,
    })
}

/// Sum of `quantity_delta` over the active, approved additives touching a line item.
pub(crate) async fn additive_quantity<C>(db: &C, line_item_id: i64) -> Result<Decimal>
where
    C: ConnectionTrait,
{
    let rows = AdditiveLineItem::find()
        .join(
            JoinType::InnerJoin,
            additive_line_item::Relation::Additive.def(),
        )
        .filter(additive_line_item::Column::ContractLineItemId.eq(line_item_id))
        .filter(additive::Column::Active.eq(true))
        .filter(additive::Column::ApprovedBy.is_not_null())
        .all(db)
        .await?;

    Ok(rows.iter().map(|row| *row.quantity_delta).sum())
}

/// Projects the balance of a line item.
///
/// # Errors
/// Returns `Error::NotFound` if the line item does not exist.
pub async fn project<C>(
    db: &C,
    line_item_id: i64,
    low_balance_threshold: Decimal,
) -> Result<BalanceSnapshot>
where
    C: ConnectionTrait,
{
    let line_item = crate::core::line_item::get_line_item(db, line_item_id)
        .await?
        .ok_or_else(|| Error::not_found("contract line item", line_item_id))?;
    project_line(db, &line_item, low_balance_threshold).await
}

/// Projects the balance of a line item the caller already loaded (and possibly locked).
pub(crate) async fn project_line<C>(
    db: &C,
    line_item: &contract_line_item::Model,
    low_balance_threshold: Decimal,
) -> Result<BalanceSnapshot>
where
    C: ConnectionTrait,
{
    let movements = crate::core::journal::list_by_line_item(db, line_item.id).await?;
    let additive_qty = additive_quantity(db, line_item.id).await?;
    fold(line_item, &movements, additive_qty, low_balance_threshold)
}

/// Read-only balance API handed to collaborators.
#[derive(Debug, Clone)]
pub struct Balances {
    db: DatabaseConnection,
    config: Arc<LedgerConfig>,
}

impl Balances {
    /// Creates the projector over a connection and ledger policy.
    #[must_use]
    pub const fn new(db: DatabaseConnection, config: Arc<LedgerConfig>) -> Self {
        Self { db, config }
    }

    /// Current balance of one line item.
    pub async fn project(&self, line_item_id: i64) -> Result<BalanceSnapshot> {
        project(&self.db, line_item_id, self.config.low_balance_threshold).await
    }

    /// Current balance of every line of a contract, in line id order.
    pub async fn project_contract(&self, contract_id: i64) -> Result<Vec<BalanceSnapshot>> {
        let lines = crate::core::line_item::list_for_contract(&self.db, contract_id).await?;
        let mut snapshots = Vec::with_capacity(lines.len());
        for line in &lines {
            snapshots
                .push(project_line(&self.db, line, self.config.low_balance_threshold).await?);
        }
        Ok(snapshots)
    }
}

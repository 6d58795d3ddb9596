//! Reservation service - Two-phase order lifecycle over the movement journal.
//!
//! An order reserves balance when it is placed, and the hold is later converted
//! into consumption at receipt or released on cancellation. Every phase shares the
//! order's reference document as correlation key. The state of a reservation is
//! never stored: it is derived from the movements recorded under that key.

use crate::{
    config::LedgerConfig,
    core::{
        balance::{BalanceSnapshot, BalanceStatus, LotTotals, lots_by_line_item, project_line},
        journal::{self, NewMovement},
        line_item::lock_line_item,
        retry::{RetryPolicy, with_retry},
        round_money,
    },
    entities::{MovementKind, contract_line_item, movement},
    errors::{Error, RejectedItem, Result},
};
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One line of an order to reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationItem {
    /// Line item to reserve against
    pub contract_line_item_id: i64,
    /// Strictly positive quantity
    pub quantity: Decimal,
    /// Price agreed for the order line
    pub unit_price: Decimal,
}

/// Quantity actually received for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedItem {
    /// Line item the goods were ordered against
    pub contract_line_item_id: i64,
    /// Quantity delivered, zero or more
    pub quantity_received: Decimal,
}

/// Movements written by a conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionResult {
    /// `CONSUMPTION` movements
    pub consumed: Vec<movement::Model>,
    /// `RESERVATION_RELEASE` movements for what was not received
    pub released: Vec<movement::Model>,
}

/// Derived state of a reservation lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LotState {
    /// Some quantity is still on hold
    Reserved,
    /// Resolved with part consumed and the rest released
    PartiallyConsumed,
    /// Resolved with the whole hold consumed
    Consumed,
    /// Resolved with nothing consumed
    Released,
}

impl LotState {
    fn derive(totals: &LotTotals) -> Self {
        if totals.outstanding() > Decimal::ZERO {
            Self::Reserved
        } else if totals.settled().is_zero() {
            Self::Released
        } else if totals.released_qty > Decimal::ZERO {
            Self::PartiallyConsumed
        } else {
            Self::Consumed
        }
    }
}

/// The movements of one line item under one reference document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationLot {
    /// Line item of the lot
    pub contract_line_item_id: i64,
    /// Order the lot belongs to
    pub reference_document: String,
    /// Sum of `RESERVATION` quantities
    pub reserved_qty: Decimal,
    /// Sum of `RESERVATION_RELEASE` quantities
    pub released_qty: Decimal,
    /// Sum of `CONSUMPTION` quantities under the reference
    pub consumed_qty: Decimal,
    /// Quantity still held against the line
    pub outstanding_qty: Decimal,
    /// Derived lifecycle state
    pub state: LotState,
}

impl ReservationLot {
    fn new(contract_line_item_id: i64, reference_document: &str, totals: &LotTotals) -> Self {
        Self {
            contract_line_item_id,
            reference_document: reference_document.to_string(),
            reserved_qty: totals.reserved_qty,
            released_qty: totals.released_qty,
            consumed_qty: totals.consumed_qty,
            outstanding_qty: totals.outstanding(),
            state: LotState::derive(totals),
        }
    }
}

/// An open lot together with the current balance of its line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveReservation {
    /// The open lot
    pub lot: ReservationLot,
    /// Current balance of the lot's line item
    pub balance: BalanceSnapshot,
}

/// Lots of a reference document, keyed by line item. Lines that never had a
/// reservation under the reference are left out.
async fn load_lots<C>(db: &C, reference_document: &str) -> Result<BTreeMap<i64, LotTotals>>
where
    C: sea_orm::ConnectionTrait,
{
    let movements = journal::list_by_reference_document(db, reference_document).await?;
    let mut lots = lots_by_line_item(&movements)?;
    lots.retain(|_, totals| totals.reserved_qty > Decimal::ZERO);
    Ok(lots)
}

async fn lock_lot_line(
    txn: &DatabaseTransaction,
    line_item_id: i64,
) -> Result<contract_line_item::Model> {
    lock_line_item(txn, line_item_id)
        .await?
        .ok_or(Error::UnknownLineItem { line_item_id })
}

/// Order-lifecycle API handed to order intake and receiving.
#[derive(Debug, Clone)]
pub struct Reservations {
    db: DatabaseConnection,
    config: Arc<LedgerConfig>,
    retry: RetryPolicy,
}

impl Reservations {
    /// Creates the service over a connection and ledger policy.
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

    /// Reserves every item of an order, or none of them.
    ///
    /// Each line is locked and its balance projected inside the transaction, so
    /// two orders racing for the same balance cannot both pass the check. Items
    /// repeating a line are checked against what the earlier items already took.
    ///
    /// # Errors
    /// Returns `Error::ReservationRejected` listing every failing item; no
    /// movement is written in that case.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn reserve(
        &self,
        items: &[ReservationItem],
        actor_id: i64,
        reference_document: &str,
    ) -> Result<Vec<movement::Model>> {
        with_retry(&self.retry, "reserve", || async move {
            let txn = self.db.begin().await?;

            // Lock in id order so concurrent orders queue up the same way.
            let mut lines = BTreeMap::new();
            for item in items {
                lines.insert(item.contract_line_item_id, None);
            }
            for (line_item_id, slot) in &mut lines {
                *slot = lock_line_item(&txn, *line_item_id).await?;
            }

            let mut snapshots: BTreeMap<i64, BalanceSnapshot> = BTreeMap::new();
            let mut taken: BTreeMap<i64, Decimal> = BTreeMap::new();
            let mut rejections = Vec::new();

            for item in items {
                let line_item_id = item.contract_line_item_id;
                if item.quantity <= Decimal::ZERO {
                    rejections.push(RejectedItem {
                        contract_line_item_id: line_item_id,
                        reason: Error::InvalidQuantity {
                            quantity: item.quantity,
                        },
                    });
                    continue;
                }

                let Some(Some(line)) = lines.get(&line_item_id) else {
                    rejections.push(RejectedItem {
                        contract_line_item_id: line_item_id,
                        reason: Error::not_found("contract line item", line_item_id),
                    });
                    continue;
                };

                let snapshot = match snapshots.get(&line_item_id) {
                    Some(snapshot) => snapshot.clone(),
                    None => {
                        let snapshot =
                            project_line(&txn, line, self.config.low_balance_threshold).await?;
                        snapshots.insert(line_item_id, snapshot.clone());
                        snapshot
                    }
                };

                let already_taken = taken.get(&line_item_id).copied().unwrap_or_default();
                let available = snapshot.available_qty - already_taken;

                if snapshot.status == BalanceStatus::Exhausted {
                    rejections.push(RejectedItem {
                        contract_line_item_id: line_item_id,
                        reason: Error::LineExhausted { line_item_id },
                    });
                } else if item.quantity > available {
                    rejections.push(RejectedItem {
                        contract_line_item_id: line_item_id,
                        reason: Error::InsufficientBalance {
                            line_item_id,
                            available,
                            requested: item.quantity,
                        },
                    });
                } else {
                    *taken.entry(line_item_id).or_default() += item.quantity;
                }
            }

            if !rejections.is_empty() {
                warn!(
                    reference_document,
                    rejected = rejections.len(),
                    "Reservation rejected, rolling back"
                );
                return Err(Error::ReservationRejected {
                    reference_document: reference_document.to_string(),
                    rejections,
                });
            }

            let mut reserved = Vec::with_capacity(items.len());
            for item in items {
                let value = round_money(item.quantity * item.unit_price);
                let new_movement = NewMovement::new(
                    item.contract_line_item_id,
                    MovementKind::Reservation,
                    item.quantity,
                    value,
                    actor_id,
                )
                .with_reference(reference_document);
                reserved.push(journal::append(&txn, new_movement).await?);
            }

            txn.commit().await?;
            info!(reference_document, lines = reserved.len(), "Order reserved");
            Ok(reserved)
        })
        .await
    }

    /// Converts the open holds of an order into consumption.
    ///
    /// For each lot, the received quantity is consumed, priced at the lot's
    /// reserved unit value, and whatever is left of the hold is released. Lots
    /// missing from `received` are released in full. Received lines without a lot
    /// are logged and skipped, and lots already resolved are left untouched.
    ///
    /// # Errors
    /// - `Error::NotFound` if nothing was ever reserved under the reference
    /// - `Error::InvalidQuantity` for a negative received quantity
    #[instrument(skip(self, received))]
    pub async fn convert_to_consumption(
        &self,
        reference_document: &str,
        received: &[ReceivedItem],
        actor_id: i64,
    ) -> Result<ConversionResult> {
        let mut received_by_line: BTreeMap<i64, Decimal> = BTreeMap::new();
        for item in received {
            if item.quantity_received.is_sign_negative() {
                return Err(Error::InvalidQuantity {
                    quantity: item.quantity_received,
                });
            }
            *received_by_line.entry(item.contract_line_item_id).or_default() +=
                item.quantity_received;
        }
        let received_by_line = &received_by_line;

        with_retry(&self.retry, "convert_to_consumption", || async move {
            let txn = self.db.begin().await?;
            let lots = load_lots(&txn, reference_document).await?;
            if lots.is_empty() {
                return Err(Error::not_found("reservation", reference_document));
            }

            for line_item_id in received_by_line.keys() {
                if !lots.contains_key(line_item_id) {
                    warn!(
                        reference_document,
                        line_item_id, "Received line has no reservation, skipping"
                    );
                }
            }

            let mut result = ConversionResult::default();
            for (&line_item_id, totals) in &lots {
                let outstanding = totals.outstanding();
                if outstanding.is_zero() {
                    if received_by_line.contains_key(&line_item_id) {
                        warn!(
                            reference_document,
                            line_item_id, "Reservation already resolved, skipping received line"
                        );
                    }
                    continue;
                }

                lock_lot_line(&txn, line_item_id).await?;
                let quantity_received = received_by_line
                    .get(&line_item_id)
                    .copied()
                    .unwrap_or_default();
                if quantity_received > outstanding {
                    warn!(
                        reference_document,
                        line_item_id,
                        %quantity_received,
                        %outstanding,
                        "Received more than reserved, consuming everything received"
                    );
                }

                let unit_value = totals.unit_value();
                if quantity_received > Decimal::ZERO {
                    let consumption = NewMovement::new(
                        line_item_id,
                        MovementKind::Consumption,
                        quantity_received,
                        round_money(quantity_received * unit_value),
                        actor_id,
                    )
                    .with_reference(reference_document);
                    result.consumed.push(journal::append(&txn, consumption).await?);
                }

                let remainder = outstanding - quantity_received;
                if remainder > Decimal::ZERO {
                    let release = NewMovement::new(
                        line_item_id,
                        MovementKind::ReservationRelease,
                        remainder,
                        round_money(remainder * unit_value),
                        actor_id,
                    )
                    .with_reference(reference_document)
                    .with_justification("Not received");
                    result.released.push(journal::append(&txn, release).await?);
                }
            }

            txn.commit().await?;
            info!(
                reference_document,
                consumed = result.consumed.len(),
                released = result.released.len(),
                "Reservation converted to consumption"
            );
            Ok(result)
        })
        .await
    }

    /// Releases every open hold of an order. Calling it again releases nothing.
    ///
    /// # Errors
    /// Returns `Error::NotFound` if nothing was ever reserved under the reference.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        reference_document: &str,
        actor_id: i64,
    ) -> Result<Vec<movement::Model>> {
        with_retry(&self.retry, "cancel_reservation", || async move {
            let txn = self.db.begin().await?;
            let lots = load_lots(&txn, reference_document).await?;
            if lots.is_empty() {
                return Err(Error::not_found("reservation", reference_document));
            }

            let mut released = Vec::new();
            for (&line_item_id, totals) in &lots {
                let outstanding = totals.outstanding();
                if outstanding.is_zero() {
                    continue;
                }
                lock_lot_line(&txn, line_item_id).await?;
                let release = NewMovement::new(
                    line_item_id,
                    MovementKind::ReservationRelease,
                    outstanding,
                    round_money(outstanding * totals.unit_value()),
                    actor_id,
                )
                .with_reference(reference_document)
                .with_justification("Order cancelled");
                released.push(journal::append(&txn, release).await?);
            }

            txn.commit().await?;
            if released.is_empty() {
                debug!(reference_document, "Nothing left to release");
            } else {
                info!(reference_document, lines = released.len(), "Reservation cancelled");
            }
            Ok(released)
        })
        .await
    }

    /// Every lot recorded under a reference document, in line item order.
    pub async fn lots(&self, reference_document: &str) -> Result<Vec<ReservationLot>> {
        let lots = load_lots(&self.db, reference_document).await?;
        Ok(lots
            .iter()
            .map(|(&line_item_id, totals)| {
                ReservationLot::new(line_item_id, reference_document, totals)
            })
            .collect())
    }

    /// Open lots of a reference document joined with the current balance of
    /// their lines.
    pub async fn list_active_reservations(
        &self,
        reference_document: &str,
    ) -> Result<Vec<ActiveReservation>> {
        let mut active = Vec::new();
        for lot in self.lots(reference_document).await? {
            if lot.state != LotState::Reserved {
                continue;
            }
            let line = crate::core::line_item::get_line_item(&self.db, lot.contract_line_item_id)
                .await?
                .ok_or(Error::UnknownLineItem {
                    line_item_id: lot.contract_line_item_id,
                })?;
            let balance = project_line(&self.db, &line, self.config.low_balance_threshold).await?;
            active.push(ActiveReservation { lot, balance });
        }
        Ok(active)
    }
}

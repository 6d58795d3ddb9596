//! Movement journal - Append-only record of balance-affecting events.
//!
//! There is no update path: corrections are new compensating movements
//! (`REVERSAL`, `RESERVATION_RELEASE`). The one delete, [`delete_for_additive`],
//! removes movements wholly owned by an additive that is being deleted.

use crate::{
    entities::{ContractLineItem, Movement, MovementKind, movement},
    errors::{Error, Result},
};
use rust_decimal::Decimal;
use sea_orm::{QueryOrder, Set, prelude::*};
use tracing::debug;

/// A movement about to be appended.
#[derive(Debug, Clone)]
pub struct NewMovement {
    /// Line item whose balance is affected
    pub contract_line_item_id: i64,
    /// Kind of event
    pub kind: MovementKind,
    /// Strictly positive quantity
    pub quantity: Decimal,
    /// Monetary value of the event
    pub value: Decimal,
    /// Free-text reason
    pub justification: Option<String>,
    /// Correlation key (order identifier)
    pub reference_document: Option<String>,
    /// Owning additive, for movements recorded as part of an amendment
    pub additive_id: Option<i64>,
    /// User causing the movement
    pub actor_id: i64,
}

impl NewMovement {
    /// Movement with no justification, reference or owning additive.
    #[must_use]
    pub const fn new(
        contract_line_item_id: i64,
        kind: MovementKind,
        quantity: Decimal,
        value: Decimal,
        actor_id: i64,
    ) -> Self {
        Self {
            contract_line_item_id,
            kind,
            quantity,
            value,
            justification: None,
            reference_document: None,
            additive_id: None,
            actor_id,
        }
    }

    /// Sets the correlation key.
    #[must_use]
    pub fn with_reference(mut self, reference_document: impl Into<String>) -> Self {
        self.reference_document = Some(reference_document.into());
        self
    }

    /// Sets the justification text.
    #[must_use]
    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    /// Marks the movement as owned by an additive.
    #[must_use]
    pub const fn owned_by_additive(mut self, additive_id: i64) -> Self {
        self.additive_id = Some(additive_id);
        self
    }
}

/// Appends a movement to the journal.
///
/// Pass a transaction to make the append part of a larger atomic write.
///
/// # Errors
/// - `Error::InvalidQuantity` if the quantity is not strictly positive
/// - `Error::UnknownLineItem` if the line item does not exist
pub async fn append<C>(db: &C, new_movement: NewMovement) -> Result<movement::Model>
where
    C: ConnectionTrait,
{
    if new_movement.quantity <= Decimal::ZERO {
        return Err(Error::InvalidQuantity {
            quantity: new_movement.quantity,
        });
    }

    let exists = ContractLineItem::find_by_id(new_movement.contract_line_item_id)
        .one(db)
        .await?
        .is_some();
    if !exists {
        return Err(Error::UnknownLineItem {
            line_item_id: new_movement.contract_line_item_id,
        });
    }

    let movement_model = movement::ActiveModel {
        contract_line_item_id: Set(new_movement.contract_line_item_id),
        kind: Set(new_movement.kind.as_str().to_string()),
        quantity: Set(new_movement.quantity.into()),
        value: Set(new_movement.value.into()),
        justification: Set(new_movement.justification),
        reference_document: Set(new_movement.reference_document),
        additive_id: Set(new_movement.additive_id),
        occurred_at: Set(chrono::Utc::now()),
        actor_id: Set(new_movement.actor_id),
        ..Default::default()
    };

    let result = movement_model.insert(db).await?;
    debug!(
        movement_id = result.id,
        line_item_id = result.contract_line_item_id,
        kind = %result.kind,
        quantity = %result.quantity,
        "Movement appended"
    );
    Ok(result)
}

/// Retrieves every movement of a line item in journal order.
pub async fn list_by_line_item<C>(db: &C, line_item_id: i64) -> Result<Vec<movement::Model>>
where
    C: ConnectionTrait,
{
    Movement::find()
        .filter(movement::Column::ContractLineItemId.eq(line_item_id))
        .order_by_asc(movement::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Retrieves every movement correlated by `reference_document`, in journal order.
pub async fn list_by_reference_document<C>(
    db: &C,
    reference_document: &str,
) -> Result<Vec<movement::Model>>
where
    C: ConnectionTrait,
{
    Movement::find()
        .filter(movement::Column::ReferenceDocument.eq(reference_document))
        .order_by_asc(movement::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Removes the movements owned by an additive. Only the additive-deletion path
/// calls this.
pub(crate) async fn delete_for_additive<C>(txn: &C, additive_id: i64) -> Result<u64>
where
    C: ConnectionTrait,
{
    let result = Movement::delete_many()
        .filter(movement::Column::AdditiveId.eq(additive_id))
        .exec(txn)
        .await?;
    Ok(result.rows_affected)
}

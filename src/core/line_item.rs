//! Contract line item store - The mutable quantity ceiling of each contracted product.
//!
//! Line items are created when a contract is signed. Only the Additive Engine moves
//! `current_limit`, and it does so through [`set_current_limit`] while holding the
//! row lock taken by [`lock_line_item`] or [`lock_contract_line_items`].

use crate::{
    entities::{ContractLineItem, contract_line_item},
    errors::{Error, Result},
};
use rust_decimal::Decimal;
use sea_orm::{QueryOrder, QuerySelect, Set, prelude::*};

/// Creates a line item whose baseline and current limit both start at `quantity`.
///
/// # Errors
/// Returns `Error::InvalidQuantity` for a non-positive quantity and for a negative
/// unit price.
pub async fn create_line_item<C>(
    db: &C,
    contract_id: i64,
    product_id: i64,
    unit_price: Decimal,
    quantity: Decimal,
) -> Result<contract_line_item::Model>
where
    C: ConnectionTrait,
{
    if quantity <= Decimal::ZERO {
        return Err(Error::InvalidQuantity { quantity });
    }

    if unit_price.is_sign_negative() {
        return Err(Error::InvalidQuantity {
            quantity: unit_price,
        });
    }

    let line_item = contract_line_item::ActiveModel {
        contract_id: Set(contract_id),
        product_id: Set(product_id),
        unit_price: Set(unit_price.into()),
        current_limit: Set(quantity.into()),
        baseline_limit: Set(quantity.into()),
        created_at: Set(chrono::Utc::now()),
        ..Default::default()
    };

    line_item.insert(db).await.map_err(Into::into)
}

/// Finds a line item by its unique ID.
pub async fn get_line_item<C>(db: &C, line_item_id: i64) -> Result<Option<contract_line_item::Model>>
where
    C: ConnectionTrait,
{
    ContractLineItem::find_by_id(line_item_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Looks up the line of `product_id` within `contract_id`.
///
/// This is the lookup the contract catalog hands to order intake.
pub async fn find_by_contract_and_product<C>(
    db: &C,
    contract_id: i64,
    product_id: i64,
) -> Result<Option<contract_line_item::Model>>
where
    C: ConnectionTrait,
{
    ContractLineItem::find()
        .filter(contract_line_item::Column::ContractId.eq(contract_id))
        .filter(contract_line_item::Column::ProductId.eq(product_id))
        .one(db)
        .await
        .map_err(Into::into)
}

/// Retrieves every line of a contract, ordered by id.
pub async fn list_for_contract<C>(db: &C, contract_id: i64) -> Result<Vec<contract_line_item::Model>>
where
    C: ConnectionTrait,
{
    ContractLineItem::find()
        .filter(contract_line_item::Column::ContractId.eq(contract_id))
        .order_by_asc(contract_line_item::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Retrieves every line item, grouped by contract.
pub async fn list_all<C>(db: &C) -> Result<Vec<contract_line_item::Model>>
where
    C: ConnectionTrait,
{
    ContractLineItem::find()
        .order_by_asc(contract_line_item::Column::ContractId)
        .order_by_asc(contract_line_item::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Reads a line item with a row lock held until the surrounding transaction ends.
///
/// Renders `SELECT … FOR UPDATE` on backends with row locks; `SQLite` already
/// serialises writers at the database level.
pub(crate) async fn lock_line_item<C>(
    txn: &C,
    line_item_id: i64,
) -> Result<Option<contract_line_item::Model>>
where
    C: ConnectionTrait,
{
    ContractLineItem::find_by_id(line_item_id)
        .lock_exclusive()
        .one(txn)
        .await
        .map_err(Into::into)
}

/// Locks every line of a contract in id order, so concurrent writers acquire the
/// rows in the same sequence.
pub(crate) async fn lock_contract_line_items<C>(
    txn: &C,
    contract_id: i64,
) -> Result<Vec<contract_line_item::Model>>
where
    C: ConnectionTrait,
{
    ContractLineItem::find()
        .filter(contract_line_item::Column::ContractId.eq(contract_id))
        .order_by_asc(contract_line_item::Column::Id)
        .lock_exclusive()
        .all(txn)
        .await
        .map_err(Into::into)
}

/// Writes a new current limit on a line item the caller has locked.
pub(crate) async fn set_current_limit<C>(
    txn: &C,
    line_item: contract_line_item::Model,
    current_limit: Decimal,
) -> Result<contract_line_item::Model>
where
    C: ConnectionTrait,
{
    let mut active_model: contract_line_item::ActiveModel = line_item.into();
    active_model.current_limit = Set(current_limit.into());
    active_model.update(txn).await.map_err(Into::into)
}

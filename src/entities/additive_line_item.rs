//! Additive line item entity - The delta one additive applied to one line item.
//!
//! `quantity_delta` is computed once at apply time from the line's baseline and
//! stored; reverting an additive subtracts exactly this value.

use super::Numeric;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Additive line item database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "additive_line_items")]
pub struct Model {
    /// Unique identifier for the row
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Parent additive
    pub additive_id: i64,
    /// Line item that was amended
    pub contract_line_item_id: i64,
    /// Line baseline at the time of the apply
    #[sea_orm(column_type = "Text")]
    pub original_quantity: Numeric,
    /// Percentage applied to this line
    #[sea_orm(column_type = "Text")]
    pub percentage_increase: Numeric,
    /// Quantity added to the line's current limit
    #[sea_orm(column_type = "Text")]
    pub quantity_delta: Numeric,
    /// Line current limit right after the apply
    #[sea_orm(column_type = "Text")]
    pub quantity_after: Numeric,
    /// Unit price at the time of the apply
    #[sea_orm(column_type = "Text")]
    pub unit_price: Numeric,
    /// `quantity_delta * unit_price`
    #[sea_orm(column_type = "Text")]
    pub value_delta: Numeric,
}

/// Defines relationships between `AdditiveLineItem` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each row belongs to one additive
    #[sea_orm(
        belongs_to = "super::additive::Entity",
        from = "Column::AdditiveId",
        to = "super::additive::Column::Id"
    )]
    Additive,
    /// Each row amends one contract line item
    #[sea_orm(
        belongs_to = "super::contract_line_item::Entity",
        from = "Column::ContractLineItemId",
        to = "super::contract_line_item::Column::Id"
    )]
    ContractLineItem,
}

impl Related<super::additive::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Additive.def()
    }
}

impl Related<super::contract_line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ContractLineItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

//! Contract line item entity - One contracted product within a supply contract.
//!
//! `current_limit` is the quantity ceiling after every applied additive, while
//! `baseline_limit` is the first-ever contracted quantity. Percentage additives
//! always compound off `baseline_limit`, so it is written once and never updated.

use super::Numeric;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Contract line item database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "contract_line_items")]
pub struct Model {
    /// Unique identifier for the line item
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Contract this line belongs to
    pub contract_id: i64,
    /// Catalog product being contracted
    pub product_id: i64,
    /// Contracted price per unit
    #[sea_orm(column_type = "Text")]
    pub unit_price: Numeric,
    /// Quantity ceiling including applied additives
    #[sea_orm(column_type = "Text")]
    pub current_limit: Numeric,
    /// Quantity signed before any additive was applied
    #[sea_orm(column_type = "Text")]
    pub baseline_limit: Numeric,
    /// When the line was created
    pub created_at: DateTimeUtc,
}

/// Defines relationships between `ContractLineItem` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One line item has many journal movements
    #[sea_orm(has_many = "super::movement::Entity")]
    Movements,
    /// One line item is touched by many additive rows
    #[sea_orm(has_many = "super::additive_line_item::Entity")]
    AdditiveLineItems,
}

impl Related<super::movement::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Movements.def()
    }
}

impl Related<super::additive_line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AdditiveLineItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

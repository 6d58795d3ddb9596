//! Movement entity - Append-only journal of balance-affecting events.
//!
//! Each movement has a `contract_line_item_id`, a `kind` (stored as text), a strictly
//! positive `quantity` whose effect is decided by the kind, a monetary `value`, and
//! the `reference_document` that correlates a reservation with its later consumption
//! or release. `additive_id` is set only on movements owned by an additive.

use super::Numeric;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Movement database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "movements")]
pub struct Model {
    /// Unique identifier for the movement
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Line item whose balance this movement affects
    pub contract_line_item_id: i64,
    /// Kind of movement: see [`MovementKind`]
    pub kind: String,
    /// Always positive; the kind decides the sign
    #[sea_orm(column_type = "Text")]
    pub quantity: Numeric,
    /// Monetary value of the movement
    #[sea_orm(column_type = "Text")]
    pub value: Numeric,
    /// Free-text reason recorded by the actor
    pub justification: Option<String>,
    /// Correlation key supplied by the order subsystem
    pub reference_document: Option<String>,
    /// Owning additive, if the movement was recorded as part of an amendment
    pub additive_id: Option<i64>,
    /// When the event happened
    pub occurred_at: DateTimeUtc,
    /// User who caused the movement
    pub actor_id: i64,
}

impl Model {
    /// Parsed movement kind.
    ///
    /// Rows are only ever written through [`MovementKind::as_str`], so an
    /// unparseable kind means the table was edited by hand.
    pub fn movement_kind(&self) -> Result<MovementKind, DbErr> {
        self.kind.parse()
    }
}

/// Defines relationships between Movement and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each movement belongs to one contract line item
    #[sea_orm(
        belongs_to = "super::contract_line_item::Entity",
        from = "Column::ContractLineItemId",
        to = "super::contract_line_item::Column::Id"
    )]
    ContractLineItem,
}

impl Related<super::contract_line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ContractLineItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// What a movement does to the balance of its line item.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementKind {
    /// Quantity received against the contract
    Consumption,
    /// Compensates an earlier consumption
    Reversal,
    /// Manual correction added to consumption
    Adjustment,
    /// Provisional hold placed at order time
    Reservation,
    /// Returns reserved quantity to the available pool
    ReservationRelease,
}

impl MovementKind {
    /// Canonical text stored in the `kind` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consumption => "CONSUMPTION",
            Self::Reversal => "REVERSAL",
            Self::Adjustment => "ADJUSTMENT",
            Self::Reservation => "RESERVATION",
            Self::ReservationRelease => "RESERVATION_RELEASE",
        }
    }
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementKind {
    type Err = DbErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONSUMPTION" => Ok(Self::Consumption),
            "REVERSAL" => Ok(Self::Reversal),
            "ADJUSTMENT" => Ok(Self::Adjustment),
            "RESERVATION" => Ok(Self::Reservation),
            "RESERVATION_RELEASE" => Ok(Self::ReservationRelease),
            other => Err(DbErr::Type(format!("unknown movement kind `{other}`"))),
        }
    }
}

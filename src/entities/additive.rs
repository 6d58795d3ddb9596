//! Additive entity - A formal amendment to a supply contract.
//!
//! Additives are created pending (`approved_by` is `None`). Percentage kinds count
//! toward the legal accumulation cap while `active`; quantity-affecting kinds only
//! move balances once approved and applied to line items.

use super::Numeric;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Additive database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "additives")]
pub struct Model {
    /// Unique identifier for the additive
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Contract being amended
    pub contract_id: i64,
    /// Kind of amendment: see [`AdditiveKind`]
    pub kind: String,
    /// Percentage increase for QUANTITY, VALUE and MIXED additives
    #[sea_orm(column_type = "Text", nullable)]
    pub percentage_increase: Option<Numeric>,
    /// Inactive additives neither count toward the cap nor move balances
    pub active: bool,
    /// Approving user; `None` while pending
    pub approved_by: Option<i64>,
    /// Whether the last apply targeted specific line items
    pub item_scoped: bool,
    /// Free-text description of the amendment
    pub description: Option<String>,
    /// When the amendment was signed
    pub signed_at: Option<DateTimeUtc>,
    /// When the additive was recorded
    pub created_at: DateTimeUtc,
}

impl Model {
    /// Parsed additive kind.
    pub fn additive_kind(&self) -> Result<AdditiveKind, DbErr> {
        self.kind.parse()
    }

    /// Whether an approver has been recorded.
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        self.approved_by.is_some()
    }
}

/// Defines relationships between Additive and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One additive touches many line items
    #[sea_orm(has_many = "super::additive_line_item::Entity")]
    AdditiveLineItems,
}

impl Related<super::additive_line_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AdditiveLineItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Kind of contract amendment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdditiveKind {
    /// Extends the contract term only
    Term,
    /// Increases contracted quantities
    Quantity,
    /// Increases contracted value
    Value,
    /// Term and quantity together
    Mixed,
}

impl AdditiveKind {
    /// Canonical text stored in the `kind` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Quantity => "QUANTITY",
            Self::Value => "VALUE",
            Self::Mixed => "MIXED",
        }
    }

    /// Kinds whose percentage counts toward the legal cap.
    #[must_use]
    pub const fn is_percentage(self) -> bool {
        matches!(self, Self::Quantity | Self::Value | Self::Mixed)
    }

    /// Kinds that change line item quantities when applied.
    #[must_use]
    pub const fn affects_quantity(self) -> bool {
        matches!(self, Self::Quantity | Self::Mixed)
    }
}

impl fmt::Display for AdditiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdditiveKind {
    type Err = DbErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TERM" => Ok(Self::Term),
            "QUANTITY" => Ok(Self::Quantity),
            "VALUE" => Ok(Self::Value),
            "MIXED" => Ok(Self::Mixed),
            other => Err(DbErr::Type(format!("unknown additive kind `{other}`"))),
        }
    }
}

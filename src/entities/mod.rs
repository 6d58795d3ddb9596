//! Entity module - Contains all SeaORM entity definitions for the ledger tables.
//! These entities represent the four persisted relations and their relationships.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod additive;
pub mod additive_line_item;
pub mod contract_line_item;
pub mod movement;
pub mod numeric;

// Re-export specific types to avoid conflicts
pub use additive::{
    AdditiveKind, Column as AdditiveColumn, Entity as Additive, Model as AdditiveModel,
};
pub use additive_line_item::{
    Column as AdditiveLineItemColumn, Entity as AdditiveLineItem, Model as AdditiveLineItemModel,
};
pub use contract_line_item::{
    Column as ContractLineItemColumn, Entity as ContractLineItem, Model as ContractLineItemModel,
};
pub use movement::{Column as MovementColumn, Entity as Movement, Model as MovementModel, MovementKind};
pub use numeric::Numeric;

//! Core business logic - framework-agnostic ledger operations.
//!
//! The Additive Engine and the Reservation Service both write the movement journal
//! and the contract line item store; the balance projector only reads them.

use rust_decimal::Decimal;

pub mod additive;
pub mod balance;
pub mod journal;
pub mod line_item;
pub mod report;
pub mod reservation;
pub mod retry;

pub use additive::{Additives, LimitCheck, NewAdditive, SpecificItem};
pub use balance::{BalanceSnapshot, BalanceStatus, Balances};
pub use journal::NewMovement;
pub use reservation::{
    ActiveReservation, ConversionResult, LotState, ReceivedItem, ReservationItem, ReservationLot,
    Reservations,
};
pub use retry::RetryPolicy;

/// Decimal places kept on computed quantities
pub const QUANTITY_SCALE: u32 = 4;

/// Decimal places kept on computed money amounts
pub const MONEY_SCALE: u32 = 2;

pub(crate) fn round_quantity(quantity: Decimal) -> Decimal {
    quantity.round_dp(QUANTITY_SCALE)
}

pub(crate) fn round_money(value: Decimal) -> Decimal {
    value.round_dp(MONEY_SCALE)
}

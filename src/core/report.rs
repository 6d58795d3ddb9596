//! Balance report generation.
//!
//! This module assembles per-line balance figures and renders them as text for
//! operators. Functions return structured data; only the `format_*` helpers know
//! about presentation.

use crate::{
    core::balance::{BalanceSnapshot, project_line},
    core::{journal, line_item},
    entities::{contract_line_item, movement},
    errors::{Error, Result},
};
use rust_decimal::{Decimal, prelude::ToPrimitive};
use sea_orm::ConnectionTrait;

/// Balance report of one contract line item.
#[derive(Debug, Clone)]
pub struct LineItemReport {
    /// The line item being reported on
    pub line_item: contract_line_item::Model,
    /// Current balance
    pub balance: BalanceSnapshot,
    /// Share of the total quantity already consumed (0-100)
    pub usage_percent: Decimal,
    /// Most recent movements, newest first
    pub recent_movements: Vec<movement::Model>,
}

/// Generates the report of one line item.
///
/// # Arguments
/// * `db` - Database connection
/// * `line_item_id` - Line item to report on
/// * `low_balance_threshold` - Ratio that flags a line as LOW
/// * `movement_limit` - Maximum number of recent movements to include (default 10)
pub async fn line_item_report<C>(
    db: &C,
    line_item_id: i64,
    low_balance_threshold: Decimal,
    movement_limit: Option<usize>,
) -> Result<LineItemReport>
where
    C: ConnectionTrait,
{
    let line = line_item::get_line_item(db, line_item_id)
        .await?
        .ok_or_else(|| Error::not_found("contract line item", line_item_id))?;
    build_report(db, line, low_balance_threshold, movement_limit).await
}

/// Generates the report of every line of a contract, in line id order.
pub async fn contract_report<C>(
    db: &C,
    contract_id: i64,
    low_balance_threshold: Decimal,
) -> Result<Vec<LineItemReport>>
where
    C: ConnectionTrait,
{
    let lines = line_item::list_for_contract(db, contract_id).await?;
    let mut reports = Vec::with_capacity(lines.len());
    for line in lines {
        reports.push(build_report(db, line, low_balance_threshold, Some(0)).await?);
    }
    Ok(reports)
}

async fn build_report<C>(
    db: &C,
    line: contract_line_item::Model,
    low_balance_threshold: Decimal,
    movement_limit: Option<usize>,
) -> Result<LineItemReport>
where
    C: ConnectionTrait,
{
    let balance = project_line(db, &line, low_balance_threshold).await?;
    let usage_percent = calculate_usage(balance.consumed_qty, balance.total_qty);

    let limit = movement_limit.unwrap_or(10);
    let recent_movements = if limit == 0 {
        Vec::new()
    } else {
        journal::list_by_line_item(db, line.id)
            .await?
            .into_iter()
            .rev()
            .take(limit)
            .collect()
    };

    Ok(LineItemReport {
        line_item: line,
        balance,
        usage_percent,
        recent_movements,
    })
}

/// Percentage of `total` already consumed, rounded to one decimal place.
#[must_use]
pub fn calculate_usage(consumed: Decimal, total: Decimal) -> Decimal {
    if total <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (consumed / total * Decimal::ONE_HUNDRED).round_dp(1)
}

/// Renders a usage bar like `[████████░░] 80.0%`.
///
/// Values outside 0-100 are clamped in the bar but printed as they are.
#[must_use]
pub fn format_usage_bar(usage_percent: Decimal, bar_length: Option<usize>) -> String {
    let length = bar_length.unwrap_or(10);
    let clamped = usage_percent.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);

    let filled = (clamped * Decimal::from(length) / Decimal::ONE_HUNDRED)
        .round()
        .to_usize()
        .unwrap_or_default()
        .min(length);
    let empty = length - filled;

    format!(
        "[{}{}] {:.1}%",
        "█".repeat(filled),
        "░".repeat(empty),
        usage_percent
    )
}

/// One report line for the operator console.
#[must_use]
pub fn format_report_line(report: &LineItemReport) -> String {
    let b = &report.balance;
    format!(
        "line {} (product {}) {} | available {} of {} | reserved {} | {}",
        report.line_item.id,
        report.line_item.product_id,
        format_usage_bar(report.usage_percent, None),
        b.available_qty.normalize(),
        b.total_qty.normalize(),
        b.reserved_qty.normalize(),
        b.status.as_str()
    )
}

/// Summary of a movement like `CONSUMPTION 40 (ORD-1)`.
#[must_use]
pub fn format_movement_summary(movement: &movement::Model) -> String {
    let reference = movement.reference_document.as_deref().unwrap_or("-");
    format!(
        "{} {} ({reference})",
        movement.kind,
        movement.quantity.normalize()
    )
}

//! Shared test utilities for the contract ledger.
//!
//! This module provides common helper functions for setting up test databases
//! and creating test records with sensible defaults.

use crate::{
    config::LedgerConfig,
    core::{
        additive::{Additives, NewAdditive},
        line_item,
        reservation::Reservations,
        retry::RetryPolicy,
    },
    entities::{AdditiveKind, additive, contract_line_item},
    errors::Result,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use std::path::Path;
use std::sync::Arc;

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Creates a file-backed `SQLite` database inside `dir` with all tables initialized.
/// Unlike the in-memory database, the pool can hand out several connections, so
/// concurrent writers really contend for the file lock.
pub async fn setup_file_db(dir: &Path) -> Result<DatabaseConnection> {
    let url = format!("sqlite://{}?mode=rwc", dir.join("ledger.db").display());
    let db = sea_orm::Database::connect(url).await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Default ledger policy: 25% cap, LOW at 90%.
pub fn test_config() -> Arc<LedgerConfig> {
    Arc::new(LedgerConfig::default())
}

/// Creates a test line item with sensible defaults.
///
/// # Defaults
/// * `product_id`: 1
/// * `unit_price`: 10
/// * quantity: 100
pub async fn create_test_line_item(
    db: &DatabaseConnection,
    contract_id: i64,
) -> Result<contract_line_item::Model> {
    line_item::create_line_item(db, contract_id, 1, Decimal::TEN, Decimal::ONE_HUNDRED).await
}

/// Sets up a complete test environment with one line item on contract 1.
/// Returns (db, line item) for common test scenarios.
pub async fn setup_with_line_item() -> Result<(DatabaseConnection, contract_line_item::Model)> {
    let db = setup_test_db().await?;
    let line = create_test_line_item(&db, 1).await?;
    Ok((db, line))
}

/// Additive engine that retries without sleeping.
pub fn test_additives(db: &DatabaseConnection) -> Additives {
    Additives::new(db.clone(), test_config()).with_retry_policy(RetryPolicy::immediate(3))
}

/// Reservation service that retries without sleeping.
pub fn test_reservations(db: &DatabaseConnection) -> Reservations {
    Reservations::new(db.clone(), test_config()).with_retry_policy(RetryPolicy::immediate(3))
}

/// Records a pending QUANTITY additive through the engine, so the cap applies.
pub async fn create_pending_additive(
    db: &DatabaseConnection,
    contract_id: i64,
    percentage: Decimal,
) -> Result<additive::Model> {
    test_additives(db)
        .create(NewAdditive {
            contract_id,
            kind: AdditiveKind::Quantity,
            percentage_increase: Some(percentage),
            description: None,
            signed_at: None,
        })
        .await
}

/// Records a QUANTITY additive and marks it approved without applying it.
pub async fn create_approved_additive(
    db: &DatabaseConnection,
    contract_id: i64,
    percentage: Decimal,
) -> Result<additive::Model> {
    let pending = create_pending_additive(db, contract_id, percentage).await?;
    let mut active_model: additive::ActiveModel = pending.into();
    active_model.approved_by = Set(Some(1));
    Ok(active_model.update(db).await?)
}

/// Inserts an additive directly, bypassing every validation.
/// Use this when a test needs a state the engine would refuse to create.
pub async fn create_custom_additive(
    db: &DatabaseConnection,
    contract_id: i64,
    kind: AdditiveKind,
    percentage: Option<Decimal>,
) -> Result<additive::Model> {
    let created = additive::ActiveModel {
        contract_id: Set(contract_id),
        kind: Set(kind.as_str().to_string()),
        percentage_increase: Set(percentage.map(Into::into)),
        active: Set(true),
        approved_by: Set(Some(1)),
        item_scoped: Set(false),
        description: Set(None),
        signed_at: Set(None),
        created_at: Set(chrono::Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(created)
}

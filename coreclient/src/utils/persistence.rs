// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;

use sqlx::{
    SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!();

/// Opens the client database at `path` and runs the migrations.
///
/// Without a path, the database is ephemeral and lives as long as the returned pool.
pub async fn open_db(path: Option<&Path>) -> sqlx::Result<SqlitePool> {
    let Some(path) = path else {
        return open_db_in_memory().await;
    };
    info!(path = %path.display(), "Opening client database");
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// Opens an ephemeral database and runs the migrations.
pub async fn open_db_in_memory() -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::new().in_memory(true);
    // every connection to an in-memory database opens a new database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

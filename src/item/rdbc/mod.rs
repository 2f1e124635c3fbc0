use std::future::Future;

use sqlx::{Database, query_builder::Separated};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::BatchError;

/// Keyset paged source reading a SQLite query.
pub mod sqlite_reader;

/// Sink inserting chunks into a SQLite table, one transaction per chunk.
pub mod sqlite_writer;

/// Binds the fields of an item to the parameters of one `VALUES` row.
///
/// # Examples
///
/// ```
/// use batch_etl_rs::item::rdbc::DatabaseItemBinder;
/// use sqlx::{query_builder::Separated, Sqlite};
///
/// struct Account {
///     id: i64,
///     owner: String,
/// }
///
/// struct AccountBinder;
///
/// impl DatabaseItemBinder<Account, Sqlite> for AccountBinder {
///     fn bind(&self, item: &Account, mut query_builder: Separated<Sqlite, &str>) {
///         query_builder.push_bind(item.id);
///         query_builder.push_bind(item.owner.clone());
///     }
/// }
/// ```
pub trait DatabaseItemBinder<O, DB: Database> {
    /// Pushes one bind per configured column, in column order.
    fn bind(&self, item: &O, query_builder: Separated<DB, &str>);
}

/// Runs `future` to completion from synchronous step code.
///
/// Requires a multi-threaded tokio runtime: the current worker is handed over
/// to other tasks while this one blocks.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output, BatchError> {
    let handle = Handle::try_current().map_err(|error| {
        BatchError::Configuration(format!("database access needs a tokio runtime: {}", error))
    })?;

    if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
        return Err(BatchError::Configuration(
            "database access needs a multi-threaded tokio runtime".to_string(),
        ));
    }

    Ok(tokio::task::block_in_place(|| handle.block_on(future)))
}

pub use sqlite_reader::{SqlitePagedSource, SqlitePagedSourceBuilder};
pub use sqlite_writer::{SqliteBatchSink, SqliteBatchSinkBuilder};

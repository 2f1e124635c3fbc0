use log::{debug, error};
use sqlx::{Pool, QueryBuilder, Sqlite};

use crate::{
    BatchError,
    core::{
        chunk::Chunk,
        item::{BatchSink, SinkResult},
    },
};

use super::{DatabaseItemBinder, block_on};

/// Default SQLITE_MAX_VARIABLE_NUMBER since SQLite 3.32.
const BIND_LIMIT: usize = 32766;

/// Inserts each chunk into a SQLite table inside a single transaction.
///
/// Chunks needing more bind parameters than SQLite accepts in one statement are
/// split into several `INSERT` statements of the same transaction, so the chunk
/// is still committed or rolled back as a whole.
///
/// With [`SqliteBatchSinkBuilder::replace_existing`] rows are written with
/// `INSERT OR REPLACE`, which makes re-delivering a chunk after a crash between
/// commit and checkpoint harmless when the table has a natural key.
pub struct SqliteBatchSink<'a, O> {
    pool: &'a Pool<Sqlite>,
    table: &'a str,
    columns: Vec<&'a str>,
    item_binder: &'a dyn DatabaseItemBinder<O, Sqlite>,
    replace_existing: bool,
}

impl<O> SqliteBatchSink<'_, O> {
    fn rows_per_statement(&self) -> usize {
        (BIND_LIMIT / self.columns.len()).max(1)
    }

    async fn insert(&self, items: &[O]) -> Result<(), sqlx::Error> {
        let statement = if self.replace_existing {
            "INSERT OR REPLACE INTO "
        } else {
            "INSERT INTO "
        };

        let mut transaction = self.pool.begin().await?;

        for rows in items.chunks(self.rows_per_statement()) {
            let mut query_builder = QueryBuilder::<Sqlite>::new(statement);
            query_builder.push(self.table);
            query_builder.push(" (");
            query_builder.push(self.columns.join(","));
            query_builder.push(") ");
            query_builder.push_values(rows, |row, item| self.item_binder.bind(item, row));

            query_builder.build().execute(&mut *transaction).await?;
        }

        transaction.commit().await
    }
}

impl<O> BatchSink<O> for SqliteBatchSink<'_, O> {
    fn commit(&self, chunk: &Chunk<O>) -> SinkResult {
        if chunk.is_empty() {
            return Ok(());
        }

        match block_on(self.insert(chunk.get_items()))? {
            Ok(()) => {
                debug!("Inserted {} rows into {}", chunk.len(), self.table);
                Ok(())
            }
            Err(e) => {
                error!("Chunk insert into {} rolled back: {}", self.table, e);
                Err(BatchError::Sink(format!("SQLite insert failed: {}", e)))
            }
        }
    }
}

/// Builder of [`SqliteBatchSink`].
///
/// The pool, the table, at least one column and the item binder are required.
///
/// # Examples
///
/// ```no_run
/// use batch_etl_rs::item::rdbc::{DatabaseItemBinder, SqliteBatchSinkBuilder};
/// use batch_etl_rs::BatchError;
/// use sqlx::{query_builder::Separated, Sqlite, SqlitePool};
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
///
/// fn accounts_sink(pool: &SqlitePool) -> Result<(), BatchError> {
///     let binder = AccountBinder;
///     let _sink = SqliteBatchSinkBuilder::new()
///         .pool(pool)
///         .table("accounts")
///         .add_column("id")
///         .add_column("owner")
///         .item_binder(&binder)
///         .replace_existing(true)
///         .build()?;
///     Ok(())
/// }
/// ```
pub struct SqliteBatchSinkBuilder<'a, O> {
    pool: Option<&'a Pool<Sqlite>>,
    table: Option<&'a str>,
    columns: Vec<&'a str>,
    item_binder: Option<&'a dyn DatabaseItemBinder<O, Sqlite>>,
    replace_existing: bool,
}

impl<O> Default for SqliteBatchSinkBuilder<'_, O> {
    fn default() -> Self {
        Self {
            pool: None,
            table: None,
            columns: Vec::new(),
            item_binder: None,
            replace_existing: false,
        }
    }
}

impl<'a, O> SqliteBatchSinkBuilder<'a, O> {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection pool; each chunk takes one connection for its
    /// transaction.
    pub fn pool(mut self, pool: &'a Pool<Sqlite>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the table receiving the rows.
    ///
    /// The name is written into the statement as is, it must not come from
    /// untrusted input.
    pub fn table(mut self, table: &'a str) -> Self {
        self.table = Some(table);
        self
    }

    /// Adds a column; the binder must push one value per column, in this order.
    pub fn add_column(mut self, column: &'a str) -> Self {
        self.columns.push(column);
        self
    }

    /// Sets the binder turning an item into one row of values.
    pub fn item_binder(mut self, item_binder: &'a dyn DatabaseItemBinder<O, Sqlite>) -> Self {
        self.item_binder = Some(item_binder);
        self
    }

    /// Writes with `INSERT OR REPLACE` instead of `INSERT`.
    ///
    /// Rows conflicting on a unique constraint are replaced instead of failing
    /// the chunk.
    pub fn replace_existing(mut self, yes: bool) -> Self {
        self.replace_existing = yes;
        self
    }

    /// Builds the sink.
    ///
    /// # Errors
    /// `BatchError::Configuration` when the pool, the table, the columns or the
    /// item binder is missing.
    pub fn build(self) -> Result<SqliteBatchSink<'a, O>, BatchError> {
        let pool = self
            .pool
            .ok_or_else(|| BatchError::Configuration("a SQLite pool is required".to_string()))?;
        let table = self
            .table
            .ok_or_else(|| BatchError::Configuration("a table name is required".to_string()))?;
        if self.columns.is_empty() {
            return Err(BatchError::Configuration(
                "one or more columns are required".to_string(),
            ));
        }
        let item_binder = self
            .item_binder
            .ok_or_else(|| BatchError::Configuration("an item binder is required".to_string()))?;

        Ok(SqliteBatchSink {
            pool,
            table,
            columns: self.columns,
            item_binder,
            replace_existing: self.replace_existing,
        })
    }
}

use log::debug;
use sqlx::{Encode, FromRow, Pool, QueryBuilder, Sqlite, Type, sqlite::SqliteRow};

use crate::{
    BatchError,
    core::item::{Keyed, PageResult, PagedSource},
};

use super::block_on;

/// Reads the rows of a query one page at a time, ordered by a unique sort key.
///
/// Each page is fetched with
/// `SELECT * FROM (<query>) AS page_source WHERE <key> > ? ORDER BY <key> ASC LIMIT ?`,
/// so the position of the source is fully described by the last key read and a
/// restarted step resumes with the exact same rows. The sort key column must hold
/// the value returned by [`Keyed::key`] and be unique.
///
/// Rows are mapped with [`FromRow`]; the calling step must run inside a
/// multi-threaded tokio runtime.
pub struct SqlitePagedSource<'a, I> {
    pool: &'a Pool<Sqlite>,
    query: &'a str,
    sort_key: &'a str,
    _item: std::marker::PhantomData<I>,
}

impl<I> SqlitePagedSource<'_, I>
where
    I: Keyed,
    I::Key: for<'q> Encode<'q, Sqlite> + Type<Sqlite> + Send + 'static,
{
    fn page_query(&self, after_key: Option<&I::Key>, page_size: usize) -> QueryBuilder<'static, Sqlite> {
        let mut query_builder = QueryBuilder::new("SELECT * FROM (");
        query_builder.push(self.query);
        query_builder.push(") AS page_source");

        if let Some(after_key) = after_key {
            query_builder.push(" WHERE ");
            query_builder.push(self.sort_key);
            query_builder.push(" > ");
            query_builder.push_bind(after_key.clone());
        }

        query_builder.push(" ORDER BY ");
        query_builder.push(self.sort_key);
        query_builder.push(" ASC LIMIT ");
        query_builder.push_bind(page_size as i64);
        query_builder
    }
}

impl<I> PagedSource<I> for SqlitePagedSource<'_, I>
where
    I: Keyed + for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    I::Key: for<'q> Encode<'q, Sqlite> + Type<Sqlite> + Send + 'static,
{
    fn next_page(&self, after_key: Option<&I::Key>, page_size: usize) -> PageResult<I> {
        let mut query_builder = self.page_query(after_key, page_size);
        let query = query_builder.build_query_as::<I>();

        let rows = block_on(query.fetch_all(self.pool))?
            .map_err(|error| BatchError::Source(format!("SQLite page query failed: {}", error)))?;

        debug!("Fetched {} rows after {:?}", rows.len(), after_key);
        Ok(rows)
    }
}

/// Builder of [`SqlitePagedSource`].
pub struct SqlitePagedSourceBuilder<'a, I> {
    pool: Option<&'a Pool<Sqlite>>,
    query: Option<&'a str>,
    sort_key: Option<&'a str>,
    _item: std::marker::PhantomData<I>,
}

impl<I> Default for SqlitePagedSourceBuilder<'_, I> {
    fn default() -> Self {
        Self {
            pool: None,
            query: None,
            sort_key: None,
            _item: std::marker::PhantomData,
        }
    }
}

impl<'a, I> SqlitePagedSourceBuilder<'a, I> {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connection pool the pages are read from.
    pub fn pool(mut self, pool: &'a Pool<Sqlite>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Query selecting the source rows, without `ORDER BY` or `LIMIT`.
    pub fn query(mut self, query: &'a str) -> Self {
        self.query = Some(query);
        self
    }

    /// Unique column the rows are paged on.
    ///
    /// Its value must be the [`Keyed::key`](crate::core::item::Keyed::key) of
    /// the mapped item, otherwise pages overlap or skip rows.
    pub fn sort_key(mut self, column: &'a str) -> Self {
        self.sort_key = Some(column);
        self
    }

    /// Builds the source.
    ///
    /// # Errors
    /// `BatchError::Configuration` when the pool, the query or the sort key is
    /// missing.
    pub fn build(self) -> Result<SqlitePagedSource<'a, I>, BatchError> {
        let pool = self
            .pool
            .ok_or_else(|| BatchError::Configuration("a SQLite pool is required".to_string()))?;
        let query = self
            .query
            .ok_or_else(|| BatchError::Configuration("a source query is required".to_string()))?;
        let sort_key = self.sort_key.ok_or_else(|| {
            BatchError::Configuration(
                "a unique sort key is required: paging without one can skip or repeat rows"
                    .to_string(),
            )
        })?;

        Ok(SqlitePagedSource {
            pool,
            query,
            sort_key,
            _item: std::marker::PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

    use super::*;

    #[derive(Debug, Clone, PartialEq, FromRow)]
    struct Order {
        id: i64,
        customer: String,
        amount: f64,
    }

    impl Keyed for Order {
        type Key = i64;

        fn key(&self) -> i64 {
            self.id
        }
    }

    async fn setup_orders(count: i64) -> Result<SqlitePool, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, customer TEXT NOT NULL, amount REAL NOT NULL)")
            .execute(&pool)
            .await?;

        // inserted out of order on purpose
        for id in (1..=count).rev() {
            sqlx::query("INSERT INTO orders (id, customer, amount) VALUES (?, ?, ?)")
                .bind(id)
                .bind(format!("customer{}", id))
                .bind(id as f64 * 1.5)
                .execute(&pool)
                .await?;
        }

        Ok(pool)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn should_page_by_key() -> Result<(), Box<dyn std::error::Error>> {
        let pool = setup_orders(7).await?;
        let source = SqlitePagedSourceBuilder::<Order>::new()
            .pool(&pool)
            .query("SELECT id, customer, amount FROM orders")
            .sort_key("id")
            .build()?;

        let first = source.next_page(None, 3)?;
        assert_eq!(first.iter().map(|o| o.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(first[0].customer, "customer1");

        let second = source.next_page(Some(&3), 3)?;
        assert_eq!(second.iter().map(|o| o.id).collect::<Vec<_>>(), vec![4, 5, 6]);

        let last = source.next_page(Some(&6), 3)?;
        assert_eq!(last.len(), 1);

        assert!(source.next_page(Some(&7), 3)?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filtering_query_is_wrapped() -> Result<(), Box<dyn std::error::Error>> {
        let pool = setup_orders(6).await?;
        let source = SqlitePagedSourceBuilder::<Order>::new()
            .pool(&pool)
            .query("SELECT id, customer, amount FROM orders WHERE amount > 4")
            .sort_key("id")
            .build()?;

        let page = source.next_page(None, 10)?;
        assert_eq!(page.iter().map(|o| o.id).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_query_is_a_source_error() -> Result<(), Box<dyn std::error::Error>> {
        let pool = setup_orders(1).await?;
        let source = SqlitePagedSourceBuilder::<Order>::new()
            .pool(&pool)
            .query("SELECT * FROM missing_table")
            .sort_key("id")
            .build()?;

        assert!(matches!(source.next_page(None, 5), Err(BatchError::Source(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sort_key_is_mandatory() -> Result<(), Box<dyn std::error::Error>> {
        let pool = setup_orders(1).await?;
        let result = SqlitePagedSourceBuilder::<Order>::new()
            .pool(&pool)
            .query("SELECT * FROM orders")
            .build();

        assert!(matches!(result, Err(BatchError::Configuration(_))));
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn current_thread_runtime_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let pool = setup_orders(1).await?;
        let source = SqlitePagedSourceBuilder::<Order>::new()
            .pool(&pool)
            .query("SELECT * FROM orders")
            .sort_key("id")
            .build()?;

        assert!(matches!(
            source.next_page(None, 5),
            Err(BatchError::Configuration(_))
        ));
        Ok(())
    }
}

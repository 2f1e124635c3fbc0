//! Runs one of the tutorial jobs.
//!
//! ```text
//! cargo run --example tutorial_jobs --features full -- helloWorldJob
//! cargo run --example tutorial_jobs --features full -- validateParamJob fileName=test.csv
//! cargo run --example tutorial_jobs --features full -- --repository runs.json trMigrationJob
//! ```
//!
//! The process exits with 0 when the run completed, 1 when it failed and 2 when
//! it was stopped.

use std::path::PathBuf;

use anyhow::{Context, bail};
use batch_etl_rs::{
    BatchError,
    core::{
        execution::{JobExecution, StepExecution},
        item::{Keyed, RecordTransformer, TransformResult},
        job::{Job, JobBuilder},
        listener::LoggingRunListener,
        parameters::{JobParameters, RunIdIncrementer},
        step::{StepBuilder, StepContext},
        tasklet::{RepeatStatus, Tasklet},
        validator::{CompositeParameterValidator, DefaultParametersValidator, SuffixParameterValidator},
    },
    item::rdbc::{DatabaseItemBinder, SqliteBatchSinkBuilder, SqlitePagedSourceBuilder},
    repository::{InMemoryJobRepository, JobRepository, JsonFileJobRepository},
};
use chrono::Utc;
use clap::Parser;
use log::info;
use sqlx::{FromRow, Sqlite, SqlitePool, query_builder::Separated, sqlite::SqlitePoolOptions};

#[derive(Parser, Debug)]
#[command(name = "tutorial_jobs", about = "Runs one of the tutorial batch jobs")]
struct Cli {
    /// helloWorldJob, validateParamJob or trMigrationJob
    job: String,

    /// Job parameters, as `key=value` or `key(type)=value`
    parameters: Vec<String>,

    /// JSON file keeping executions between runs; kept in memory when absent
    #[arg(long)]
    repository: Option<PathBuf>,
}

struct HelloWorld;

impl Tasklet for HelloWorld {
    fn execute(
        &self,
        _step_execution: &StepExecution,
        _context: &StepContext,
    ) -> Result<RepeatStatus, BatchError> {
        info!("Hello, World!");
        Ok(RepeatStatus::Finished)
    }
}

struct PrintFileName;

impl Tasklet for PrintFileName {
    fn execute(
        &self,
        step_execution: &StepExecution,
        context: &StepContext,
    ) -> Result<RepeatStatus, BatchError> {
        info!(
            "{} called with fileName={}",
            step_execution.name,
            context.parameters().get_string("fileName").unwrap_or_default()
        );
        Ok(RepeatStatus::Finished)
    }
}

#[derive(Debug, Clone, FromRow)]
struct Order {
    id: i64,
    order_item: String,
    price: i64,
    order_date: String,
}

impl Keyed for Order {
    type Key = i64;

    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone)]
struct Account {
    id: i64,
    order_item: String,
    price: i64,
    order_date: String,
    account_date: String,
}

/// Turns an order into the account booking it; the account keeps the order id.
struct OrderToAccount;

impl RecordTransformer<Order, Account> for OrderToAccount {
    fn transform(&self, order: &Order) -> TransformResult<Account> {
        Ok(Some(Account {
            id: order.id,
            order_item: order.order_item.clone(),
            price: order.price,
            order_date: order.order_date.clone(),
            account_date: Utc::now().date_naive().to_string(),
        }))
    }
}

struct AccountBinder;

impl DatabaseItemBinder<Account, Sqlite> for AccountBinder {
    fn bind(&self, item: &Account, mut query_builder: Separated<Sqlite, &str>) {
        query_builder.push_bind(item.id);
        query_builder.push_bind(item.order_item.clone());
        query_builder.push_bind(item.price);
        query_builder.push_bind(item.order_date.clone());
        query_builder.push_bind(item.account_date.clone());
    }
}

fn hello_world_job(
    repository: &dyn JobRepository,
    parameters: JobParameters,
) -> Result<JobExecution, BatchError> {
    let tasklet = HelloWorld;
    let step = StepBuilder::new("helloWorldStep").tasklet(&tasklet).build()?;
    let listener = LoggingRunListener;
    let incrementer = RunIdIncrementer::new();

    JobBuilder::new()
        .name("helloWorldJob")
        .repository(repository)
        .incrementer(&incrementer)
        .listener(&listener)
        .start(&step)
        .build()?
        .run(parameters)
}

fn validate_param_job(
    repository: &dyn JobRepository,
    parameters: JobParameters,
) -> Result<JobExecution, BatchError> {
    let tasklet = PrintFileName;
    let step = StepBuilder::new("validateParamStep")
        .tasklet(&tasklet)
        .build()?;

    let required = DefaultParametersValidator::new().required_key("fileName");
    let csv_file = SuffixParameterValidator::new("fileName", "csv");
    let validator = CompositeParameterValidator::new()
        .validator(&required)
        .validator(&csv_file);
    let incrementer = RunIdIncrementer::new();
    let listener = LoggingRunListener;

    JobBuilder::new()
        .name("validateParamJob")
        .repository(repository)
        .validator(&validator)
        .incrementer(&incrementer)
        .listener(&listener)
        .start(&step)
        .build()?
        .run(parameters)
}

async fn setup_orders() -> anyhow::Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;

    sqlx::query(
        "CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            order_item TEXT NOT NULL,
            price INTEGER NOT NULL,
            order_date TEXT NOT NULL
        )",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE TABLE accounts (
            id INTEGER PRIMARY KEY,
            order_item TEXT NOT NULL,
            price INTEGER NOT NULL,
            order_date TEXT NOT NULL,
            account_date TEXT NOT NULL
        )",
    )
    .execute(&pool)
    .await?;

    for id in 1..=12_i64 {
        sqlx::query("INSERT INTO orders (id, order_item, price, order_date) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(format!("item-{}", id))
            .bind(id * 1_000)
            .bind(format!("2024-01-{:02}", id))
            .execute(&pool)
            .await?;
    }

    Ok(pool)
}

async fn tr_migration_job(
    repository: &dyn JobRepository,
    parameters: JobParameters,
) -> anyhow::Result<JobExecution> {
    let pool = setup_orders().await?;

    let source = SqlitePagedSourceBuilder::<Order>::new()
        .pool(&pool)
        .query("SELECT id, order_item, price, order_date FROM orders")
        .sort_key("id")
        .build()?;
    let binder = AccountBinder;
    let sink = SqliteBatchSinkBuilder::new()
        .pool(&pool)
        .table("accounts")
        .add_column("id")
        .add_column("order_item")
        .add_column("price")
        .add_column("order_date")
        .add_column("account_date")
        .item_binder(&binder)
        .replace_existing(true)
        .build()?;

    let step = StepBuilder::new("trMigrationStep")
        .chunk::<Order, Account>(5)
        .page_size(5)
        .source(&source)
        .transformer(&OrderToAccount)
        .sink(&sink)
        .build()?;
    let listener = LoggingRunListener;
    let incrementer = RunIdIncrementer::new();

    let execution = JobBuilder::new()
        .name("trMigrationJob")
        .repository(repository)
        .incrementer(&incrementer)
        .listener(&listener)
        .start(&step)
        .build()?
        .run(parameters)?;

    let accounts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
        .fetch_one(&pool)
        .await?;
    info!("{} accounts booked", accounts);

    Ok(execution)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let parameters = JobParameters::from_args(&cli.parameters)?;

    let in_memory = InMemoryJobRepository::new();
    let json_file;
    let repository: &dyn JobRepository = match &cli.repository {
        Some(path) => {
            json_file = JsonFileJobRepository::new(path);
            &json_file
        }
        None => &in_memory,
    };

    let execution = match cli.job.as_str() {
        "helloWorldJob" => hello_world_job(repository, parameters)?,
        "validateParamJob" => validate_param_job(repository, parameters)?,
        "trMigrationJob" => tr_migration_job(repository, parameters).await?,
        other => bail!("unknown job: {}", other),
    };

    let outcome = execution
        .outcome()
        .context("the run did not reach a terminal status")?;
    info!("{} finished: {}", execution.job_name, outcome);

    std::process::exit(outcome.exit_code());
}

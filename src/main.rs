use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use tallydb::{
    config::{CliArgs, Command, Config, LoggingConfig},
    current_month_year, day_key, Budget, Category, CategoryTotal, DailyTotal, QueryResult, QuerySpec,
    RecurringCharge, Store, StoreError, Transaction, TransactionType,
};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct BudgetProgress {
    #[serde(flatten)]
    budget: Budget,
    spent: f64,
}

#[derive(Serialize)]
struct MonthSummary {
    month_year: String,
    income: f64,
    expense: f64,
    balance: f64,
    category_totals: Vec<CategoryTotal>,
    daily_totals: Vec<DailyTotal>,
    budgets: Vec<BudgetProgress>,
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_result(json: bool, result: &QueryResult) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        println!("{}", result);
    }
    Ok(())
}

fn resolve_month(month: Option<String>) -> String {
    let month = month.unwrap_or_else(current_month_year);
    let spec = QuerySpec::DailyTotalsByMonth { month_year: month.clone() };
    if let Err(e) = spec.validate() {
        tracing::warn!(error = %e, "Reports for this month will be empty");
    }
    month
}

fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn summary(store: &Store, month_year: String) -> Result<MonthSummary, StoreError> {
    let total = |kind| {
        store.fetch::<Option<f64>>(&QuerySpec::MonthlyTotal {
            kind,
            month_year: month_year.clone(),
        })
    };
    let income = total(TransactionType::Income)?.unwrap_or(0.0);
    let expense = total(TransactionType::Expense)?.unwrap_or(0.0);

    let category_totals: Vec<CategoryTotal> = store.fetch(&QuerySpec::CategoryTotalsByMonth {
        month_year: month_year.clone(),
    })?;
    let daily_totals: Vec<DailyTotal> = store.fetch(&QuerySpec::DailyTotalsByMonth {
        month_year: month_year.clone(),
    })?;
    let budgets: Vec<Budget> = store.fetch(&QuerySpec::BudgetsByMonth {
        month_year: month_year.clone(),
    })?;

    let budgets = budgets
        .into_iter()
        .map(|budget| {
            let spent = category_totals
                .iter()
                .find(|c| c.category_id == budget.category_id)
                .map_or(0.0, |c| c.total_amount);
            BudgetProgress { budget, spent }
        })
        .collect();

    Ok(MonthSummary {
        month_year,
        income,
        expense,
        balance: income - expense,
        category_totals,
        daily_totals,
        budgets,
    })
}

fn print_summary(json: bool, summary: &MonthSummary) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Month:   {}", summary.month_year);
    println!("Income:  {}", summary.income);
    println!("Expense: {}", summary.expense);
    println!("Balance: {}", summary.balance);
    println!("{}", QueryResult::CategoryTotals(summary.category_totals.clone()));
    println!("{}", QueryResult::DailyTotals(summary.daily_totals.clone()));

    let mut table = prettytable::Table::new();
    table.add_row(prettytable::row!["Budget", "Category", "Limit", "Spent", "Remaining"]);
    table.add_empty_row();
    for p in &summary.budgets {
        table.add_row(prettytable::row![
            p.budget.id,
            p.budget.category_id,
            p.budget.monthly_limit,
            p.spent,
            p.budget.monthly_limit - p.spent
        ]);
    }
    println!("\n{}", table);
    Ok(())
}

fn print_recurring(json: bool, charges: &[RecurringCharge]) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(charges)?);
        return Ok(());
    }

    let mut table = prettytable::Table::new();
    table.add_row(prettytable::row!["Merchant", "Amount", "Detected", "Cycle (days)"]);
    table.add_empty_row();
    for c in charges {
        let detected = day_key(c.detected_at).unwrap_or_default();
        table.add_row(prettytable::row![c.merchant, c.amount, detected, c.cycle_days]);
    }
    println!("\n{}", table);
    Ok(())
}

async fn run(store: &Store, command: Command, json: bool) -> Result<(), CliError> {
    match command {
        Command::AddCategory { name, icon, budget_limit, id } => {
            let id = store.insert_category(Category {
                id,
                name,
                icon_metadata: icon,
                budget_limit,
            })?;
            println!("Category {}", id);
        }
        Command::AddTransaction { amount, category, note, income, timestamp, id } => {
            let kind = if income { TransactionType::Income } else { TransactionType::Expense };
            let id = store.insert_transaction(Transaction {
                id,
                amount,
                timestamp: timestamp.unwrap_or_else(now_millis),
                category_id: category,
                note,
                kind,
            })?;
            println!("Transaction {}", id);
        }
        Command::AddBudget { category, limit, month, id } => {
            let id = store.insert_budget(Budget {
                id,
                category_id: category,
                monthly_limit: limit,
                month_year: resolve_month(month),
            })?;
            println!("Budget {}", id);
        }
        Command::DeleteCategory { id } => store.delete_category(id)?,
        Command::DeleteTransaction { id } => store.delete_transaction(id)?,
        Command::DeleteBudget { id } => store.delete_budget(id)?,
        Command::ClearTransactions => store.delete_all_transactions()?,
        Command::Transactions => print_result(json, &store.query(&QuerySpec::AllTransactions)?)?,
        Command::Categories => print_result(json, &store.query(&QuerySpec::AllCategories)?)?,
        Command::Budgets { month } => {
            let spec = QuerySpec::BudgetsByMonth { month_year: resolve_month(month) };
            print_result(json, &store.query(&spec)?)?
        }
        Command::Summary { month } => {
            let summary = summary(store, resolve_month(month))?;
            print_summary(json, &summary)?
        }
        Command::ImportSms { message, timestamp } => {
            match store.import_sms(&message, timestamp.unwrap_or_else(now_millis))? {
                Some(id) => println!("Transaction {}", id),
                None => println!("No completed transaction in message"),
            }
        }
        Command::Recurring => print_recurring(json, &store.recurring_charges()?)?,
        Command::Watch { month } => {
            let mut live = store.category_totals_by_month(&resolve_month(month))?;
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    update = live.next() => match update {
                        Some(Ok(rows)) => print_result(json, &QueryResult::CategoryTotals(rows))?,
                        Some(Err(e)) => return Err(StoreError::from(e).into()),
                        None => break,
                    },
                    _ = &mut ctrl_c => break,
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_logging(&config.logging);

    let store = match Store::open(&config.database) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, path = %config.database.path, "Failed to open store");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let result = run(&store, cli.command, cli.json).await;
    if let Err(e) = store.close() {
        tracing::warn!(error = %e, "Failed to close store cleanly");
    }
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

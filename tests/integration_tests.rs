use std::sync::{Arc, Mutex};
use std::time::Duration;

use tallydb::{
    BackendKind, Budget, Category, CategoryTotal, DatabaseConfig, LiveQuery, Observer, QueryResult, QuerySpec, Store,
    StoreError, SubscriptionError, SubscriptionState, Transaction, TransactionType, WriteOp,
};
use tallydb::storage::StorageError;
use tempfile::TempDir;
use time::{Date, Month};

#[derive(Clone, Copy)]
enum Backend {
    Memory,
    Sqlite,
}

/// Keeps the SQLite directory alive for the duration of a test.
struct TestStore {
    store: Store,
    _dir: Option<TempDir>,
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Store {
        &self.store
    }
}

fn setup(backend: Backend) -> TestStore {
    match backend {
        Backend::Memory => TestStore {
            store: Store::open(&DatabaseConfig::in_memory()).expect("Failed to open store"),
            _dir: None,
        },
        Backend::Sqlite => {
            let dir = tempfile::tempdir().expect("Failed to create temp dir");
            let path = dir.path().join("ledger.db");
            let config = DatabaseConfig::new(BackendKind::Sqlite, path.to_str().unwrap());
            TestStore {
                store: Store::open(&config).expect("Failed to open store"),
                _dir: Some(dir),
            }
        }
    }
}

fn millis(year: i32, month: Month, day: u8, hour: u8) -> i64 {
    Date::from_calendar_date(year, month, day)
        .unwrap()
        .with_hms(hour, 0, 0)
        .unwrap()
        .assume_utc()
        .unix_timestamp()
        * 1000
}

fn feb_10() -> i64 {
    millis(2024, Month::February, 10, 12)
}

fn expense(amount: f64, timestamp: i64, category_id: i64, note: &str) -> Transaction {
    Transaction::new(amount, timestamp, category_id, note, TransactionType::Expense)
}

/// Reads from `live` until a result satisfies `accept`.
async fn next_matching<T>(live: &mut LiveQuery<T>, mut accept: impl FnMut(&T) -> bool) -> T
where
    T: tallydb::query::FromQueryResult,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match live.next().await {
                Some(Ok(value)) if accept(&value) => return value,
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("subscription failed: {}", e),
                None => panic!("subscription ended"),
            }
        }
    })
    .await
    .expect("no matching result in time")
}

#[derive(Default)]
struct Recorder {
    results: Mutex<Vec<QueryResult>>,
}

impl Recorder {
    fn results(&self) -> Vec<QueryResult> {
        self.results.lock().unwrap().clone()
    }
}

impl Observer for Recorder {
    fn on_next(&self, result: &QueryResult) {
        self.results.lock().unwrap().push(result.clone());
    }

    fn on_error(&self, error: &SubscriptionError) {
        panic!("unexpected subscription error: {}", error);
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn upsert_replaces_row_with_same_id(backend: Backend) {
    let store = setup(backend);
    let mut t = expense(10.0, feb_10(), 1, "first");
    t.id = 7;
    store.insert_transaction(t.clone()).unwrap();

    t.amount = 12.5;
    t.note = "second".to_string();
    assert_eq!(store.insert_transaction(t.clone()).unwrap(), 7);

    let rows: Vec<Transaction> = store.fetch(&QuerySpec::AllTransactions).unwrap();
    assert_eq!(rows, vec![t]);
}

async fn negative_id_upserts_in_place(backend: Backend) {
    let store = setup(backend);
    let mut t = expense(10.0, feb_10(), 1, "first");
    t.id = -5;
    let receipt = store.execute(&[WriteOp::UpsertTransaction(t.clone())]).unwrap();
    assert_eq!(receipt.ids, vec![-5]);

    t.amount = 11.0;
    t.note = "second".to_string();
    let receipt = store.execute(&[WriteOp::UpsertTransaction(t.clone())]).unwrap();
    assert_eq!(receipt.ids, vec![-5]);

    let rows: Vec<Transaction> = store.fetch(&QuerySpec::AllTransactions).unwrap();
    assert_eq!(rows, vec![t]);
}

async fn autogenerated_ids_are_distinct(backend: Backend) {
    let store = setup(backend);
    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(store.insert_category(Category::new(format!("c{}", i), "", 0.0)).unwrap());
    }
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 20);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    store.delete_category(ids[19]).unwrap();
    let next = store.insert_category(Category::new("after delete", "", 0.0)).unwrap();
    assert!(next > ids[19], "deleted ids are not handed out again");
}

async fn monthly_total_is_null_without_rows(backend: Backend) {
    let store = setup(backend);
    let spec = QuerySpec::MonthlyTotal {
        kind: TransactionType::Expense,
        month_year: "02-2024".to_string(),
    };
    assert_eq!(store.query(&spec).unwrap(), QueryResult::Total(None));

    // Rows in other months or of the other type do not count.
    store.insert_transaction(expense(5.0, millis(2024, Month::March, 1, 0), 1, "")).unwrap();
    store
        .insert_transaction(Transaction::new(9.0, feb_10(), 1, "", TransactionType::Income))
        .unwrap();
    assert_eq!(store.query(&spec).unwrap(), QueryResult::Total(None));

    store.insert_transaction(expense(0.0, feb_10(), 1, "")).unwrap();
    assert_eq!(store.query(&spec).unwrap(), QueryResult::Total(Some(0.0)));
}

async fn orphans_excluded_from_category_totals(backend: Backend) {
    let store = setup(backend);
    let food = store.insert_category(Category::new("Food", "", 0.0)).unwrap();
    store.insert_transaction(expense(15.5, feb_10(), food, "lunch")).unwrap();
    store.insert_transaction(expense(4.5, feb_10(), food + 100, "orphan")).unwrap();

    let totals: Vec<CategoryTotal> = store
        .fetch(&QuerySpec::CategoryTotalsByMonth { month_year: "02-2024".to_string() })
        .unwrap();
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].category_id, food);
    assert_eq!(totals[0].total_amount, 15.5);

    let total: Option<f64> = store
        .fetch(&QuerySpec::MonthlyTotal {
            kind: TransactionType::Expense,
            month_year: "02-2024".to_string(),
        })
        .unwrap();
    assert_eq!(total, Some(20.0));

    // Deleting the category does not cascade; its transactions become orphans.
    store.delete_category(food).unwrap();
    let totals: Vec<CategoryTotal> = store
        .fetch(&QuerySpec::CategoryTotalsByMonth { month_year: "02-2024".to_string() })
        .unwrap();
    assert!(totals.is_empty());
    let rows: Vec<Transaction> = store.fetch(&QuerySpec::AllTransactions).unwrap();
    assert_eq!(rows.len(), 2);
}

async fn food_scenario(backend: Backend) {
    let store = setup(backend);
    let food = store.insert_category(Category::new("Food", "", 200.0)).unwrap();
    store.insert_transaction(expense(15.5, feb_10(), food, "lunch")).unwrap();

    let mut live = store.category_totals_by_month("02-2024").unwrap();
    let totals = next_matching(&mut live, |_| true).await;
    assert_eq!(
        totals,
        vec![CategoryTotal {
            category_id: food,
            category_name: "Food".to_string(),
            total_amount: 15.5,
        }]
    );
}

async fn new_category_reaches_live_subscriber(backend: Backend) {
    let store = setup(backend);
    let mut live = store.all_categories().unwrap();
    assert_eq!(next_matching(&mut live, |_| true).await, vec![]);

    let id = store.insert_category(Category::new("Travel", "plane", 50.0)).unwrap();
    let rows = next_matching(&mut live, |rows| !rows.is_empty()).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id);
    assert_eq!(rows[0].name, "Travel");
}

async fn unchanged_results_are_not_reemitted(backend: Backend) {
    let store = setup(backend);
    let food = store.insert_category(Category::new("Food", "", 0.0)).unwrap();
    let recorder = Arc::new(Recorder::default());
    let handle = store
        .subscribe(
            QuerySpec::CategoryTotalsByMonth { month_year: "02-2024".to_string() },
            recorder.clone(),
        )
        .unwrap();
    eventually(|| recorder.results().len() == 1).await;

    // Both writes invalidate the query without changing its result.
    store
        .insert_transaction(Transaction::new(100.0, feb_10(), food, "salary", TransactionType::Income))
        .unwrap();
    store.insert_budget(Budget::new(food, 10.0, "02-2024")).unwrap();
    store.insert_transaction(expense(3.0, millis(2024, Month::May, 2, 9), food, "")).unwrap();
    eventually(|| handle.evaluations() >= 2).await;

    store.insert_transaction(expense(8.0, feb_10(), food, "snack")).unwrap();
    eventually(|| {
        recorder
            .results()
            .last()
            .is_some_and(|r| matches!(r, QueryResult::CategoryTotals(rows) if rows.len() == 1))
    })
    .await;
    assert_eq!(recorder.results().len(), 2);
    handle.cancel();
}

async fn delete_all_transactions_emits_empty(backend: Backend) {
    let store = setup(backend);
    store.insert_transaction(expense(1.0, feb_10(), 1, "a")).unwrap();
    store.insert_transaction(expense(2.0, feb_10(), 1, "b")).unwrap();

    let mut live = store.all_transactions().unwrap();
    assert_eq!(next_matching(&mut live, |_| true).await.len(), 2);

    store.delete_all_transactions().unwrap();
    assert!(next_matching(&mut live, |rows| rows.is_empty()).await.is_empty());
}

async fn daily_totals_follow_utc_days(backend: Backend) {
    let store = setup(backend);
    store.insert_transaction(expense(1.0, millis(2024, Month::February, 1, 0), 1, "")).unwrap();
    store.insert_transaction(expense(2.0, millis(2024, Month::February, 1, 23), 1, "")).unwrap();
    store.insert_transaction(expense(4.0, millis(2024, Month::February, 29, 23), 1, "")).unwrap();
    store.insert_transaction(expense(8.0, millis(2024, Month::March, 1, 0), 1, "")).unwrap();

    let mut live = store.daily_totals_by_month("02-2024").unwrap();
    let days = next_matching(&mut live, |_| true).await;
    let days: Vec<(String, f64)> = days.into_iter().map(|d| (d.date, d.total_amount)).collect();
    assert_eq!(
        days,
        vec![("2024-02-01".to_string(), 3.0), ("2024-02-29".to_string(), 4.0)]
    );
}

async fn budgets_by_month_are_live(backend: Backend) {
    let store = setup(backend);
    let mut live = store.budgets_by_month("02-2024").unwrap();
    assert!(next_matching(&mut live, |_| true).await.is_empty());

    store.insert_budget(Budget::new(1, 300.0, "03-2024")).unwrap();
    let id = store.insert_budget(Budget::new(1, 250.0, "02-2024")).unwrap();
    let budgets = next_matching(&mut live, |rows| !rows.is_empty()).await;
    assert_eq!(budgets, vec![Budget { id, ..Budget::new(1, 250.0, "02-2024") }]);
}

async fn monthly_total_is_live(backend: Backend) {
    let store = setup(backend);
    let mut live = store.monthly_total(TransactionType::Income, "02-2024").unwrap();
    assert_eq!(next_matching(&mut live, |_| true).await, None);

    store
        .insert_transaction(Transaction::new(1200.0, feb_10(), 1, "salary", TransactionType::Income))
        .unwrap();
    assert_eq!(next_matching(&mut live, |t| t.is_some()).await, Some(1200.0));
}

async fn failed_batch_changes_nothing(backend: Backend) {
    let store = setup(backend);
    store.insert_category(Category::new("Food", "", 0.0)).unwrap();

    let err = store
        .execute(&[
            WriteOp::DeleteAll(tallydb::Table::Categories),
            WriteOp::UpsertTransaction(expense(f64::NAN, feb_10(), 1, "")),
        ])
        .unwrap_err();
    assert!(matches!(err, StoreError::Storage(StorageError::Conflict(_))), "got {:?}", err);

    let categories: Vec<Category> = store.fetch(&QuerySpec::AllCategories).unwrap();
    assert_eq!(categories.len(), 1);
    let rows: Vec<Transaction> = store.fetch(&QuerySpec::AllTransactions).unwrap();
    assert!(rows.is_empty());
}

async fn close_ends_subscriptions(backend: Backend) {
    let store = setup(backend);
    let mut live = store.all_categories().unwrap();
    next_matching(&mut live, |_| true).await;
    assert_eq!(store.active_subscriptions(), 1);

    store.close().unwrap();
    store.close().unwrap();
    assert!(live.next().await.is_none());
    assert!(live.handle().state() == SubscriptionState::Cancelled);

    assert!(matches!(
        store.insert_category(Category::new("late", "", 0.0)),
        Err(StoreError::Storage(StorageError::Closed))
    ));
    assert!(matches!(
        store.all_categories(),
        Err(StoreError::Storage(StorageError::Closed))
    ));
}

async fn dropping_live_query_cancels(backend: Backend) {
    let store = setup(backend);
    {
        let _live = store.all_transactions().unwrap();
        let _other = store.all_categories().unwrap();
        assert_eq!(store.active_subscriptions(), 2);
    }
    assert_eq!(store.active_subscriptions(), 0);
}

async fn sms_import_records_completed_alerts(backend: Backend) {
    let store = setup(backend);
    let fallback = store
        .import_sms("A/c XX12 debited by Rs.1,250.00 on 10Feb24 trf to Netflix on 10Feb.", feb_10())
        .unwrap()
        .expect("debit alert recorded");

    let food = store.insert_category(Category::new("Food", "", 0.0)).unwrap();
    store.insert_category(Category::new("Rent", "", 0.0)).unwrap();
    let credited = store
        .import_sms("Your a/c is credited by Rs 500 by transfer from Alice.", feb_10())
        .unwrap()
        .expect("credit alert recorded");

    assert_eq!(store.import_sms("Bob has requested Rs.300 frm u on UPI app.", feb_10()).unwrap(), None);
    assert_eq!(store.import_sms("Your OTP is 123456", feb_10()).unwrap(), None);

    let rows: Vec<Transaction> = store.fetch(&QuerySpec::AllTransactions).unwrap();
    assert_eq!(rows.len(), 2);
    let debit = rows.iter().find(|t| t.id == fallback).unwrap();
    assert_eq!(debit.category_id, 1, "no category existed yet");
    assert_eq!(debit.note, "Netflix (SMS)");
    assert_eq!(debit.amount, 1250.0);
    let credit = rows.iter().find(|t| t.id == credited).unwrap();
    assert_eq!(credit.category_id, food, "first category by id");
    assert_eq!(credit.kind, TransactionType::Income);
}

async fn recurring_charges_over_ledger(backend: Backend) {
    let store = setup(backend);
    store.insert_transaction(expense(649.0, millis(2024, Month::January, 5, 9), 1, "Netflix")).unwrap();
    store.insert_transaction(expense(649.0, millis(2024, Month::February, 5, 9), 1, "Netflix")).unwrap();
    store.insert_transaction(expense(30.0, millis(2024, Month::January, 5, 9), 1, "Lunch")).unwrap();
    store.insert_transaction(expense(30.0, millis(2024, Month::January, 6, 9), 1, "Lunch")).unwrap();

    let charges = store.recurring_charges().unwrap();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].merchant, "Netflix");
    assert_eq!(charges[0].detected_at, millis(2024, Month::February, 5, 9));
}

macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::Backend::Memory).await
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test]
                async fn $name() {
                    super::$name(super::Backend::Sqlite).await
                }
            )*
        }
    };
}

backend_tests!(
    upsert_replaces_row_with_same_id,
    negative_id_upserts_in_place,
    autogenerated_ids_are_distinct,
    monthly_total_is_null_without_rows,
    orphans_excluded_from_category_totals,
    food_scenario,
    new_category_reaches_live_subscriber,
    unchanged_results_are_not_reemitted,
    delete_all_transactions_emits_empty,
    daily_totals_follow_utc_days,
    budgets_by_month_are_live,
    monthly_total_is_live,
    failed_batch_changes_nothing,
    close_ends_subscriptions,
    dropping_live_query_cancels,
    sms_import_records_completed_alerts,
    recurring_charges_over_ledger,
);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_are_serialized() {
    let store = setup(Backend::Sqlite);
    let mut live = store.all_transactions().unwrap();

    let mut writers = Vec::new();
    for w in 0..4 {
        let store = store.store.clone();
        writers.push(tokio::task::spawn_blocking(move || {
            (0..25)
                .map(|i| {
                    store
                        .insert_transaction(expense(1.0, feb_10() + i, 1, &format!("w{}-{}", w, i)))
                        .unwrap()
                })
                .collect::<Vec<_>>()
        }));
    }

    let mut ids = Vec::new();
    for writer in writers {
        ids.extend(writer.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 100);

    let rows = next_matching(&mut live, |rows| rows.len() == 100).await;
    assert!(rows.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    assert!(live.handle().evaluations() <= 101);
}

/// Holds every `on_next` until released.
struct BlockingObserver {
    entered: tokio::sync::mpsc::UnboundedSender<()>,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
    category_counts: Mutex<Vec<usize>>,
}

impl Observer for BlockingObserver {
    fn on_next(&self, result: &QueryResult) {
        if let QueryResult::Categories(rows) = result {
            self.category_counts.lock().unwrap().push(rows.len());
        }
        let _ = self.entered.send(());
        let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
    }

    fn on_error(&self, error: &SubscriptionError) {
        panic!("unexpected subscription error: {}", error);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writers_do_not_wait_on_observers() {
    let store = setup(Backend::Memory);
    let (entered_tx, mut entered) = tokio::sync::mpsc::unbounded_channel();
    let (release, release_rx) = std::sync::mpsc::channel::<()>();
    let observer = Arc::new(BlockingObserver {
        entered: entered_tx,
        release: Mutex::new(release_rx),
        category_counts: Mutex::new(Vec::new()),
    });
    let _handle = store.subscribe(QuerySpec::AllCategories, observer.clone()).unwrap();

    // The initial emission is now stuck inside the observer.
    entered.recv().await.unwrap();

    let writer = store.store.clone();
    let burst = tokio::task::spawn_blocking(move || {
        for i in 0..20 {
            writer.insert_category(Category::new(format!("c{}", i), "", 0.0)).unwrap();
        }
    });
    tokio::time::timeout(Duration::from_secs(2), burst)
        .await
        .expect("writers blocked behind the observer")
        .unwrap();
    assert_eq!(observer.category_counts.lock().unwrap().clone(), vec![0]);

    drop(release);
    eventually(|| observer.category_counts.lock().unwrap().last() == Some(&20)).await;
}

#[tokio::test]
async fn test_open_is_idempotent_per_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let config = DatabaseConfig::new(BackendKind::Sqlite, path.to_str().unwrap());

    let first = Store::open(&config).unwrap();
    let second = Store::open(&config).unwrap();
    let _live = first.all_categories().unwrap();
    assert_eq!(second.active_subscriptions(), 1, "both handles share one store");

    let id = second.insert_category(Category::new("Food", "", 0.0)).unwrap();
    let categories: Vec<Category> = first.fetch(&QuerySpec::AllCategories).unwrap();
    assert_eq!(categories[0].id, id);

    first.close().unwrap();
    assert!(second.is_closed());

    // A closed store is replaced by a fresh one that sees the persisted rows.
    let reopened = Store::open(&config).unwrap();
    assert!(!reopened.is_closed());
    let categories: Vec<Category> = reopened.fetch(&QuerySpec::AllCategories).unwrap();
    assert_eq!(categories.len(), 1);
}

#[tokio::test]
async fn test_private_memory_stores_are_independent() {
    let a = Store::open(&DatabaseConfig::in_memory()).unwrap();
    let b = Store::open(&DatabaseConfig::in_memory()).unwrap();
    a.insert_category(Category::new("only in a", "", 0.0)).unwrap();
    let in_b: Vec<Category> = b.fetch(&QuerySpec::AllCategories).unwrap();
    assert!(in_b.is_empty());
}

#[tokio::test]
async fn test_schema_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let mut config = DatabaseConfig::new(BackendKind::Sqlite, path.to_str().unwrap());
    let store = Store::open(&config).unwrap();

    config.schema_version += 1;
    assert!(matches!(
        Store::open(&config),
        Err(StoreError::Storage(StorageError::SchemaMismatch { .. }))
    ));
    store.close().unwrap();
    assert!(matches!(
        Store::open(&config),
        Err(StoreError::Storage(StorageError::SchemaMismatch { .. }))
    ));
}

#[test]
fn test_open_requires_runtime() {
    assert!(matches!(
        Store::open(&DatabaseConfig::in_memory()),
        Err(StoreError::NoRuntime)
    ));
}

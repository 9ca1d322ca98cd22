//! src/services/metadata_store.rs
//!
//! MetadataStore - accounts, object records and bandwidth aggregates in
//! SQLite. Every timestamp is bound from Rust so stored values share one
//! textual format and compare correctly.

use crate::models::{
    account::{Account, Plan},
    bandwidth::BandwidthRecord,
    object::StoredObject,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const OBJECT_COLUMNS: &str = "id, alias, account_id, extension, content_type, size_bytes, \
     storage_key, url, uploaded_at, deleted_at";

/// Sort orders accepted when listing an account's objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectSort {
    #[default]
    UploadedAtDesc,
    UploadedAtAsc,
    SizeDesc,
    SizeAsc,
}

impl ObjectSort {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "uploaded_at_desc" => Some(Self::UploadedAtDesc),
            "uploaded_at_asc" => Some(Self::UploadedAtAsc),
            "size_desc" => Some(Self::SizeDesc),
            "size_asc" => Some(Self::SizeAsc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UploadedAtDesc => "uploaded_at_desc",
            Self::UploadedAtAsc => "uploaded_at_asc",
            Self::SizeDesc => "size_desc",
            Self::SizeAsc => "size_asc",
        }
    }

    fn order_by(self) -> &'static str {
        match self {
            Self::UploadedAtDesc => "uploaded_at DESC, id DESC",
            Self::UploadedAtAsc => "uploaded_at ASC, id ASC",
            Self::SizeDesc => "size_bytes DESC, uploaded_at DESC",
            Self::SizeAsc => "size_bytes ASC, uploaded_at DESC",
        }
    }
}

#[derive(Clone)]
pub struct MetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());
        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
            .map(|_| ())
    }

    // --- accounts ---

    pub async fn create_account(&self, api_key: &str, plan: Plan) -> Result<Account, sqlx::Error> {
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            api_key: api_key.to_string(),
            plan,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO accounts (id, api_key, plan, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(account.id)
        .bind(&account.api_key)
        .bind(account.plan)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(account)
    }

    pub async fn find_account_by_key(&self, api_key: &str) -> Result<Option<Account>, sqlx::Error> {
        sqlx::query_as::<_, Account>(
            "SELECT id, api_key, plan, created_at, updated_at FROM accounts WHERE api_key = ?",
        )
        .bind(api_key)
        .fetch_optional(&*self.db)
        .await
    }

    /// Change an account's plan; returns false if the account does not exist.
    pub async fn update_plan(&self, account_id: Uuid, plan: Plan) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE accounts SET plan = ?, updated_at = ? WHERE id = ?")
            .bind(plan)
            .bind(Utc::now())
            .bind(account_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Total bytes and count of the account's non-deleted objects.
    pub async fn storage_usage(&self, account_id: Uuid) -> Result<(i64, i64), sqlx::Error> {
        sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(SUM(size_bytes), 0), COUNT(*)
             FROM objects WHERE account_id = ? AND deleted_at IS NULL",
        )
        .bind(account_id)
        .fetch_one(&*self.db)
        .await
    }

    // --- objects ---

    pub async fn insert_object(&self, object: &StoredObject) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO objects (
                id, alias, account_id, extension, content_type, size_bytes,
                storage_key, url, uploaded_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&object.id)
        .bind(&object.alias)
        .bind(object.account_id)
        .bind(&object.extension)
        .bind(&object.content_type)
        .bind(object.size_bytes)
        .bind(&object.storage_key)
        .bind(&object.url)
        .bind(object.uploaded_at)
        .bind(object.deleted_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Fetch a non-deleted object by canonical identifier.
    pub async fn find_object(&self, id: &str) -> Result<Option<StoredObject>, sqlx::Error> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Fetch an object regardless of its deletion state.
    pub async fn find_object_with_deleted(
        &self,
        id: &str,
    ) -> Result<Option<StoredObject>, sqlx::Error> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Owner of a live object, used to attribute CDN traffic.
    pub async fn resolve_owner(&self, id: &str) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT account_id FROM objects WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Mark an owned, live object deleted. Returns false when no such object.
    pub async fn soft_delete_object(
        &self,
        id: &str,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE objects SET deleted_at = ?
             WHERE id = ? AND account_id = ? AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(id)
        .bind(account_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Permanently remove an object row. Only the lifecycle worker calls this,
    /// and only after the payload is gone.
    pub async fn hard_delete_object(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Page through an account's live objects. Returns the page and the total.
    pub async fn list_objects(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
        sort: ObjectSort,
    ) -> Result<(Vec<StoredObject>, i64), sqlx::Error> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM objects WHERE account_id = ? AND deleted_at IS NULL",
        )
        .bind(account_id)
        .fetch_one(&*self.db)
        .await?;

        let rows = sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE account_id = ? AND deleted_at IS NULL
             ORDER BY {} LIMIT ? OFFSET ?",
            sort.order_by()
        ))
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.db)
        .await?;

        Ok((rows, total))
    }

    /// Live objects of trial accounts uploaded before `cutoff`, oldest first.
    pub async fn expired_trial_objects(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StoredObject>, sqlx::Error> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT o.id, o.alias, o.account_id, o.extension, o.content_type, o.size_bytes,
                    o.storage_key, o.url, o.uploaded_at, o.deleted_at
             FROM objects o
             INNER JOIN accounts a ON o.account_id = a.id
             WHERE a.plan = ? AND o.deleted_at IS NULL AND o.uploaded_at < ?
             ORDER BY o.uploaded_at ASC",
        )
        .bind(Plan::Trial)
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await
    }

    /// Soft-deleted objects whose deletion predates `cutoff`, oldest first.
    pub async fn purgeable_objects(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StoredObject>, sqlx::Error> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE deleted_at IS NOT NULL AND deleted_at < ?
             ORDER BY deleted_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await
    }

    // --- bandwidth ---

    /// Replace the account's totals for `day`.
    pub async fn upsert_bandwidth(
        &self,
        account_id: Uuid,
        day: NaiveDate,
        bytes_served: i64,
        request_count: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO bandwidth_stats (account_id, day, bytes_served, request_count, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(account_id, day) DO UPDATE SET
                bytes_served = excluded.bytes_served,
                request_count = excluded.request_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(account_id)
        .bind(day)
        .bind(bytes_served)
        .bind(request_count)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn bandwidth_record(
        &self,
        account_id: Uuid,
        day: NaiveDate,
    ) -> Result<Option<BandwidthRecord>, sqlx::Error> {
        sqlx::query_as::<_, BandwidthRecord>(
            "SELECT account_id, day, bytes_served, request_count, updated_at
             FROM bandwidth_stats WHERE account_id = ? AND day = ?",
        )
        .bind(account_id)
        .bind(day)
        .fetch_optional(&*self.db)
        .await
    }

    /// Bytes served to the account on days in `[start, end)`.
    pub async fn bandwidth_between(
        &self,
        account_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(bytes_served), 0) FROM bandwidth_stats
             WHERE account_id = ? AND day >= ? AND day < ?",
        )
        .bind(account_id)
        .bind(start)
        .bind(end)
        .fetch_one(&*self.db)
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = memory_store().await;
        store.migrate().await.unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_account_roundtrip_and_plan_change() {
        let store = memory_store().await;
        let account = store.create_account("ln_test_abc", Plan::Trial).await.unwrap();

        let found = store.find_account_by_key("ln_test_abc").await.unwrap().unwrap();
        assert_eq!(found.id, account.id);
        assert_eq!(found.plan, Plan::Trial);
        assert!(store.find_account_by_key("nope").await.unwrap().is_none());

        assert!(store.update_plan(account.id, Plan::Pro).await.unwrap());
        let found = store.find_account_by_key("ln_test_abc").await.unwrap().unwrap();
        assert_eq!(found.plan, Plan::Pro);
        assert!(!store.update_plan(Uuid::new_v4(), Plan::Pro).await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_usage_ignores_soft_deleted() {
        let store = memory_store().await;
        let account = store.create_account("k", Plan::Starter).await.unwrap();
        let a = object_record(account.id, 100, Utc::now());
        let b = object_record(account.id, 50, Utc::now());
        store.insert_object(&a).await.unwrap();
        store.insert_object(&b).await.unwrap();
        assert_eq!(store.storage_usage(account.id).await.unwrap(), (150, 2));

        assert!(store.soft_delete_object(&b.id, account.id, Utc::now()).await.unwrap());
        assert_eq!(store.storage_usage(account.id).await.unwrap(), (100, 1));
        assert!(store.find_object(&b.id).await.unwrap().is_none());
        assert!(store.find_object_with_deleted(&b.id).await.unwrap().unwrap().is_deleted());
        assert!(store.resolve_owner(&b.id).await.unwrap().is_none());
        assert_eq!(store.resolve_owner(&a.id).await.unwrap(), Some(account.id));
    }

    #[tokio::test]
    async fn test_soft_delete_requires_owner() {
        let store = memory_store().await;
        let owner = store.create_account("owner", Plan::Pro).await.unwrap();
        let other = store.create_account("other", Plan::Pro).await.unwrap();
        let obj = object_record(owner.id, 10, Utc::now());
        store.insert_object(&obj).await.unwrap();

        assert!(!store.soft_delete_object(&obj.id, other.id, Utc::now()).await.unwrap());
        assert!(store.soft_delete_object(&obj.id, owner.id, Utc::now()).await.unwrap());
        assert!(!store.soft_delete_object(&obj.id, owner.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_expiry_and_purge_queries() {
        let store = memory_store().await;
        let trial = store.create_account("trial", Plan::Trial).await.unwrap();
        let paid = store.create_account("paid", Plan::Starter).await.unwrap();
        let now = Utc::now();

        let old_trial = object_record(trial.id, 1, now - Duration::days(8));
        let new_trial = object_record(trial.id, 1, now - Duration::days(1));
        let old_paid = object_record(paid.id, 1, now - Duration::days(30));
        for obj in [&old_trial, &new_trial, &old_paid] {
            store.insert_object(obj).await.unwrap();
        }

        let expired = store.expired_trial_objects(now - Duration::days(7)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old_trial.id);

        store.soft_delete_object(&old_paid.id, paid.id, now).await.unwrap();
        assert!(store.purgeable_objects(now - Duration::days(30)).await.unwrap().is_empty());
        set_deleted_at(&store, &old_paid.id, now - Duration::days(31)).await;
        let purgeable = store.purgeable_objects(now - Duration::days(30)).await.unwrap();
        assert_eq!(purgeable.len(), 1);
        assert_eq!(purgeable[0].id, old_paid.id);

        assert!(store.hard_delete_object(&old_paid.id).await.unwrap());
        assert!(store.find_object_with_deleted(&old_paid.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bandwidth_upsert_replaces_totals() {
        let store = memory_store().await;
        let account = store.create_account("bw", Plan::Pro).await.unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();

        store.upsert_bandwidth(account.id, day, 500, 5).await.unwrap();
        store.upsert_bandwidth(account.id, day, 700, 7).await.unwrap();
        let record = store.bandwidth_record(account.id, day).await.unwrap().unwrap();
        assert_eq!(record.bytes_served, 700);
        assert_eq!(record.request_count, 7);

        let next = day.succ_opt().unwrap();
        store.upsert_bandwidth(account.id, next, 300, 1).await.unwrap();
        let month_start = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let month_end = NaiveDate::from_ymd_opt(2025, 4, 1).unwrap();
        assert_eq!(
            store.bandwidth_between(account.id, month_start, month_end).await.unwrap(),
            1000
        );
        assert_eq!(
            store.bandwidth_between(account.id, month_start, day).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_list_objects_paginates_and_sorts() {
        let store = memory_store().await;
        let account = store.create_account("lister", Plan::Pro).await.unwrap();
        let now = Utc::now();
        for (i, size) in [30_i64, 10, 20].into_iter().enumerate() {
            let obj = object_record(account.id, size, now - Duration::minutes(i as i64));
            store.insert_object(&obj).await.unwrap();
        }

        let (page, total) = store
            .list_objects(account.id, 2, 0, ObjectSort::SizeAsc)
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.iter().map(|o| o.size_bytes).collect::<Vec<_>>(), vec![10, 20]);

        let (page, _) = store
            .list_objects(account.id, 2, 2, ObjectSort::SizeAsc)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].size_bytes, 30);

        let (page, _) = store
            .list_objects(account.id, 10, 0, ObjectSort::UploadedAtDesc)
            .await
            .unwrap();
        assert_eq!(page[0].size_bytes, 30);
    }
}

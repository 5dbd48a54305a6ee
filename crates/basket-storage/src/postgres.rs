//! Postgres implementation of the store traits. Every mutating call runs in
//! its own short transaction.

use std::collections::HashSet;

use async_trait::async_trait;
use basket_core::{
    IngestionJob, Item, JobDetails, JobId, JobType, NotificationThreshold, Order,
    PriceHistoryEntry, SettingsPatch, TrackedItem, TrackedItemId, UserId, UserRef, UserSettings,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::{
    JobStore, JobUpdate, NewTrackedItem, OrderStore, OrderWrite, PriceCheckWrite, PriceStore,
    SettingsStore, StoreError,
};

const JOB_COLUMNS: &str = "id, job_type, user_id, status, progress, details, notification_seen, created_at, updated_at";

const TRACKED_ITEM_COLUMNS: &str = "id, user_id, url, product_id, name, is_custom_name, current_price, currency, last_checked, notification_threshold_type, notification_threshold_value, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn decode_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(err.to_string())
}

fn job_from_row(row: &PgRow) -> Result<IngestionJob, StoreError> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let progress: Option<serde_json::Value> = row.try_get("progress")?;
    let details: serde_json::Value = row.try_get("details")?;

    Ok(IngestionJob {
        id: row.try_get("id")?,
        job_type: job_type.parse().map_err(decode_err)?,
        user_id: row.try_get("user_id")?,
        status: status.parse().map_err(decode_err)?,
        progress: progress.map(serde_json::from_value).transpose()?,
        details: serde_json::from_value(details)?,
        notification_seen: row.try_get("notification_seen")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tracked_item_from_row(row: &PgRow) -> Result<TrackedItem, StoreError> {
    let threshold_type: Option<String> = row.try_get("notification_threshold_type")?;
    Ok(TrackedItem {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        url: row.try_get("url")?,
        product_id: row.try_get("product_id")?,
        name: row.try_get("name")?,
        is_custom_name: row.try_get("is_custom_name")?,
        current_price: row.try_get("current_price")?,
        currency: row.try_get("currency")?,
        last_checked: row.try_get("last_checked")?,
        threshold: NotificationThreshold::from_columns(
            threshold_type.as_deref(),
            row.try_get("notification_threshold_value")?,
        ),
        created_at: row.try_get("created_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item, StoreError> {
    Ok(Item {
        order_number: row.try_get("order_number")?,
        product_id: row.try_get("product_id")?,
        title: row.try_get("title")?,
        link: row.try_get("link")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        quantity: row.try_get("quantity")?,
        unit_price: row.try_get("unit_price")?,
        is_subscribe_and_save: row.try_get("is_subscribe_and_save")?,
    })
}

#[async_trait]
impl OrderStore for PgStore {
    async fn latest_order_date(
        &self,
        user_id: Option<UserId>,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(placed_date) AS latest
              FROM orders
             WHERE $1::uuid IS NULL OR user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("latest")?)
    }

    async fn existing_order_numbers(
        &self,
        user_id: UserId,
        candidates: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT order_number
              FROM orders
             WHERE user_id = $1
               AND order_number = ANY($2)
            "#,
        )
        .bind(user_id)
        .bind(candidates)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<String, _>("order_number")?);
        }
        Ok(out)
    }

    async fn save_order(&self, order: &Order, items: &[Item]) -> Result<OrderWrite, StoreError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (user_id, order_number, placed_date, grand_total, subscription_discount, recipient_name)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, order_number) DO NOTHING
            "#,
        )
        .bind(order.user_id)
        .bind(&order.order_number)
        .bind(order.placed_date)
        .bind(order.grand_total)
        .bind(order.subscription_discount)
        .bind(&order.recipient_name)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let mut write = OrderWrite {
            order_inserted: inserted,
            ..OrderWrite::default()
        };

        for item in items {
            let row = sqlx::query(
                r#"
                INSERT INTO items (user_id, order_number, product_id, title, link, thumbnail_url, quantity, unit_price, is_subscribe_and_save)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (user_id, order_number, title, unit_price) DO UPDATE SET
                    is_subscribe_and_save = EXCLUDED.is_subscribe_and_save,
                    thumbnail_url = EXCLUDED.thumbnail_url
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(order.user_id)
            .bind(&item.order_number)
            .bind(&item.product_id)
            .bind(&item.title)
            .bind(&item.link)
            .bind(&item.thumbnail_url)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.is_subscribe_and_save)
            .fetch_one(&mut *tx)
            .await?;

            if row.try_get::<bool, _>("inserted")? {
                write.items_inserted += 1;
            } else {
                write.items_refreshed += 1;
            }
        }

        tx.commit().await?;
        debug!(order_number = %order.order_number, ?write, "order persisted");
        Ok(write)
    }

    async fn count_orders(&self, user_id: UserId) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM orders WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn items_for_order(
        &self,
        user_id: UserId,
        order_number: &str,
    ) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT order_number, product_id, title, link, thumbnail_url, quantity, unit_price, is_subscribe_and_save
              FROM items
             WHERE user_id = $1 AND order_number = $2
             ORDER BY id
            "#,
        )
        .bind(user_id)
        .bind(order_number)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(
        &self,
        job_type: JobType,
        user_id: Option<UserId>,
        details: &JobDetails,
    ) -> Result<JobId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO ingestion_jobs (job_type, user_id, status, details)
            VALUES ($1, $2, 'pending', $3)
            RETURNING id
            "#,
        )
        .bind(job_type.as_str())
        .bind(user_id)
        .bind(serde_json::to_value(details)?)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn try_create_manual_job(
        &self,
        user_id: UserId,
        details: &JobDetails,
    ) -> Result<Option<JobId>, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_jobs (job_type, user_id, status, details)
            SELECT 'manual', $1, 'pending', $2
             WHERE NOT EXISTS (
                SELECT 1 FROM ingestion_jobs
                 WHERE user_id = $1
                   AND job_type = 'manual'
                   AND status IN ('pending', 'running')
             )
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(serde_json::to_value(details)?)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => Ok(Some(row.try_get("id")?)),
            Ok(None) => Ok(None),
            // Lost the race against a concurrent insert; the partial unique index caught it.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<(), StoreError> {
        let progress = update.progress.map(serde_json::to_value).transpose()?;
        let details = update.details.as_ref().map(serde_json::to_value).transpose()?;

        let affected = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET status = CASE
                       WHEN status IN ('completed', 'failed') THEN status
                       ELSE COALESCE($2, status)
                   END,
                   progress = COALESCE($3, progress),
                   details = COALESCE($4, details),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(progress)
        .bind(details)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(format!("ingestion job {id}")));
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<IngestionJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn latest_job(
        &self,
        job_type: JobType,
        user_id: Option<UserId>,
    ) -> Result<Option<IngestionJob>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM ingestion_jobs
             WHERE job_type = $1
               AND user_id IS NOT DISTINCT FROM $2
             ORDER BY created_at DESC, id DESC
             LIMIT 1
            "#
        ))
        .bind(job_type.as_str())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_notification_seen(&self, id: JobId, user_id: UserId) -> Result<bool, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET notification_seen = TRUE
             WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get_settings(&self, user_id: UserId) -> Result<Option<UserSettings>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, source_email, source_password_encrypted, source_otp_secret,
                   enable_scheduled_ingestion, job_webhook_url, job_notification_preference,
                   price_webhook_url, default_threshold_type, default_threshold_value
              FROM user_settings
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let preference: String = row.try_get("job_notification_preference")?;
        let threshold_type: Option<String> = row.try_get("default_threshold_type")?;
        Ok(Some(UserSettings {
            user_id: row.try_get("user_id")?,
            source_email: row.try_get("source_email")?,
            source_password_encrypted: row.try_get("source_password_encrypted")?,
            source_otp_secret: row.try_get("source_otp_secret")?,
            enable_scheduled_ingestion: row.try_get("enable_scheduled_ingestion")?,
            job_webhook_url: row.try_get("job_webhook_url")?,
            job_notification_preference: preference.parse().map_err(decode_err)?,
            price_webhook_url: row.try_get("price_webhook_url")?,
            default_threshold: NotificationThreshold::from_columns(
                threshold_type.as_deref(),
                row.try_get("default_threshold_value")?,
            ),
        }))
    }

    async fn save_settings(&self, user_id: UserId, patch: &SettingsPatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (
                user_id, source_email, source_password_encrypted, source_otp_secret,
                enable_scheduled_ingestion, job_webhook_url, job_notification_preference,
                price_webhook_url, default_threshold_type, default_threshold_value
            )
            VALUES ($1, $2, $3, $4, COALESCE($5, FALSE), $6, COALESCE($7, 'off'), $8, $9, $10)
            ON CONFLICT (user_id) DO UPDATE SET
                source_email = COALESCE($2, user_settings.source_email),
                source_password_encrypted = COALESCE($3, user_settings.source_password_encrypted),
                source_otp_secret = COALESCE($4, user_settings.source_otp_secret),
                enable_scheduled_ingestion = COALESCE($5, user_settings.enable_scheduled_ingestion),
                job_webhook_url = COALESCE($6, user_settings.job_webhook_url),
                job_notification_preference = COALESCE($7, user_settings.job_notification_preference),
                price_webhook_url = COALESCE($8, user_settings.price_webhook_url),
                default_threshold_type = COALESCE($9, user_settings.default_threshold_type),
                default_threshold_value = COALESCE($10, user_settings.default_threshold_value)
            "#,
        )
        .bind(user_id)
        .bind(&patch.source_email)
        .bind(&patch.source_password_encrypted)
        .bind(&patch.source_otp_secret)
        .bind(patch.enable_scheduled_ingestion)
        .bind(&patch.job_webhook_url)
        .bind(patch.job_notification_preference.map(|p| p.as_str()))
        .bind(&patch.price_webhook_url)
        .bind(patch.default_threshold.map(|t| t.kind.as_str()))
        .bind(patch.default_threshold.map(|t| t.value))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scheduled_users(&self) -> Result<Vec<UserRef>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.username
              FROM users u
              JOIN user_settings s ON u.id = s.user_id
             WHERE s.enable_scheduled_ingestion = TRUE
             ORDER BY u.created_at, u.username
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(UserRef {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
            });
        }
        Ok(out)
    }

    async fn admin_user(&self) -> Result<Option<UserId>, StoreError> {
        let row = sqlx::query(
            "SELECT id FROM users WHERE role = 'admin' ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }
}

#[async_trait]
impl PriceStore for PgStore {
    async fn list_tracked_items(&self) -> Result<Vec<TrackedItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACKED_ITEM_COLUMNS} FROM tracked_items ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tracked_item_from_row).collect()
    }

    async fn tracked_items_for_user(&self, user_id: UserId) -> Result<Vec<TrackedItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACKED_ITEM_COLUMNS} FROM tracked_items WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tracked_item_from_row).collect()
    }

    async fn get_tracked_item(
        &self,
        user_id: UserId,
        id: TrackedItemId,
    ) -> Result<Option<TrackedItem>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRACKED_ITEM_COLUMNS} FROM tracked_items WHERE id = $1 AND user_id = $2"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tracked_item_from_row).transpose()
    }

    async fn find_tracked_item(
        &self,
        user_id: UserId,
        product_id: Option<&str>,
        url: &str,
    ) -> Result<Option<TrackedItemId>, StoreError> {
        let row = match product_id {
            Some(product_id) => {
                sqlx::query("SELECT id FROM tracked_items WHERE user_id = $1 AND product_id = $2")
                    .bind(user_id)
                    .bind(product_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT id FROM tracked_items WHERE user_id = $1 AND url = $2")
                    .bind(user_id)
                    .bind(url)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        row.map(|r| r.try_get("id")).transpose().map_err(Into::into)
    }

    async fn insert_tracked_item(&self, item: &NewTrackedItem) -> Result<TrackedItem, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tracked_items (
                user_id, product_id, url, name, current_price, currency, last_checked,
                notification_threshold_type, notification_threshold_value
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {TRACKED_ITEM_COLUMNS}
            "#
        ))
        .bind(item.user_id)
        .bind(&item.product_id)
        .bind(&item.url)
        .bind(&item.name)
        .bind(item.current_price)
        .bind(&item.currency)
        .bind(item.checked_at)
        .bind(item.threshold.map(|t| t.kind.as_str()))
        .bind(item.threshold.map(|t| t.value))
        .fetch_one(&mut *tx)
        .await?;
        let tracked = tracked_item_from_row(&row)?;

        if let Some(price) = item.current_price {
            sqlx::query(
                "INSERT INTO price_history (tracked_item_id, price, recorded_at) VALUES ($1, $2, $3)",
            )
            .bind(tracked.id)
            .bind(price)
            .bind(item.checked_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(tracked)
    }

    async fn latest_price(&self, id: TrackedItemId) -> Result<Option<PriceHistoryEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT price, recorded_at
              FROM price_history
             WHERE tracked_item_id = $1
             ORDER BY recorded_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(PriceHistoryEntry {
                price: row.try_get("price")?,
                recorded_at: row.try_get("recorded_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn record_price_check(
        &self,
        id: TrackedItemId,
        write: &PriceCheckWrite,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let affected = sqlx::query(
            r#"
            UPDATE tracked_items
               SET current_price = $2,
                   last_checked = $3,
                   name = COALESCE($4, name)
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(write.price)
        .bind(write.checked_at)
        .bind(&write.name)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(format!("tracked item {id}")));
        }

        if write.append_history {
            sqlx::query(
                "INSERT INTO price_history (tracked_item_id, price, recorded_at) VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(write.price)
            .bind(write.checked_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn touch_last_checked(
        &self,
        id: TrackedItemId,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE tracked_items SET last_checked = $2 WHERE id = $1")
            .bind(id)
            .bind(checked_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rename_tracked_item(
        &self,
        user_id: UserId,
        id: TrackedItemId,
        name: &str,
    ) -> Result<Option<TrackedItem>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tracked_items
               SET name = $3, is_custom_name = TRUE
             WHERE id = $1 AND user_id = $2
            RETURNING {TRACKED_ITEM_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tracked_item_from_row).transpose()
    }

    async fn set_threshold(
        &self,
        user_id: UserId,
        id: TrackedItemId,
        threshold: Option<NotificationThreshold>,
    ) -> Result<Option<TrackedItem>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tracked_items
               SET notification_threshold_type = $3,
                   notification_threshold_value = $4
             WHERE id = $1 AND user_id = $2
            RETURNING {TRACKED_ITEM_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(user_id)
        .bind(threshold.map(|t| t.kind.as_str()))
        .bind(threshold.map(|t| t.value))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(tracked_item_from_row).transpose()
    }

    async fn delete_tracked_item(
        &self,
        user_id: UserId,
        id: TrackedItemId,
    ) -> Result<bool, StoreError> {
        let affected = sqlx::query("DELETE FROM tracked_items WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn price_history(&self, id: TrackedItemId) -> Result<Vec<PriceHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT price, recorded_at
              FROM price_history
             WHERE tracked_item_id = $1
             ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PriceHistoryEntry {
                price: row.try_get("price")?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(out)
    }
}

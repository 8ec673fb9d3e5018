use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{lease_delta, PageStore, SourcePageProvider};
use crate::core::errors::{StoreError, StoreResult};
use crate::core::types::{
    ClaimToken, Finalization, PageKey, SourcePage, TargetLanguage, TranslatedPage,
    TranslationState,
};

const STATE_NOT_TRANSLATED: &str = "not_translated";
const STATE_PROCESSING: &str = "processing";
const STATE_TRANSLATED: &str = "translated";

/// SQLite-backed page store.
///
/// `translated_pages` is keyed by (chapter_id, page_number, language) and
/// keeps the job state in its own column next to the image URL. Claims are
/// a single conditional upsert.
#[derive(Clone)]
pub struct SqlitePageStore {
    pool: Pool<Sqlite>,
}

impl SqlitePageStore {
    /// Open (creating if missing) the database at `url` and apply the schema
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Page store ready at {}", url);
        Ok(store)
    }

    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use.
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_pages (
                page_id INTEGER PRIMARY KEY,
                chapter_id INTEGER NOT NULL,
                page_number INTEGER NOT NULL,
                image_location TEXT NOT NULL,
                language TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS translated_pages (
                chapter_id INTEGER NOT NULL,
                page_number INTEGER NOT NULL,
                language TEXT NOT NULL,
                state TEXT NOT NULL
                    CHECK (state IN ('not_translated', 'processing', 'translated')),
                image_url TEXT,
                claim_id TEXT,
                lease_expires_at INTEGER,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (chapter_id, page_number, language)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace an ingested page
    pub async fn upsert_source_page(&self, page: &SourcePage) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO source_pages (page_id, chapter_id, page_number, image_location, language)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (page_id) DO UPDATE SET
                chapter_id = excluded.chapter_id,
                page_number = excluded.page_number,
                image_location = excluded.image_location,
                language = excluded.language
            "#,
        )
        .bind(page.page_id)
        .bind(page.chapter_id)
        .bind(page.page_number)
        .bind(&page.image_location)
        .bind(&page.language)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn decode_translation(row: &SqliteRow) -> StoreResult<TranslatedPage> {
        let chapter_id: i64 = row.try_get("chapter_id")?;
        let page_number: i32 = row.try_get("page_number")?;
        let language: String = row.try_get("language")?;
        let state: String = row.try_get("state")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        let corrupt = |reason: String| StoreError::CorruptRow {
            key: format!("{}/{}/{}", chapter_id, page_number, language),
            reason,
        };

        let language = TargetLanguage::from_str(&language).map_err(corrupt)?;
        let key = PageKey::new(chapter_id, page_number, language);

        let state = match state.as_str() {
            STATE_NOT_TRANSLATED => TranslationState::NotTranslated,
            STATE_PROCESSING => {
                let claim_id: Option<String> = row.try_get("claim_id")?;
                let lease_expires_at: Option<i64> = row.try_get("lease_expires_at")?;
                let claim_id = claim_id
                    .as_deref()
                    .map(Uuid::parse_str)
                    .transpose()
                    .map_err(|e| corrupt(format!("bad claim id: {}", e)))?
                    .ok_or_else(|| corrupt("processing row without claim id".to_string()))?;
                let lease_expires_at = lease_expires_at
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .ok_or_else(|| corrupt("processing row without lease".to_string()))?;
                TranslationState::Processing {
                    claim_id,
                    lease_expires_at,
                }
            }
            STATE_TRANSLATED => {
                let image_url: Option<String> = row.try_get("image_url")?;
                match image_url.filter(|url| !url.is_empty()) {
                    Some(image_url) => TranslationState::Translated { image_url },
                    None => return Err(corrupt("translated row without image url".to_string())),
                }
            }
            other => return Err(corrupt(format!("unknown state '{}'", other))),
        };

        Ok(TranslatedPage {
            key,
            state,
            updated_at: DateTime::<Utc>::from_timestamp_millis(updated_at)
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl PageStore for SqlitePageStore {
    async fn find_translation(&self, key: &PageKey) -> StoreResult<Option<TranslatedPage>> {
        let row = sqlx::query(
            r#"
            SELECT chapter_id, page_number, language, state, image_url,
                   claim_id, lease_expires_at, updated_at
            FROM translated_pages
            WHERE chapter_id = ? AND page_number = ? AND language = ?
            "#,
        )
        .bind(key.chapter_id)
        .bind(key.page_number)
        .bind(key.language.code())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::decode_translation).transpose()
    }

    async fn claim_processing(
        &self,
        key: &PageKey,
        lease: Duration,
    ) -> StoreResult<Option<ClaimToken>> {
        let now = Utc::now();
        let token = ClaimToken {
            key: *key,
            claim_id: Uuid::new_v4(),
            lease_expires_at: now + lease_delta(lease),
        };

        // Insert, or take over a row that is not translated or whose lease
        // ran out. A held or translated row leaves rows_affected at 0.
        let result = sqlx::query(
            r#"
            INSERT INTO translated_pages
                (chapter_id, page_number, language, state, image_url,
                 claim_id, lease_expires_at, updated_at)
            VALUES (?, ?, ?, 'processing', NULL, ?, ?, ?)
            ON CONFLICT (chapter_id, page_number, language) DO UPDATE SET
                state = 'processing',
                image_url = NULL,
                claim_id = excluded.claim_id,
                lease_expires_at = excluded.lease_expires_at,
                updated_at = excluded.updated_at
            WHERE translated_pages.state = 'not_translated'
               OR (translated_pages.state = 'processing'
                   AND translated_pages.lease_expires_at <= excluded.updated_at)
            "#,
        )
        .bind(key.chapter_id)
        .bind(key.page_number)
        .bind(key.language.code())
        .bind(token.claim_id.to_string())
        .bind(token.lease_expires_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(token))
    }

    async fn finalize(&self, claim: &ClaimToken, outcome: Finalization) -> StoreResult<bool> {
        let (state, image_url) = match outcome {
            Finalization::Translated { image_url } => (STATE_TRANSLATED, Some(image_url)),
            Finalization::Rollback => (STATE_NOT_TRANSLATED, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE translated_pages
            SET state = ?, image_url = ?, claim_id = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE chapter_id = ? AND page_number = ? AND language = ?
              AND state = 'processing' AND claim_id = ?
            "#,
        )
        .bind(state)
        .bind(image_url)
        .bind(Utc::now().timestamp_millis())
        .bind(claim.key.chapter_id)
        .bind(claim.key.page_number)
        .bind(claim.key.language.code())
        .bind(claim.claim_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_expired_claims(&self) -> StoreResult<usize> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE translated_pages
            SET state = 'not_translated', claim_id = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE state = 'processing' AND lease_expires_at <= ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl SourcePageProvider for SqlitePageStore {
    async fn get_source_page(&self, page_id: i64) -> StoreResult<Option<SourcePage>> {
        let row = sqlx::query(
            r#"
            SELECT page_id, chapter_id, page_number, image_location, language
            FROM source_pages
            WHERE page_id = ?
            "#,
        )
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(SourcePage {
            page_id: row.try_get("page_id")?,
            chapter_id: row.try_get("chapter_id")?,
            page_number: row.try_get("page_number")?,
            image_location: row.try_get("image_location")?,
            language: row.try_get("language")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PageStatus;

    const LEASE: Duration = Duration::from_secs(60);

    async fn setup_test_store() -> SqlitePageStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqlitePageStore::from_pool(pool);
        store.migrate().await.unwrap();
        store
    }

    fn key() -> PageKey {
        PageKey::new(9, 12, TargetLanguage::Vietnamese)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = setup_test_store().await;

        assert!(store.find_translation(&key()).await.unwrap().is_none());
        let claim = store.claim_processing(&key(), LEASE).await.unwrap().unwrap();
        assert!(store.claim_processing(&key(), LEASE).await.unwrap().is_none());

        let row = store.find_translation(&key()).await.unwrap().unwrap();
        assert_eq!(row.status(), PageStatus::Processing);
        assert_eq!(
            row.state,
            TranslationState::Processing {
                claim_id: claim.claim_id,
                lease_expires_at: DateTime::<Utc>::from_timestamp_millis(
                    claim.lease_expires_at.timestamp_millis()
                )
                .unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        // File-backed so the attempts race on separate connections
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("pages.db").display());
        let store = SqlitePageStore::connect(&url, 4).await.unwrap();

        let attempts = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_processing(&key(), LEASE).await.unwrap() })
        });

        let winners = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(Some(_))))
            .count();
        assert_eq!(winners, 1);

        let row = store.find_translation(&key()).await.unwrap().unwrap();
        assert_eq!(row.status(), PageStatus::Processing);
    }

    #[tokio::test]
    async fn test_translated_row_is_terminal() {
        let store = setup_test_store().await;
        let claim = store.claim_processing(&key(), LEASE).await.unwrap().unwrap();
        assert!(store
            .finalize(
                &claim,
                Finalization::Translated {
                    image_url: "https://cdn/12-vi.png".into()
                }
            )
            .await
            .unwrap());

        let row = store.find_translation(&key()).await.unwrap().unwrap();
        assert_eq!(row.image_url(), Some("https://cdn/12-vi.png"));
        assert!(store.claim_processing(&key(), LEASE).await.unwrap().is_none());

        // A second finalize with the spent claim does nothing
        assert!(!store.finalize(&claim, Finalization::Rollback).await.unwrap());
        let row = store.find_translation(&key()).await.unwrap().unwrap();
        assert_eq!(row.status(), PageStatus::Translated);
    }

    #[tokio::test]
    async fn test_rollback_keeps_row_and_allows_retry() {
        let store = setup_test_store().await;
        let claim = store.claim_processing(&key(), LEASE).await.unwrap().unwrap();
        assert!(store.finalize(&claim, Finalization::Rollback).await.unwrap());

        let row = store.find_translation(&key()).await.unwrap().unwrap();
        assert_eq!(row.state, TranslationState::NotTranslated);
        assert!(row.image_url().is_none());

        let retry = store.claim_processing(&key(), LEASE).await.unwrap();
        assert!(retry.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable_and_released() {
        let store = setup_test_store().await;
        let stale = store
            .claim_processing(&key(), Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = store.claim_processing(&key(), LEASE).await.unwrap().unwrap();
        assert!(!store.finalize(&stale, Finalization::Rollback).await.unwrap());
        assert!(store.finalize(&fresh, Finalization::Rollback).await.unwrap());

        let other = PageKey::new(9, 13, TargetLanguage::Vietnamese);
        store
            .claim_processing(&other, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.release_expired_claims().await.unwrap(), 1);
        let row = store.find_translation(&other).await.unwrap().unwrap();
        assert_eq!(row.state, TranslationState::NotTranslated);
    }

    #[tokio::test]
    async fn test_source_page_roundtrip() {
        let store = setup_test_store().await;
        let page = SourcePage {
            page_id: 42,
            chapter_id: 9,
            page_number: 12,
            image_location: "/data/raw/9/12.png".into(),
            language: "ja".into(),
        };
        store.upsert_source_page(&page).await.unwrap();

        assert_eq!(store.get_source_page(42).await.unwrap(), Some(page));
        assert!(store.get_source_page(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let store = setup_test_store().await;
        sqlx::query(
            "INSERT INTO translated_pages (chapter_id, page_number, language, state, updated_at)
             VALUES (9, 12, 'vi', 'translated', 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.find_translation(&key()).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { .. }));
    }
}

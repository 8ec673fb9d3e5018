use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use uuid::Uuid;

use super::{lease_delta, PageStore, SourcePageProvider};
use crate::core::errors::StoreResult;
use crate::core::types::{
    ClaimToken, Finalization, PageKey, SourcePage, TranslatedPage, TranslationState,
};

/// In-process page store.
///
/// The claim runs under the DashMap shard lock for its key, which makes
/// check-and-set a single step.
#[derive(Default)]
pub struct MemoryPageStore {
    translations: DashMap<PageKey, TranslatedPage>,
    sources: DashMap<i64, SourcePage>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an ingested page
    pub fn seed_source_page(&self, page: SourcePage) {
        self.sources.insert(page.page_id, page);
    }

    /// Put a row into an arbitrary state (fixtures and recovery tooling)
    pub fn put_translation(&self, page: TranslatedPage) {
        self.translations.insert(page.key, page);
    }

    pub fn translation_count(&self) -> usize {
        self.translations.len()
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn find_translation(&self, key: &PageKey) -> StoreResult<Option<TranslatedPage>> {
        Ok(self.translations.get(key).map(|row| row.value().clone()))
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
        let processing = TranslatedPage {
            key: *key,
            state: TranslationState::Processing {
                claim_id: token.claim_id,
                lease_expires_at: token.lease_expires_at,
            },
            updated_at: now,
        };

        match self.translations.entry(*key) {
            Entry::Vacant(slot) => {
                slot.insert(processing);
                Ok(Some(token))
            }
            Entry::Occupied(mut slot) => {
                let claimable = match &slot.get().state {
                    TranslationState::NotTranslated => true,
                    TranslationState::Processing {
                        lease_expires_at, ..
                    } => *lease_expires_at <= now,
                    TranslationState::Translated { .. } => false,
                };
                if claimable {
                    slot.insert(processing);
                    Ok(Some(token))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn finalize(&self, claim: &ClaimToken, outcome: Finalization) -> StoreResult<bool> {
        let Some(mut row) = self.translations.get_mut(&claim.key) else {
            return Ok(false);
        };

        let holds_claim = matches!(
            &row.state,
            TranslationState::Processing { claim_id, .. } if *claim_id == claim.claim_id
        );
        if !holds_claim {
            return Ok(false);
        }

        row.state = match outcome {
            Finalization::Translated { image_url } => TranslationState::Translated { image_url },
            Finalization::Rollback => TranslationState::NotTranslated,
        };
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_expired_claims(&self) -> StoreResult<usize> {
        let now = Utc::now();
        let mut released = 0;

        for mut row in self.translations.iter_mut() {
            let expired = matches!(
                &row.state,
                TranslationState::Processing { lease_expires_at, .. } if *lease_expires_at <= now
            );
            if expired {
                row.state = TranslationState::NotTranslated;
                row.updated_at = now;
                released += 1;
            }
        }

        Ok(released)
    }
}

#[async_trait]
impl SourcePageProvider for MemoryPageStore {
    async fn get_source_page(&self, page_id: i64) -> StoreResult<Option<SourcePage>> {
        Ok(self.sources.get(&page_id).map(|page| page.value().clone()))
    }
}

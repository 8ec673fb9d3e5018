// Persistence seams for the pipeline
//
// The page store owns the translated-page rows and performs the atomic
// claim; the source provider answers lookups for ingested pages. Both are
// implemented by the in-memory store (tests, single process) and the SQLite
// store (deployments).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::time::Duration;

use crate::core::errors::StoreResult;
use crate::core::types::{ClaimToken, Finalization, PageKey, SourcePage, TranslatedPage};

pub use memory::MemoryPageStore;
pub use sqlite::SqlitePageStore;

#[async_trait]
pub trait PageStore: Send + Sync {
    /// Row for a translation variant, if one was ever created
    async fn find_translation(&self, key: &PageKey) -> StoreResult<Option<TranslatedPage>>;

    /// Atomically move `key` into processing.
    ///
    /// Succeeds only when no row exists, the row is not translated, or the
    /// row is processing under an expired lease. Returns `None` when another
    /// job holds the key or it is already translated.
    async fn claim_processing(&self, key: &PageKey, lease: Duration)
        -> StoreResult<Option<ClaimToken>>;

    /// End a claimed job. Applied only while the row still carries this
    /// claim; returns false when the claim was lost to a newer one.
    async fn finalize(&self, claim: &ClaimToken, outcome: Finalization) -> StoreResult<bool>;

    /// Reset every processing row whose lease has expired. Returns how many
    /// rows were released.
    async fn release_expired_claims(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait SourcePageProvider: Send + Sync {
    async fn get_source_page(&self, page_id: i64) -> StoreResult<Option<SourcePage>>;
}

/// Convert a lease duration into a chrono offset, capped at a century
pub(crate) fn lease_delta(lease: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(lease).map_or(cap, |delta| delta.min(cap))
}

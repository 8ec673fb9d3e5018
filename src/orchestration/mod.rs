pub mod reconciler;
pub mod translation_orchestrator;

pub use reconciler::ClaimReconciler;
pub use translation_orchestrator::{
    PipelineComponents, TranslationOrchestrator, TranslationStatus,
};

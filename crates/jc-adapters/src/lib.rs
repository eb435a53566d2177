//! Job-board plugin contract + the boards implemented against it.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use jc_core::{
    AlwaysAnalyze, AnalysisContext, AnalysisPolicy, CachedPage, CatcherConfig, NormalizedOffer,
    StoredOffer,
};
use jc_storage::{PageCache, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub mod extract;
pub mod pole_emploi;

pub use extract::{HtmlTextNormalizer, LabeledField};
pub use pole_emploi::PoleEmploi;

pub const CRATE_NAME: &str = "jc-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// An offer detail URL found in a feed, tagged with the feed's page id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredUrl {
    pub feed_id: String,
    pub url: String,
}

/// Why a page produced no row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    OfferIdMissing,
    ContentBlockMissing,
    TitleMissing,
    SecondarySectionMissing,
    RegionMissing,
    Incomplete(Vec<&'static str>),
}

impl SkipReason {
    pub fn key(&self) -> &'static str {
        match self {
            SkipReason::OfferIdMissing => "offer_id_missing",
            SkipReason::ContentBlockMissing => "content_block_missing",
            SkipReason::TitleMissing => "title_missing",
            SkipReason::SecondarySectionMissing => "secondary_section_missing",
            SkipReason::RegionMissing => "region_missing",
            SkipReason::Incomplete(_) => "incomplete",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::OfferIdMissing => f.write_str("no offer id in page url"),
            SkipReason::ContentBlockMissing => f.write_str("content block missing"),
            SkipReason::TitleMissing => f.write_str("title missing"),
            SkipReason::SecondarySectionMissing => f.write_str("secondary section missing"),
            SkipReason::RegionMissing => f.write_str("region missing"),
            SkipReason::Incomplete(missing) => {
                write!(f, "incomplete record, missing {}", missing.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AnalysisOutcome {
    /// The staleness policy said the page does not need analysis.
    NotDue,
    Skipped(SkipReason),
    /// `inserted` is false when the offer id was already in the table.
    Recorded { offerid: String, inserted: bool },
}

#[async_trait]
pub trait JobBoard: Send + Sync {
    fn name(&self) -> &'static str;

    fn discover_urls(&self, feeds: &[CachedPage]) -> Vec<DiscoveredUrl>;

    async fn ensure_schema(&self) -> Result<bool, AdapterError>;

    async fn analyze_page(
        &self,
        ctx: &AnalysisContext,
        page: &CachedPage,
    ) -> Result<AnalysisOutcome, AdapterError>;

    async fn stored_offers(&self) -> Result<Vec<StoredOffer>, AdapterError>;

    fn build_offer(&self, row: &StoredOffer) -> Option<NormalizedOffer>;
}

pub fn board_for_source(
    source_id: &str,
    config: &CatcherConfig,
) -> Result<Option<Box<dyn JobBoard>>, AdapterError> {
    board_with_policy(source_id, config, Box::new(AlwaysAnalyze))
}

pub fn board_with_policy(
    source_id: &str,
    config: &CatcherConfig,
    policy: Box<dyn AnalysisPolicy>,
) -> Result<Option<Box<dyn JobBoard>>, AdapterError> {
    match source_id {
        "PoleEmploi" | "pole-emploi" | "poleemploi" => {
            Ok(Some(Box::new(PoleEmploi::new(config)?.with_policy(policy))))
        }
        _ => Ok(None),
    }
}

pub async fn discover_from_cache(
    board: &dyn JobBoard,
    cache: &PageCache,
) -> Result<Vec<DiscoveredUrl>, AdapterError> {
    let feeds = cache.load_feeds(board.name()).await?;
    Ok(board.discover_urls(&feeds))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisSummary {
    pub pages: usize,
    pub recorded: usize,
    pub already_stored: usize,
    pub not_due: usize,
    pub skipped: BTreeMap<String, usize>,
}

impl AnalysisSummary {
    fn tally(&mut self, outcome: &AnalysisOutcome) {
        self.pages += 1;
        match outcome {
            AnalysisOutcome::NotDue => self.not_due += 1,
            AnalysisOutcome::Skipped(reason) => {
                *self.skipped.entry(reason.key().to_string()).or_default() += 1;
            }
            AnalysisOutcome::Recorded { inserted: true, .. } => self.recorded += 1,
            AnalysisOutcome::Recorded { inserted: false, .. } => self.already_stored += 1,
        }
    }
}

/// Analyzes pages one after the other. Store failures stop the run.
pub async fn run_analysis(
    board: &dyn JobBoard,
    ctx: &AnalysisContext,
    pages: &[CachedPage],
) -> Result<AnalysisSummary, AdapterError> {
    let mut summary = AnalysisSummary::default();
    for page in pages {
        let span = info_span!("analyze_page", run_id = %ctx.run_id, board = board.name(), url = %page.url);
        let outcome = board.analyze_page(ctx, page).instrument(span).await?;
        summary.tally(&outcome);
    }
    info!(
        run_id = %ctx.run_id,
        board = board.name(),
        pages = summary.pages,
        recorded = summary.recorded,
        already_stored = summary.already_stored,
        not_due = summary.not_due,
        "analysis run finished"
    );
    Ok(summary)
}

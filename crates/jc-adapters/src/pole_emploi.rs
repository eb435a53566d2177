//! Pole Emploi board: feed tables, offer detail pages, `jb_PoleEmploi` table.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::FixedOffset;
use jc_core::{
    AlwaysAnalyze, AnalysisContext, AnalysisPolicy, CachedPage, CatcherConfig, LogOnlyDisabler,
    NormalizedOffer, OfferDisabler, OfferDraft, OfferState, StoredOffer, TextNormalizer,
    COMPANY_NOT_AVAILABLE,
};
use jc_storage::RecordStore;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::extract::{
    element_text, parse_day_month_year, split_location, HtmlTextNormalizer, LabeledField,
};
use crate::{AdapterError, AnalysisOutcome, DiscoveredUrl, JobBoard, SkipReason};

pub const BOARD_NAME: &str = "PoleEmploi";
pub const DETAIL_URL_PREFIX: &str = "http://candidat.pole-emploi.fr/candidat/rechercheoffres/detail/";

static DETAIL_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\./resultats\.tableauresultatrechercheoffre:detailOffre/(.+)$")
        .expect("static detail link regex")
});

const LABEL_REFERENCE: &str = "Numéro de l'offre";
const LABEL_UPDATED: &str = "Offre actualisée le";
const LABEL_CONTRACT: &str = "Type de contrat";
const LABEL_SALARY: &str = "Salaire indicatif";

#[derive(Debug)]
struct PageSelectors {
    row: Selector,
    link: Selector,
    content_block: Selector,
    title: Selector,
    primary: Selector,
    secondary: Selector,
    region: Selector,
    company: Selector,
    reference: LabeledField,
    updated: LabeledField,
    contract: LabeledField,
    salary: LabeledField,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("selector {css}: {e}")))
}

fn labeled(label: &str) -> Result<LabeledField, AdapterError> {
    LabeledField::new(label).map_err(|e| AdapterError::Message(format!("label {label}: {e}")))
}

impl PageSelectors {
    fn compile() -> Result<Self, AdapterError> {
        Ok(Self {
            row: selector("tr")?,
            link: selector("a[href]")?,
            content_block: selector("body div.block-content")?,
            title: selector(r#"h4[itemprop="title"]"#)?,
            primary: selector("li.primary")?,
            secondary: selector("li.secondary")?,
            region: selector(r#"li[itemprop="addressRegion"]"#)?,
            company: selector(r#"p[itemprop="hiringOrganization"]"#)?,
            reference: labeled(LABEL_REFERENCE)?,
            updated: labeled(LABEL_UPDATED)?,
            contract: labeled(LABEL_CONTRACT)?,
            salary: labeled(LABEL_SALARY)?,
        })
    }
}

/// Offer id is everything after `/detail/` in the canonical URL.
pub fn offer_id_from_url(url: &str) -> Option<String> {
    url.split_once("/detail/")
        .map(|(_, id)| id.trim())
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
}

pub struct PoleEmploi {
    store: RecordStore,
    timezone: FixedOffset,
    selectors: PageSelectors,
    policy: Box<dyn AnalysisPolicy>,
    disabler: Box<dyn OfferDisabler>,
    normalizer: Box<dyn TextNormalizer>,
}

impl PoleEmploi {
    pub fn new(config: &CatcherConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            store: RecordStore::new(&config.database, BOARD_NAME)?,
            timezone: config.timezone(),
            selectors: PageSelectors::compile()?,
            policy: Box::new(AlwaysAnalyze),
            disabler: Box::new(LogOnlyDisabler),
            normalizer: Box::new(HtmlTextNormalizer),
        })
    }

    pub fn with_policy(mut self, policy: Box<dyn AnalysisPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_disabler(mut self, disabler: Box<dyn OfferDisabler>) -> Self {
        self.disabler = disabler;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Box<dyn TextNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn discover_in_feed(&self, feed: &CachedPage) -> Vec<DiscoveredUrl> {
        let document = Html::parse_document(&feed.content);
        let mut urls = Vec::new();
        for row in document.select(&self.selectors.row) {
            let found = row
                .select(&self.selectors.link)
                .filter(|link| nearest_row(*link).map(|r| r.id()) == Some(row.id()))
                .filter_map(|link| link.value().attr("href"))
                .find_map(|href| DETAIL_LINK.captures(href.trim()))
                .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()));
            if let Some(detail_id) = found {
                urls.push(DiscoveredUrl {
                    feed_id: feed.pageid.clone(),
                    url: format!("{DETAIL_URL_PREFIX}{detail_id}"),
                });
            }
        }
        urls
    }

    /// Runs the structural checkpoints over one page. The first missing
    /// mandatory section ends the extraction with its skip reason.
    pub fn extract_draft(
        &self,
        ctx: &AnalysisContext,
        page: &CachedPage,
        offerid: &str,
    ) -> Result<OfferDraft, SkipReason> {
        let document = Html::parse_document(&page.content);
        let normalizer = self.normalizer.as_ref();
        let selectors = &self.selectors;

        let block = document
            .select(&self.selectors.content_block)
            .next()
            .ok_or(SkipReason::ContentBlockMissing)?;

        let title = block
            .select(&self.selectors.title)
            .next()
            .ok_or(SkipReason::TitleMissing)?;

        let draft = OfferDraft {
            title: element_text(title),
            url: Some(page.url.clone()),
            lastupdate: Some(page.lastupdate),
            feedid: page.feedid.clone(),
            reference: block
                .select(&self.selectors.primary)
                .next()
                .and_then(|li| selectors.reference.extract(li, normalizer)),
            ..OfferDraft::for_offer(offerid)
        };

        let secondary = block
            .select(&self.selectors.secondary)
            .next()
            .ok_or(SkipReason::SecondarySectionMissing)?;

        let updated = selectors.updated.extract(secondary, normalizer);
        let date_pub = updated
            .as_deref()
            .and_then(|text| parse_day_month_year(text, self.timezone));
        if date_pub.is_none() {
            debug!(offerid, updated = ?updated, "publication date missing or unparsable");
        }
        let draft = OfferDraft {
            date_add: Some(ctx.analyzed_at.timestamp()),
            date_pub,
            contract: selectors.contract.extract(block, normalizer),
            salary: selectors.salary.extract(block, normalizer),
            ..draft
        };

        let region = block
            .select(&self.selectors.region)
            .next()
            .ok_or(SkipReason::RegionMissing)?;
        let (department, location) = element_text(region)
            .map(|text| split_location(&text))
            .unwrap_or((None, None));

        let company = block
            .select(&self.selectors.company)
            .next()
            .and_then(element_text)
            .unwrap_or_else(|| COMPANY_NOT_AVAILABLE.to_string());

        Ok(OfferDraft {
            department,
            location,
            company: Some(company),
            state: Some(OfferState::Active),
            ..draft
        })
    }
}

fn nearest_row(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|ancestor| ancestor.value().name() == "tr")
}

#[async_trait]
impl JobBoard for PoleEmploi {
    fn name(&self) -> &'static str {
        BOARD_NAME
    }

    fn discover_urls(&self, feeds: &[CachedPage]) -> Vec<DiscoveredUrl> {
        feeds
            .iter()
            .flat_map(|feed| self.discover_in_feed(feed))
            .collect()
    }

    async fn ensure_schema(&self) -> Result<bool, AdapterError> {
        Ok(self.store.ensure_schema().await?)
    }

    async fn analyze_page(
        &self,
        ctx: &AnalysisContext,
        page: &CachedPage,
    ) -> Result<AnalysisOutcome, AdapterError> {
        // The policy is keyed by offer id, so a page without one never reaches it.
        let Some(offerid) = offer_id_from_url(&page.url) else {
            warn!(url = %page.url, "no offer id in page url");
            return Ok(AnalysisOutcome::Skipped(SkipReason::OfferIdMissing));
        };

        if !self.policy.must_analyze(&offerid, page) {
            return Ok(AnalysisOutcome::NotDue);
        }

        let draft = match self.extract_draft(ctx, page, &offerid) {
            Ok(draft) => draft,
            Err(reason) => {
                if reason == SkipReason::ContentBlockMissing {
                    self.disabler.disable(&offerid);
                }
                warn!(offerid = %offerid, url = %page.url, %reason, "offer page skipped");
                return Ok(AnalysisOutcome::Skipped(reason));
            }
        };

        let record = match draft.commit() {
            Ok(record) => record,
            Err(incomplete) => {
                warn!(offerid = %offerid, %incomplete, "offer not recorded");
                return Ok(AnalysisOutcome::Skipped(SkipReason::Incomplete(
                    incomplete.missing,
                )));
            }
        };

        let inserted = self.store.insert(&record).await?;
        debug!(offerid = %offerid, inserted, "offer recorded");
        Ok(AnalysisOutcome::Recorded { offerid, inserted })
    }

    async fn stored_offers(&self) -> Result<Vec<StoredOffer>, AdapterError> {
        Ok(self.store.fetch_all().await?)
    }

    fn build_offer(&self, row: &StoredOffer) -> Option<NormalizedOffer> {
        NormalizedOffer::from_stored(BOARD_NAME, row)
    }
}

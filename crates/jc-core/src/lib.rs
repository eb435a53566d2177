//! Core offer model and collaborator contracts for the job-board extractors.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jc-core";

/// Company placeholder used when the page names no hiring organization.
pub const COMPANY_NOT_AVAILABLE: &str = "NA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OfferState {
    Active,
    Inactive,
}

impl OfferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferState::Active => "ACTIVE",
            OfferState::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for OfferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feed or offer page as materialized by the fetch layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPage {
    pub pageid: String,
    pub url: String,
    pub content: String,
    pub lastupdate: i64,
    #[serde(default)]
    pub feedid: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl CachedPage {
    pub fn is_utf8(&self) -> bool {
        matches!(
            self.encoding.trim().to_ascii_lowercase().as_str(),
            "utf-8" | "utf8"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub run_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisContext {
    pub fn now() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            analyzed_at: Utc::now(),
        }
    }
}

/// Accumulates extracted fields for one page. Values are replaced by building a
/// new draft (`OfferDraft { title, ..draft }`) and only become a record through
/// [`OfferDraft::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferDraft {
    pub offerid: Option<String>,
    pub lastupdate: Option<i64>,
    pub reference: Option<String>,
    pub feedid: Option<String>,
    pub url: Option<String>,
    pub date_pub: Option<i64>,
    pub date_add: Option<i64>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub contract: Option<String>,
    pub location: Option<String>,
    pub department: Option<String>,
    pub salary: Option<String>,
    pub state: Option<OfferState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("incomplete offer record, missing: {}", .missing.join(", "))]
pub struct IncompleteRecord {
    pub missing: Vec<&'static str>,
}

impl OfferDraft {
    pub fn for_offer(offerid: impl Into<String>) -> Self {
        Self {
            offerid: Some(offerid.into()),
            ..Self::default()
        }
    }

    pub fn commit(self) -> Result<RawOfferRecord, IncompleteRecord> {
        let mut missing = Vec::new();

        let offerid = non_blank(self.offerid);
        let reference = non_blank(self.reference);
        let company = non_blank(self.company);
        let feedid = non_blank(self.feedid);
        let url = non_blank(self.url);

        for (name, present) in [
            ("offerid", offerid.is_some()),
            ("lastupdate", self.lastupdate.is_some()),
            ("ref", reference.is_some()),
            ("feedid", feedid.is_some()),
            ("url", url.is_some()),
            ("date_add", self.date_add.is_some()),
            ("company", company.is_some()),
            ("state", self.state.is_some()),
        ] {
            if !present {
                missing.push(name);
            }
        }

        match (
            offerid,
            self.lastupdate,
            reference,
            feedid,
            url,
            self.date_add,
            company,
            self.state,
        ) {
            (
                Some(offerid),
                Some(lastupdate),
                Some(reference),
                Some(feedid),
                Some(url),
                Some(date_add),
                Some(company),
                Some(state),
            ) => Ok(RawOfferRecord {
                offerid,
                lastupdate,
                reference,
                feedid,
                url,
                date_pub: self.date_pub,
                date_add,
                title: self.title,
                company,
                contract: self.contract,
                location: self.location,
                department: self.department,
                salary: self.salary,
                state,
            }),
            _ => Err(IncompleteRecord { missing }),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

/// A fully extracted offer that satisfies the completeness gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOfferRecord {
    pub offerid: String,
    pub lastupdate: i64,
    #[serde(rename = "ref")]
    pub reference: String,
    pub feedid: String,
    pub url: String,
    pub date_pub: Option<i64>,
    pub date_add: i64,
    pub title: Option<String>,
    pub company: String,
    pub contract: Option<String>,
    pub location: Option<String>,
    pub department: Option<String>,
    pub salary: Option<String>,
    pub state: OfferState,
}

/// One row of a board table. Every column is nullable at the storage level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOffer {
    pub offerid: Option<String>,
    pub lastupdate: Option<i64>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub feedid: Option<String>,
    pub url: Option<String>,
    pub date_pub: Option<i64>,
    pub date_add: Option<i64>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub contract: Option<String>,
    pub location: Option<String>,
    pub department: Option<String>,
    pub salary: Option<String>,
    pub state: Option<String>,
}

impl From<&RawOfferRecord> for StoredOffer {
    fn from(record: &RawOfferRecord) -> Self {
        Self {
            offerid: Some(record.offerid.clone()),
            lastupdate: Some(record.lastupdate),
            reference: Some(record.reference.clone()),
            feedid: Some(record.feedid.clone()),
            url: Some(record.url.clone()),
            date_pub: record.date_pub,
            date_add: Some(record.date_add),
            title: record.title.clone(),
            company: Some(record.company.clone()),
            contract: record.contract.clone(),
            location: record.location.clone(),
            department: record.department.clone(),
            salary: record.salary.clone(),
            state: Some(record.state.as_str().to_string()),
        }
    }
}

/// Cross-source offer projection handed to the rest of the aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedOffer {
    pub src: String,
    pub offerid: String,
    pub url: Option<String>,
    pub lastupdate: Option<i64>,
    #[serde(rename = "ref")]
    pub reference: String,
    pub feedid: Option<String>,
    pub title: Option<String>,
    pub company: String,
    pub contract: Option<String>,
    pub location: Option<String>,
    pub department: Option<String>,
    pub salary: Option<String>,
    pub date_pub: Option<i64>,
    pub date_add: Option<i64>,
    pub state: Option<String>,
}

impl NormalizedOffer {
    /// Copies a stored row as-is. Returns `None` unless offerid, ref and company
    /// are all present and non-blank.
    pub fn from_stored(src: &str, row: &StoredOffer) -> Option<Self> {
        if is_blank(&row.offerid) || is_blank(&row.reference) || is_blank(&row.company) {
            return None;
        }
        Some(Self {
            src: src.to_string(),
            offerid: row.offerid.clone()?,
            url: row.url.clone(),
            lastupdate: row.lastupdate,
            reference: row.reference.clone()?,
            feedid: row.feedid.clone(),
            title: row.title.clone(),
            company: row.company.clone()?,
            contract: row.contract.clone(),
            location: row.location.clone(),
            department: row.department.clone(),
            salary: row.salary.clone(),
            date_pub: row.date_pub,
            date_add: row.date_add,
            state: row.state.clone(),
        })
    }
}

/// Staleness decision owned by the host: should this page be (re-)analyzed?
///
/// Consulted only once the offer id has been read from the page URL; pages
/// without one are skipped before the policy runs.
pub trait AnalysisPolicy: Send + Sync {
    fn must_analyze(&self, offerid: &str, page: &CachedPage) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAnalyze;

impl AnalysisPolicy for AlwaysAnalyze {
    fn must_analyze(&self, _offerid: &str, _page: &CachedPage) -> bool {
        true
    }
}

/// Skips pages whose offer is already recorded.
#[derive(Debug, Default, Clone)]
pub struct SkipKnownOffers {
    known: HashSet<String>,
}

impl SkipKnownOffers {
    pub fn new(known: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: known.into_iter().collect(),
        }
    }
}

impl AnalysisPolicy for SkipKnownOffers {
    fn must_analyze(&self, offerid: &str, _page: &CachedPage) -> bool {
        !self.known.contains(offerid)
    }
}

/// Called when an offer page no longer carries its content block.
pub trait OfferDisabler: Send + Sync {
    fn disable(&self, offerid: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyDisabler;

impl OfferDisabler for LogOnlyDisabler {
    fn disable(&self, offerid: &str) {
        warn!(offerid, "offer content block gone; marking offer inactive");
    }
}

/// Turns an HTML snippet into plain text (entities decoded, tags dropped).
pub trait TextNormalizer: Send + Sync {
    fn to_text(&self, html: &str) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatcherConfig {
    pub database: PathBuf,
    pub cache_dir: PathBuf,
    pub utc_offset_secs: i32,
}

impl Default for CatcherConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("./jobcatcher.db"),
            cache_dir: PathBuf::from("./cache"),
            utc_offset_secs: 0,
        }
    }
}

impl CatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database: std::env::var("JC_DATABASE")
                .map(PathBuf::from)
                .unwrap_or(defaults.database),
            cache_dir: std::env::var("JC_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            utc_offset_secs: std::env::var("JC_UTC_OFFSET_SECS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.utc_offset_secs),
        }
    }

    /// Timezone used to interpret dates printed on pages. Out-of-range offsets
    /// fall back to UTC.
    pub fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }
}

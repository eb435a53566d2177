use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use jc_adapters::{
    discover_from_cache, run_analysis, AnalysisOutcome, JobBoard, PoleEmploi, SkipReason,
};
use jc_core::{
    AnalysisContext, AnalysisPolicy, CachedPage, CatcherConfig, OfferDisabler, SkipKnownOffers,
};
use jc_storage::{CacheKind, PageCache};
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

const OFFER_URL: &str = "http://candidat.pole-emploi.fr/candidat/rechercheoffres/detail/038XKLM";

#[derive(Clone, Default)]
struct RecordingDisabler {
    disabled: Arc<Mutex<Vec<String>>>,
}

impl RecordingDisabler {
    fn disabled(&self) -> Vec<String> {
        self.disabled.lock().expect("lock").clone()
    }
}

impl OfferDisabler for RecordingDisabler {
    fn disable(&self, offerid: &str) {
        self.disabled.lock().expect("lock").push(offerid.to_string());
    }
}

struct NeverAnalyze;

impl AnalysisPolicy for NeverAnalyze {
    fn must_analyze(&self, _offerid: &str, _page: &CachedPage) -> bool {
        false
    }
}

struct Harness {
    _dir: TempDir,
    board: PoleEmploi,
    disabler: RecordingDisabler,
}

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/pole-emploi/sample")
        .join(name)
}

fn fixture(name: &str) -> String {
    fs::read_to_string(fixture_path(name)).expect("read fixture")
}

fn offer_page(content: String) -> CachedPage {
    CachedPage {
        pageid: PageCache::page_id_for(OFFER_URL),
        url: OFFER_URL.to_string(),
        content,
        lastupdate: 1_457_190_000,
        feedid: Some("feed-1".to_string()),
        encoding: "utf-8".to_string(),
    }
}

fn ctx() -> AnalysisContext {
    AnalysisContext {
        run_id: Uuid::new_v4(),
        analyzed_at: Utc
            .with_ymd_and_hms(2016, 3, 6, 8, 0, 0)
            .single()
            .expect("ts"),
    }
}

async fn harness_with_offset(utc_offset_secs: i32) -> Harness {
    let dir = tempdir().expect("tempdir");
    let config = CatcherConfig {
        database: dir.path().join("jobcatcher.db"),
        cache_dir: dir.path().join("cache"),
        utc_offset_secs,
    };
    let disabler = RecordingDisabler::default();
    let board = PoleEmploi::new(&config)
        .expect("board")
        .with_disabler(Box::new(disabler.clone()));
    assert!(board.ensure_schema().await.expect("schema"));
    Harness {
        _dir: dir,
        board,
        disabler,
    }
}

async fn harness() -> Harness {
    harness_with_offset(0).await
}

async fn analyze(h: &Harness, content: String) -> AnalysisOutcome {
    h.board
        .analyze_page(&ctx(), &offer_page(content))
        .await
        .expect("analyze")
}

async fn row_count(h: &Harness) -> i64 {
    h.board.store().count().await.expect("count")
}

#[tokio::test]
async fn well_formed_offer_page_is_recorded() {
    let h = harness().await;
    let context = ctx();
    let outcome = h
        .board
        .analyze_page(&context, &offer_page(fixture("offer.html")))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        AnalysisOutcome::Recorded {
            offerid: "038XKLM".into(),
            inserted: true
        }
    );

    let rows = h.board.stored_offers().await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.offerid.as_deref(), Some("038XKLM"));
    assert_eq!(row.reference.as_deref(), Some("038XKLM"));
    assert_eq!(row.feedid.as_deref(), Some("feed-1"));
    assert_eq!(row.url.as_deref(), Some(OFFER_URL));
    assert_eq!(row.lastupdate, Some(1_457_190_000));
    assert_eq!(row.title.as_deref(), Some("Développeur Web H/F"));
    assert_eq!(
        row.contract.as_deref(),
        Some("CDI - Contrat à durée indéterminée")
    );
    assert_eq!(
        row.salary.as_deref(),
        Some("Annuel de 30000,00 € à 35000,00 €")
    );
    assert_eq!(row.department.as_deref(), Some("75"));
    assert_eq!(row.location.as_deref(), Some("PARIS 11"));
    assert_eq!(row.company.as_deref(), Some("ACME & Fils"));
    assert_eq!(row.date_pub, Some(1_457_136_000));
    assert_eq!(row.date_add, Some(context.analyzed_at.timestamp()));
    assert_eq!(row.state.as_deref(), Some("ACTIVE"));

    let offer = h.board.build_offer(row).expect("complete offer");
    assert_eq!(offer.src, "PoleEmploi");
    assert_eq!(offer.reference, "038XKLM");
    assert_eq!(offer.location.as_deref(), Some("PARIS 11"));
    assert!(h.disabler.disabled().is_empty());
}

#[tokio::test]
async fn publication_date_follows_configured_timezone() {
    let h = harness_with_offset(3600).await;
    analyze(&h, fixture("offer.html")).await;
    let rows = h.board.stored_offers().await.unwrap();
    assert_eq!(rows[0].date_pub, Some(1_457_132_400));
}

#[tokio::test]
async fn reanalysis_keeps_the_first_row() {
    let h = harness().await;
    analyze(&h, fixture("offer.html")).await;
    let changed = fixture("offer.html").replace("Développeur Web  H/F", "Intitulé modifié");
    let outcome = analyze(&h, changed).await;

    assert_eq!(
        outcome,
        AnalysisOutcome::Recorded {
            offerid: "038XKLM".into(),
            inserted: false
        }
    );
    let rows = h.board.stored_offers().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].title.as_deref(), Some("Développeur Web H/F"));
}

#[tokio::test]
async fn missing_title_stops_without_writing_or_disabling() {
    let h = harness().await;
    let page = fixture("offer.html").replace(r#"<h4 itemprop="title">Développeur Web  H/F</h4>"#, "");
    assert_eq!(
        analyze(&h, page).await,
        AnalysisOutcome::Skipped(SkipReason::TitleMissing)
    );
    assert_eq!(row_count(&h).await, 0);
    assert!(h.disabler.disabled().is_empty());
}

#[tokio::test]
async fn missing_content_block_disables_the_offer() {
    let h = harness().await;
    let page = fixture("offer.html").replace(r#"class="block-content""#, r#"class="block-gone""#);
    assert_eq!(
        analyze(&h, page).await,
        AnalysisOutcome::Skipped(SkipReason::ContentBlockMissing)
    );
    assert_eq!(row_count(&h).await, 0);
    assert_eq!(h.disabler.disabled(), vec!["038XKLM".to_string()]);
}

#[tokio::test]
async fn missing_secondary_section_or_region_stops_analysis() {
    let h = harness().await;

    let no_secondary = fixture("offer.html").replace(r#"class="secondary""#, r#"class="tertiary""#);
    assert_eq!(
        analyze(&h, no_secondary).await,
        AnalysisOutcome::Skipped(SkipReason::SecondarySectionMissing)
    );

    let no_region = fixture("offer.html").replace(r#"itemprop="addressRegion""#, r#"itemprop="address""#);
    assert_eq!(
        analyze(&h, no_region).await,
        AnalysisOutcome::Skipped(SkipReason::RegionMissing)
    );

    assert_eq!(row_count(&h).await, 0);
    assert!(h.disabler.disabled().is_empty());
}

#[tokio::test]
async fn offer_without_reference_is_never_persisted() {
    let h = harness().await;
    let page = fixture("offer.html").replace(r#"class="primary""#, r#"class="summary""#);
    assert_eq!(
        analyze(&h, page).await,
        AnalysisOutcome::Skipped(SkipReason::Incomplete(vec!["ref"]))
    );
    assert_eq!(row_count(&h).await, 0);
}

#[tokio::test]
async fn optional_fields_are_tolerated() {
    let h = harness().await;
    let page = fixture("offer.html")
        .replace(r#"<p itemprop="hiringOrganization">ACME &amp; Fils</p>"#, "")
        .replace("Salaire indicatif", "Qualification")
        .replace("05/03/2016", "bientôt")
        .replace("75 - PARIS 11", "Remote");
    assert_eq!(
        analyze(&h, page).await,
        AnalysisOutcome::Recorded {
            offerid: "038XKLM".into(),
            inserted: true
        }
    );

    let rows = h.board.stored_offers().await.unwrap();
    let row = &rows[0];
    assert_eq!(row.company.as_deref(), Some("NA"));
    assert_eq!(row.salary, None);
    assert_eq!(row.date_pub, None);
    assert_eq!(row.department, None);
    assert_eq!(row.location.as_deref(), Some("Remote"));
    assert!(h.board.build_offer(row).is_some());
}

#[tokio::test]
async fn known_offers_are_not_analyzed_again() {
    let dir = tempdir().expect("tempdir");
    let config = CatcherConfig {
        database: dir.path().join("jobcatcher.db"),
        ..CatcherConfig::default()
    };
    let board = PoleEmploi::new(&config)
        .unwrap()
        .with_policy(Box::new(SkipKnownOffers::new(vec!["038XKLM".to_string()])));
    board.ensure_schema().await.unwrap();

    let outcome = board
        .analyze_page(&ctx(), &offer_page(fixture("offer.html")))
        .await
        .unwrap();
    assert_eq!(outcome, AnalysisOutcome::NotDue);
    assert_eq!(board.store().count().await.unwrap(), 0);
}

#[tokio::test]
async fn page_url_without_offer_id_is_skipped() {
    let h = harness().await;
    let mut page = offer_page(fixture("offer.html"));
    page.url = "http://candidat.pole-emploi.fr/candidat/rechercheoffres/detail/".into();
    let outcome = h.board.analyze_page(&ctx(), &page).await.unwrap();
    assert_eq!(outcome, AnalysisOutcome::Skipped(SkipReason::OfferIdMissing));
    assert_eq!(row_count(&h).await, 0);
}

#[tokio::test]
async fn missing_offer_id_is_reported_before_the_policy_runs() {
    let dir = tempdir().expect("tempdir");
    let config = CatcherConfig {
        database: dir.path().join("jobcatcher.db"),
        ..CatcherConfig::default()
    };
    let board = PoleEmploi::new(&config)
        .unwrap()
        .with_policy(Box::new(NeverAnalyze));
    board.ensure_schema().await.unwrap();

    let mut page = offer_page(fixture("offer.html"));
    page.url = "http://candidat.pole-emploi.fr/candidat/rechercheoffres/detail/".into();
    let outcome = board.analyze_page(&ctx(), &page).await.unwrap();
    assert_eq!(outcome, AnalysisOutcome::Skipped(SkipReason::OfferIdMissing));

    let outcome = board
        .analyze_page(&ctx(), &offer_page(fixture("offer.html")))
        .await
        .unwrap();
    assert_eq!(outcome, AnalysisOutcome::NotDue);
    assert_eq!(board.store().count().await.unwrap(), 0);
}

#[tokio::test]
async fn cached_feeds_yield_detail_urls_in_document_order() {
    let dir = tempdir().expect("tempdir");
    let cache = PageCache::new(dir.path().join("cache"));
    let feed_url = "http://candidat.pole-emploi.fr/candidat/rechercheoffres/resultats/A__COMMUNE_75056";
    let feed = CachedPage {
        pageid: PageCache::page_id_for(feed_url),
        url: feed_url.to_string(),
        content: fixture("feed.html"),
        lastupdate: 1_457_190_000,
        feedid: None,
        encoding: "utf-8".to_string(),
    };
    cache
        .store_page("PoleEmploi", CacheKind::Feed, &feed)
        .await
        .unwrap();

    let board = PoleEmploi::new(&CatcherConfig {
        database: dir.path().join("jobcatcher.db"),
        ..CatcherConfig::default()
    })
    .unwrap();
    let urls = discover_from_cache(&board, &cache).await.unwrap();

    let got: Vec<_> = urls.iter().map(|u| u.url.as_str()).collect();
    assert_eq!(
        got,
        vec![
            "http://candidat.pole-emploi.fr/candidat/rechercheoffres/detail/038XKLM",
            "http://candidat.pole-emploi.fr/candidat/rechercheoffres/detail/039ABCD",
            "http://candidat.pole-emploi.fr/candidat/rechercheoffres/detail/040EFGH",
        ]
    );
    assert!(urls.iter().all(|u| u.feed_id == feed.pageid));
}

#[tokio::test]
async fn run_summary_counts_every_outcome() {
    let h = harness().await;
    let pages = vec![
        offer_page(fixture("offer.html")),
        offer_page(fixture("offer.html")),
        offer_page(fixture("offer.html").replace(r#"itemprop="title""#, r#"itemprop="name""#)),
    ];
    let summary = run_analysis(&h.board, &ctx(), &pages).await.unwrap();

    assert_eq!(summary.pages, 3);
    assert_eq!(summary.recorded, 1);
    assert_eq!(summary.already_stored, 1);
    assert_eq!(summary.skipped.get("title_missing"), Some(&1));
    assert_eq!(row_count(&h).await, 1);
}

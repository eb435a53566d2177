//! Cached page files + per-board offer tables.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use jc_core::{CachedPage, RawOfferRecord, StoredOffer};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, FromRow};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jc-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Feed,
    Page,
}

impl CacheKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheKind::Feed => "feeds",
            CacheKind::Page => "pages",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CacheKind::Feed => "feed",
            CacheKind::Page => "page",
        }
    }
}

/// Directory of pages previously fetched for each board, laid out as
/// `<root>/<board>/{feeds,pages}/<pageid>.{feed,page}`.
#[derive(Debug, Clone)]
pub struct PageCache {
    root: PathBuf,
}

impl PageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_id_for(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(&self, board: &str, kind: CacheKind, pageid: &str) -> PathBuf {
        PathBuf::from(board)
            .join(kind.dir_name())
            .join(format!("{pageid}.{}", kind.extension()))
    }

    /// Write a page with a temp-file rename so readers never see a partial file.
    /// A page already cached under the same id is replaced.
    pub async fn store_page(
        &self,
        board: &str,
        kind: CacheKind,
        page: &CachedPage,
    ) -> anyhow::Result<PathBuf> {
        let absolute_path = self.root.join(self.relative_path(board, kind, &page.pageid));
        let Some(parent) = absolute_path.parent() else {
            bail!("cache path {} has no parent", absolute_path.display());
        };
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let bytes = serde_json::to_vec(page).context("serializing cached page")?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp cache file {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(absolute_path)
    }

    pub async fn load_feeds(&self, board: &str) -> anyhow::Result<Vec<CachedPage>> {
        self.load_all(board, CacheKind::Feed).await
    }

    pub async fn load_pages(&self, board: &str) -> anyhow::Result<Vec<CachedPage>> {
        self.load_all(board, CacheKind::Page).await
    }

    /// Loads every cached file of one kind, ordered by file name. A missing
    /// directory is an empty cache. Pages cached in an encoding other than
    /// UTF-8 are logged and left out.
    pub async fn load_all(&self, board: &str, kind: CacheKind) -> anyhow::Result<Vec<CachedPage>> {
        let dir = self.root.join(board).join(kind.dir_name());
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking cache directory {}", dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(kind.extension()) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut pages = Vec::with_capacity(paths.len());
        for path in paths {
            let page = read_cached_page(&path).await?;
            if !page.is_utf8() {
                warn!(
                    board,
                    path = %path.display(),
                    encoding = %page.encoding,
                    "skipping cached page with unsupported encoding"
                );
                continue;
            }
            pages.push(page);
        }
        Ok(pages)
    }
}

async fn read_cached_page(path: &Path) -> anyhow::Result<CachedPage> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid table name {0:?}")]
    InvalidTableName(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const COLUMNS: &str = "offerid, lastupdate, ref, feedid, url, date_pub, date_add, title, \
                       company, contract, location, department, salary, state";

/// Owner of one board's `jb_<board>` table. Every operation opens its own
/// connection and closes it before returning.
#[derive(Debug, Clone)]
pub struct RecordStore {
    options: SqliteConnectOptions,
    table: String,
}

#[derive(Debug, FromRow)]
struct OfferRow {
    offerid: Option<String>,
    lastupdate: Option<i64>,
    #[sqlx(rename = "ref")]
    reference: Option<String>,
    feedid: Option<String>,
    url: Option<String>,
    date_pub: Option<i64>,
    date_add: Option<i64>,
    title: Option<String>,
    company: Option<String>,
    contract: Option<String>,
    location: Option<String>,
    department: Option<String>,
    salary: Option<String>,
    state: Option<String>,
}

impl From<OfferRow> for StoredOffer {
    fn from(row: OfferRow) -> Self {
        Self {
            offerid: row.offerid,
            lastupdate: row.lastupdate,
            reference: row.reference,
            feedid: row.feedid,
            url: row.url,
            date_pub: row.date_pub,
            date_add: row.date_add,
            title: row.title,
            company: row.company,
            contract: row.contract,
            location: row.location,
            department: row.department,
            salary: row.salary,
            state: row.state,
        }
    }
}

impl RecordStore {
    pub fn new(database: impl AsRef<Path>, board: &str) -> Result<Self, StoreError> {
        let table = format!("jb_{board}");
        if board.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::InvalidTableName(table));
        }
        let options = SqliteConnectOptions::new()
            .filename(database.as_ref())
            .create_if_missing(true);
        Ok(Self { options, table })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    async fn connect(&self) -> Result<SqliteConnection, StoreError> {
        Ok(SqliteConnection::connect_with(&self.options).await?)
    }

    async fn release(&self, conn: SqliteConnection) {
        if let Err(err) = conn.close().await {
            warn!(table = %self.table, %err, "closing sqlite connection failed");
        }
    }

    pub async fn table_exists(&self) -> Result<bool, StoreError> {
        let mut conn = self.connect().await?;
        let result = table_exists_on(&mut conn, &self.table).await;
        self.release(conn).await;
        result
    }

    /// Creates the table when it is not there yet. Returns whether it was created.
    pub async fn ensure_schema(&self) -> Result<bool, StoreError> {
        let mut conn = self.connect().await?;
        let result = create_table_on(&mut conn, &self.table).await;
        self.release(conn).await;
        if let Ok(true) = result {
            debug!(table = %self.table, "created offer table");
        }
        result
    }

    /// Inserts a record once. Returns `false` when the offer id is already stored;
    /// the existing row is left untouched.
    pub async fn insert(&self, record: &RawOfferRecord) -> Result<bool, StoreError> {
        let mut conn = self.connect().await?;
        let sql = format!(
            "INSERT INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(&record.offerid)
            .bind(record.lastupdate)
            .bind(&record.reference)
            .bind(&record.feedid)
            .bind(&record.url)
            .bind(record.date_pub)
            .bind(record.date_add)
            .bind(record.title.as_deref())
            .bind(&record.company)
            .bind(record.contract.as_deref())
            .bind(record.location.as_deref())
            .bind(record.department.as_deref())
            .bind(record.salary.as_deref())
            .bind(record.state.as_str())
            .execute(&mut conn)
            .await;
        self.release(conn).await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                debug!(offerid = %record.offerid, table = %self.table, "offer already recorded");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn contains(&self, offerid: &str) -> Result<bool, StoreError> {
        let mut conn = self.connect().await?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE offerid = ?", self.table);
        let result = sqlx::query_scalar::<_, i64>(&sql)
            .bind(offerid)
            .fetch_one(&mut conn)
            .await;
        self.release(conn).await;
        Ok(result? > 0)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let mut conn = self.connect().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let result = sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut conn).await;
        self.release(conn).await;
        Ok(result?)
    }

    pub async fn fetch_all(&self) -> Result<Vec<StoredOffer>, StoreError> {
        let mut conn = self.connect().await?;
        let sql = format!("SELECT {COLUMNS} FROM {} ORDER BY rowid", self.table);
        let result = sqlx::query_as::<_, OfferRow>(&sql)
            .fetch_all(&mut conn)
            .await;
        self.release(conn).await;
        Ok(result?.into_iter().map(StoredOffer::from).collect())
    }
}

async fn table_exists_on(conn: &mut SqliteConnection, table: &str) -> Result<bool, StoreError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

async fn create_table_on(conn: &mut SqliteConnection, table: &str) -> Result<bool, StoreError> {
    if table_exists_on(conn, table).await? {
        return Ok(false);
    }
    let sql = format!(
        "CREATE TABLE {table}(\
         offerid TEXT, \
         lastupdate INTEGER, \
         ref TEXT, \
         feedid TEXT, \
         url TEXT, \
         date_pub INTEGER, \
         date_add INTEGER, \
         title TEXT, \
         company TEXT, \
         contract TEXT, \
         location TEXT, \
         department TEXT, \
         salary TEXT, \
         state TEXT, \
         PRIMARY KEY(offerid))"
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(true)
}

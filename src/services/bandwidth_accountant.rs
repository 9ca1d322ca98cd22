//! src/services/bandwidth_accountant.rs
//!
//! BandwidthAccountant - attributes a day's CDN traffic to accounts.
//!
//! Every gzip-compressed access log for the day is parsed, each hit on an
//! `/i/<ID>.<ext>` path is resolved to the object's owner, and one record per
//! account is written for the day. Records replace earlier totals, so running
//! the same day again yields the same numbers.

use crate::{
    models::object::IDENTIFIER_LEN,
    services::metadata_store::MetadataStore,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use std::{
    collections::HashMap,
    io::{self, BufRead, BufReader},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Path segment that precedes the identifier in public URLs.
pub const PATH_MARKER: &str = "i";

/// Minimum tab-separated fields on a usable line.
const MIN_FIELDS: usize = 15;
const BYTES_FIELD: usize = 3;
const URI_FIELD: usize = 7;

#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("listing access logs: {0}")]
    ListLogs(#[source] io::Error),
}

/// Where access logs come from.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Names of the log objects for `day`.
    async fn list(&self, day: NaiveDate) -> io::Result<Vec<String>>;

    async fn fetch(&self, name: &str) -> io::Result<Bytes>;
}

/// Logs delivered as files into one directory, named
/// `<prefix>...YYYY-MM-DD...`.
#[derive(Debug, Clone)]
pub struct DirLogSource {
    dir: PathBuf,
    prefix: String,
}

impl DirLogSource {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl LogSource for DirLogSource {
    async fn list(&self, day: NaiveDate) -> io::Result<Vec<String>> {
        let stamp = day.format("%Y-%m-%d").to_string();
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&self.prefix) && name.contains(&stamp) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn fetch(&self, name: &str) -> io::Result<Bytes> {
        if name.contains('/') || name.contains("..") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid log name `{name}`"),
            ));
        }
        fs::read(self.dir.join(name)).await.map(Bytes::from)
    }
}

/// One hit on an object path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHit {
    pub identifier: String,
    pub bytes: i64,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct AccountingReport {
    pub day: Option<NaiveDate>,
    pub files_processed: usize,
    pub files_skipped: usize,
    pub hits_attributed: u64,
    pub hits_unresolved: u64,
    /// Hits dropped because the owner lookup failed.
    pub hits_failed: u64,
    pub records_updated: usize,
    pub records_failed: usize,
    /// One message per failed lookup or write, in the order they happened.
    pub errors: Vec<String>,
}

impl AccountingReport {
    /// True when some hit or record could not be accounted for.
    pub fn has_failures(&self) -> bool {
        self.hits_failed > 0 || self.records_failed > 0
    }
}

pub struct BandwidthAccountant {
    metadata: MetadataStore,
    logs: Arc<dyn LogSource>,
}

impl BandwidthAccountant {
    pub fn new(metadata: MetadataStore, logs: Arc<dyn LogSource>) -> Self {
        Self { metadata, logs }
    }

    pub async fn process(&self, day: NaiveDate) -> Result<AccountingReport, AccountingError> {
        let mut report = AccountingReport {
            day: Some(day),
            ..Default::default()
        };
        let names = self.logs.list(day).await.map_err(AccountingError::ListLogs)?;
        info!(%day, files = names.len(), "processing access logs");

        let mut owners: HashMap<String, Option<Uuid>> = HashMap::new();
        let mut totals: HashMap<Uuid, (i64, i64)> = HashMap::new();

        for name in &names {
            let hits = match self.read_log(name).await {
                Ok(hits) => hits,
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping unreadable access log");
                    report.files_skipped += 1;
                    continue;
                }
            };

            for hit in hits {
                let owner = match owners.get(&hit.identifier) {
                    Some(owner) => *owner,
                    None => match self.metadata.resolve_owner(&hit.identifier).await {
                        Ok(owner) => {
                            owners.insert(hit.identifier.clone(), owner);
                            owner
                        }
                        Err(err) => {
                            warn!(object = %hit.identifier, error = %err, "owner lookup failed");
                            report.hits_failed += 1;
                            report
                                .errors
                                .push(format!("resolving {}: {}", hit.identifier, err));
                            continue;
                        }
                    },
                };
                match owner {
                    Some(account) => {
                        let entry = totals.entry(account).or_insert((0, 0));
                        entry.0 += hit.bytes;
                        entry.1 += 1;
                        report.hits_attributed += 1;
                    }
                    None => report.hits_unresolved += 1,
                }
            }
            report.files_processed += 1;
        }

        for (account, (bytes, requests)) in &totals {
            match self
                .metadata
                .upsert_bandwidth(*account, day, *bytes, *requests)
                .await
            {
                Ok(()) => {
                    report.records_updated += 1;
                    debug!(%account, %day, bytes, requests, "recorded bandwidth");
                }
                Err(err) => {
                    warn!(%account, %day, error = %err, "failed to record bandwidth");
                    report.records_failed += 1;
                    report.errors.push(format!("recording {}: {}", account, err));
                }
            }
        }

        info!(
            %day,
            processed = report.files_processed,
            skipped = report.files_skipped,
            records = report.records_updated,
            failed = report.records_failed,
            unresolved = report.hits_unresolved,
            "bandwidth accounting finished"
        );
        Ok(report)
    }

    async fn read_log(&self, name: &str) -> io::Result<Vec<LogHit>> {
        let raw = self.logs.fetch(name).await?;
        tokio::task::spawn_blocking(move || parse_log(&raw))
            .await
            .map_err(io::Error::other)?
    }
}

/// Decompress and parse one log, including every member of a concatenated
/// gzip stream. Only decompression or read errors reject the file; lines
/// that are not valid UTF-8 are decoded lossily and parsed like any other.
pub fn parse_log(compressed: &[u8]) -> io::Result<Vec<LogHit>> {
    let reader = BufReader::new(MultiGzDecoder::new(compressed));
    let mut hits = Vec::new();
    for line in reader.split(b'\n') {
        let line = line?;
        let text = String::from_utf8_lossy(&line);
        if let Some(hit) = parse_line(text.trim_end_matches('\r')) {
            hits.push(hit);
        }
    }
    Ok(hits)
}

fn parse_line(line: &str) -> Option<LogHit> {
    if line.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < MIN_FIELDS {
        return None;
    }
    let bytes = fields[BYTES_FIELD].trim().parse::<i64>().ok()?;
    let identifier = parse_object_path(fields[URI_FIELD])?;
    Some(LogHit { identifier, bytes })
}

/// `/i/<ID>.<ext>` in any case → uppercase identifier.
pub fn parse_object_path(path: &str) -> Option<String> {
    let mut segments = path.strip_prefix('/')?.split('/');
    let (marker, file) = (segments.next()?, segments.next()?);
    if segments.next().is_some() || !marker.eq_ignore_ascii_case(PATH_MARKER) {
        return None;
    }
    let (id, ext) = file.split_once('.')?;
    if id.len() != IDENTIFIER_LEN
        || !id.bytes().all(|b| b.is_ascii_alphanumeric())
        || ext.is_empty()
        || !ext.bytes().all(|b| b.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(id.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::Plan;
    use crate::services::metadata_store::testing::{memory_store, object_record};
    use chrono::Utc;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;
    use tempfile::TempDir;

    const HEADER: &str = "#Version: 1.0\n#Fields: date time x-edge-location sc-bytes c-ip cs-method cs(Host) cs-uri-stem sc-status cs(Referer) cs(User-Agent) cs-uri-query cs(Cookie) x-edge-result-type x-edge-request-id\n";

    fn line(bytes: i64, uri: &str) -> String {
        format!(
            "2026-10-17\t12:00:00\tFRA56-C1\t{bytes}\t198.51.100.4\tGET\tcdn.example.com\t{uri}\t200\t-\tcurl/8.0\t-\t-\tHit\tabc123\n"
        )
    }

    /// The same line with a user agent that is not valid UTF-8.
    fn with_raw_agent(line: &str) -> Vec<u8> {
        let (head, tail) = line.split_once("curl/8.0").unwrap();
        [head.as_bytes(), &b"agent\xff\xfe"[..], tail.as_bytes()].concat()
    }

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    #[test]
    fn test_parse_object_path() {
        let id = "0192F0C4A1B27C3D8E9F001122334455";
        assert_eq!(parse_object_path(&format!("/i/{id}.jpg")), Some(id.to_string()));
        assert_eq!(
            parse_object_path(&format!("/I/{}.PNG", id.to_lowercase())),
            Some(id.to_string())
        );
        assert_eq!(parse_object_path(&format!("/x/{id}.jpg")), None);
        assert_eq!(parse_object_path(&format!("/i/{id}")), None);
        assert_eq!(parse_object_path(&format!("/i/{id}.")), None);
        assert_eq!(parse_object_path("/i/SHORT.jpg"), None);
        assert_eq!(parse_object_path(&format!("/i/a/{id}.jpg")), None);
        assert_eq!(parse_object_path(&format!("i/{id}.jpg")), None);
        assert_eq!(parse_object_path("/favicon.ico"), None);
    }

    #[test]
    fn test_parse_log_skips_comments_and_short_lines() {
        let id = "0192F0C4A1B27C3D8E9F001122334455";
        let text = format!(
            "{HEADER}{}short\tline\n{}{}",
            line(100, &format!("/i/{id}.jpg")),
            line(50, "/index.html"),
            line(25, &format!("/i/{}.jpg", id.to_lowercase())),
        );
        let hits = parse_log(&gzip(&text)).unwrap();
        assert_eq!(
            hits,
            vec![
                LogHit { identifier: id.into(), bytes: 100 },
                LogHit { identifier: id.into(), bytes: 25 },
            ]
        );
        assert!(parse_log(b"definitely not gzip").is_err());
    }

    #[test]
    fn test_parse_log_tolerates_invalid_utf8_lines() {
        let id = "0192F0C4A1B27C3D8E9F001122334455";
        let mut raw = HEADER.as_bytes().to_vec();
        raw.extend_from_slice(line(1000, &format!("/i/{id}.png")).as_bytes());
        raw.extend(with_raw_agent(&line(5, "/index.html")));
        raw.extend_from_slice(line(20, &format!("/i/{id}.png")).replace('\n', "\r\n").as_bytes());

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let hits = parse_log(&encoder.finish().unwrap()).unwrap();
        assert_eq!(
            hits,
            vec![
                LogHit { identifier: id.into(), bytes: 1000 },
                LogHit { identifier: id.into(), bytes: 20 },
            ]
        );
    }

    #[test]
    fn test_parse_log_reads_every_gzip_member() {
        let id = "0192F0C4A1B27C3D8E9F001122334455";
        let mut joined = gzip(&format!("{HEADER}{}", line(7, &format!("/i/{id}.gif"))));
        joined.extend(gzip(&line(9, &format!("/i/{id}.gif"))));
        let hits = parse_log(&joined).unwrap();
        assert_eq!(hits.iter().map(|h| h.bytes).collect::<Vec<_>>(), vec![7, 9]);
    }

    struct Fixture {
        dir: TempDir,
        metadata: MetadataStore,
        accountant: BandwidthAccountant,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let metadata = memory_store().await;
        let accountant = BandwidthAccountant::new(
            metadata.clone(),
            Arc::new(DirLogSource::new(dir.path(), "E2ABC.")),
        );
        Fixture {
            dir,
            metadata,
            accountant,
        }
    }

    fn write_log(fx: &Fixture, name: &str, body: &[u8]) {
        std::fs::write(fx.dir.path().join(name), body).unwrap();
    }

    #[tokio::test]
    async fn test_reprocessing_a_day_is_idempotent() {
        let fx = fixture().await;
        let a = fx.metadata.create_account("a", Plan::Trial).await.unwrap();
        let b = fx.metadata.create_account("b", Plan::Pro).await.unwrap();
        let obj_a = object_record(a.id, 10, Utc::now());
        let obj_b = object_record(b.id, 10, Utc::now());
        fx.metadata.insert_object(&obj_a).await.unwrap();
        fx.metadata.insert_object(&obj_b).await.unwrap();

        let first = format!(
            "{HEADER}{}{}",
            line(1000, &format!("/i/{}.png", obj_a.id)),
            line(500, &format!("/i/{}.png", obj_b.id)),
        );
        let second = format!("{HEADER}{}", line(300, &format!("/i/{}.png", obj_a.id)));
        write_log(&fx, "E2ABC.2026-10-17-12.aaaa.gz", &gzip(&first));
        write_log(&fx, "E2ABC.2026-10-17-13.bbbb.gz", &gzip(&second));
        write_log(&fx, "E2ABC.2026-10-18-00.cccc.gz", &gzip(&second));

        for _ in 0..2 {
            let report = fx.accountant.process(day()).await.unwrap();
            assert_eq!(report.files_processed, 2);
            assert_eq!(report.records_updated, 2);

            let rec_a = fx.metadata.bandwidth_record(a.id, day()).await.unwrap().unwrap();
            assert_eq!((rec_a.bytes_served, rec_a.request_count), (1300, 2));
            let rec_b = fx.metadata.bandwidth_record(b.id, day()).await.unwrap().unwrap();
            assert_eq!((rec_b.bytes_served, rec_b.request_count), (500, 1));
        }
    }

    #[tokio::test]
    async fn test_unknown_identifier_contributes_nothing() {
        let fx = fixture().await;
        let a = fx.metadata.create_account("a", Plan::Trial).await.unwrap();
        let obj = object_record(a.id, 10, Utc::now());
        fx.metadata.insert_object(&obj).await.unwrap();

        let text = format!(
            "{HEADER}{}{}",
            line(777, "/i/0192F0C4A1B27C3D8E9F001122334455.jpg"),
            line(40, &format!("/i/{}.png", obj.id)),
        );
        write_log(&fx, "E2ABC.2026-10-17-09.dddd.gz", &gzip(&text));

        let report = fx.accountant.process(day()).await.unwrap();
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.hits_unresolved, 1);
        assert_eq!(report.records_updated, 1);
        let rec = fx.metadata.bandwidth_record(a.id, day()).await.unwrap().unwrap();
        assert_eq!(rec.bytes_served, 40);
    }

    #[tokio::test]
    async fn test_deleted_objects_are_not_attributed() {
        let fx = fixture().await;
        let a = fx.metadata.create_account("a", Plan::Trial).await.unwrap();
        let obj = object_record(a.id, 10, Utc::now());
        fx.metadata.insert_object(&obj).await.unwrap();
        fx.metadata
            .soft_delete_object(&obj.id, a.id, Utc::now())
            .await
            .unwrap();

        let text = format!("{HEADER}{}", line(40, &format!("/i/{}.png", obj.id)));
        write_log(&fx, "E2ABC.2026-10-17-09.eeee.gz", &gzip(&text));

        let report = fx.accountant.process(day()).await.unwrap();
        assert_eq!(report.records_updated, 0);
        assert!(fx.metadata.bandwidth_record(a.id, day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped() {
        let fx = fixture().await;
        let a = fx.metadata.create_account("a", Plan::Starter).await.unwrap();
        let obj = object_record(a.id, 10, Utc::now());
        fx.metadata.insert_object(&obj).await.unwrap();

        let good = format!("{HEADER}{}", line(64, &format!("/i/{}.png", obj.id)));
        write_log(&fx, "E2ABC.2026-10-17-01.good.gz", &gzip(&good));
        // flip a byte of the CRC trailer
        let mut damaged = gzip(&good);
        let crc_at = damaged.len() - 8;
        damaged[crc_at] ^= 0xFF;
        write_log(&fx, "E2ABC.2026-10-17-02.bad.gz", &damaged);
        write_log(&fx, "E2ABC.2026-10-17-03.junk.gz", b"plain text, not gzip");

        let report = fx.accountant.process(day()).await.unwrap();
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.files_skipped, 2);
        let rec = fx.metadata.bandwidth_record(a.id, day()).await.unwrap().unwrap();
        assert_eq!(rec.bytes_served, 64);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_the_rest_of_the_file() {
        let fx = fixture().await;
        let a = fx.metadata.create_account("a", Plan::Trial).await.unwrap();
        let obj = object_record(a.id, 10, Utc::now());
        fx.metadata.insert_object(&obj).await.unwrap();

        let mut raw = format!("{HEADER}{}", line(1000, &format!("/i/{}.png", obj.id))).into_bytes();
        raw.extend(with_raw_agent(&line(50, &format!("/i/{}.png", obj.id))));
        raw.extend_from_slice(b"#note \xff\xfe\n");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        write_log(&fx, "E2ABC.2026-10-17-04.utf8.gz", &encoder.finish().unwrap());

        let report = fx.accountant.process(day()).await.unwrap();
        assert_eq!((report.files_processed, report.files_skipped), (1, 0));
        let rec = fx.metadata.bandwidth_record(a.id, day()).await.unwrap().unwrap();
        assert_eq!((rec.bytes_served, rec.request_count), (1050, 2));
    }

    #[tokio::test]
    async fn test_failed_record_does_not_stop_other_accounts() {
        let fx = fixture().await;
        let a = fx.metadata.create_account("a", Plan::Trial).await.unwrap();
        let b = fx.metadata.create_account("b", Plan::Pro).await.unwrap();
        let obj_a = object_record(a.id, 10, Utc::now());
        let obj_b = object_record(b.id, 10, Utc::now());
        fx.metadata.insert_object(&obj_a).await.unwrap();
        fx.metadata.insert_object(&obj_b).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_account_a BEFORE INSERT ON bandwidth_stats
             WHEN NEW.account_id = (SELECT id FROM accounts WHERE api_key = 'a')
             BEGIN SELECT RAISE(ABORT, 'stats unavailable'); END",
        )
        .execute(&*fx.metadata.db)
        .await
        .unwrap();

        let text = format!(
            "{HEADER}{}{}",
            line(1000, &format!("/i/{}.png", obj_a.id)),
            line(500, &format!("/i/{}.png", obj_b.id)),
        );
        write_log(&fx, "E2ABC.2026-10-17-05.ffff.gz", &gzip(&text));

        // map iteration order varies, so repeat to cover both orders
        for _ in 0..5 {
            let report = fx.accountant.process(day()).await.unwrap();
            assert_eq!(report.records_updated, 1);
            assert_eq!(report.records_failed, 1);
            assert_eq!(report.errors.len(), 1);
            assert!(report.has_failures());
            assert!(fx.metadata.bandwidth_record(a.id, day()).await.unwrap().is_none());
            let rec = fx.metadata.bandwidth_record(b.id, day()).await.unwrap().unwrap();
            assert_eq!(rec.bytes_served, 500);
        }
    }

    #[tokio::test]
    async fn test_failed_owner_lookup_is_counted_not_fatal() {
        let fx = fixture().await;
        let a = fx.metadata.create_account("a", Plan::Trial).await.unwrap();
        let obj = object_record(a.id, 10, Utc::now());
        fx.metadata.insert_object(&obj).await.unwrap();
        sqlx::query("ALTER TABLE objects RENAME TO objects_moved")
            .execute(&*fx.metadata.db)
            .await
            .unwrap();

        let text = format!("{HEADER}{}", line(40, &format!("/i/{}.png", obj.id)));
        write_log(&fx, "E2ABC.2026-10-17-06.gggg.gz", &gzip(&text));

        let report = fx.accountant.process(day()).await.unwrap();
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.hits_failed, 1);
        assert_eq!(report.hits_attributed, 0);
        assert_eq!(report.records_updated, 0);
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn test_missing_log_directory_is_an_error() {
        let metadata = memory_store().await;
        let accountant = BandwidthAccountant::new(
            metadata,
            Arc::new(DirLogSource::new("/nonexistent/image-vault-logs", "E2ABC.")),
        );
        let err = accountant.process(day()).await.unwrap_err();
        assert!(matches!(err, AccountingError::ListLogs(_)));
    }
}

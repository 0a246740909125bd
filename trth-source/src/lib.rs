// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Object-store client for LSEG/TRTH daily trade files.
//!
//! Resolves `(exchange, date)` to the vendor's merged NORMALIZEDMP csv.gz
//! blob and yields a streaming, header-keyed record sequence. Decompression
//! is streaming; a day's file can be multiple GB uncompressed and must never
//! be buffered whole.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::Client;
use chrono::NaiveDate;
use core_types::config::ObjectStoreConfig;
use core_types::error::{Classify, FailureKind};
use core_types::retry::RetryPolicy;
use core_types::types::Exchange;
use csv_async::{AsyncReaderBuilder, StringRecord};
use futures::{Stream, StreamExt};
use log::{debug, info};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio::time::timeout;

const VENDOR: &str = "LSEG";
const PRODUCT: &str = "TRTH";

/// File kinds published alongside each other under `data/merged`. Only the
/// `Data` file is ingested; the `Report` sibling exists but is not consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Data,
    Report,
}

impl FileKind {
    fn as_str(&self) -> &'static str {
        match self {
            FileKind::Data => "Data",
            FileKind::Report => "Report",
        }
    }
}

/// Object key for one exchange-day, bit-exact to the vendor layout:
/// `LSEG/TRTH/<EXCHANGE>/ingestion/<YYYY-MM-DD>/data/merged/
/// <EXCHANGE>-<YYYY-MM-DD>-NORMALIZEDMP-<Kind>-1-of-1.csv.gz`.
pub fn object_key(exchange: Exchange, date: NaiveDate, kind: FileKind) -> String {
    let code = exchange.code();
    let day = date.format("%Y-%m-%d");
    format!(
        "{VENDOR}/{PRODUCT}/{code}/ingestion/{day}/data/merged/{code}-{day}-NORMALIZEDMP-{kind}-1-of-1.csv.gz",
        kind = kind.as_str()
    )
}

pub fn object_uri(bucket: &str, key: &str) -> String {
    format!("s3://{bucket}/{key}")
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no source object at {uri}")]
    NotFound { uri: String },
    #[error("object store request failed for {uri}: {message}")]
    Io { uri: String, message: String },
    #[error("object store request timed out for {uri} after {seconds}s")]
    Timeout { uri: String, seconds: u64 },
    #[error("malformed record in {uri}: {context}")]
    Decode { uri: String, context: String },
}

impl Classify for SourceError {
    fn kind(&self) -> FailureKind {
        match self {
            SourceError::NotFound { .. } => FailureKind::NotFound,
            SourceError::Io { .. } | SourceError::Timeout { .. } => FailureKind::TransientIo,
            SourceError::Decode { .. } => FailureKind::DataMalformed,
        }
    }
}

/// Metadata resolved by `head`.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub uri: String,
    pub size_bytes: u64,
}

pub type RecordStream = Pin<Box<dyn Stream<Item = Result<StringRecord, SourceError>> + Send>>;

/// Open handle on one decoded source file: the header row plus the lazy
/// record stream behind it.
pub struct CsvFile {
    pub uri: String,
    pub headers: StringRecord,
    pub records: RecordStream,
}

#[async_trait]
pub trait SourceTrait: Send + Sync + 'static {
    async fn head(&self, exchange: Exchange, date: NaiveDate) -> Result<FileMeta, SourceError>;
    async fn open(&self, exchange: Exchange, date: NaiveDate) -> Result<CsvFile, SourceError>;
}

/// S3-backed source for the vendor bucket.
pub struct TrthSource {
    client: Client,
    bucket: String,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl TrthSource {
    pub fn new(config: &ObjectStoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone().unwrap_or_default(),
            config.secret_access_key.clone().unwrap_or_default(),
            None,
            None,
            "trth-source",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(config.default_region.clone()))
            .credentials_provider(credentials)
            .behavior_version(BehaviorVersion::latest());
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            retry: RetryPolicy::object_store(),
        }
    }

    async fn head_once(&self, exchange: Exchange, date: NaiveDate) -> Result<FileMeta, SourceError> {
        let key = object_key(exchange, date, FileKind::Data);
        let uri = object_uri(&self.bucket, &key);
        let request = self.client.head_object().bucket(&self.bucket).key(&key).send();
        let response = timeout(self.request_timeout, request)
            .await
            .map_err(|_| SourceError::Timeout {
                uri: uri.clone(),
                seconds: self.request_timeout.as_secs(),
            })?;
        match response {
            Ok(head) => Ok(FileMeta {
                size_bytes: head.content_length().unwrap_or(0).max(0) as u64,
                uri,
            }),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_not_found() {
                    Err(SourceError::NotFound { uri })
                } else {
                    Err(SourceError::Io {
                        uri,
                        message: service.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl SourceTrait for TrthSource {
    async fn head(&self, exchange: Exchange, date: NaiveDate) -> Result<FileMeta, SourceError> {
        // NotFound is a definitive answer; only transient failures retry.
        let result = self
            .retry
            .run(|attempt| async move {
                if attempt > 0 {
                    debug!("head retry {attempt} for {exchange} {date}");
                }
                match self.head_once(exchange, date).await {
                    Ok(meta) => Ok(Ok(meta)),
                    Err(err) if err.kind() == FailureKind::TransientIo => Err(err),
                    Err(err) => Ok(Err(err)),
                }
            })
            .await;
        match result {
            Ok(inner) => inner,
            Err(err) => Err(err),
        }
    }

    async fn open(&self, exchange: Exchange, date: NaiveDate) -> Result<CsvFile, SourceError> {
        let key = object_key(exchange, date, FileKind::Data);
        let uri = object_uri(&self.bucket, &key);
        info!("opening {uri}");

        let request = self.client.get_object().bucket(&self.bucket).key(&key).send();
        let response = timeout(self.request_timeout, request)
            .await
            .map_err(|_| SourceError::Timeout {
                uri: uri.clone(),
                seconds: self.request_timeout.as_secs(),
            })?;
        let object = match response {
            Ok(object) => object,
            Err(err) => {
                let service = err.into_service_error();
                return if service.is_no_such_key() {
                    Err(SourceError::NotFound { uri })
                } else {
                    Err(SourceError::Io {
                        uri,
                        message: service.to_string(),
                    })
                };
            }
        };

        decoded_csv(uri, Box::pin(BufReader::new(object.body.into_async_read()))).await
    }
}

/// Filesystem-backed source mirroring the vendor key layout under a local
/// root. Used by the test suites and for replaying previously downloaded
/// days without touching the bucket.
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn local_path(&self, exchange: Exchange, date: NaiveDate) -> PathBuf {
        self.root.join(object_key(exchange, date, FileKind::Data))
    }
}

#[async_trait]
impl SourceTrait for LocalSource {
    async fn head(&self, exchange: Exchange, date: NaiveDate) -> Result<FileMeta, SourceError> {
        let path = self.local_path(exchange, date);
        let uri = path.display().to_string();
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(FileMeta {
                uri,
                size_bytes: meta.len(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::NotFound { uri })
            }
            Err(err) => Err(SourceError::Io {
                uri,
                message: err.to_string(),
            }),
        }
    }

    async fn open(&self, exchange: Exchange, date: NaiveDate) -> Result<CsvFile, SourceError> {
        let path = self.local_path(exchange, date);
        let uri = path.display().to_string();
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound { uri })
            }
            Err(err) => {
                return Err(SourceError::Io {
                    uri,
                    message: err.to_string(),
                })
            }
        };
        decoded_csv(uri, Box::pin(BufReader::new(file))).await
    }
}

/// Layer the gzip decoder and CSV reader over a raw byte reader and pull the
/// header row. The record stream stays lazy.
async fn decoded_csv(
    uri: String,
    reader: Pin<Box<dyn tokio::io::AsyncBufRead + Send>>,
) -> Result<CsvFile, SourceError> {
    let decoder: Pin<Box<dyn AsyncRead + Send>> = if uri.ends_with(".gz") {
        Box::pin(GzipDecoder::new(reader))
    } else {
        Box::pin(reader)
    };
    let mut csv_reader = AsyncReaderBuilder::new().create_reader(decoder);

    let headers = csv_reader
        .headers()
        .await
        .map_err(|err| classify_csv_error(&uri, err))?
        .clone();
    if headers.is_empty() {
        return Err(SourceError::Decode {
            uri,
            context: "missing header row".to_string(),
        });
    }

    let stream_uri = uri.clone();
    let records: RecordStream = Box::pin(
        csv_reader
            .into_records()
            .map(move |record| record.map_err(|err| classify_csv_error(&stream_uri, err))),
    );

    Ok(CsvFile {
        uri,
        headers,
        records,
    })
}

fn classify_csv_error(uri: &str, err: csv_async::Error) -> SourceError {
    match err.kind() {
        csv_async::ErrorKind::Io(io_err) => SourceError::Io {
            uri: uri.to_string(),
            message: io_err.to_string(),
        },
        _ => SourceError::Decode {
            uri: uri.to_string(),
            context: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::GzipEncoder;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    const SAMPLE: &str = "\
#RIC,Date-Time,Type,Price,Volume
VOD.L,2025-01-15T08:00:00.000Z,Trade,68.42,1200
VOD.L,2025-01-15T08:00:00.120Z,Trade,68.44,300
BARC.L,2025-01-15T08:00:01.002Z,Trade,2.61,5000
";

    async fn write_fixture(root: &std::path::Path, exchange: Exchange, date: NaiveDate, body: &str) {
        let key = object_key(exchange, date, FileKind::Data);
        let path = root.join(&key);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(body.as_bytes()).await.unwrap();
        encoder.shutdown().await.unwrap();
        tokio::fs::write(&path, encoder.into_inner()).await.unwrap();
    }

    fn mid_january() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    #[test]
    fn object_key_matches_vendor_layout() {
        let key = object_key(Exchange::Lse, mid_january(), FileKind::Data);
        assert_eq!(
            key,
            "LSEG/TRTH/LSE/ingestion/2025-01-15/data/merged/LSE-2025-01-15-NORMALIZEDMP-Data-1-of-1.csv.gz"
        );
        let report = object_key(Exchange::Nyq, mid_january(), FileKind::Report);
        assert!(report.ends_with("NYQ-2025-01-15-NORMALIZEDMP-Report-1-of-1.csv.gz"));
        assert_eq!(
            object_uri("vendor-data-s3", &key),
            format!("s3://vendor-data-s3/{key}")
        );
    }

    #[tokio::test]
    async fn local_head_distinguishes_not_found() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), Exchange::Lse, mid_january(), SAMPLE).await;
        let source = LocalSource::new(dir.path());

        let meta = source.head(Exchange::Lse, mid_january()).await.unwrap();
        assert!(meta.size_bytes > 0);

        let missing = source.head(Exchange::Cme, mid_january()).await.unwrap_err();
        assert_eq!(missing.kind(), FailureKind::NotFound);
    }

    #[tokio::test]
    async fn open_streams_decoded_records_with_headers() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), Exchange::Lse, mid_january(), SAMPLE).await;
        let source = LocalSource::new(dir.path());

        let mut file = source.open(Exchange::Lse, mid_january()).await.unwrap();
        assert_eq!(
            file.headers.iter().collect::<Vec<_>>(),
            vec!["#RIC", "Date-Time", "Type", "Price", "Volume"]
        );

        let mut rows = Vec::new();
        while let Some(record) = file.records.next().await {
            rows.push(record.unwrap());
        }
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][0], "VOD.L");
        assert_eq!(&rows[2][4], "5000");
    }

    #[tokio::test]
    async fn header_only_file_yields_zero_records() {
        let dir = tempdir().unwrap();
        write_fixture(
            dir.path(),
            Exchange::Cme,
            mid_january(),
            "#RIC,Date-Time,Type,Price,Volume\n",
        )
        .await;
        let source = LocalSource::new(dir.path());

        let mut file = source.open(Exchange::Cme, mid_january()).await.unwrap();
        assert_eq!(file.headers.len(), 5);
        assert!(file.records.next().await.is_none());
    }

    #[tokio::test]
    async fn ragged_row_surfaces_as_decode_error() {
        let dir = tempdir().unwrap();
        let body = "#RIC,Date-Time,Type,Price,Volume\nVOD.L,2025-01-15T08:00:00Z,Trade,68.42,1200\nBARC.L,oops\n";
        write_fixture(dir.path(), Exchange::Nyq, mid_january(), body).await;
        let source = LocalSource::new(dir.path());

        let mut file = source.open(Exchange::Nyq, mid_january()).await.unwrap();
        let first = file.records.next().await.unwrap();
        assert!(first.is_ok());
        let second = file.records.next().await.unwrap();
        let err = second.unwrap_err();
        assert_eq!(err.kind(), FailureKind::DataMalformed);
    }
}

//! Acquisition of Eurostat artifacts: inventory, SDMX metadata, TSV data.
//!
//! Downloads stream straight to disk and land in a local file cache via a
//! temp-file-plus-rename so concurrent readers never observe a partial file.
//! Transient transport failures and 5xx responses are retried with
//! exponential backoff and jitter; 404-class responses are permanent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use estat_common::{EstatError, Result};
use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, CacheConfig, EurostatConfig};

/// Cached inventory files older than this are re-downloaded; the inventory is
/// the change signal for delta decisions and must stay reasonably fresh.
const INVENTORY_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Maximum backoff between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// When may a cached artifact satisfy a fetch.
#[derive(Debug, Clone, Copy)]
enum Freshness {
    /// Any cached copy is acceptable.
    Any,
    /// Only a copy written after the given source timestamp.
    NewerThan(DateTime<Utc>),
    /// Only a copy younger than the given age.
    MaxAge(Duration),
}

/// Handles the acquisition of data and metadata from the dissemination API.
pub struct Fetcher {
    client: Client,
    cache: CacheConfig,
    eurostat: EurostatConfig,
    /// Effective cache directory after degradation, if any.
    cache_dir: PathBuf,
}

impl Fetcher {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.eurostat.request_timeout_secs))
            .user_agent(concat!("estat-load/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let cache_dir = prepare_cache_dir(&config.cache)?;

        Ok(Self {
            client,
            cache: config.cache.clone(),
            eurostat: config.eurostat.clone(),
            cache_dir,
        })
    }

    /// Local path of the (possibly cached) inventory TSV.
    pub async fn get_inventory(&self) -> Result<PathBuf> {
        let url = format!("{}/files/inventory?type=data", self.eurostat.base_url);
        self.fetch(&url, "inventory.tsv", Freshness::MaxAge(INVENTORY_MAX_AGE))
            .await
    }

    /// Local path of the DSD document for a dataset.
    ///
    /// A cached copy is reused only if it is at least as new as the dataset's
    /// inventory timestamp, when known.
    pub async fn get_dsd(
        &self,
        dataset_id: &str,
        source_last_update: Option<DateTime<Utc>>,
    ) -> Result<PathBuf> {
        let url = format!(
            "{}/sdmx/{}/dataflow/{}/{}/latest?references=datastructure",
            self.eurostat.base_url,
            self.eurostat.sdmx_api_version,
            self.eurostat.sdmx_agency,
            dataset_id.to_uppercase(),
        );
        let cache_name = format!("dsd_{}.xml", dataset_id.to_lowercase());
        self.fetch(&url, &cache_name, freshness_for(source_last_update))
            .await
    }

    /// Local path of a code list document.
    pub async fn get_codelist(
        &self,
        codelist_id: &str,
        source_last_update: Option<DateTime<Utc>>,
    ) -> Result<PathBuf> {
        let url = format!(
            "{}/sdmx/{}/codelist/{}/{}/latest",
            self.eurostat.base_url,
            self.eurostat.sdmx_api_version,
            self.eurostat.sdmx_agency,
            codelist_id.to_uppercase(),
        );
        let cache_name = format!("codelist_{}.xml", codelist_id.to_lowercase());
        self.fetch(&url, &cache_name, freshness_for(source_last_update))
            .await
    }

    /// Local path of the gzip TSV matrix, fetched from the download URL
    /// published in the inventory (resolved against the base URL when
    /// relative).
    pub async fn get_tsv(
        &self,
        dataset_id: &str,
        download_url: &str,
        source_last_update: Option<DateTime<Utc>>,
    ) -> Result<PathBuf> {
        let url = self.resolve_url(download_url);
        let cache_name = format!("{}.tsv.gz", dataset_id.to_lowercase());
        self.fetch(&url, &cache_name, freshness_for(source_last_update))
            .await
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.eurostat.base_url.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        }
    }

    /// Generic fetch with cache lookup.
    async fn fetch(&self, url: &str, cache_name: &str, freshness: Freshness) -> Result<PathBuf> {
        let path = self.cache_dir.join(cache_name);

        if self.cache.enabled && cache_satisfies(&path, freshness) {
            debug!(file = cache_name, "cache hit, skipping download");
            return Ok(path);
        }

        self.download_with_retry(url, &path).await?;
        Ok(path)
    }

    /// Download `url` into `dest` atomically, retrying transient failures.
    async fn download_with_retry(&self, url: &str, dest: &Path) -> Result<()> {
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.eurostat.max_retries {
            match self.download_once(url, dest).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(
                        url,
                        attempt,
                        max = self.eurostat.max_retries,
                        error = %e,
                        "download attempt failed"
                    );
                    last_error = Some(e.to_string());

                    if attempt < self.eurostat.max_retries {
                        let backoff = backoff_with_jitter(self.eurostat.retry_base_delay_ms, attempt);
                        debug!(delay_ms = backoff.as_millis() as u64, "backing off");
                        tokio::time::sleep(backoff).await;
                    }
                },
                Err(e) => return Err(e),
            }
        }

        Err(EstatError::transient(
            url,
            self.eurostat.max_retries,
            last_error.unwrap_or_else(|| "no error captured".to_string()),
        ))
    }

    /// One download attempt: stream the body to a temp file next to the
    /// destination, then rename into place.
    async fn download_once(&self, url: &str, dest: &Path) -> Result<()> {
        info!(url, dest = %dest.display(), "downloading");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EstatError::transient(url, 1, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(url, status));
        }

        let tmp = dest.with_extension(format!("part{}", std::process::id()));
        let write_err = |e: std::io::Error| EstatError::cache_io(tmp.display().to_string(), e.to_string());

        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        let mut stream = response.bytes_stream();
        let mut bytes_written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    file.write_all(&bytes).await.map_err(write_err)?;
                    bytes_written += bytes.len() as u64;
                },
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(EstatError::transient(url, 1, e.to_string()));
                },
            }
        }

        file.flush().await.map_err(write_err)?;
        drop(file);
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| EstatError::cache_io(dest.display().to_string(), e.to_string()))?;

        info!(url, bytes = bytes_written, "download complete");
        Ok(())
    }
}

fn freshness_for(source_last_update: Option<DateTime<Utc>>) -> Freshness {
    match source_last_update {
        Some(ts) => Freshness::NewerThan(ts),
        None => Freshness::Any,
    }
}

/// Whether an existing cache file satisfies the freshness requirement.
fn cache_satisfies(path: &Path, freshness: Freshness) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match freshness {
        Freshness::Any => true,
        Freshness::MaxAge(max_age) => modified
            .elapsed()
            .map(|age| age <= max_age)
            .unwrap_or(false),
        Freshness::NewerThan(source_ts) => {
            DateTime::<Utc>::from(modified) >= source_ts
        },
    }
}

/// Exponential backoff `base * 2^(attempt-1)` capped at [`MAX_BACKOFF`], plus
/// up to one base-delay of uniform jitter.
fn backoff_with_jitter(base_delay_ms: u64, attempt: u32) -> Duration {
    let exp = base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(16));
    let capped = exp.min(MAX_BACKOFF.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0..=base_delay_ms);
    Duration::from_millis(capped + jitter)
}

fn classify_status(url: &str, status: StatusCode) -> EstatError {
    match status {
        StatusCode::NOT_FOUND
        | StatusCode::GONE
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN => EstatError::not_found(url, format!("HTTP {status}")),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            EstatError::transient(url, 1, format!("HTTP {s}"))
        },
        s => EstatError::not_found(url, format!("unexpected HTTP {s}")),
    }
}

/// Ensure the cache directory exists; degrade to a temp directory when the
/// configured root is unusable.
fn prepare_cache_dir(cache: &CacheConfig) -> Result<PathBuf> {
    if let Err(e) = std::fs::create_dir_all(&cache.dir) {
        let fallback = std::env::temp_dir().join("estat-load");
        warn!(
            dir = %cache.dir.display(),
            error = %e,
            fallback = %fallback.display(),
            "cache directory unusable, falling back to temp dir"
        );
        std::fs::create_dir_all(&fallback)
            .map_err(|e2| EstatError::cache_io(fallback.display().to_string(), e2.to_string()))?;
        return Ok(fallback);
    }
    debug!(dir = %cache.dir.display(), "cache directory ready");
    Ok(cache.dir.clone())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str, cache_dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.eurostat.base_url = base_url.to_string();
        config.eurostat.max_retries = 3;
        config.eurostat.retry_base_delay_ms = 5;
        config.cache.dir = cache_dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_inventory_downloaded_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/inventory"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Code\tType\n"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let fetcher = Fetcher::new(&test_config(&server.uri(), tmp.path())).unwrap();

        let first = fetcher.get_inventory().await.unwrap();
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "Code\tType\n");

        // Second call must come from the cache (mock expects exactly 1 hit).
        let second = fetcher.get_inventory().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/inventory"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/inventory"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let fetcher = Fetcher::new(&test_config(&server.uri(), tmp.path())).unwrap();

        let path = fetcher.get_inventory().await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_not_found_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let fetcher = Fetcher::new(&test_config(&server.uri(), tmp.path())).unwrap();

        let err = fetcher.get_dsd("nope", None).await.unwrap_err();
        assert!(matches!(err, EstatError::FetchNotFound { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_retries_reported_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let fetcher = Fetcher::new(&test_config(&server.uri(), tmp.path())).unwrap();

        let err = fetcher.get_inventory().await.unwrap_err();
        match err {
            EstatError::FetchTransient { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected FetchTransient, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_tsv_redownloaded_when_source_newer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.tsv.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"v2".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let fetcher = Fetcher::new(&test_config(&server.uri(), tmp.path())).unwrap();

        // Seed a cached copy, then ask for data whose source is newer than
        // any plausible file mtime.
        std::fs::write(tmp.path().join("demo.tsv.gz"), b"v1").unwrap();
        let future_ts = Utc::now() + chrono::Duration::days(1);
        let url = format!("{}/data.tsv.gz", server.uri());

        let path = fetcher.get_tsv("demo", &url, Some(future_ts)).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"v2");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = backoff_with_jitter(100, 1);
        let fourth = backoff_with_jitter(100, 4);
        assert!(first.as_millis() <= 200);
        assert!(fourth.as_millis() >= 800);
        // High attempt numbers stay capped.
        let huge = backoff_with_jitter(1_000, 30);
        assert!(huge <= MAX_BACKOFF + Duration::from_millis(1_000));
    }

    #[test]
    fn test_resolve_url_relative_and_absolute() {
        let tmp = TempDir::new().unwrap();
        let fetcher = Fetcher::new(&test_config("http://example.test/api", tmp.path())).unwrap();
        assert_eq!(
            fetcher.resolve_url("files/data/demo.tsv.gz"),
            "http://example.test/api/files/data/demo.tsv.gz"
        );
        assert_eq!(
            fetcher.resolve_url("https://elsewhere.test/x.gz"),
            "https://elsewhere.test/x.gz"
        );
    }
}

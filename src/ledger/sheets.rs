//! Google Sheets v4 REST client.
//!
//! Access tokens come either from configuration or from the GCE metadata
//! server (App Engine / Cloud Run default service account), cached until
//! shortly before they expire.

use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Book, CellRange, Row, SheetsError, Spreadsheet};
use crate::retry::{RetryPolicy, Transient, with_retry};

const API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_SLACK: Duration = Duration::from_secs(60);

pub enum TokenSource {
    Static(String),
    Metadata { cached: Mutex<Option<(String, Instant)>> },
}

impl TokenSource {
    pub fn from_config(token: Option<String>) -> Self {
        match token {
            Some(t) if !t.is_empty() => TokenSource::Static(t),
            _ => TokenSource::Metadata { cached: Mutex::new(None) },
        }
    }

    async fn token(&self, http: &reqwest::Client) -> Result<String, SheetsError> {
        let cached = match self {
            TokenSource::Static(t) => return Ok(t.clone()),
            TokenSource::Metadata { cached } => cached,
        };

        let mut slot = cached.lock().await;
        if let Some((token, expires)) = slot.as_ref() {
            if Instant::now() + TOKEN_SLACK < *expires {
                return Ok(token.clone());
            }
        }

        #[derive(Deserialize)]
        struct MetadataToken {
            access_token: String,
            expires_in: u64,
        }

        let response = http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| SheetsError::Auth(format!("metadata server unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(SheetsError::Auth(format!("metadata server returned {}", response.status())));
        }
        let fetched: MetadataToken = response.json().await.map_err(|e| SheetsError::Auth(e.to_string()))?;

        info!("Fetched sheets access token (expires in {}s)", fetched.expires_in);
        let expires = Instant::now() + Duration::from_secs(fetched.expires_in);
        *slot = Some((fetched.access_token.clone(), expires));
        Ok(fetched.access_token)
    }
}

pub struct GoogleSheets {
    http: reqwest::Client,
    budget_id: String,
    tracker_id: String,
    tokens: TokenSource,
    retry: RetryPolicy,
}

/// Wrapper for appends: only retried when the server certainly did not
/// apply the first attempt.
struct AppendError(SheetsError);

impl Transient for AppendError {
    fn is_transient(&self) -> bool {
        self.0.not_applied()
    }
}

impl fmt::Display for AppendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn transport_error(e: reqwest::Error) -> SheetsError {
    if e.is_connect() {
        SheetsError::Connect(e.to_string())
    } else {
        SheetsError::Http(e.to_string())
    }
}

impl GoogleSheets {
    pub fn new(budget_id: String, tracker_id: String, tokens: TokenSource) -> Result<Self, SheetsError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SheetsError::Http(e.to_string()))?;
        Ok(Self {
            http,
            budget_id,
            tracker_id,
            tokens,
            retry: RetryPolicy::new(3, Duration::from_millis(500)),
        })
    }

    fn spreadsheet_id(&self, book: Book) -> &str {
        match book {
            Book::Budget => &self.budget_id,
            Book::Tracker => &self.tracker_id,
        }
    }

    fn values_url(&self, book: Book, range: &CellRange, suffix: &str) -> String {
        format!(
            "{API_BASE}/{}/values/{}{suffix}",
            self.spreadsheet_id(book),
            urlencoding::encode(&range.to_a1())
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, SheetsError> {
        let token = self.tokens.token(&self.http).await?;
        let response = request.bearer_auth(token).send().await.map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(|e| SheetsError::Http(e.to_string()))?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            return Err(SheetsError::Api { status: status.as_u16(), message });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| SheetsError::Decode(e.to_string()))
    }

    async fn read_once(&self, book: Book, range: &CellRange) -> Result<Vec<Row>, SheetsError> {
        let url = self.values_url(book, range, "?valueRenderOption=UNFORMATTED_VALUE");
        let body = self.send(self.http.get(url)).await?;
        match body.get("values") {
            None => Ok(Vec::new()),
            Some(values) => {
                serde_json::from_value(values.clone()).map_err(|e| SheetsError::Decode(e.to_string()))
            }
        }
    }

    async fn write_once(&self, book: Book, range: &CellRange, rows: &[Row]) -> Result<(), SheetsError> {
        let url = self.values_url(book, range, "?valueInputOption=RAW");
        let body = json!({ "range": range.to_a1(), "majorDimension": "ROWS", "values": rows });
        self.send(self.http.put(url).json(&body)).await?;
        Ok(())
    }

    async fn append_once(&self, book: Book, range: &CellRange, rows: &[Row]) -> Result<(), AppendError> {
        let url = self.values_url(book, range, ":append?valueInputOption=RAW&insertDataOption=INSERT_ROWS");
        let body = json!({ "majorDimension": "ROWS", "values": rows });
        self.send(self.http.post(url).json(&body)).await.map(|_| ()).map_err(AppendError)
    }

    async fn batch_write_once(&self, book: Book, data: &Value) -> Result<(), SheetsError> {
        let url = format!("{API_BASE}/{}/values:batchUpdate", self.spreadsheet_id(book));
        self.send(self.http.post(url).json(data)).await?;
        Ok(())
    }

    async fn titles_once(&self, book: Book) -> Result<Vec<String>, SheetsError> {
        let url = format!("{API_BASE}/{}?fields=sheets.properties.title", self.spreadsheet_id(book));
        let body = self.send(self.http.get(url)).await?;
        Ok(body["sheets"]
            .as_array()
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| s["properties"]["title"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_sheet_once(&self, book: Book, body: &Value) -> Result<(), SheetsError> {
        let url = format!("{API_BASE}/{}:batchUpdate", self.spreadsheet_id(book));
        self.send(self.http.post(url).json(body)).await?;
        Ok(())
    }
}

impl Spreadsheet for GoogleSheets {
    async fn read(&self, book: Book, range: &CellRange) -> Result<Vec<Row>, SheetsError> {
        debug!("Reading {} {}", book, range);
        with_retry(self.retry, "sheets read", || self.read_once(book, range)).await
    }

    async fn write(&self, book: Book, range: &CellRange, rows: Vec<Row>) -> Result<(), SheetsError> {
        debug!("Writing {} rows to {} {}", rows.len(), book, range);
        with_retry(self.retry, "sheets write", || self.write_once(book, range, &rows)).await
    }

    async fn append(&self, book: Book, range: &CellRange, rows: Vec<Row>) -> Result<(), SheetsError> {
        debug!("Appending {} rows to {} {}", rows.len(), book, range);
        with_retry(self.retry, "sheets append", || self.append_once(book, range, &rows))
            .await
            .map_err(|e| e.0)
    }

    async fn batch_write(&self, book: Book, updates: Vec<(CellRange, Vec<Row>)>) -> Result<(), SheetsError> {
        let data: Vec<Value> = updates
            .iter()
            .map(|(range, rows)| json!({ "range": range.to_a1(), "majorDimension": "ROWS", "values": rows }))
            .collect();
        let body = json!({ "valueInputOption": "RAW", "data": data });
        debug!("Batch writing {} ranges to {}", updates.len(), book);
        with_retry(self.retry, "sheets batch write", || self.batch_write_once(book, &body)).await
    }

    async fn sheet_exists(&self, book: Book, title: &str) -> Result<bool, SheetsError> {
        let titles = with_retry(self.retry, "sheets metadata", || self.titles_once(book)).await?;
        Ok(titles.iter().any(|t| t == title))
    }

    async fn add_sheet(&self, book: Book, title: &str) -> Result<(), SheetsError> {
        let body = json!({
            "requests": [{ "addSheet": { "properties": { "title": title, "rightToLeft": true } } }]
        });
        // Not retried: a lost response would make the retry fail with "already exists".
        self.add_sheet_once(book, &body).await?;
        info!("Created {} tab '{}'", book, title);
        Ok(())
    }
}

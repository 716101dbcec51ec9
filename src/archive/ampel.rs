//! Client for an AMPEL-style ZTF alert archive REST API.
use crate::alert::AlertRecord;
use crate::archive::{AlertArchive, ArchiveError, Middleware, RequestError};
use crate::conf::{ArchiveConfig, ConfigurationError};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

pub const SERVICE_NAME: &str = "alert archive";
const MAX_ERROR_BODY: usize = 512;

/// How requests authenticate against the archive.
#[derive(Clone, PartialEq)]
pub enum Credentials {
    Anonymous,
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Bearer(_) => write!(f, "Bearer([REDACTED])"),
            Credentials::Basic { username, .. } => {
                write!(f, "Basic {{ username: {}, password: [REDACTED] }}", username)
            }
        }
    }
}

impl Credentials {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        match (&config.token, &config.username, &config.password) {
            (Some(token), _, _) if !token.is_empty() => Credentials::Bearer(token.clone()),
            (_, Some(username), Some(password)) => Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => Credentials::Anonymous,
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::Anonymous => request,
            Credentials::Bearer(token) => request.bearer_auth(token),
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }
}

pub(crate) fn parse_base_url(key: &str, base_url: &str) -> Result<Url, ConfigurationError> {
    let url = Url::parse(base_url.trim_end_matches('/'))
        .map_err(|e| ConfigurationError::invalid(key, e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(ConfigurationError::invalid(key, "not a base URL"));
    }
    Ok(url)
}

pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Issue a GET and decode the JSON body, mapping failures onto
/// [`RequestError`].
pub(crate) async fn get_json(
    client: &reqwest::Client,
    credentials: &Credentials,
    url: Url,
) -> Result<Value, RequestError> {
    let response = credentials.apply(client.get(url.clone())).send().await?;
    let status = response.status();
    if !status.is_success() {
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(MAX_ERROR_BODY);
        return Err(RequestError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| RequestError::Decode(e.to_string()))
}

/// Decode alert records one by one, logging and dropping the ones that do
/// not fit the expected shape.
pub fn parse_records(values: Vec<Value>) -> Vec<AlertRecord> {
    values
        .into_iter()
        .filter_map(|value| {
            let object_id = value
                .get("objectId")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>")
                .to_string();
            match serde_json::from_value::<AlertRecord>(value) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!(error.message = %error, object_id, "skipping malformed alert");
                    None
                }
            }
        })
        .collect()
}

/// Split a chunked response into its alerts and the token of the next
/// chunk, if any.
fn split_chunk(body: Value) -> Result<(Vec<Value>, Option<String>), RequestError> {
    let Value::Object(mut map) = body else {
        return Err(RequestError::Decode("expected a JSON object".to_string()));
    };
    let alerts = match map.remove("alerts") {
        Some(Value::Array(alerts)) => alerts,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err(RequestError::Decode("'alerts' is not a list".to_string())),
    };
    let resume_token = map
        .remove("resume_token")
        .and_then(|token| token.as_str().map(str::to_string));
    Ok((alerts, resume_token))
}

fn expect_list(body: Value) -> Result<Vec<Value>, RequestError> {
    match body {
        Value::Array(values) => Ok(values),
        _ => Err(RequestError::Decode("expected a JSON list".to_string())),
    }
}

/// REST client for the alert archive.
#[derive(Debug, Clone)]
pub struct AmpelArchive {
    client: reqwest::Client,
    base: Url,
    credentials: Credentials,
    chunk_size: usize,
    middleware: Middleware,
}

impl AmpelArchive {
    pub fn new(config: &ArchiveConfig) -> Result<Self, ConfigurationError> {
        let base = parse_base_url("archive.base_url", &config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigurationError::invalid("archive", e.to_string()))?;
        Ok(AmpelArchive {
            client,
            base,
            credentials: Credentials::from_config(config),
            chunk_size: config.cone_chunk_size.max(1),
            middleware: Middleware::from_config(SERVICE_NAME, &config.retry, &config.rate_limit),
        })
    }

    /// Replace the retry and rate-limit policy.
    pub fn with_middleware(mut self, middleware: Middleware) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn cone_search_url(
        &self,
        ra: f64,
        dec: f64,
        radius_deg: f64,
        t_min_jd: f64,
        t_max_jd: f64,
    ) -> Url {
        let mut url = endpoint(&self.base, &["alerts", "cone_search"]);
        url.query_pairs_mut()
            .append_pair("ra", &ra.to_string())
            .append_pair("dec", &dec.to_string())
            .append_pair("radius", &radius_deg.to_string())
            .append_pair("jd_start", &t_min_jd.to_string())
            .append_pair("jd_end", &t_max_jd.to_string())
            .append_pair("with_history", "false")
            .append_pair("with_cutouts", "false")
            .append_pair("chunk_size", &self.chunk_size.to_string());
        url
    }

    pub fn object_url(&self, object_id: &str, with_history: bool) -> Url {
        let mut url = endpoint(&self.base, &["object", object_id, "alerts"]);
        url.query_pairs_mut()
            .append_pair("with_history", flag(with_history))
            .append_pair("with_cutouts", "false");
        url
    }

    pub fn timerange_url(
        &self,
        t_min_jd: f64,
        t_max_jd: f64,
        with_history: bool,
        chunk_size: usize,
    ) -> Url {
        let mut url = endpoint(&self.base, &["alerts", "time_range"]);
        url.query_pairs_mut()
            .append_pair("jd_start", &t_min_jd.to_string())
            .append_pair("jd_end", &t_max_jd.to_string())
            .append_pair("with_history", flag(with_history))
            .append_pair("with_cutouts", "false")
            .append_pair("chunk_size", &chunk_size.to_string());
        url
    }

    pub fn chunk_url(&self, resume_token: &str, with_history: bool) -> Url {
        let mut url = endpoint(&self.base, &["stream", resume_token, "chunk"]);
        url.query_pairs_mut()
            .append_pair("with_history", flag(with_history))
            .append_pair("with_cutouts", "false");
        url
    }

    pub fn cutouts_url(&self, candid: i64) -> Url {
        endpoint(&self.base, &["cutouts", &candid.to_string()])
    }

    async fn get(&self, operation: &str, url: Url) -> Result<Value, ArchiveError> {
        debug!(%url, operation, "archive request");
        self.middleware
            .call(operation, move || {
                get_json(&self.client, &self.credentials, url.clone())
            })
            .await
    }

    /// Fetch a chunked query and follow resume tokens until the stream is
    /// drained.
    async fn get_stream(
        &self,
        operation: &str,
        first: Url,
        with_history: bool,
    ) -> Result<Vec<AlertRecord>, ArchiveError> {
        let body = self.get(operation, first).await?;
        let (mut alerts, mut resume_token) = self.split(operation, body)?;
        let mut records = Vec::new();
        while !alerts.is_empty() {
            records.extend(parse_records(std::mem::take(&mut alerts)));
            let Some(token) = resume_token.take() else {
                break;
            };
            let body = self.get(operation, self.chunk_url(&token, with_history)).await?;
            (alerts, resume_token) = self.split(operation, body)?;
        }
        Ok(records)
    }

    fn split(
        &self,
        operation: &str,
        body: Value,
    ) -> Result<(Vec<Value>, Option<String>), ArchiveError> {
        split_chunk(body).map_err(|source| self.rejected(operation, source))
    }

    fn rejected(&self, operation: &str, source: RequestError) -> ArchiveError {
        ArchiveError::Rejected {
            service: SERVICE_NAME.to_string(),
            operation: operation.to_string(),
            source,
        }
    }
}

#[async_trait]
impl AlertArchive for AmpelArchive {
    #[instrument(skip(self), err)]
    async fn cone_search(
        &self,
        ra: f64,
        dec: f64,
        radius_deg: f64,
        t_min_jd: f64,
        t_max_jd: f64,
    ) -> Result<Vec<AlertRecord>, ArchiveError> {
        let url = self.cone_search_url(ra, dec, radius_deg, t_min_jd, t_max_jd);
        self.get_stream("cone_search", url, false).await
    }

    #[instrument(skip(self), err)]
    async fn object_search(
        &self,
        object_id: &str,
        with_history: bool,
    ) -> Result<Vec<AlertRecord>, ArchiveError> {
        let url = self.object_url(object_id, with_history);
        match self.get("object_search", url).await {
            Ok(body) => {
                let values = expect_list(body).map_err(|e| self.rejected("object_search", e))?;
                Ok(parse_records(values))
            }
            // the archive answers 404 for objects it holds no alerts for
            Err(ArchiveError::Rejected {
                source: RequestError::Status { status, .. },
                ..
            }) if status == StatusCode::NOT_FOUND.as_u16() => {
                debug!(object_id, "object not found in archive");
                Ok(Vec::new())
            }
            Err(error) => Err(error),
        }
    }

    #[instrument(skip(self), err)]
    async fn timerange_search(
        &self,
        t_min_jd: f64,
        t_max_jd: f64,
        with_history: bool,
        chunk_size: usize,
    ) -> Result<Vec<AlertRecord>, ArchiveError> {
        let url = self.timerange_url(t_min_jd, t_max_jd, with_history, chunk_size.max(1));
        self.get_stream("timerange_search", url, with_history).await
    }

    #[instrument(skip(self), err)]
    async fn get_cutouts(&self, candid: i64) -> Result<HashMap<String, Vec<u8>>, ArchiveError> {
        let body = self.get("get_cutouts", self.cutouts_url(candid)).await?;
        let Value::Object(map) = body else {
            return Err(self.rejected(
                "get_cutouts",
                RequestError::Decode("expected a JSON object".to_string()),
            ));
        };
        let mut cutouts = HashMap::new();
        for (kind, value) in map {
            let Some(encoded) = value.as_str() else {
                continue;
            };
            match STANDARD.decode(encoded) {
                Ok(bytes) => {
                    cutouts.insert(kind, bytes);
                }
                Err(error) => warn!(error.message = %error, kind, candid, "undecodable cutout"),
            }
        }
        Ok(cutouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn archive() -> AmpelArchive {
        let config = ArchiveConfig {
            base_url: "https://ampel.example.org/api/ztf/archive/v3/".to_string(),
            token: Some("secret".to_string()),
            username: None,
            password: None,
            timeout_secs: 10,
            cone_chunk_size: 100,
            rate_limit: Default::default(),
            retry: Default::default(),
        };
        AmpelArchive::new(&config).unwrap()
    }

    #[test]
    fn test_cone_search_url() {
        let url = archive().cone_search_url(10.5, -3.25, 0.95, 2459000.5, 2459010.5);
        assert_eq!(url.path(), "/api/ztf/archive/v3/alerts/cone_search");
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["ra"], "10.5");
        assert_eq!(query["dec"], "-3.25");
        assert_eq!(query["radius"], "0.95");
        assert_eq!(query["jd_start"], "2459000.5");
        assert_eq!(query["jd_end"], "2459010.5");
        assert_eq!(query["with_history"], "false");
        assert_eq!(query["with_cutouts"], "false");
        assert_eq!(query["chunk_size"], "100");
    }

    #[test]
    fn test_object_and_cutout_urls() {
        let archive = archive();
        let url = archive.object_url("ZTF19aapreis", true);
        assert_eq!(
            url.as_str(),
            "https://ampel.example.org/api/ztf/archive/v3/object/ZTF19aapreis/alerts?with_history=true&with_cutouts=false"
        );
        assert_eq!(
            archive.cutouts_url(42).as_str(),
            "https://ampel.example.org/api/ztf/archive/v3/cutouts/42"
        );
        assert_eq!(
            archive.chunk_url("abc", false).path(),
            "/api/ztf/archive/v3/stream/abc/chunk"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(parse_base_url("archive.base_url", "not a url").is_err());
        assert!(parse_base_url("archive.base_url", "mailto:someone@example.org").is_err());
    }

    #[test]
    fn test_parse_records_skips_malformed() {
        let records = parse_records(vec![
            json!({"objectId": "ZTF1", "candidate": {"jd": 1.0, "isdiffpos": "t"}}),
            json!({"objectId": "ZTF2"}),
            json!({"candidate": {"jd": 2.0}}),
        ]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_id, "ZTF1");
    }

    #[test]
    fn test_split_chunk() {
        let (alerts, token) =
            split_chunk(json!({"alerts": [{"objectId": "ZTF1"}], "resume_token": "t1"})).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(token.as_deref(), Some("t1"));

        let (alerts, token) = split_chunk(json!({"alerts": []})).unwrap();
        assert!(alerts.is_empty());
        assert!(token.is_none());

        assert!(split_chunk(json!([1, 2])).is_err());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let credentials = Credentials::Basic {
            username: "scanner".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }
}

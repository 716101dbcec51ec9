//! Access to the remote alert archive.
//!
//! Every call goes through [`middleware::Middleware`]: an outer retry loop
//! with exponential backoff bounded by a total time budget, an inner shared
//! rate limiter, and the raw HTTP request innermost.
pub mod ampel;
pub mod middleware;

pub use ampel::{AmpelArchive, Credentials};
pub use middleware::{Backoff, Middleware, RateLimiter};

use crate::alert::AlertRecord;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Failure of a single request attempt.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("transport error")]
    Transport(#[from] reqwest::Error),
    #[error("{url} answered with status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("transient failure: {0}")]
    Unavailable(String),
}

impl RequestError {
    /// Whether the attempt may succeed if repeated.
    ///
    /// Connection problems, timeouts, throttling and server-side errors are
    /// transient; rejected requests and undecodable payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            RequestError::Transport(error) => !error.is_builder() && !error.is_decode(),
            RequestError::Status { status, .. } => is_transient_status(*status),
            RequestError::Decode(_) => false,
            RequestError::Unavailable(_) => true,
        }
    }
}

pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// A remote endpoint kept failing until the retry budget ran out.
#[derive(thiserror::Error, Debug)]
#[error("{service} {operation} failed after {attempts} attempts over {elapsed:?}")]
pub struct RemoteServiceError {
    pub service: String,
    pub operation: String,
    pub attempts: u32,
    pub elapsed: Duration,
    #[source]
    pub last_error: RequestError,
}

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    RemoteService(#[from] RemoteServiceError),
    #[error("{service} rejected {operation}")]
    Rejected {
        service: String,
        operation: String,
        #[source]
        source: RequestError,
    },
}

/// Query interface of an optical alert archive.
///
/// Times are Julian dates and angles degrees.
#[async_trait]
pub trait AlertArchive: Send + Sync {
    /// Alerts whose position falls within `radius_deg` of (ra, dec) and
    /// whose detection time lies in the window. History is not included.
    async fn cone_search(
        &self,
        ra: f64,
        dec: f64,
        radius_deg: f64,
        t_min_jd: f64,
        t_max_jd: f64,
    ) -> Result<Vec<AlertRecord>, ArchiveError>;

    /// Every alert of one object.
    async fn object_search(
        &self,
        object_id: &str,
        with_history: bool,
    ) -> Result<Vec<AlertRecord>, ArchiveError>;

    /// Every alert issued in a time window, fetched in chunks.
    async fn timerange_search(
        &self,
        t_min_jd: f64,
        t_max_jd: f64,
        with_history: bool,
        chunk_size: usize,
    ) -> Result<Vec<AlertRecord>, ArchiveError>;

    /// Image stamps of one detection, keyed by kind
    /// (`cutoutScience`, `cutoutTemplate`, `cutoutDifference`).
    async fn get_cutouts(&self, candid: i64) -> Result<HashMap<String, Vec<u8>>, ArchiveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_transient_status(status), "{}", status);
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!is_transient_status(status), "{}", status);
        }
        let error = RequestError::Status {
            url: "http://archive/object".to_string(),
            status: 503,
            body: String::new(),
        };
        assert!(error.is_transient());
        assert!(!RequestError::Decode("bad json".to_string()).is_transient());
    }
}

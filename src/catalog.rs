//! Nearest-match lookups in external catalogs (TNS, NED, ...), used to
//! annotate the report. Filtering never depends on them.
use crate::archive::ampel::{endpoint, get_json, parse_base_url};
use crate::archive::{ArchiveError, Credentials, Middleware, RequestError};
use crate::conf::{CatalogConfig, ConfigurationError};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

pub const SERVICE_NAME: &str = "catalog";

/// The closest catalog entry to a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogMatch {
    pub catalog: String,
    pub name: String,
    pub date: Option<String>,
    pub group: Option<String>,
    pub distance_arcsec: f64,
    /// Redshift of the entry, for catalogs of galaxies.
    #[serde(default)]
    pub redshift: Option<f64>,
}

#[async_trait]
pub trait CatalogMatcher: Send + Sync {
    /// Best match within `radius_arcsec` of (ra, dec), if any.
    async fn best_match(
        &self,
        ra: f64,
        dec: f64,
        radius_arcsec: f64,
    ) -> Result<Option<CatalogMatch>, ArchiveError>;
}

/// Client for an AMPEL-style catalog match service.
///
/// `GET {base}/{catalog}/nearest?ra_deg=..&dec_deg=..&rs_arcsec=..` answers
/// `null` or `{"dist_arcsec": .., "body": {..}}`.
#[derive(Debug, Clone)]
pub struct AmpelCatalogMatcher {
    client: reqwest::Client,
    base: Url,
    credentials: Credentials,
    catalogs: Vec<String>,
    middleware: Middleware,
}

impl AmpelCatalogMatcher {
    pub fn new(config: &CatalogConfig) -> Result<Self, ConfigurationError> {
        let base = parse_base_url("catalog.base_url", &config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigurationError::invalid("catalog", e.to_string()))?;
        Ok(AmpelCatalogMatcher {
            client,
            base,
            credentials: Credentials::Anonymous,
            catalogs: config.catalogs.clone(),
            middleware: Middleware::from_config(SERVICE_NAME, &config.retry, &config.rate_limit),
        })
    }

    pub fn nearest_url(&self, catalog: &str, ra: f64, dec: f64, radius_arcsec: f64) -> Url {
        let mut url = endpoint(&self.base, &[catalog, "nearest"]);
        url.query_pairs_mut()
            .append_pair("ra_deg", &ra.to_string())
            .append_pair("dec_deg", &dec.to_string())
            .append_pair("rs_arcsec", &radius_arcsec.to_string());
        url
    }
}

/// Read a nearest-match answer. Catalogs disagree on key names, so the
/// usual spellings are tried in turn.
pub fn parse_match(catalog: &str, body: &Value) -> Result<Option<CatalogMatch>, RequestError> {
    if body.is_null() {
        return Ok(None);
    }
    let distance_arcsec = body
        .get("dist_arcsec")
        .and_then(Value::as_f64)
        .ok_or_else(|| RequestError::Decode("match without 'dist_arcsec'".to_string()))?;
    let fields = body.get("body").unwrap_or(body);
    let text = |keys: &[&str]| {
        keys.iter().find_map(|key| match fields.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    };
    let redshift = ["z", "redshift"]
        .iter()
        .find_map(|key| match fields.get(*key) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|z| z.is_finite());
    let name = text(&["name", "objname", "_id"])
        .ok_or_else(|| RequestError::Decode("match without a name".to_string()))?;
    Ok(Some(CatalogMatch {
        catalog: catalog.to_string(),
        name,
        date: text(&["discoverydate", "date"]),
        group: text(&["reporting_group", "groupname", "type"]),
        distance_arcsec,
        redshift,
    }))
}

#[async_trait]
impl CatalogMatcher for AmpelCatalogMatcher {
    #[instrument(skip(self), err)]
    async fn best_match(
        &self,
        ra: f64,
        dec: f64,
        radius_arcsec: f64,
    ) -> Result<Option<CatalogMatch>, ArchiveError> {
        for catalog in &self.catalogs {
            let url = self.nearest_url(catalog, ra, dec, radius_arcsec);
            let body = self
                .middleware
                .call("best_match", move || {
                    get_json(&self.client, &self.credentials, url.clone())
                })
                .await?;
            let found = parse_match(catalog, &body).map_err(|source| ArchiveError::Rejected {
                service: SERVICE_NAME.to_string(),
                operation: "best_match".to_string(),
                source,
            })?;
            if let Some(found) = found {
                debug!(catalog = %catalog, name = %found.name, "catalog match");
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_match() {
        let body = json!({
            "dist_arcsec": 0.42,
            "body": {"name": "2019ebq", "discoverydate": "2019-04-26 07:54:14", "reporting_group": "ZTF"}
        });
        let found = parse_match("TNS", &body).unwrap().unwrap();
        assert_eq!(found.name, "2019ebq");
        assert_eq!(found.group.as_deref(), Some("ZTF"));
        assert_eq!(found.distance_arcsec, 0.42);
        assert_eq!(found.redshift, None);

        let galaxy = json!({"dist_arcsec": 2.5, "body": {"objname": "WISEA J1", "z": 0.0123}});
        let found = parse_match("NED", &galaxy).unwrap().unwrap();
        assert_eq!(found.name, "WISEA J1");
        assert_eq!(found.redshift, Some(0.0123));

        assert_eq!(parse_match("TNS", &Value::Null).unwrap(), None);
        assert!(parse_match("TNS", &json!({"body": {"name": "x"}})).is_err());
    }

    #[test]
    fn test_nearest_url() {
        let config = CatalogConfig {
            base_url: "https://ampel.example.org/api/catalogmatch/".to_string(),
            search_radius_arcsec: 3.0,
            catalogs: vec!["TNS".to_string()],
            timeout_secs: 10,
            rate_limit: Default::default(),
            retry: Default::default(),
        };
        let matcher = AmpelCatalogMatcher::new(&config).unwrap();
        let url = matcher.nearest_url("TNS", 10.5, -2.25, 3.0);
        assert_eq!(
            url.as_str(),
            "https://ampel.example.org/api/catalogmatch/TNS/nearest?ra_deg=10.5&dec_deg=-2.25&rs_arcsec=3"
        );
    }
}

//! An HTTP client that fetches features from the GrowthBook API.
use reqwest::{header, Response, StatusCode};
use serde_json::{Map, Value};
use url::Url;

use crate::{decryption::decrypt, Error, RepositoryConfig, Result};

const FEATURES_ENDPOINT: &str = "api/features";
const STREAM_ENDPOINT: &str = "sub";
const SSE_SUPPORT_HEADER: &str = "x-sse-support";

/// Features and saved groups extracted from a payload, decrypted if needed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FeaturesPayload {
    /// The `features` object, re-serialized.
    pub features_json: String,
    /// The `savedGroups` object, re-serialized. `{}` if the payload has none.
    pub saved_groups_json: String,
}

/// Result of a successful features request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FetchedFeatures {
    /// `None` if the server answered `304 Not Modified`.
    pub payload: Option<FeaturesPayload>,
    /// Whether the server advertised a streaming endpoint.
    pub sse_supported: bool,
}

pub(crate) struct FeaturesFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    // The streaming connection stays open indefinitely, so it cannot share the request timeout.
    stream_client: reqwest::Client,
    features_url: Url,
    stream_url: Url,
    decryption_key: Option<String>,
    /// `ETag` of the last accepted features response.
    etag: Option<String>,
}

impl FeaturesFetcher {
    pub fn new(config: &RepositoryConfig) -> Result<FeaturesFetcher> {
        let (features_url, stream_url) = endpoints(&config.api_host, &config.client_key)?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let stream_client = reqwest::Client::builder().build()?;

        Ok(FeaturesFetcher {
            client,
            stream_client,
            features_url,
            stream_url,
            decryption_key: config.decryption_key.clone(),
            etag: None,
        })
    }

    /// Fetch the features document. Sends `If-None-Match` once a response carried an `ETag`.
    pub async fn fetch_features(&mut self) -> Result<FetchedFeatures> {
        log::debug!(target: "growthbook", "fetching features");
        let mut request = self.client.get(self.features_url.clone());
        if let Some(etag) = &self.etag {
            request = request.header(header::IF_NONE_MATCH, etag.as_str());
        }
        let response = request.send().await?;

        let sse_supported = response
            .headers()
            .get(SSE_SUPPORT_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("enabled"));

        if response.status() == StatusCode::NOT_MODIFIED && self.etag.is_some() {
            log::debug!(target: "growthbook", "features not modified");
            return Ok(FetchedFeatures {
                payload: None,
                sse_supported,
            });
        }
        let response = check_status(response)?;

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await?;
        let payload = self.parse_payload(&body)?;
        // The tag is only worth sending back once its body was accepted.
        self.etag = etag;

        log::debug!(target: "growthbook", sse_supported = sse_supported; "successfully fetched features");
        Ok(FetchedFeatures {
            payload: Some(payload),
            sse_supported,
        })
    }

    /// Open the server-sent events connection. The body is consumed by the caller.
    pub async fn connect_stream(&self) -> Result<Response> {
        log::debug!(target: "growthbook", "opening streaming connection");
        let response = self
            .stream_client
            .get(self.stream_url.clone())
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        check_status(response)
    }

    /// Extract features and saved groups from a payload, with the configured decryption key.
    pub fn parse_payload(&self, body: &str) -> Result<FeaturesPayload> {
        parse_payload(body, self.decryption_key.as_deref())
    }
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        log::warn!(target: "growthbook", status = status.as_u16(); "client is not authorized. Check your client key");
    } else {
        log::warn!(target: "growthbook", status = status.as_u16(); "received non-200 response while fetching features");
    }
    Err(Error::HttpStatus(status))
}

/// Build the features and streaming endpoints for `api_host` and `client_key`.
pub(crate) fn endpoints(api_host: &str, client_key: &str) -> Result<(Url, Url)> {
    if client_key.is_empty() || client_key.contains('/') {
        return Err(Error::InvalidClientKey);
    }

    let base = Url::parse(&format!("{}/", api_host.trim_end_matches('/')))
        .map_err(Error::InvalidApiHost)?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(Error::Configuration(format!(
            "unsupported api_host scheme: {}",
            base.scheme()
        )));
    }

    let features_url = base
        .join(&format!("{FEATURES_ENDPOINT}/{client_key}"))
        .map_err(Error::InvalidApiHost)?;
    let stream_url = base
        .join(&format!("{STREAM_ENDPOINT}/{client_key}"))
        .map_err(Error::InvalidApiHost)?;
    Ok((features_url, stream_url))
}

/// Extract features and saved groups from a top-level payload.
///
/// With a `decryption_key`, features are read from `encryptedFeatures` and saved groups from
/// `encryptedSavedGroups`. Otherwise from `features` and `savedGroups`.
pub(crate) fn parse_payload(body: &str, decryption_key: Option<&str>) -> Result<FeaturesPayload> {
    let mut payload: Value = serde_json::from_str(body).inspect_err(|err| {
        log::warn!(target: "growthbook", error:display = err; "failed to parse features payload");
    })?;

    let (features, saved_groups) = match decryption_key {
        Some(key) => {
            let Some(encrypted_features) = payload.get("encryptedFeatures").and_then(Value::as_str)
            else {
                return Err(Error::Configuration(
                    "decryption key provided but endpoint not encrypted".to_owned(),
                ));
            };
            let features = serde_json::from_str(&decrypt(encrypted_features, key)?)?;
            let saved_groups = match payload.get("encryptedSavedGroups").and_then(Value::as_str) {
                Some(encrypted) => serde_json::from_str(&decrypt(encrypted, key)?)?,
                None => Value::Null,
            };
            (features, saved_groups)
        }
        None => {
            if payload.get("features").is_none() && payload.get("encryptedFeatures").is_some() {
                return Err(Error::Configuration(
                    "features are encrypted but no decryption key is configured".to_owned(),
                ));
            }
            let features = payload.get_mut("features").map(Value::take);
            let saved_groups = payload.get_mut("savedGroups").map(Value::take);
            (
                features.unwrap_or(Value::Null),
                saved_groups.unwrap_or(Value::Null),
            )
        }
    };

    let features @ Value::Object(_) = features else {
        return Err(Error::Configuration("no features found".to_owned()));
    };
    let saved_groups = match saved_groups {
        Value::Null => Value::Object(Map::new()),
        saved_groups @ Value::Object(_) => saved_groups,
        _ => {
            return Err(Error::Configuration(
                "saved groups must be an object".to_owned(),
            ))
        }
    };

    Ok(FeaturesPayload {
        features_json: features.to_string(),
        saved_groups_json: saved_groups.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{endpoints, parse_payload};
    use crate::{Error, FetchErrorCode};

    const DECRYPTION_KEY: &str = "Ns04T5n9+6bq9xG8pqzCkA==";
    const ENCRYPTED_FEATURES: &str = "AQIDBAUGBwgJCgsMDQ4PEA==./KZ1cIT6L8VnspnEhZW489USXc1rkAZiHezZbcw6AP80NRbhHeso97aNLvFEYuvfHBvIYUQ9ERFu5siFbh1EIhiYrIFRSCNTTljG1aVlglGCGmxRGPtxF7IvKMmib/zZD1huFl6dIWmuTNF5u7zxPg==";
    const ENCRYPTED_SAVED_GROUPS: &str =
        "oaKjpKWmp6ipqqusra6vsA==.3zP6pKdcchgNGTCSq9w8cWdxwyVqirvedqGhuTGm10A=";

    #[test]
    fn builds_endpoints() {
        let (features, stream) = endpoints("https://cdn.example.com/", "sdk-abc").unwrap();
        assert_eq!(
            features.as_str(),
            "https://cdn.example.com/api/features/sdk-abc"
        );
        assert_eq!(stream.as_str(), "https://cdn.example.com/sub/sdk-abc");
    }

    #[test]
    fn keeps_api_host_path_prefix() {
        let (features, _) = endpoints("http://localhost:3100/growthbook", "key").unwrap();
        assert_eq!(
            features.as_str(),
            "http://localhost:3100/growthbook/api/features/key"
        );
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(
            endpoints("not a host", "key"),
            Err(Error::InvalidApiHost(_))
        ));
        assert!(matches!(
            endpoints("ftp://example.com", "key"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            endpoints("https://example.com", ""),
            Err(Error::InvalidClientKey)
        ));
        assert!(matches!(
            endpoints("https://example.com", "a/b"),
            Err(Error::InvalidClientKey)
        ));
    }

    #[test]
    fn extracts_features_object() {
        let payload =
            parse_payload(r#"{"status": 200, "features": {"a": {"defaultValue": 1}}}"#, None)
                .unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&payload.features_json).unwrap(),
            json!({"a": {"defaultValue": 1}})
        );
        assert_eq!(payload.saved_groups_json, "{}");
    }

    #[test]
    fn extracts_saved_groups() {
        let payload = parse_payload(
            r#"{"features": {}, "savedGroups": {"grp_beta": ["1", "2"]}}"#,
            None,
        )
        .unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&payload.saved_groups_json).unwrap(),
            json!({"grp_beta": ["1", "2"]})
        );
    }

    #[test]
    fn payload_without_features_is_a_configuration_error() {
        for body in [
            r#"{"status": 200}"#,
            r#"{"features": []}"#,
            r#"{"features": {}, "savedGroups": [1]}"#,
            r#"{"encryptedFeatures": "abc"}"#,
            "[]",
        ] {
            let err = parse_payload(body, None).unwrap_err();
            assert_eq!(err.code(), FetchErrorCode::ConfigurationError, "{body}");
        }
        assert_eq!(
            parse_payload("{", None).unwrap_err().code(),
            FetchErrorCode::ParseError
        );
    }

    #[test]
    fn decrypts_features_and_saved_groups() {
        let body = json!({
            "encryptedFeatures": ENCRYPTED_FEATURES,
            "encryptedSavedGroups": ENCRYPTED_SAVED_GROUPS,
        })
        .to_string();

        let payload = parse_payload(&body, Some(DECRYPTION_KEY)).unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&payload.features_json).unwrap(),
            json!({"greeting": {
                "defaultValue": "hello",
                "rules": [{"condition": {"id": {"$inGroup": "grp_beta"}}, "force": "bonjour"}]
            }})
        );
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&payload.saved_groups_json).unwrap(),
            json!({"grp_beta": ["1", "2"]})
        );
    }

    #[test]
    fn decryption_key_requires_an_encrypted_endpoint() {
        let err = parse_payload(r#"{"features": {}}"#, Some(DECRYPTION_KEY)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let body = json!({"encryptedFeatures": ENCRYPTED_FEATURES}).to_string();
        let err = parse_payload(&body, Some("BhB1wORFmZLTDjbvstvS8w==")).unwrap_err();
        assert!(matches!(err, Error::Decryption(_)));
        assert_eq!(err.code(), FetchErrorCode::ConfigurationError);
    }
}

//! Container registry introspection
//!
//! The build and sign stages are skipped once their target image exists.
//! [`HttpRegistry`] answers that question with a `HEAD` request against the
//! OCI distribution API, following bearer token challenges and using the
//! credentials from the Module pull secret.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::crd::TlsOptions;
use crate::error::{Error, Result};

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";

/// Answers whether an image reference can be pulled
#[async_trait]
pub trait Registry: Send + Sync {
    async fn image_exists(
        &self,
        image: &str,
        tls: &TlsOptions,
        auth: Option<&RegistryAuth>,
    ) -> Result<bool>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Credentials {
    username: String,
    password: String,
}

/// Registry credentials keyed by registry host
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    auths: BTreeMap<String, Credentials>,
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Parse the contents of a `.dockerconfigjson` secret key
    pub fn from_docker_config(data: &[u8]) -> Result<Self> {
        let config: DockerConfig = serde_json::from_slice(data)?;
        let mut auths = BTreeMap::new();

        for (server, entry) in config.auths {
            let credentials = match (entry.username, entry.password, entry.auth) {
                (Some(username), Some(password), _) => Credentials { username, password },
                (_, _, Some(encoded)) => {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(encoded.trim())
                        .map_err(|e| Error::ConfigError(format!("invalid auth for {}: {}", server, e)))?;
                    let decoded = String::from_utf8_lossy(&decoded).to_string();
                    let (username, password) = decoded.split_once(':').ok_or_else(|| {
                        Error::ConfigError(format!("auth for {} is not user:password", server))
                    })?;
                    Credentials {
                        username: username.to_string(),
                        password: password.to_string(),
                    }
                }
                _ => continue,
            };
            auths.insert(normalize_server(&server), credentials);
        }

        Ok(Self { auths })
    }

    fn credentials_for(&self, registry: &str) -> Option<&Credentials> {
        self.auths.get(registry).or_else(|| {
            (registry == DOCKER_HUB_API)
                .then(|| self.auths.get(DOCKER_HUB))
                .flatten()
        })
    }
}

/// Reduce a docker config server key to a bare host
fn normalize_server(server: &str) -> String {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(server);
    match host {
        "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB.to_string(),
        other => other.to_string(),
    }
}

/// Parsed image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    /// Host serving the distribution API
    pub registry: String,
    pub repository: String,
    /// Tag or digest
    pub reference: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> Result<Self> {
        if image.is_empty() {
            return Err(Error::RegistryError("empty image reference".to_string()));
        }

        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => {
                let last_slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
                match image[last_slash..].rfind(':') {
                    Some(i) => (
                        &image[..last_slash + i],
                        image[last_slash + i + 1..].to_string(),
                    ),
                    None => (image, "latest".to_string()),
                }
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DOCKER_HUB_API.to_string(), name.to_string()),
            None => (DOCKER_HUB_API.to_string(), format!("library/{}", name)),
        };

        let registry = if registry == DOCKER_HUB || registry == "index.docker.io" {
            DOCKER_HUB_API.to_string()
        } else {
            registry
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Registry client speaking the OCI distribution API
#[derive(Clone)]
pub struct HttpRegistry {
    client: Client,
    insecure_client: Client,
}

impl HttpRegistry {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("kmm-operator/0.1.0")
            .build()
            .map_err(Error::HttpError)?;
        let insecure_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("kmm-operator/0.1.0")
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self {
            client,
            insecure_client,
        })
    }

    async fn head_manifest(
        &self,
        client: &Client,
        url: &str,
        credentials: Option<&Credentials>,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut request = client.head(url).header(ACCEPT, MANIFEST_MEDIA_TYPES);
        request = match (token, credentials) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some(c)) => request.basic_auth(&c.username, Some(&c.password)),
            (None, None) => request,
        };
        Ok(request.send().await?)
    }

    /// Exchange a `WWW-Authenticate: Bearer ...` challenge for a token
    async fn fetch_token(
        &self,
        client: &Client,
        challenge: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        let params = parse_challenge(challenge);
        let realm = params
            .get("realm")
            .ok_or_else(|| Error::RegistryError(format!("no realm in challenge {:?}", challenge)))?;

        let query: Vec<(&str, &str)> = ["service", "scope"]
            .iter()
            .filter_map(|k| params.get(*k).map(|v| (*k, v.as_str())))
            .collect();

        let mut request = client.get(realm.as_str()).query(&query);
        if let Some(c) = credentials {
            request = request.basic_auth(&c.username, Some(&c.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::RegistryError(format!(
                "token request to {} returned {}",
                realm,
                response.status()
            )));
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| Error::RegistryError(format!("no token returned by {}", realm)))
    }
}

/// Parse the `key="value"` parameters of a bearer challenge
fn parse_challenge(challenge: &str) -> BTreeMap<String, String> {
    let re = match Regex::new(r#"(\w+)="([^"]*)""#) {
        Ok(re) => re,
        Err(_) => return BTreeMap::new(),
    };
    re.captures_iter(challenge)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

#[async_trait]
impl Registry for HttpRegistry {
    #[instrument(skip(self, tls, auth))]
    async fn image_exists(
        &self,
        image: &str,
        tls: &TlsOptions,
        auth: Option<&RegistryAuth>,
    ) -> Result<bool> {
        let image_ref = ImageRef::parse(image)?;
        let scheme = if tls.insecure { "http" } else { "https" };
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme, image_ref.registry, image_ref.repository, image_ref.reference
        );
        let client = if tls.insecure_skip_tls_verify {
            &self.insecure_client
        } else {
            &self.client
        };
        let credentials = auth.and_then(|a| a.credentials_for(&image_ref.registry));

        let mut response = self.head_manifest(client, &url, credentials, None).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if challenge.to_ascii_lowercase().starts_with("bearer") {
                let token = self.fetch_token(client, &challenge, credentials).await?;
                response = self
                    .head_manifest(client, &url, credentials, Some(&token))
                    .await?;
            }
        }

        debug!("HEAD {} returned {}", url, response.status());
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::RegistryError(format!(
                "unexpected status {} for {}",
                s, image
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plain_http() -> TlsOptions {
        TlsOptions {
            insecure: true,
            insecure_skip_tls_verify: false,
        }
    }

    #[test]
    fn test_parse_image_references() {
        let r = ImageRef::parse("quay.io/org/kmod:5.14.0_ns_m_kmm_unsigned").unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.repository, "org/kmod");
        assert_eq!(r.reference, "5.14.0_ns_m_kmm_unsigned");

        let r = ImageRef::parse("localhost:5000/kmod").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.reference, "latest");

        let r = ImageRef::parse("busybox").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/busybox");

        let r = ImageRef::parse("org/img@sha256:abcd").unwrap();
        assert_eq!(r.repository, "org/img");
        assert_eq!(r.reference, "sha256:abcd");
    }

    #[test]
    fn test_docker_config_parsing() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pass");
        let config = serde_json::json!({
            "auths": {
                "https://index.docker.io/v1/": { "auth": encoded },
                "quay.io": { "username": "robot", "password": "secret" }
            }
        });
        let auth = RegistryAuth::from_docker_config(config.to_string().as_bytes()).unwrap();

        let hub = auth.credentials_for("registry-1.docker.io").unwrap();
        assert_eq!(hub.username, "user");
        assert_eq!(hub.password, "pass");
        assert_eq!(auth.credentials_for("quay.io").unwrap().username, "robot");
        assert!(auth.credentials_for("ghcr.io").is_none());
    }

    #[test]
    fn test_parse_challenge() {
        let params = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry",scope="repository:org/kmod:pull""#,
        );
        assert_eq!(params["realm"], "https://auth.example.com/token");
        assert_eq!(params["service"], "registry");
        assert_eq!(params["scope"], "repository:org/kmod:pull");
    }

    #[tokio::test]
    async fn test_image_exists_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/v2/org/kmod/manifests/present"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/v2/org/kmod/manifests/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let host = server.address().to_string();
        let registry = HttpRegistry::new().unwrap();

        assert!(registry
            .image_exists(&format!("{}/org/kmod:present", host), &plain_http(), None)
            .await
            .unwrap());
        assert!(!registry
            .image_exists(&format!("{}/org/kmod:absent", host), &plain_http(), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_image_exists_follows_bearer_challenge() {
        let server = MockServer::start().await;
        let host = server.address().to_string();

        Mock::given(method("HEAD"))
            .and(path("/v2/org/kmod/manifests/v1"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/v2/org/kmod/manifests/v1"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "www-authenticate",
                format!(
                    r#"Bearer realm="http://{}/token",service="test",scope="repository:org/kmod:pull""#,
                    host
                )
                .as_str(),
            ))
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": "t0ken" })))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new().unwrap();
        assert!(registry
            .image_exists(&format!("{}/org/kmod:v1", host), &plain_http(), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unexpected_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new().unwrap();
        let err = registry
            .image_exists(&format!("{}/org/kmod:v1", server.address()), &plain_http(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryError(_)));
    }
}

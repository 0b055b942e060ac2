//! Agent-side bootstrap against the operator's certificate API: fetch the
//! CA once (trust on first use, pinned thereafter), obtain a signed peer
//! certificate with a single-use token, and publish the agent's endpoint
//! over the resulting mutually-authenticated channel.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use fabedge_operator_core::{protocol, Endpoint};
use rcgen::{CertificateParams, DnType, KeyPair};
use reqwest::StatusCode;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

const CA_CERT_FILE: &str = "ca.crt";
const TLS_CERT_FILE: &str = "tls.crt";
const TLS_KEY_FILE: &str = "tls.key";

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("failed to prepare credentials: {0}")]
    Credentials(#[from] rcgen::Error),

    #[error("failed to persist credentials: {0}")]
    Io(#[from] std::io::Error),
}

/// The agent's pinned trust anchors and TLS identity, all PEM.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub ca_cert: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Builds a PKCS#10 request carrying the endpoint ID as CommonName. Returns
/// the key pair alongside the PEM request.
pub fn new_cert_request(common_name: &str) -> Result<(KeyPair, String), Error> {
    let key = KeyPair::generate()?;
    let mut params = CertificateParams::new(Vec::new())?;
    params.distinguished_name.push(DnType::CommonName, common_name);
    let csr = params.serialize_request(&key)?;
    Ok((key, csr.pem()?))
}

/// Fetches the operator CA, PEM-encoded. Unauthenticated by design: this is
/// the trust-on-first-use step.
pub async fn get_certificate(base_url: &str) -> Result<Vec<u8>, Error> {
    let response = reqwest::get(format!("{base_url}{}", protocol::URL_GET_CA)).await?;
    let response = expect_status(response, StatusCode::OK).await?;
    Ok(response.bytes().await?.to_vec())
}

/// Submits a CSR under a single-use bearer token and returns the signed
/// certificate PEM. When a CA is given, the server identity is verified
/// against it alone.
pub async fn sign_cert_by_token(
    base_url: &str,
    token: &str,
    csr_pem: &[u8],
    ca_pem: Option<&[u8]>,
) -> Result<Vec<u8>, Error> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();
    if let Some(ca) = ca_pem {
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(reqwest::Certificate::from_pem(ca)?);
    }
    let client = builder.build()?;

    let response = client
        .post(format!("{base_url}{}", protocol::URL_SIGN_CERT))
        .header(
            reqwest::header::AUTHORIZATION,
            format!("{}{token}", protocol::BEARER_PREFIX),
        )
        .body(csr_pem.to_vec())
        .send()
        .await?;
    let response = expect_status(response, StatusCode::OK).await?;
    Ok(response.bytes().await?.to_vec())
}

/// An authenticated handle to the operator API, presenting the agent's
/// certificate as TLS client credential.
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

// === impl Client ===

impl Client {
    pub fn new(base_url: impl Into<String>, credentials: Option<&Credentials>) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(credentials) = credentials {
            let mut identity = credentials.cert.clone();
            identity.extend_from_slice(&credentials.key);
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(reqwest::Certificate::from_pem(&credentials.ca_cert)?)
                .identity(reqwest::Identity::from_pem(&identity)?);
        }
        Ok(Self {
            base_url: base_url.into(),
            http: builder.build()?,
        })
    }

    /// Publishes the agent's endpoint records; the operator writes them to
    /// its store and folds them into the next topology rebuild.
    pub async fn update_endpoints(&self, endpoints: &[Endpoint]) -> Result<(), Error> {
        let response = self
            .http
            .put(format!("{}{}", self.base_url, protocol::URL_UPDATE_ENDPOINTS))
            .json(endpoints)
            .send()
            .await?;
        expect_status(response, StatusCode::NO_CONTENT).await?;
        debug!(endpoints = endpoints.len(), "published endpoints");
        Ok(())
    }
}

/// Runs the full bootstrap once, persisting the credentials under `dir`.
/// Existing credentials are reused as-is; in particular the CA stays pinned
/// to whatever was fetched first.
pub async fn bootstrap(
    base_url: &str,
    token: &str,
    common_name: &str,
    dir: &Path,
) -> Result<Credentials, Error> {
    let ca_path = dir.join(CA_CERT_FILE);
    let cert_path = dir.join(TLS_CERT_FILE);
    let key_path = dir.join(TLS_KEY_FILE);

    if tokio::fs::try_exists(&ca_path).await?
        && tokio::fs::try_exists(&cert_path).await?
        && tokio::fs::try_exists(&key_path).await?
    {
        debug!(?dir, "reusing persisted credentials");
        return Ok(Credentials {
            ca_cert: tokio::fs::read(&ca_path).await?,
            cert: tokio::fs::read(&cert_path).await?,
            key: tokio::fs::read(&key_path).await?,
        });
    }

    let ca_cert = get_certificate(base_url).await?;
    let (key, csr_pem) = new_cert_request(common_name)?;
    let cert = sign_cert_by_token(base_url, token, csr_pem.as_bytes(), Some(&ca_cert)).await?;
    let key = key.serialize_pem().into_bytes();

    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&ca_path, &ca_cert).await?;
    tokio::fs::write(&cert_path, &cert).await?;
    tokio::fs::write(&key_path, &key).await?;
    info!(%common_name, ?dir, "bootstrapped agent credentials");

    Ok(Credentials { ca_cert, cert, key })
}

async fn expect_status(
    response: reqwest::Response,
    expected: StatusCode,
) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status != expected {
        let message = response.text().await.unwrap_or_default();
        return Err(Error::Status { status, message });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::{body::Incoming, service::service_fn, Request, Response};
    use hyper_util::rt::TokioIo;
    use std::{collections::VecDeque, convert::Infallible, sync::Arc};
    use tokio::{net::TcpListener, sync::Mutex};
    use x509_parser::prelude::FromDer;

    struct Received {
        method: String,
        path: String,
        authorization: Option<String>,
        body: Vec<u8>,
    }

    /// An in-process HTTP server that answers each request with the next
    /// canned response and records what it saw.
    async fn serve(
        responses: Vec<Response<Full<Bytes>>>,
    ) -> (String, Arc<Mutex<Vec<Received>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let responses = Arc::new(Mutex::new(responses.into_iter().collect::<VecDeque<_>>()));

        let state = received.clone();
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let state = state.clone();
                let responses = responses.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        let responses = responses.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await.unwrap().to_bytes().to_vec();
                            state.lock().await.push(Received {
                                method: parts.method.to_string(),
                                path: parts.uri.path().to_string(),
                                authorization: parts
                                    .headers
                                    .get(hyper::header::AUTHORIZATION)
                                    .map(|v| v.to_str().unwrap().to_string()),
                                body,
                            });
                            let response = responses
                                .lock()
                                .await
                                .pop_front()
                                .expect("mock server ran out of responses");
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tcp), service)
                        .await;
                });
            }
        });
        (format!("http://{addr}"), received)
    }

    fn ok_body(bytes: Vec<u8>) -> Response<Full<Bytes>> {
        Response::builder()
            .status(hyper::StatusCode::OK)
            .body(Full::new(Bytes::from(bytes)))
            .unwrap()
    }

    fn status_only(status: hyper::StatusCode) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .body(Full::default())
            .unwrap()
    }

    fn ca_pem() -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "test CA");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.self_signed(&key).unwrap().pem().into_bytes()
    }

    #[tokio::test]
    async fn get_certificate_fetches_the_ca() {
        let ca = ca_pem();
        let (url, received) = serve(vec![ok_body(ca.clone())]).await;

        let fetched = get_certificate(&url).await.unwrap();
        assert_eq!(fetched, ca);

        let received = received.lock().await;
        assert_eq!(received[0].method, "GET");
        assert_eq!(received[0].path, protocol::URL_GET_CA);
    }

    #[tokio::test]
    async fn sign_cert_by_token_posts_the_csr_under_the_token() {
        let (url, received) = serve(vec![ok_body(b"signed".to_vec())]).await;
        let (_key, csr_pem) = new_cert_request("edge1").unwrap();

        let cert = sign_cert_by_token(&url, "123456", csr_pem.as_bytes(), None)
            .await
            .unwrap();
        assert_eq!(cert, b"signed");

        let received = received.lock().await;
        assert_eq!(received[0].method, "POST");
        assert_eq!(received[0].path, protocol::URL_SIGN_CERT);
        assert_eq!(received[0].authorization.as_deref(), Some("Bearer 123456"));
        assert_eq!(received[0].body, csr_pem.as_bytes());
    }

    #[tokio::test]
    async fn rejections_surface_as_status_errors() {
        let (url, _received) = serve(vec![status_only(hyper::StatusCode::UNAUTHORIZED)]).await;
        let (_key, csr_pem) = new_cert_request("edge1").unwrap();

        match sign_cert_by_token(&url, "wrong", csr_pem.as_bytes(), None).await {
            Err(Error::Status { status, .. }) => assert_eq!(status, StatusCode::UNAUTHORIZED),
            other => panic!("expected a status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_endpoints_puts_json() {
        let (url, received) = serve(vec![status_only(hyper::StatusCode::NO_CONTENT)]).await;

        let endpoints = vec![Endpoint {
            id: "edge1-id".to_string(),
            name: "edge1".to_string(),
            public_addresses: vec!["60.10.10.1".to_string()],
            subnets: vec!["2.2.0.0/24".to_string()],
            node_subnets: vec!["10.10.10.1".to_string()],
            ..Default::default()
        }];
        let client = Client::new(&url, None).unwrap();
        client.update_endpoints(&endpoints).await.unwrap();

        let received = received.lock().await;
        assert_eq!(received[0].method, "PUT");
        assert_eq!(received[0].path, protocol::URL_UPDATE_ENDPOINTS);
        let sent: Vec<Endpoint> = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(sent, endpoints);
    }

    #[tokio::test]
    async fn csr_carries_the_requested_common_name() {
        let (_key, csr_pem) = new_cert_request("edge-node-7").unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes()).unwrap();
        let (_, csr) =
            x509_parser::certification_request::X509CertificationRequest::from_der(&pem.contents)
                .unwrap();
        let cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(cn, "edge-node-7");
    }

    #[tokio::test]
    async fn bootstrap_persists_and_then_pins_credentials() {
        let ca = ca_pem();
        let (url, _received) = serve(vec![ok_body(ca.clone()), ok_body(b"signed".to_vec())]).await;

        let dir = tempfile::tempdir().unwrap();
        let credentials = bootstrap(&url, "123456", "edge1", dir.path()).await.unwrap();
        assert_eq!(credentials.ca_cert, ca);
        assert_eq!(credentials.cert, b"signed");
        assert!(!credentials.key.is_empty());

        // A second bootstrap never talks to the server again; the mock has
        // no responses left, so a request would panic the connection task
        // and surface here as an error.
        let reloaded = bootstrap(&url, "unused", "edge1", dir.path()).await.unwrap();
        assert_eq!(reloaded.ca_cert, credentials.ca_cert);
        assert_eq!(reloaded.cert, credentials.cert);
        assert_eq!(reloaded.key, credentials.key);
    }
}

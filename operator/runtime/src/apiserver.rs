//! The certificate-bootstrap API: CA distribution, token-gated CSR signing,
//! and client-certificate-authenticated endpoint publication. The server
//! terminates TLS itself so the client certificate, when presented, can be
//! verified against the operator CA and consulted per route.

use crate::{
    cert::{CertManager, SignError},
    token::TokenStore,
};
use anyhow::{Context, Result};
use bytes::Bytes;
use fabedge_operator_core::{protocol, Endpoint};
use fabedge_operator_k8s_index::SharedStore;
use futures::future;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, header, Method, Request, Response, StatusCode};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use rustls::{server::WebPkiClientVerifier, ServerConfig};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

type Body = Full<Bytes>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),
}

pub struct ApiServer {
    addr: SocketAddr,
    names: Vec<String>,
    cert_manager: Arc<CertManager>,
    tokens: Arc<TokenStore>,
    store: SharedStore,
}

#[derive(Clone)]
struct ApiService {
    cert_manager: Arc<CertManager>,
    tokens: Arc<TokenStore>,
    store: SharedStore,
    client_verified: bool,
}

// === impl ApiServer ===

impl ApiServer {
    pub fn new(
        addr: SocketAddr,
        names: Vec<String>,
        cert_manager: Arc<CertManager>,
        tokens: Arc<TokenStore>,
        store: SharedStore,
    ) -> Self {
        Self {
            addr,
            names,
            cert_manager,
            tokens,
            store,
        }
    }

    pub async fn run(self, drain: drain::Watch) -> Result<()> {
        let tls = tls_config(&self.cert_manager, self.names.clone())?;
        let acceptor = TlsAcceptor::from(Arc::new(tls));
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        info!(addr = %self.addr, "certificate API server listening");

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("certificate API server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (tcp, client_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(error) => {
                            warn!(%error, "failed to accept connection");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let service = ApiService {
                        cert_manager: self.cert_manager.clone(),
                        tokens: self.tokens.clone(),
                        store: self.store.clone(),
                        client_verified: false,
                    };
                    tokio::spawn(async move {
                        let tls = match acceptor.accept(tcp).await {
                            Ok(tls) => tls,
                            Err(error) => {
                                debug!(%client_addr, %error, "TLS handshake failed");
                                return;
                            }
                        };
                        let client_verified = tls
                            .get_ref()
                            .1
                            .peer_certificates()
                            .map_or(false, |certs| !certs.is_empty());
                        let service = TowerToHyperService::new(ApiService {
                            client_verified,
                            ..service
                        });
                        if let Err(error) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(tls), service)
                            .await
                        {
                            debug!(%client_addr, %error, "connection failed");
                        }
                    });
                }
            }
        }
    }
}

/// Client certificates are optional at the TLS layer; routes that require
/// them check the handshake outcome instead.
fn tls_config(cert_manager: &CertManager, names: Vec<String>) -> Result<ServerConfig> {
    let (chain, key) = cert_manager.server_credentials(names)?;

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(cert_manager.ca_cert_der()?)
        .context("failed to trust the CA root")?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .context("failed to build client verifier")?;

    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("failed to select TLS versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .context("failed to configure server certificate")
}

// === impl ApiService ===

impl tower::Service<Request<Incoming>> for ApiService {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            match (req.method().clone(), req.uri().path()) {
                (Method::GET, protocol::URL_GET_CA) => Ok(ca_response(&service.cert_manager)),
                (Method::POST, protocol::URL_SIGN_CERT) => {
                    let bearer = bearer_token(&req).map(String::from);
                    let body = req.into_body().collect().await?.to_bytes();
                    Ok(sign_cert_response(
                        &service.cert_manager,
                        &service.tokens,
                        bearer.as_deref(),
                        &body,
                    ))
                }
                (Method::PUT, protocol::URL_UPDATE_ENDPOINTS) => {
                    let body = req.into_body().collect().await?.to_bytes();
                    Ok(update_endpoints_response(
                        &service.store,
                        service.client_verified,
                        &body,
                    ))
                }
                _ => Ok(status_response(StatusCode::NOT_FOUND, "")),
            }
        })
    }
}

fn bearer_token(req: &Request<Incoming>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix(protocol::BEARER_PREFIX)
}

fn ca_response(cert_manager: &CertManager) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-pem-file")
        .body(Body::from(Bytes::from(
            cert_manager.ca_cert_pem().to_string(),
        )))
        .expect("CA response must be valid")
}

fn sign_cert_response(
    cert_manager: &CertManager,
    tokens: &TokenStore,
    bearer: Option<&str>,
    body: &[u8],
) -> Response<Body> {
    // The token is checked before the body is even looked at; a mismatch or
    // a replay is indistinguishable from the outside.
    let authorized = bearer.map(|token| tokens.redeem(token)).unwrap_or(false);
    if !authorized {
        warn!("rejected sign-cert request with a bad or replayed token");
        return status_response(StatusCode::UNAUTHORIZED, "invalid token");
    }

    let Ok(csr_pem) = std::str::from_utf8(body) else {
        return status_response(StatusCode::BAD_REQUEST, "request body is not PEM");
    };
    match cert_manager.sign_csr(csr_pem) {
        Ok(cert_pem) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/x-pem-file")
            .body(Body::from(Bytes::from(cert_pem)))
            .expect("sign-cert response must be valid"),
        Err(error @ SignError::BadRequest(_)) => {
            warn!(%error, "rejected malformed CSR");
            status_response(StatusCode::BAD_REQUEST, &error.to_string())
        }
        Err(error) => {
            warn!(%error, "failed to sign CSR");
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "signing failed")
        }
    }
}

fn update_endpoints_response(
    store: &SharedStore,
    client_verified: bool,
    body: &[u8],
) -> Response<Body> {
    if !client_verified {
        warn!("rejected endpoint update without a client certificate");
        return status_response(StatusCode::UNAUTHORIZED, "client certificate required");
    }

    let endpoints: Vec<Endpoint> = match serde_json::from_slice(body) {
        Ok(endpoints) => endpoints,
        Err(error) => {
            warn!(%error, "rejected unparseable endpoint update");
            return status_response(StatusCode::BAD_REQUEST, &error.to_string());
        }
    };
    for endpoint in &endpoints {
        if let Err(error) = endpoint.validate() {
            warn!(%error, "rejected invalid endpoint");
            return status_response(StatusCode::BAD_REQUEST, &error.to_string());
        }
    }

    for endpoint in endpoints {
        debug!(name = %endpoint.name, "saving endpoint");
        store.save(endpoint);
    }
    status_response(StatusCode::NO_CONTENT, "")
}

fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(Bytes::from(message.to_string())))
        .expect("status response must be valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabedge_operator_client::new_cert_request;
    use fabedge_operator_core::EndpointType;
    use fabedge_operator_k8s_index::Store;
    use time::Duration;
    use x509_parser::prelude::parse_x509_certificate;

    fn manager() -> Arc<CertManager> {
        Arc::new(CertManager::self_signed(Duration::days(365)).unwrap())
    }

    async fn body_bytes(response: Response<Body>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn ca_response_serves_the_ca_raw_bytes() {
        let manager = manager();
        let response = ca_response(&manager);
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_bytes(response).await;
        let (_, pem) = x509_parser::pem::parse_x509_pem(&body).unwrap();
        let expected = manager.ca_cert_der().unwrap();
        assert_eq!(pem.contents.as_slice(), expected.as_ref());
    }

    #[tokio::test]
    async fn sign_cert_requires_a_valid_unused_token() {
        let manager = manager();
        let tokens = TokenStore::new(["123456".to_string()]);
        let (_key, csr_pem) = new_cert_request("edge1").unwrap();

        // Wrong token of the correct length.
        let response =
            sign_cert_response(&manager, &tokens, Some("654321"), csr_pem.as_bytes());
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Missing header.
        let response = sign_cert_response(&manager, &tokens, None, csr_pem.as_bytes());
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Correct token.
        let response =
            sign_cert_response(&manager, &tokens, Some("123456"), csr_pem.as_bytes());
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        let (_, pem) = x509_parser::pem::parse_x509_pem(&body).unwrap();
        let (_, cert) = parse_x509_certificate(&pem.contents).unwrap();
        assert_eq!(
            cert.subject()
                .iter_common_name()
                .next()
                .unwrap()
                .as_str()
                .unwrap(),
            "edge1",
        );

        // Replay after first use.
        let response =
            sign_cert_response(&manager, &tokens, Some("123456"), csr_pem.as_bytes());
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sign_cert_rejects_malformed_csrs() {
        let manager = manager();
        let tokens = TokenStore::new(["123456".to_string()]);

        let response = sign_cert_response(&manager, &tokens, Some("123456"), b"not a csr");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn update_endpoints_requires_a_client_certificate() {
        let store = Store::shared();
        let response = update_endpoints_response(&store, false, b"[]");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.all_endpoint_names().is_empty());
    }

    #[test]
    fn update_endpoints_saves_valid_records() {
        let store = Store::shared();
        let endpoints = vec![Endpoint {
            id: "edge1-id".to_string(),
            name: "edge1".to_string(),
            public_addresses: vec!["60.10.10.1".to_string()],
            subnets: vec!["10.233.64.0/24".to_string()],
            node_subnets: vec!["60.10.10.1".to_string()],
            kind: EndpointType::EdgeNode,
        }];
        let body = serde_json::to_vec(&endpoints).unwrap();

        let response = update_endpoints_response(&store, true, &body);
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(store.get("edge1"), Some(endpoints[0].clone()));
    }

    #[test]
    fn update_endpoints_rejects_bad_payloads() {
        let store = Store::shared();

        let response = update_endpoints_response(&store, true, b"not json");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // A record with an empty name is a configuration error, not a store
        // write.
        let body = serde_json::to_vec(&vec![Endpoint::default()]).unwrap();
        let response = update_endpoints_response(&store, true, &body);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.all_endpoint_names().is_empty());
    }
}

//! The operator's certificate authority: loaded from a cluster Secret or
//! generated self-signed on first start, then used to sign agent CSRs and to
//! issue the API server's own TLS identity.

use anyhow::{anyhow, Context, Result};
use fabedge_operator_k8s_api::{self as k8s, Api, ByteString, PostParams, Secret};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DnType, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::info;

pub const CA_CERT_SECRET_KEY: &str = "ca.crt";
pub const CA_KEY_SECRET_KEY: &str = "ca.key";

const CA_COMMON_NAME: &str = "fabedge-ca";

#[derive(Debug, Error)]
pub enum SignError {
    #[error("malformed certificate request: {0}")]
    BadRequest(#[source] rcgen::Error),

    #[error("failed to sign certificate: {0}")]
    Signing(#[source] rcgen::Error),
}

pub struct CertManager {
    ca: Certificate,
    ca_key: KeyPair,
    // The authoritative CA bytes. When the CA was loaded from the Secret
    // these differ from a re-rendering of `ca`, and these are what agents
    // must pin.
    ca_pem: String,
    validity: Duration,
}

// === impl CertManager ===

impl CertManager {
    pub fn self_signed(validity: Duration) -> Result<Self> {
        let ca_key = KeyPair::generate().context("failed to generate CA key")?;
        let mut params =
            CertificateParams::new(Vec::new()).context("failed to build CA params")?;
        params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + validity;

        let ca = params
            .self_signed(&ca_key)
            .context("failed to self-sign CA certificate")?;
        let ca_pem = ca.pem();
        Ok(Self {
            ca,
            ca_key,
            ca_pem,
            validity,
        })
    }

    pub fn from_pem(ca_pem: &str, key_pem: &str, validity: Duration) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem).context("failed to parse CA key")?;
        let params = CertificateParams::from_ca_cert_pem(ca_pem)
            .context("failed to parse CA certificate")?;
        let ca = params
            .self_signed(&ca_key)
            .context("failed to rebuild CA issuer")?;
        Ok(Self {
            ca,
            ca_key,
            ca_pem: ca_pem.to_string(),
            validity,
        })
    }

    /// Loads the CA from the named Secret, generating and persisting a
    /// self-signed one when the Secret does not exist yet.
    pub async fn load_or_create(
        client: k8s::Client,
        namespace: &str,
        secret_name: &str,
        validity: Duration,
    ) -> Result<Self> {
        let api = Api::<Secret>::namespaced(client, namespace);
        match api.get(secret_name).await {
            Ok(secret) => {
                let data = secret.data.unwrap_or_default();
                let cert = data
                    .get(CA_CERT_SECRET_KEY)
                    .ok_or_else(|| anyhow!("secret {secret_name} is missing {CA_CERT_SECRET_KEY}"))?;
                let key = data
                    .get(CA_KEY_SECRET_KEY)
                    .ok_or_else(|| anyhow!("secret {secret_name} is missing {CA_KEY_SECRET_KEY}"))?;
                Self::from_pem(
                    std::str::from_utf8(&cert.0).context("CA certificate is not UTF-8")?,
                    std::str::from_utf8(&key.0).context("CA key is not UTF-8")?,
                    validity,
                )
            }
            Err(k8s::Error::Api(resp)) if resp.code == 404 => {
                let manager = Self::self_signed(validity)?;
                let secret = Secret {
                    metadata: k8s::ObjectMeta {
                        name: Some(secret_name.to_string()),
                        ..Default::default()
                    },
                    data: Some(
                        [
                            (
                                CA_CERT_SECRET_KEY.to_string(),
                                ByteString(manager.ca_pem.clone().into_bytes()),
                            ),
                            (
                                CA_KEY_SECRET_KEY.to_string(),
                                ByteString(manager.ca_key.serialize_pem().into_bytes()),
                            ),
                        ]
                        .into(),
                    ),
                    type_: Some("Opaque".to_string()),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &secret)
                    .await
                    .context("failed to persist generated CA")?;
                info!(%secret_name, "generated a self-signed CA");
                Ok(manager)
            }
            Err(error) => Err(error).context("failed to read CA secret"),
        }
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_pem
    }

    pub fn ca_cert_der(&self) -> Result<CertificateDer<'static>> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(self.ca_pem.as_bytes())
            .map_err(|error| anyhow!("stored CA is not valid PEM: {error}"))?;
        Ok(CertificateDer::from(pem.contents))
    }

    /// Signs a PEM-encoded PKCS#10 request, preserving its subject and
    /// returning the certificate PEM.
    pub fn sign_csr(&self, csr_pem: &str) -> Result<String, SignError> {
        let mut csr =
            CertificateSigningRequestParams::from_pem(csr_pem).map_err(SignError::BadRequest)?;
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - Duration::minutes(5);
        csr.params.not_after = now + self.validity;
        csr.params.is_ca = IsCa::ExplicitNoCa;

        let cert = csr
            .signed_by(&self.ca, &self.ca_key)
            .map_err(SignError::Signing)?;
        Ok(cert.pem())
    }

    /// Issues a fresh serving identity for the API server, chained to the CA.
    pub fn server_credentials(
        &self,
        names: Vec<String>,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let key = KeyPair::generate().context("failed to generate server key")?;
        let mut params =
            CertificateParams::new(names).context("failed to build server cert params")?;
        params
            .distinguished_name
            .push(DnType::CommonName, "fabedge-operator");
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + self.validity;

        let cert = params
            .signed_by(&key, &self.ca, &self.ca_key)
            .context("failed to sign server certificate")?;

        let chain = vec![cert.der().clone(), self.ca_cert_der()?];
        let key = PrivateKeyDer::Pkcs8(key.serialize_der().into());
        Ok((chain, key))
    }
}

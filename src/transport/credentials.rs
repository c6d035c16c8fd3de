//! Transport security for secure ports
//!
//! A [`ServerCredentials`] runs the handshake on each accepted connection and reports what it
//! learned about the peer as an [`AuthContext`]. [`TlsCredentials`] is the rustls-backed
//! implementation.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::TlsAcceptor;

pub const TRANSPORT_SECURITY_TYPE: &str = "transport_security_type";
pub const PEER_CERTIFICATE: &str = "x509_peer_certificate";

pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Authenticated properties of a peer, keyed by property name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    properties: BTreeMap<String, Vec<Bytes>>,
    peer_identity_key: Option<String>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.properties
            .entry(name.into())
            .or_default()
            .push(value.into());
    }

    /// Names the property that identifies the peer.
    pub fn set_peer_identity_key(&mut self, key: impl Into<String>) {
        self.peer_identity_key = Some(key.into());
    }

    pub fn get(&self, name: &str) -> Option<&[Bytes]> {
        self.properties.get(name).map(Vec::as_slice)
    }

    pub fn properties(&self) -> &BTreeMap<String, Vec<Bytes>> {
        &self.properties
    }

    pub fn peer_identity_key(&self) -> Option<&str> {
        self.peer_identity_key.as_deref()
    }

    /// Values of the identity property; `None` for unauthenticated peers.
    pub fn peer_identities(&self) -> Option<&[Bytes]> {
        self.peer_identity_key
            .as_deref()
            .and_then(|key| self.get(key))
    }

    pub fn is_authenticated(&self) -> bool {
        self.peer_identities().is_some()
    }
}

#[async_trait]
pub trait ServerCredentials: Send + Sync {
    /// Secures a freshly accepted connection.
    async fn handshake(&self, stream: TcpStream) -> std::io::Result<(BoxedIo, AuthContext)>;
}

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read PEM data: {0}")]
    Pem(#[from] std::io::Error),
    #[error("no certificates found in PEM data")]
    MissingCertificate,
    #[error("no private key found in PEM data")]
    MissingKey,
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid client CA configuration: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
}

/// TLS server credentials.
///
/// When built with client authentication, the leaf certificate presented by the client becomes
/// the peer identity under [`PEER_CERTIFICATE`].
#[derive(Clone)]
pub struct TlsCredentials {
    acceptor: TlsAcceptor,
}

impl TlsCredentials {
    pub fn from_pem(cert_chain_pem: &[u8], private_key_pem: &[u8]) -> Result<Self, CredentialsError> {
        let (certs, key) = load_identity(cert_chain_pem, private_key_pem)?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self::from_config(config))
    }

    /// Requires clients to present a certificate signed by one of `client_ca_pem`.
    pub fn from_pem_with_client_auth(
        cert_chain_pem: &[u8],
        private_key_pem: &[u8],
        client_ca_pem: &[u8],
    ) -> Result<Self, CredentialsError> {
        let (certs, key) = load_identity(cert_chain_pem, private_key_pem)?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &client_ca_pem[..]) {
            roots.add(cert?)?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }
}

impl fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCredentials").finish_non_exhaustive()
    }
}

#[async_trait]
impl ServerCredentials for TlsCredentials {
    async fn handshake(&self, stream: TcpStream) -> std::io::Result<(BoxedIo, AuthContext)> {
        let tls = self.acceptor.accept(stream).await?;

        let mut auth = AuthContext::new();
        auth.add_property(TRANSPORT_SECURITY_TYPE, Bytes::from_static(b"ssl"));
        if let Some(leaf) = tls.get_ref().1.peer_certificates().and_then(<[_]>::first) {
            auth.add_property(PEER_CERTIFICATE, Bytes::copy_from_slice(leaf.as_ref()));
            auth.set_peer_identity_key(PEER_CERTIFICATE);
        }

        Ok((Box::new(tls), auth))
    }
}

fn load_identity(
    cert_chain_pem: &[u8],
    private_key_pem: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CredentialsError> {
    let certs = rustls_pemfile::certs(&mut &cert_chain_pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(CredentialsError::MissingCertificate);
    }
    let key = rustls_pemfile::private_key(&mut &private_key_pem[..])?
        .ok_or(CredentialsError::MissingKey)?;
    Ok((certs, key))
}

//! Connection providers: how a driver obtains its socket.
//!
//! A provider is a function from a dial address to a boxed async stream,
//! so tests inject in-memory pipes and production code gets TCP or TLS
//! per the server's config.

use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::config::ServerSettings;

/// Any async byte stream a driver can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A boxed transport.
pub type BoxTransport = Box<dyn Transport>;

/// Provider of connections: called by the driver on every connect attempt
/// with the `host:port` address.
pub type ConnProvider =
    Arc<dyn Fn(&str) -> BoxFuture<'static, io::Result<BoxTransport>> + Send + Sync>;

/// The default dialer for one server's settings: plain TCP, or TLS per
/// the `ssl` / `verify_cert` / `ssl_cert` fields.
pub fn default_provider(settings: &ServerSettings) -> ConnProvider {
    if !settings.ssl {
        return tcp_provider();
    }
    tls_provider(
        settings.host.clone(),
        settings.verify_cert,
        settings.ssl_cert.clone(),
    )
}

/// Plain TCP dialer.
pub fn tcp_provider() -> ConnProvider {
    Arc::new(|address: &str| {
        let address = address.to_owned();
        Box::pin(async move {
            let stream = TcpStream::connect(&address).await?;
            Ok(Box::new(stream) as BoxTransport)
        })
    })
}

/// TLS dialer with optional certificate verification and an optional
/// client certificate bundle (PEM containing certificates and a key).
pub fn tls_provider(sni_host: String, verify_cert: bool, ssl_cert: Option<String>) -> ConnProvider {
    Arc::new(move |address: &str| {
        let address = address.to_owned();
        let sni_host = sni_host.clone();
        let ssl_cert = ssl_cert.clone();
        Box::pin(async move {
            let config = build_tls_config(verify_cert, ssl_cert.as_deref())?;
            let connector = TlsConnector::from(Arc::new(config));
            let sni = ServerName::try_from(sni_host.clone()).map_err(io::Error::other)?;
            let tcp = TcpStream::connect(&address).await?;
            let stream = connector.connect(sni, tcp).await?;
            Ok(Box::new(stream) as BoxTransport)
        })
    })
}

fn build_tls_config(verify_cert: bool, ssl_cert: Option<&str>) -> io::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let mut config = match ssl_cert {
        Some(path) => {
            let (certs, key) = load_client_cert(path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(io::Error::other)?
        }
        None => builder.with_no_client_auth(),
    };

    if !verify_cert {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerify::default()));
    }
    Ok(config)
}

fn load_client_cert(
    path: &str,
) -> io::Result<(
    Vec<CertificateDer<'static>>,
    rustls::pki_types::PrivateKeyDer<'static>,
)> {
    let pem = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice()).collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut pem.as_slice())?
        .ok_or_else(|| io::Error::other(format!("no private key in {path}")))?;
    Ok((certs, key))
}

/// Accept-anything certificate verifier for `verify_cert = false`.
/// Signatures are still checked against the default crypto provider.
#[derive(Debug)]
struct NoVerify {
    provider: Arc<CryptoProvider>,
}

impl Default for NoVerify {
    fn default() -> Self {
        NoVerify {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

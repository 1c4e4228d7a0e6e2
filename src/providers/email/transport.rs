//! Socket setup shared by the IMAP and POP3 clients.
//!
//! Connects with bounded retries and exponential backoff. DNS failures and
//! refused connections are fatal at once. When TLS verification fails on the
//! last attempt the handshake is retried once without verification.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};

use super::{ProtocolError, Result};
use crate::domain::{Account, Protocol};

/// How many times to try and how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay after the given zero-based attempt failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub verify_tls: bool,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ConnectOptions {
    /// Options for an account. POP3 on port 995 always uses implicit TLS.
    pub fn for_account(account: &Account, retry: RetryPolicy) -> Self {
        let implicit_tls = account.port == account.protocol.default_tls_port()
            && account.protocol == Protocol::Pop3;
        Self {
            host: account.host.clone(),
            port: account.port,
            use_tls: account.use_tls || implicit_tls,
            verify_tls: account.verify_tls,
            timeout: account.timeout,
            retry,
        }
    }
}

/// A connected socket, encrypted or not.
pub enum MailStream {
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
    Plain(TcpStream),
}

impl Read for MailStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            MailStream::Tls(s) => s.read(buf),
            MailStream::Plain(s) => s.read(buf),
        }
    }
}

impl Write for MailStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            MailStream::Tls(s) => s.write(buf),
            MailStream::Plain(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            MailStream::Tls(s) => s.flush(),
            MailStream::Plain(s) => s.flush(),
        }
    }
}

impl std::fmt::Debug for MailStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailStream::Tls(_) => f.write_str("MailStream::Tls"),
            MailStream::Plain(_) => f.write_str("MailStream::Plain"),
        }
    }
}

/// Opens the byte stream a protocol session runs over.
pub trait Dialer: Send {
    type Stream: Read + Write + Send;

    fn dial(&self) -> Result<Self::Stream>;
}

/// Dials real servers over TCP, with TLS when configured.
#[derive(Debug, Clone)]
pub struct TcpDialer(pub ConnectOptions);

impl Dialer for TcpDialer {
    type Stream = MailStream;

    fn dial(&self) -> Result<MailStream> {
        connect(&self.0)
    }
}

/// Why one attempt failed, which decides whether to retry.
#[derive(Debug)]
enum AttemptError {
    /// Not worth retrying (DNS, refused).
    Fatal(String),
    /// Certificate or handshake failure.
    Tls(String),
    /// Timeouts and other transient I/O.
    Transient(String),
}

/// Connects according to `options`, retrying transient failures.
pub fn connect(options: &ConnectOptions) -> Result<MailStream> {
    let attempts = options.retry.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        let is_last = attempt + 1 == attempts;

        match attempt_connect(options, options.verify_tls) {
            Ok(stream) => {
                tracing::debug!(host = %options.host, port = options.port, attempt, "connected");
                return Ok(stream);
            }
            Err(AttemptError::Fatal(e)) => {
                tracing::error!(host = %options.host, error = %e, "connection failed, not retrying");
                return Err(ProtocolError::Connection(e));
            }
            Err(AttemptError::Tls(e)) if is_last && options.verify_tls => {
                tracing::warn!(
                    host = %options.host,
                    error = %e,
                    "TLS verification failed on final attempt, retrying without certificate verification (security downgrade)"
                );
                return attempt_connect(options, false).map_err(|e| match e {
                    AttemptError::Tls(e) => ProtocolError::Tls(e),
                    AttemptError::Fatal(e) | AttemptError::Transient(e) => {
                        ProtocolError::Connection(e)
                    }
                });
            }
            Err(AttemptError::Tls(e)) | Err(AttemptError::Transient(e)) => {
                tracing::warn!(
                    host = %options.host,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    "connection attempt failed"
                );
                last_error = e;
            }
        }

        if !is_last {
            std::thread::sleep(options.retry.delay_after(attempt));
        }
    }

    Err(ProtocolError::Connection(format!(
        "failed after {} attempts: {}",
        attempts, last_error
    )))
}

fn attempt_connect(
    options: &ConnectOptions,
    verify: bool,
) -> std::result::Result<MailStream, AttemptError> {
    let addr = resolve(&options.host, options.port)?;

    let sock = TcpStream::connect_timeout(&addr, options.timeout).map_err(|e| match e.kind() {
        io::ErrorKind::ConnectionRefused => {
            AttemptError::Fatal(format!("connection refused by {}", addr))
        }
        _ => AttemptError::Transient(format!("TCP connect to {} failed: {}", addr, e)),
    })?;
    sock.set_read_timeout(Some(options.timeout))
        .and_then(|_| sock.set_write_timeout(Some(options.timeout)))
        .map_err(|e| AttemptError::Transient(e.to_string()))?;

    if !options.use_tls {
        return Ok(MailStream::Plain(sock));
    }

    handshake(&options.host, sock, verify)
}

fn resolve(host: &str, port: u16) -> std::result::Result<SocketAddr, AttemptError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| AttemptError::Fatal(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| AttemptError::Fatal(format!("no addresses for {}", host)))
}

fn handshake(
    host: &str,
    mut sock: TcpStream,
    verify: bool,
) -> std::result::Result<MailStream, AttemptError> {
    let config = tls_config(verify).map_err(|e| AttemptError::Tls(e.to_string()))?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| AttemptError::Fatal(format!("invalid server name {}: {}", host, e)))?;
    let mut conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| AttemptError::Tls(e.to_string()))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut sock).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => AttemptError::Tls(format!("TLS handshake failed: {}", e)),
            _ => AttemptError::Transient(format!("TLS handshake I/O failed: {}", e)),
        })?;
    }

    Ok(MailStream::Tls(Box::new(StreamOwned::new(conn, sock))))
}

fn tls_config(verify: bool) -> std::result::Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder =
        ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let config = if verify {
        builder
            .with_root_certificates(RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Skips chain validation but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

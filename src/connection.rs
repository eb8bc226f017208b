//! Shared connection and TLS helpers
//!
//! Provides the framed byte stream used by both `Pop3Client` and
//! `SmtpClient`: plain or TLS-wrapped TCP, in-band TLS upgrade, and
//! line/reply reads that all honour the caller's deadline and
//! cancellation token.

use crate::codec::{self, MailCodec, Reply, ReplyAssembler};
use crate::config::{Endpoint, SessionOptions};
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Any bidirectional byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Cancellation and deadline supplied by the caller of one operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Absolute deadline for the whole operation.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// When a single step bounded by `step` must finish.
    fn step_deadline(&self, step: Duration) -> Instant {
        let at = Instant::now() + step;
        self.deadline.map_or(at, |deadline| deadline.min(at))
    }
}

/// Run `fut` until it completes, `step` elapses (capped by the overall
/// deadline), or the token is cancelled.
async fn guarded<T, F>(ctx: &RequestContext, step: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let at = ctx.step_deadline(step);
    tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => Err(Error::Cancelled(op)),
        res = tokio::time::timeout_at(at, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout(op)),
        },
    }
}

/// A framed line stream to one mail server.
pub struct Connection {
    framed: Framed<BoxedStream, MailCodec>,
    host: String,
    tls: bool,
    options: SessionOptions,
    ctx: RequestContext,
}

impl Connection {
    /// Open a TCP connection, wrapping it in TLS right away when the
    /// endpoint asks for implicit TLS.
    pub async fn open(
        endpoint: &Endpoint,
        options: &SessionOptions,
        ctx: &RequestContext,
    ) -> Result<Self> {
        let addr = endpoint.address();
        debug!("Connecting to {}", addr);

        let tcp = guarded(ctx, options.timeouts.connect, "connect", async {
            TcpStream::connect(&addr).await.map_err(Error::from)
        })
        .await?;

        let conn = Self::from_stream(Box::new(tcp), &endpoint.host, options, ctx);
        if endpoint.implicit_tls {
            conn.upgrade().await
        } else {
            Ok(conn)
        }
    }

    /// Wrap an already established stream.
    pub fn from_stream(
        stream: BoxedStream,
        host: &str,
        options: &SessionOptions,
        ctx: &RequestContext,
    ) -> Self {
        Self {
            framed: Framed::new(stream, MailCodec::with_max_length(options.max_line_length)),
            host: host.to_string(),
            tls: false,
            options: options.clone(),
            ctx: ctx.clone(),
        }
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls
    }

    /// Run the TLS handshake over the current stream.
    ///
    /// Anything the server sent ahead of the handshake is rejected:
    /// those bytes were never protected and must not be read as
    /// post-upgrade responses.
    pub async fn upgrade(self) -> Result<Self> {
        let FramedParts { io, read_buf, .. } = self.framed.into_parts();
        if !read_buf.is_empty() {
            return Err(Error::Security(
                "server sent data ahead of the TLS handshake".to_string(),
            ));
        }

        let connector = tls_connector(self.options.accept_invalid_certs)?;
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;

        let tls_stream = guarded(&self.ctx, self.options.timeouts.connect, "TLS handshake", async {
            connector
                .connect(server_name, io)
                .await
                .map_err(|e| Error::Tls(e.to_string()))
        })
        .await?;

        debug!("TLS established with {}", self.host);
        Ok(Self {
            framed: Framed::new(
                Box::new(tls_stream),
                MailCodec::with_max_length(self.options.max_line_length),
            ),
            host: self.host,
            tls: true,
            options: self.options,
            ctx: self.ctx,
        })
    }

    /// Read one line, without its terminator.
    pub async fn read_line(&mut self) -> Result<Bytes> {
        let Self {
            framed,
            ctx,
            options,
            ..
        } = self;
        guarded(ctx, options.timeouts.io, "read", async {
            framed.next().await.unwrap_or(Err(Error::ConnectionClosed))
        })
        .await
    }

    /// Read a dot-terminated block, un-stuffing each line.
    pub async fn read_block(&mut self) -> Result<Vec<Bytes>> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if codec::is_terminator(&line) {
                return Ok(lines);
            }
            lines.push(codec::unstuff_line(line));
        }
    }

    /// Read one numeric reply, however many lines it spans.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut assembler = ReplyAssembler::new();
        loop {
            let line = self.read_line().await?;
            if let Some(reply) = assembler.push(&line)? {
                return Ok(reply);
            }
        }
    }

    /// Write one line followed by CRLF and flush.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<()> {
        let Self {
            framed,
            ctx,
            options,
            ..
        } = self;
        guarded(ctx, options.timeouts.io, "write", framed.send(line)).await
    }

    /// Write already dot-stuffed lines followed by the `.` terminator.
    pub async fn write_block(&mut self, lines: &[Vec<u8>]) -> Result<()> {
        let Self {
            framed,
            ctx,
            options,
            ..
        } = self;
        for line in lines {
            guarded(ctx, options.timeouts.io, "write", framed.feed(line.as_slice())).await?;
        }
        guarded(ctx, options.timeouts.io, "write", framed.send(&b"."[..])).await
    }

    /// Send a command and read the single status line that answers it.
    pub async fn request(&mut self, line: &[u8]) -> Result<Bytes> {
        self.write_line(line).await?;
        self.read_line().await
    }

    /// Send a command and read the numeric reply that answers it.
    pub async fn request_reply(&mut self, line: &[u8]) -> Result<Reply> {
        self.write_line(line).await?;
        self.read_reply().await
    }

    /// Best-effort goodbye after the session broke: send `quit`, wait
    /// briefly for any answer, and close the stream. The caller's
    /// cancellation token is deliberately not consulted here.
    pub async fn abandon(&mut self, quit: &[u8]) {
        let grace = self.options.timeouts.quit_grace;
        let framed = &mut self.framed;
        let attempt = async {
            framed.send(quit).await?;
            let _ = framed.next().await;
            Ok::<_, Error>(())
        };
        let _ = tokio::time::timeout(grace, attempt).await;
        self.close().await;
    }

    /// Shut the write half down, bounded by the quit grace period.
    pub async fn close(&mut self) {
        let grace = self.options.timeouts.quit_grace;
        let _ = tokio::time::timeout(grace, self.framed.get_mut().shutdown()).await;
    }
}

/// Build a TLS connector.
///
/// Verifies against the Mozilla root set unless `accept_invalid_certs`
/// is set, in which case every certificate is accepted (local bridges
/// with self-signed certificates).
fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts all certificates.
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

//! In-process fake SMTP submission server for integration testing
//!
//! Each accepted connection runs:
//!
//! ```text
//!   [implicit TLS handshake] -> 220 greeting -> EHLO -> STARTTLS?
//!       -> TLS handshake -> EHLO -> AUTH -> MAIL/RCPT/DATA -> QUIT
//! ```
//!
//! Accepted messages are recorded as `Delivery` values with the
//! dot-stuffing already undone, so tests can compare against what the
//! client was asked to send.

use super::session::{Action, Delivery, Session};
use crate::common::{tls_acceptor, write_line};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Server features and failure modes.
#[derive(Debug, Clone)]
pub struct SmtpBehavior {
    pub username: String,
    pub password: String,
    pub implicit_tls: bool,
    pub starttls: bool,
    /// Answer `EHLO` with 502 so the client must fall back to `HELO`.
    pub ehlo: bool,
    /// Answer `EHLO` with 421 once the channel is encrypted.
    pub ehlo_after_tls: bool,
    /// Advertised `AUTH` mechanisms, upper case.
    pub auth: Vec<String>,
    /// Replace the whole greeting line.
    pub greeting: Option<String>,
    pub reject_sender: bool,
    pub reject_recipients: Vec<String>,
    /// Refuse the message after the data terminator.
    pub reject_data: bool,
}

impl Default for SmtpBehavior {
    fn default() -> Self {
        Self {
            username: "alice".to_string(),
            password: "app-password-123".to_string(),
            implicit_tls: false,
            starttls: true,
            ehlo: true,
            ehlo_after_tls: true,
            auth: vec!["PLAIN".to_string(), "LOGIN".to_string()],
            greeting: None,
            reject_sender: false,
            reject_recipients: Vec::new(),
            reject_data: false,
        }
    }
}

/// One received command line and whether it arrived over TLS.
#[derive(Debug, Clone)]
pub struct Received {
    pub tls: bool,
    pub line: String,
}

/// A fake SMTP server on `127.0.0.1` with an OS-assigned port.
pub struct FakeSmtpServer {
    port: u16,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    received: Arc<Mutex<Vec<Received>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeSmtpServer {
    pub async fn start() -> Self {
        Self::start_with(SmtpBehavior::default()).await
    }

    pub async fn start_with(behavior: SmtpBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let acceptor = tls_acceptor();
        let behavior = Arc::new(behavior);
        let deliveries = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let deliveries = deliveries.clone();
            let received = received.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _addr)) = listener.accept().await else {
                        break;
                    };
                    let acceptor = acceptor.clone();
                    let session = Session::new(behavior.clone(), deliveries.clone());
                    let implicit_tls = behavior.implicit_tls;
                    let received = received.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, acceptor, implicit_tls, session, &received)
                            .await;
                    });
                }
            })
        };

        Self {
            port,
            deliveries,
            received,
            _handle: handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Upper-cased command verbs received so far, in order. Lines sent
    /// during `DATA` and `AUTH` continuations are not commands and are
    /// not recorded.
    pub fn verbs(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|r| r.line.split_whitespace().next().map(str::to_ascii_uppercase))
            .collect()
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    implicit_tls: bool,
    mut session: Session,
    received: &Mutex<Vec<Received>>,
) {
    if implicit_tls {
        let Ok(tls) = acceptor.accept(stream).await else {
            return;
        };
        serve(tls, &mut session, true, true, received).await;
        return;
    }

    let Next::StartTls(reader) = serve(stream, &mut session, false, true, received).await else {
        return;
    };
    let Ok(tls) = acceptor.accept(reader.into_inner()).await else {
        return;
    };
    session.restart();
    serve(tls, &mut session, true, false, received).await;
}

enum Next<S> {
    Done,
    StartTls(BufReader<S>),
}

async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    session: &mut Session,
    tls: bool,
    greet: bool,
    received: &Mutex<Vec<Received>>,
) -> Next<S> {
    let mut reader = BufReader::new(stream);

    if greet && write_line(&mut reader, &session.greeting()).await.is_err() {
        return Next::Done;
    }

    loop {
        let Some(line) = read_line(&mut reader).await else {
            return Next::Done;
        };
        if is_command(&line) {
            received.lock().unwrap().push(Received {
                tls,
                line: line.clone(),
            });
        }

        let mut response = session.handle(&line, tls);
        if response.action == Action::Data {
            if write_line(&mut reader, &response.text).await.is_err() {
                return Next::Done;
            }
            let Some(lines) = read_data(&mut reader).await else {
                return Next::Done;
            };
            response = session.finish_data(&lines);
        }

        if write_line(&mut reader, &response.text).await.is_err() {
            return Next::Done;
        }
        match response.action {
            Action::Continue | Action::Data => {}
            Action::StartTls => return Next::StartTls(reader),
            Action::Quit => return Next::Done,
        }
    }
}

const VERBS: &[&str] = &[
    "EHLO", "HELO", "STARTTLS", "AUTH", "MAIL", "RCPT", "DATA", "RSET", "NOOP", "QUIT",
];

/// Base64 continuation lines carry no verb worth recording.
fn is_command(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|verb| VERBS.iter().any(|v| v.eq_ignore_ascii_case(verb)))
}

async fn read_line<S: AsyncRead + AsyncWrite + Unpin>(reader: &mut BufReader<S>) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

/// Read message lines up to the lone `.`, undoing dot-stuffing.
async fn read_data<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &mut BufReader<S>,
) -> Option<Vec<String>> {
    let mut lines = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line == "." {
            return Some(lines);
        }
        lines.push(line.strip_prefix('.').map_or(line.clone(), str::to_string));
    }
}

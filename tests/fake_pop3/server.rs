//! In-process fake POP3 server for integration testing
//!
//! Each accepted connection runs:
//!
//! ```text
//!   [implicit TLS handshake] -> greeting -> commands
//!       -> STLS? -> TLS handshake -> commands -> QUIT
//! ```
//!
//! `Pop3Behavior` switches individual server features on and off so
//! tests can provoke the client's failure paths: no `STLS`, no `UIDL`,
//! a refusing greeting, a broken TLS upgrade or a command that is never
//! answered.

use super::maildrop::Maildrop;
use super::session::{Action, Session};
use crate::common::{tls_acceptor, write_bytes, write_line};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Server features and failure modes.
#[derive(Debug, Clone)]
pub struct Pop3Behavior {
    pub username: String,
    pub password: String,
    /// TLS from the first byte (POP3S).
    pub implicit_tls: bool,
    pub stls: bool,
    pub capa: bool,
    pub uidl: bool,
    /// Offer APOP with this `<...>` timestamp in the greeting.
    pub apop_timestamp: Option<String>,
    /// Replace the whole greeting line.
    pub greeting: Option<String>,
    /// Close the connection before sending anything.
    pub drop_on_connect: bool,
    /// Answer `STLS` with `+OK`, then send plaintext instead of TLS.
    pub broken_tls: bool,
    /// Never answer this command verb.
    pub stall_on: Option<String>,
    /// Send the whole message in reply to `TOP`.
    pub top_ignores_count: bool,
}

impl Default for Pop3Behavior {
    fn default() -> Self {
        Self {
            username: "alice".to_string(),
            password: "app-password-123".to_string(),
            implicit_tls: false,
            stls: true,
            capa: true,
            uidl: true,
            apop_timestamp: None,
            greeting: None,
            drop_on_connect: false,
            broken_tls: false,
            stall_on: None,
            top_ignores_count: false,
        }
    }
}

/// One received command line and whether it arrived over TLS.
#[derive(Debug, Clone)]
pub struct Received {
    pub tls: bool,
    pub line: String,
}

/// A fake POP3 server on `127.0.0.1` with an OS-assigned port.
pub struct FakePop3Server {
    port: u16,
    maildrop: Arc<Mutex<Maildrop>>,
    received: Arc<Mutex<Vec<Received>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakePop3Server {
    pub async fn start(maildrop: Maildrop) -> Self {
        Self::start_with(maildrop, Pop3Behavior::default()).await
    }

    pub async fn start_with(maildrop: Maildrop, behavior: Pop3Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let acceptor = tls_acceptor();
        let behavior = Arc::new(behavior);
        let maildrop = Arc::new(Mutex::new(maildrop));
        let received = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let maildrop = maildrop.clone();
            let received = received.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _addr)) = listener.accept().await else {
                        break;
                    };
                    let acceptor = acceptor.clone();
                    let session = Session::new(behavior.clone(), maildrop.clone());
                    let behavior = behavior.clone();
                    let received = received.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, acceptor, &behavior, session, &received).await;
                    });
                }
            })
        };

        Self {
            port,
            maildrop,
            received,
            _handle: handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Every command line received so far, across connections.
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Command verbs received so far, in order.
    pub fn verbs(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|r| r.line.split_whitespace().next().map(str::to_ascii_uppercase))
            .collect()
    }

    /// Current maildrop state (after any committed deletions).
    pub fn maildrop(&self) -> Maildrop {
        self.maildrop.lock().unwrap().clone()
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    behavior: &Pop3Behavior,
    mut session: Session,
    received: &Mutex<Vec<Received>>,
) {
    if behavior.drop_on_connect {
        return;
    }

    if behavior.implicit_tls {
        let Ok(tls) = acceptor.accept(stream).await else {
            return;
        };
        serve(tls, &mut session, true, true, received).await;
        return;
    }

    let Next::StartTls(mut reader) = serve(stream, &mut session, false, true, received).await
    else {
        return;
    };

    if behavior.broken_tls {
        let _ = write_line(&mut reader, "this is not a TLS handshake\r\n").await;
        return;
    }

    let Ok(tls) = acceptor.accept(reader.into_inner()).await else {
        return;
    };
    serve(tls, &mut session, true, false, received).await;
}

enum Next<S> {
    Done,
    StartTls(BufReader<S>),
}

/// Run the command loop until `QUIT`, EOF or an `STLS` hand-off.
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
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return Next::Done,
            Ok(_) => {}
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        received.lock().unwrap().push(Received {
            tls,
            line: line.clone(),
        });

        let response = session.handle(&line, tls);
        if write_bytes(&mut reader, &response.bytes).await.is_err() {
            return Next::Done;
        }
        match response.action {
            Action::Continue => {}
            Action::StartTls => return Next::StartTls(reader),
            Action::Quit => return Next::Done,
            Action::Stall => std::future::pending::<()>().await,
        }
    }
}

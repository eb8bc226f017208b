//! Command handling for the fake SMTP server
//!
//! ## SMTP submission in brief (RFC 5321)
//!
//! ```text
//!   S: 220 fake.test ESMTP ready
//!   C: EHLO client.test
//!   S: 250-fake.test greets client.test
//!   S: 250-STARTTLS
//!   S: 250 AUTH PLAIN LOGIN CRAM-MD5
//!   C: STARTTLS                      (then TLS, then EHLO again)
//!   C: AUTH PLAIN AGFsaWNlAHNlY3JldA==
//!   S: 235 2.7.0 Authentication successful
//!   C: MAIL FROM:<alice@example.com>
//!   C: RCPT TO:<bob@example.com>     (one per recipient)
//!   C: DATA
//!   S: 354 End data with <CR><LF>.<CR><LF>
//!   C: <message lines, dot-stuffed>
//!   C: .
//!   S: 250 2.0.0 OK queued
//!   C: QUIT
//!   S: 221 2.0.0 Bye
//! ```
//!
//! Replies continue with `250-` and end with `250 `.

use super::server::SmtpBehavior;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use mail_bridge::smtp::cram_md5_response;
use std::sync::{Arc, Mutex};

pub const CRAM_CHALLENGE: &str = "<1896.697170952@fake.test>";

/// A message the server accepted.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: String,
    pub recipients: Vec<String>,
    /// Un-stuffed message text, CRLF line endings.
    pub data: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Continue,
    StartTls,
    /// Collect message lines until the terminator.
    Data,
    Quit,
}

pub struct Response {
    pub text: String,
    pub action: Action,
}

impl Response {
    fn reply(text: &str) -> Self {
        Self {
            text: format!("{text}\r\n"),
            action: Action::Continue,
        }
    }

    /// A multi-line reply: every line but the last uses `code-`.
    fn multi(code: u16, lines: &[String]) -> Self {
        let mut text = String::new();
        for (idx, line) in lines.iter().enumerate() {
            let sep = if idx + 1 == lines.len() { ' ' } else { '-' };
            text.push_str(&format!("{code}{sep}{line}\r\n"));
        }
        Self {
            text,
            action: Action::Continue,
        }
    }

    fn then(mut self, action: Action) -> Self {
        self.action = action;
        self
    }
}

enum PendingAuth {
    LoginUser,
    LoginPass(String),
    Cram,
}

pub struct Session {
    behavior: Arc<SmtpBehavior>,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    greeted: bool,
    pending: Option<PendingAuth>,
    sender: Option<String>,
    recipients: Vec<String>,
}

impl Session {
    pub fn new(behavior: Arc<SmtpBehavior>, deliveries: Arc<Mutex<Vec<Delivery>>>) -> Self {
        Self {
            behavior,
            deliveries,
            greeted: false,
            pending: None,
            sender: None,
            recipients: Vec::new(),
        }
    }

    pub fn greeting(&self) -> String {
        self.behavior
            .greeting
            .as_ref()
            .map_or_else(|| "220 fake.test ESMTP ready\r\n".to_string(), |g| format!("{g}\r\n"))
    }

    /// Forget everything negotiated before a TLS upgrade.
    pub fn restart(&mut self) {
        self.greeted = false;
        self.pending = None;
        self.reset();
    }

    fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    pub fn handle(&mut self, line: &str, tls: bool) -> Response {
        if let Some(pending) = self.pending.take() {
            return self.continue_auth(pending, line);
        }

        let upper = line.to_ascii_uppercase();
        let verb = upper.split_whitespace().next().unwrap_or("");

        match verb {
            "EHLO" if tls && !self.behavior.ehlo_after_tls => {
                Response::reply("421 4.3.0 Service not available")
            }
            "EHLO" if self.behavior.ehlo => self.ehlo(line, tls),
            "HELO" => {
                self.greeted = true;
                Response::reply("250 fake.test")
            }
            "STARTTLS" if self.behavior.starttls && !tls => {
                Response::reply("220 2.0.0 Ready to start TLS").then(Action::StartTls)
            }
            "STARTTLS" => Response::reply("454 4.7.0 TLS not available"),
            "AUTH" => self.auth(line),
            "MAIL" => self.mail(line),
            "RCPT" => self.rcpt(line),
            "DATA" if self.recipients.is_empty() => {
                Response::reply("554 5.5.1 No valid recipients")
            }
            "DATA" => Response::reply("354 End data with <CR><LF>.<CR><LF>").then(Action::Data),
            "RSET" => {
                self.reset();
                Response::reply("250 2.0.0 OK")
            }
            "NOOP" => Response::reply("250 2.0.0 OK"),
            "QUIT" => Response::reply("221 2.0.0 Bye").then(Action::Quit),
            _ => Response::reply("502 5.5.1 Command not recognized"),
        }
    }

    fn ehlo(&mut self, line: &str, tls: bool) -> Response {
        self.greeted = true;
        let client = line.split_whitespace().nth(1).unwrap_or("unknown");
        let mut lines = vec![
            format!("fake.test greets {client}"),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
            "SIZE 10240000".to_string(),
        ];
        if self.behavior.starttls && !tls {
            lines.push("STARTTLS".to_string());
        }
        if !self.behavior.auth.is_empty() {
            lines.push(format!("AUTH {}", self.behavior.auth.join(" ")));
        }
        lines.push("SMTPUTF8".to_string());
        Response::multi(250, &lines)
    }

    fn credentials_ok(&self, user: &str, pass: &str) -> bool {
        user == self.behavior.username && pass == self.behavior.password
    }

    fn verdict(ok: bool) -> Response {
        if ok {
            Response::reply("235 2.7.0 Authentication successful")
        } else {
            Response::reply("535 5.7.8 Authentication credentials invalid")
        }
    }

    fn auth(&mut self, line: &str) -> Response {
        let mut parts = line.split_whitespace().skip(1);
        let mechanism = parts.next().unwrap_or("").to_ascii_uppercase();
        if !self.behavior.auth.iter().any(|m| *m == mechanism) {
            return Response::reply("504 5.5.4 Unrecognized authentication type");
        }
        match mechanism.as_str() {
            "PLAIN" => {
                let decoded = parts
                    .next()
                    .and_then(|b64| STANDARD.decode(b64).ok())
                    .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                    .unwrap_or_default();
                let fields: Vec<&str> = decoded.split('\0').collect();
                Self::verdict(matches!(fields.as_slice(), [_, user, pass] if self.credentials_ok(user, pass)))
            }
            "LOGIN" => {
                self.pending = Some(PendingAuth::LoginUser);
                Response::reply(&format!("334 {}", STANDARD.encode("Username:")))
            }
            "CRAM-MD5" => {
                self.pending = Some(PendingAuth::Cram);
                Response::reply(&format!("334 {}", STANDARD.encode(CRAM_CHALLENGE)))
            }
            _ => Response::reply("504 5.5.4 Unrecognized authentication type"),
        }
    }

    fn continue_auth(&mut self, pending: PendingAuth, line: &str) -> Response {
        if line.trim() == "*" {
            return Response::reply("501 5.7.0 Authentication cancelled");
        }
        let decoded = STANDARD
            .decode(line.trim())
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
            .unwrap_or_default();
        match pending {
            PendingAuth::LoginUser => {
                self.pending = Some(PendingAuth::LoginPass(decoded));
                Response::reply(&format!("334 {}", STANDARD.encode("Password:")))
            }
            PendingAuth::LoginPass(user) => Self::verdict(self.credentials_ok(&user, &decoded)),
            PendingAuth::Cram => {
                let expected = cram_md5_response(
                    &self.behavior.username,
                    &self.behavior.password,
                    CRAM_CHALLENGE.as_bytes(),
                )
                .unwrap();
                Self::verdict(decoded == expected)
            }
        }
    }

    fn mail(&mut self, line: &str) -> Response {
        if !self.greeted {
            return Response::reply("503 5.5.1 Say EHLO first");
        }
        if self.behavior.reject_sender {
            return Response::reply("550 5.7.1 Sender rejected");
        }
        self.reset();
        self.sender = Some(angle_address(line));
        Response::reply("250 2.1.0 OK")
    }

    fn rcpt(&mut self, line: &str) -> Response {
        if self.sender.is_none() {
            return Response::reply("503 5.5.1 Need MAIL first");
        }
        let address = angle_address(line);
        if self.behavior.reject_recipients.contains(&address) {
            return Response::reply("550 5.1.1 No such user here");
        }
        self.recipients.push(address);
        Response::reply("250 2.1.5 OK")
    }

    /// Called with the un-stuffed data lines once the terminator arrives.
    pub fn finish_data(&mut self, lines: &[String]) -> Response {
        let response = if self.behavior.reject_data {
            Response::reply("554 5.6.0 Message content rejected")
        } else {
            let mut data = String::new();
            for line in lines {
                data.push_str(line);
                data.push_str("\r\n");
            }
            self.deliveries.lock().unwrap().push(Delivery {
                from: self.sender.clone().unwrap_or_default(),
                recipients: self.recipients.clone(),
                data,
            });
            Response::reply("250 2.0.0 OK queued as 4711")
        };
        self.reset();
        response
    }
}

/// The address between `<` and `>` of a `MAIL FROM:` / `RCPT TO:` line.
fn angle_address(line: &str) -> String {
    let start = line.find('<').map_or(0, |i| i + 1);
    let end = line.rfind('>').unwrap_or(line.len());
    line.get(start..end).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(behavior: SmtpBehavior) -> Session {
        Session::new(Arc::new(behavior), Arc::new(Mutex::new(Vec::new())))
    }

    #[test]
    fn ehlo_reply_uses_continuation_lines() {
        let mut s = session(SmtpBehavior::default());
        let text = s.handle("EHLO client.test", false).text;
        assert!(text.starts_with("250-fake.test greets client.test\r\n"));
        assert!(text.contains("250-STARTTLS\r\n"));
        assert!(text.ends_with("250 SMTPUTF8\r\n"));
        assert!(!s.handle("EHLO client.test", true).text.contains("STARTTLS"));
    }

    #[test]
    fn login_exchange() {
        let mut s = session(SmtpBehavior::default());
        s.handle("EHLO c", true);
        assert_eq!(s.handle("AUTH LOGIN", true).text, "334 VXNlcm5hbWU6\r\n");
        assert_eq!(
            s.handle(&STANDARD.encode("alice"), true).text,
            "334 UGFzc3dvcmQ6\r\n"
        );
        assert!(s.handle(&STANDARD.encode("app-password-123"), true).text.starts_with("235"));
    }

    #[test]
    fn extracts_angle_addresses() {
        assert_eq!(angle_address("MAIL FROM:<a@b.c>"), "a@b.c");
        assert_eq!(angle_address("RCPT TO:<x@y.z> NOTIFY=NEVER"), "x@y.z");
    }
}

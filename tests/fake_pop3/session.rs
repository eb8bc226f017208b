//! Command handling for the fake POP3 server
//!
//! `Session::handle` maps one client line to the bytes to send back and
//! what the connection should do next. It does no I/O, so the protocol
//! logic is testable without sockets.
//!
//! ## POP3 in brief (RFC 1939)
//!
//! ```text
//!   S: +OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>
//!   C: USER alice            (or: APOP alice <md5 digest>)
//!   S: +OK
//!   C: PASS secret
//!   S: +OK maildrop locked and ready
//!   C: STAT
//!   S: +OK 2 320
//!   C: RETR 1
//!   S: +OK 120 octets
//!   S: <message lines, dot-stuffed>
//!   S: .
//!   C: QUIT
//!   S: +OK bye
//! ```

use super::maildrop::Maildrop;
use super::server::Pop3Behavior;
use crate::common::{message_lines, stuffed_block};
use mail_bridge::pop3::apop_digest;
use std::sync::{Arc, Mutex};

/// What the connection does after sending the response.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Continue,
    StartTls,
    Quit,
    /// Never answer and never read again.
    Stall,
}

pub struct Response {
    pub bytes: Vec<u8>,
    pub action: Action,
}

impl Response {
    fn line(text: &str) -> Self {
        Self {
            bytes: format!("{text}\r\n").into_bytes(),
            action: Action::Continue,
        }
    }

    fn block(status: &str, lines: &[&[u8]]) -> Self {
        let mut bytes = format!("{status}\r\n").into_bytes();
        bytes.extend(stuffed_block(lines));
        Self {
            bytes,
            action: Action::Continue,
        }
    }

    fn then(mut self, action: Action) -> Self {
        self.action = action;
        self
    }
}

pub struct Session {
    behavior: Arc<Pop3Behavior>,
    maildrop: Arc<Mutex<Maildrop>>,
    user: Option<String>,
    authorized: bool,
    deleted: Vec<usize>,
}

impl Session {
    pub fn new(behavior: Arc<Pop3Behavior>, maildrop: Arc<Mutex<Maildrop>>) -> Self {
        Self {
            behavior,
            maildrop,
            user: None,
            authorized: false,
            deleted: Vec::new(),
        }
    }

    pub fn greeting(&self) -> String {
        if let Some(greeting) = &self.behavior.greeting {
            return format!("{greeting}\r\n");
        }
        match &self.behavior.apop_timestamp {
            Some(ts) => format!("+OK Fake POP3 server ready {ts}\r\n"),
            None => "+OK Fake POP3 server ready\r\n".to_string(),
        }
    }

    pub fn handle(&mut self, line: &str, tls: bool) -> Response {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let args: Vec<&str> = parts.collect();

        if self.behavior.stall_on.as_deref() == Some(verb.as_str()) {
            return Response {
                bytes: Vec::new(),
                action: Action::Stall,
            };
        }

        match verb.as_str() {
            "CAPA" => self.capa(tls),
            "STLS" if self.behavior.stls && !tls && !self.authorized => {
                Response::line("+OK Begin TLS negotiation").then(Action::StartTls)
            }
            "USER" if !self.authorized => {
                self.user = args.first().map(ToString::to_string);
                Response::line("+OK")
            }
            "PASS" if !self.authorized => self.pass(&args),
            "APOP" if !self.authorized => self.apop(&args),
            "QUIT" => self.quit(),
            _ if !self.authorized => Response::line("-ERR not authorized"),
            "STAT" => self.stat(),
            "LIST" => self.list(),
            "UIDL" if self.behavior.uidl => self.uidl(),
            "TOP" => self.top(&args),
            "RETR" => self.retr(&args),
            "DELE" => self.dele(&args),
            "RSET" => {
                self.deleted.clear();
                Response::line("+OK")
            }
            "NOOP" => Response::line("+OK"),
            _ => Response::line("-ERR unknown command"),
        }
    }

    fn capa(&self, tls: bool) -> Response {
        if !self.behavior.capa {
            return Response::line("-ERR unknown command");
        }
        let mut caps: Vec<&[u8]> = vec![&b"USER"[..], &b"TOP"[..]];
        if self.behavior.uidl {
            caps.push(b"UIDL");
        }
        if self.behavior.stls && !tls {
            caps.push(b"STLS");
        }
        Response::block("+OK Capability list follows", &caps)
    }

    fn pass(&mut self, args: &[&str]) -> Response {
        let password = args.join(" ");
        if self.user.as_deref() == Some(self.behavior.username.as_str())
            && password == self.behavior.password
        {
            self.authorized = true;
            Response::line("+OK maildrop locked and ready")
        } else {
            Response::line("-ERR [AUTH] invalid credentials")
        }
    }

    fn apop(&mut self, args: &[&str]) -> Response {
        let Some(timestamp) = &self.behavior.apop_timestamp else {
            return Response::line("-ERR APOP not supported");
        };
        let expected = apop_digest(timestamp, &self.behavior.password);
        match args {
            [user, digest] if *user == self.behavior.username && *digest == expected => {
                self.authorized = true;
                Response::line("+OK maildrop locked and ready")
            }
            _ => Response::line("-ERR [AUTH] permission denied"),
        }
    }

    fn quit(&mut self) -> Response {
        if self.authorized {
            self.maildrop.lock().unwrap().expunge(&self.deleted);
        }
        Response::line("+OK bye").then(Action::Quit)
    }

    /// Live (not deleted) messages as `(ordinal, raw)` pairs.
    fn live(&self) -> Vec<(usize, Vec<u8>, String)> {
        let maildrop = self.maildrop.lock().unwrap();
        maildrop
            .messages
            .iter()
            .enumerate()
            .map(|(idx, m)| (idx + 1, m.raw.clone(), m.uid.clone()))
            .filter(|(ordinal, _, _)| !self.deleted.contains(ordinal))
            .collect()
    }

    fn stat(&self) -> Response {
        let live = self.live();
        let size: usize = live.iter().map(|(_, raw, _)| raw.len()).sum();
        Response::line(&format!("+OK {} {size}", live.len()))
    }

    fn list(&self) -> Response {
        let live = self.live();
        let lines: Vec<Vec<u8>> = live
            .iter()
            .map(|(ordinal, raw, _)| format!("{ordinal} {}", raw.len()).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = lines.iter().map(Vec::as_slice).collect();
        Response::block(&format!("+OK {} messages", live.len()), &refs)
    }

    fn uidl(&self) -> Response {
        let lines: Vec<Vec<u8>> = self
            .live()
            .iter()
            .map(|(ordinal, _, uid)| format!("{ordinal} {uid}").into_bytes())
            .collect();
        let refs: Vec<&[u8]> = lines.iter().map(Vec::as_slice).collect();
        Response::block("+OK", &refs)
    }

    fn message(&self, arg: Option<&&str>) -> Option<Vec<u8>> {
        let ordinal: usize = arg?.parse().ok()?;
        if self.deleted.contains(&ordinal) {
            return None;
        }
        self.maildrop
            .lock()
            .unwrap()
            .get(ordinal)
            .map(|m| m.raw.clone())
    }

    fn retr(&self, args: &[&str]) -> Response {
        let Some(raw) = self.message(args.first()) else {
            return Response::line("-ERR no such message");
        };
        Response::block(&format!("+OK {} octets", raw.len()), &message_lines(&raw))
    }

    fn top(&self, args: &[&str]) -> Response {
        let Some(raw) = self.message(args.first()) else {
            return Response::line("-ERR no such message");
        };
        let Some(count) = args.get(1).and_then(|n| n.parse::<usize>().ok()) else {
            return Response::line("-ERR invalid line count");
        };
        let lines = message_lines(&raw);
        let keep = if self.behavior.top_ignores_count {
            lines.len()
        } else {
            lines
                .iter()
                .position(|l| l.is_empty())
                .map_or(lines.len(), |blank| (blank + 1 + count).min(lines.len()))
        };
        Response::block("+OK", &lines[..keep])
    }

    fn dele(&mut self, args: &[&str]) -> Response {
        let ordinal = args.first().and_then(|n| n.parse::<usize>().ok());
        match ordinal {
            Some(n) if self.message(args.first()).is_some() => {
                self.deleted.push(n);
                Response::line(&format!("+OK message {n} deleted"))
            }
            _ => Response::line("-ERR no such message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_pop3::MaildropBuilder;

    fn session(behavior: Pop3Behavior) -> Session {
        let maildrop = MaildropBuilder::new()
            .message("uid-1", b"Subject: a\r\n\r\nbody\r\n")
            .message("uid-2", b"Subject: b\r\n\r\n.dot\r\n")
            .build();
        Session::new(Arc::new(behavior), Arc::new(Mutex::new(maildrop)))
    }

    fn text(response: &Response) -> String {
        String::from_utf8(response.bytes.clone()).unwrap()
    }

    fn login(s: &mut Session) {
        s.handle("USER alice", false);
        assert_eq!(text(&s.handle("PASS app-password-123", false)), "+OK maildrop locked and ready\r\n");
    }

    #[test]
    fn rejects_commands_before_login() {
        let mut s = session(Pop3Behavior::default());
        assert_eq!(text(&s.handle("STAT", false)), "-ERR not authorized\r\n");
    }

    #[test]
    fn lists_and_stuffs_dot_lines() {
        let mut s = session(Pop3Behavior::default());
        login(&mut s);
        assert_eq!(text(&s.handle("LIST", false)), "+OK 2 messages\r\n1 20\r\n2 20\r\n.\r\n");
        assert_eq!(
            text(&s.handle("RETR 2", false)),
            "+OK 20 octets\r\nSubject: b\r\n\r\n..dot\r\n.\r\n"
        );
    }

    #[test]
    fn stls_only_offered_in_plaintext() {
        let mut s = session(Pop3Behavior::default());
        assert!(text(&s.handle("CAPA", false)).contains("STLS\r\n"));
        assert!(!text(&s.handle("CAPA", true)).contains("STLS"));
        assert_eq!(s.handle("STLS", false).action, Action::StartTls);
    }
}

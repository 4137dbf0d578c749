//! IMAP implementation of the mailbox [`Backend`].

use crate::backend::{headers, utf7, Backend, Error, ObservedMessage, Result, Session};
use crate::config::ImapConfig;
use secrecy::{ExposeSecret, SecretString};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn, Level};

/// Header fetch which leaves the `\Seen` flag untouched.
const FETCH_QUERY: &str = "(UID RFC822.HEADER)";

/// Opens a new IMAP session for every poll cycle.
pub struct ImapBackend {
    host: String,
    port: u16,
    username: String,
    password: SecretString,
    tls: bool,
    batch_size: usize,
    timeout: Duration,
}

impl ImapBackend {
    /// Create a new instance from `config`.
    #[must_use]
    pub fn new(config: &ImapConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: SecretString::from(config.password.expose_secret().to_owned()),
            tls: config.tls,
            batch_size: config.batch_size.max(1),
            timeout: config.timeout,
        }
    }

    fn connect_tcp(&self) -> Result<TcpStream> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(Error::Connect)?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.timeout))
                        .map_err(Error::Connect)?;
                    stream
                        .set_write_timeout(Some(self.timeout))
                        .map_err(Error::Connect)?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Failed to connect to {addr}: {e}");
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Connect(last_error.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {}", self.host),
            )
        })))
    }

    fn login<T: Read + Write + Send + 'static>(&self, stream: T) -> Result<Box<dyn Session>> {
        let mut client = imap::Client::new(stream);
        client.read_greeting().map_err(Error::Imap)?;
        let session = client
            .login(&self.username, self.password.expose_secret())
            .map_err(|(e, _)| Error::Auth(e))?;
        debug!("Logged in as {}", self.username);
        Ok(Box::new(ImapSession {
            session,
            batch_size: self.batch_size,
        }))
    }
}

impl Backend for ImapBackend {
    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(host = %self.host, port = self.port, tls = self.tls))]
    fn open(&self) -> Result<Box<dyn Session>> {
        debug!("Connecting to mail server");
        let stream = self.connect_tcp()?;
        if !self.tls {
            return self.login(stream);
        }

        let connector = native_tls::TlsConnector::builder().build()?;
        let stream = connector
            .connect(&self.host, stream)
            .map_err(|e| Error::Handshake(e.to_string()))?;
        self.login(stream)
    }
}

struct ImapSession<T: Read + Write> {
    session: imap::Session<T>,
    batch_size: usize,
}

impl<T: Read + Write + Send> Session for ImapSession<T> {
    fn unseen(&mut self, folder: &str) -> Result<Vec<ObservedMessage>> {
        // EXAMINE opens the folder read-only so flags can not change as a side effect.
        let mailbox = self.session.examine(utf7::encode(folder))?;
        let uid_validity = mailbox.uid_validity.unwrap_or_default();

        let mut uids = self
            .session
            .uid_search("UNSEEN")?
            .into_iter()
            .collect::<Vec<_>>();
        uids.sort_unstable();
        debug!("Found {} unread messages in {folder}", uids.len());

        let mut messages = Vec::with_capacity(uids.len());
        for batch in uids.chunks(self.batch_size) {
            let set = batch
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let fetches = self.session.uid_fetch(&set, FETCH_QUERY)?;

            for fetch in fetches.iter() {
                let Some(uid) = fetch.uid else {
                    warn!("Server returned a message without UID in {folder}, skipping");
                    continue;
                };

                let observed = match fetch.header().map(headers::parse) {
                    Some(Ok(parsed)) => parsed.into_observed(uid_validity, uid),
                    Some(Err(e)) => {
                        warn!("Malformed headers for uid {uid} in {folder}: {e}");
                        ObservedMessage {
                            id: headers::uid_key(uid_validity, uid),
                            subject: headers::NO_SUBJECT.to_owned(),
                            sender: None,
                        }
                    }
                    None => {
                        warn!("No headers returned for uid {uid} in {folder}, skipping");
                        continue;
                    }
                };
                messages.push(observed);
            }
        }

        Ok(messages)
    }

    fn logout(&mut self) -> Result<()> {
        self.session.logout()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// Minimal scripted server which answers every command and keeps the received lines.
    fn serve_one(listener: TcpListener) -> JoinHandle<Vec<String>> {
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            writer.write_all(b"* OK ready\r\n").unwrap();

            let mut received = Vec::new();
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                let (tag, command) = line.split_once(' ').unwrap();
                let reply = if command.starts_with("EXAMINE") {
                    format!("* 0 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n{tag} OK [READ-ONLY] done\r\n")
                } else if command.starts_with("UID SEARCH") {
                    format!("* SEARCH\r\n{tag} OK done\r\n")
                } else {
                    format!("{tag} OK done\r\n")
                };
                let logout = command.starts_with("LOGOUT");
                writer.write_all(reply.as_bytes()).unwrap();
                received.push(line);
                if logout {
                    break;
                }
            }
            received
        })
    }

    #[test]
    fn folder_names_are_sent_as_modified_utf7() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = serve_one(listener);

        let backend = ImapBackend::new(&ImapConfig {
            host: "127.0.0.1".to_owned(),
            port,
            username: "user".to_owned(),
            password: SecretString::from("secret".to_owned()),
            tls: false,
            batch_size: 10,
            timeout: Duration::from_secs(5),
        });

        let mut session = backend.open().unwrap();
        assert!(session.unseen("Entwürfe").unwrap().is_empty());
        session.logout().unwrap();

        let received = server.join().unwrap();
        assert!(
            received
                .iter()
                .any(|line| line.ends_with(r#"EXAMINE "Entw&APw-rfe""#)),
            "{received:?}"
        );
    }
}

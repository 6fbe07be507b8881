//! Raw IMAP-over-TLS fetch for mailbox source accounts.
//!
//! Deliberately minimal: LOGIN, SELECT INBOX, UID SEARCH UNSEEN, UID FETCH,
//! UID STORE \Seen, LOGOUT. All functions here are blocking and must run in
//! `spawn_blocking`. Marking seen is a separate call from fetching, so the
//! poller can route a batch first and only then consume it; messages are
//! addressed by UID throughout because sequence numbers are only valid
//! within the connection that selected the mailbox.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ConfigError, MailboxError};
use crate::model::Account;

/// IMAP credentials stored in a mailbox account's `credentials` JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxCredentials {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
}

fn default_imap_port() -> u16 {
    993
}

impl MailboxCredentials {
    pub fn from_account(account: &Account) -> Result<Self, ConfigError> {
        serde_json::from_value(account.credentials.clone()).map_err(|e| {
            ConfigError::CredentialInvalid {
                account_id: account.id,
                reason: e.to_string(),
            }
        })
    }
}

/// One unseen email, decoded but not yet routed. Attachment bytes stay in
/// memory here; the poller writes them to the temp area.
#[derive(Debug)]
pub struct FetchedMail {
    pub uid: String,
    pub external_id: String,
    /// Cleaned lowercase sender address, used for rule matching.
    pub sender: String,
    pub sender_label: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<(String, Vec<u8>)>,
}

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.\-+]+@[\w.\-]+").unwrap());

/// Normalize a From header to a bare lowercase address. Display names,
/// angle brackets, and stray whitespace are dropped; if no address-shaped
/// token exists the whole trimmed input is lowercased instead.
pub fn clean_sender(raw: &str) -> String {
    ADDRESS_RE
        .find(raw)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_else(|| raw.trim().to_lowercase())
}

type ImapStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn open_tls(creds: &MailboxCredentials) -> Result<ImapStream, MailboxError> {
    let tcp = TcpStream::connect((&*creds.host, creds.port))
        .map_err(|e| MailboxError::ConnectFailed(e.to_string()))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(creds.host.clone())
        .map_err(|e| MailboxError::ConnectFailed(e.to_string()))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailboxError::ConnectFailed(e.to_string()))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

fn read_line(tls: &mut ImapStream) -> Result<String, MailboxError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err(MailboxError::Protocol("connection closed".into())),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut ImapStream, tag: &str, cmd: &str) -> Result<Vec<String>, MailboxError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

fn login(tls: &mut ImapStream, creds: &MailboxCredentials) -> Result<(), MailboxError> {
    let _greeting = read_line(tls)?;
    let login_resp = send_cmd(
        tls,
        "A1",
        &format!("LOGIN \"{}\" \"{}\"", creds.user, creds.password),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err(MailboxError::AuthFailed(format!(
            "login rejected for {}",
            creds.user
        )));
    }
    let _select = send_cmd(tls, "A2", "SELECT \"INBOX\"")?;
    Ok(())
}

/// UIDs out of `* SEARCH` untagged response lines, in server order.
fn parse_search_uids(lines: &[String]) -> Vec<String> {
    let mut uids = Vec::new();
    for line in lines {
        if line.starts_with("* SEARCH") {
            uids.extend(line.split_whitespace().skip(2).map(|s| s.to_string()));
        }
    }
    uids
}

fn uid_fetch_cmd(uid: &str) -> String {
    format!("UID FETCH {uid} RFC822")
}

fn uid_store_seen_cmd(uid: &str) -> String {
    format!("UID STORE {uid} +FLAGS (\\Seen)")
}

/// Fetch all unseen inbox messages without touching their flags
/// (blocking — run in spawn_blocking).
pub fn fetch_unseen(creds: &MailboxCredentials) -> Result<Vec<FetchedMail>, MailboxError> {
    let mut tls = open_tls(creds)?;
    login(&mut tls, creds)?;

    let search_resp = send_cmd(&mut tls, "A3", "UID SEARCH UNSEEN")?;
    let uids = parse_search_uids(&search_resp);

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in &uids {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, &fetch_tag, &uid_fetch_cmd(uid))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        match decode_mail(uid, raw.as_bytes()) {
            Ok(mail) => results.push(mail),
            // A malformed message is skipped, never fatal for the batch.
            Err(e) => warn!(uid = %uid, "Skipping message: {e}"),
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(results)
}

fn decode_mail(uid: &str, raw: &[u8]) -> Result<FetchedMail, MailboxError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailboxError::ParseFailed(format!("message {uid} has no parseable content")))?;
    let parsed = &parsed;
    let raw_from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let sender_label = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.name())
        .map(|s| s.to_string())
        .unwrap_or_else(|| raw_from.clone());

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let body = extract_text(parsed);
    let external_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        let contents = part.contents();
        if contents.is_empty() {
            continue;
        }
        let name = MimeHeaders::attachment_name(part)
            .unwrap_or("attachment.bin")
            .to_string();
        attachments.push((name, contents.to_vec()));
    }

    Ok(FetchedMail {
        uid: uid.to_string(),
        external_id,
        sender: clean_sender(&raw_from),
        sender_label,
        subject,
        body,
        attachments,
    })
}

/// Readable text body: plain part first, then a crude de-tagged HTML part.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    "(no readable content)".to_string()
}

fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Mark a batch of messages \Seen (blocking — run in spawn_blocking).
/// Opens its own connection so it can run after routing completed; UIDs
/// from `fetch_unseen` stay valid here where sequence numbers would not.
pub fn mark_seen(creds: &MailboxCredentials, uids: &[String]) -> Result<(), MailboxError> {
    if uids.is_empty() {
        return Ok(());
    }
    let mut tls = open_tls(creds)?;
    login(&mut tls, creds)?;

    let mut tag_counter = 3_u32;
    for uid in uids {
        let tag = format!("A{tag_counter}");
        tag_counter += 1;
        let _ = send_cmd(&mut tls, &tag, &uid_store_seen_cmd(uid));
    }
    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");
    Ok(())
}

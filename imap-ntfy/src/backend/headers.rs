//! Extraction of the few header fields a notification needs.

use crate::backend::ObservedMessage;
use mailparse::{MailAddr, MailHeaderMap};

pub const NO_SUBJECT: &str = "No Subject";

/// Header fields of one message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Headers {
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: Option<String>,
}

impl Headers {
    /// Convert into an [`ObservedMessage`]. Messages without a `Message-ID` header are keyed by
    /// their UID, qualified with the folder's UIDVALIDITY.
    #[must_use]
    pub fn into_observed(self, uid_validity: u32, uid: u32) -> ObservedMessage {
        ObservedMessage {
            id: self
                .message_id
                .unwrap_or_else(|| uid_key(uid_validity, uid)),
            subject: self.subject,
            sender: self.sender,
        }
    }
}

/// Fallback identifier for a message without `Message-ID`.
#[must_use]
pub fn uid_key(uid_validity: u32, uid: u32) -> String {
    format!("uid:{uid_validity}:{uid}")
}

/// Parse the raw header block of a message.
///
/// # Errors
///
/// Returns error if the header block is malformed.
pub fn parse(raw: &[u8]) -> Result<Headers, mailparse::MailParseError> {
    let (headers, _) = mailparse::parse_headers(raw)?;

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty());

    let subject = headers
        .get_first_value("Subject")
        .map(|v| collapse_whitespace(&v))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_owned());

    let sender = headers.get_first_header("From").and_then(|header| {
        let raw_value = collapse_whitespace(&header.get_value());
        let parsed = mailparse::addrparse_header(header).ok();
        sender_name(&raw_value, parsed.as_ref().map(|list| list.as_slice()))
    });

    Ok(Headers {
        message_id,
        subject,
        sender,
    })
}

/// Pick the most readable representation of the sender: the display name, a trailing
/// `(Name)` comment, or the bare address.
fn sender_name(raw: &str, parsed: Option<&[MailAddr]>) -> Option<String> {
    if !raw.contains('<') {
        if let Some(comment) = comment(raw) {
            return Some(comment);
        }
    }

    let first = parsed.and_then(|addrs| addrs.first());
    let name = match first {
        Some(MailAddr::Single(info)) => info
            .display_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| Some(info.addr.clone())),
        Some(MailAddr::Group(group)) => group
            .addrs
            .first()
            .map(|info| info.display_name.clone().unwrap_or_else(|| info.addr.clone())),
        None => None,
    };

    name.map(|n| n.trim().trim_matches(|c| c == '"' || c == '\'').to_owned())
        .filter(|n| !n.is_empty())
        .or_else(|| (!raw.is_empty()).then(|| raw.to_owned()))
}

fn comment(value: &str) -> Option<String> {
    let start = value.find('(')?;
    let end = value[start..].find(')')? + start;
    let inner = value[start + 1..end].trim();
    (!inner.is_empty()).then(|| inner.to_owned())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_headers() {
        let raw = b"Message-ID: <abc@example.com>\r\n\
Subject: Invoice 42\r\n\
From: \"Alice Example\" <alice@example.com>\r\n\
\r\n";
        let headers = parse(raw).unwrap();
        assert_eq!(headers.message_id.as_deref(), Some("<abc@example.com>"));
        assert_eq!(headers.subject, "Invoice 42");
        assert_eq!(headers.sender.as_deref(), Some("Alice Example"));
    }

    #[test]
    fn folded_and_encoded_subject() {
        let raw = b"Subject: Quarterly report\r\n  for Q3\r\n\
From: bob@example.com\r\n\r\n";
        let headers = parse(raw).unwrap();
        assert_eq!(headers.subject, "Quarterly report for Q3");
        assert_eq!(headers.sender.as_deref(), Some("bob@example.com"));
        assert!(headers.message_id.is_none());

        let raw = b"Subject: =?UTF-8?B?UG9zdCBmw7xyIGRpY2g=?=\r\n\r\n";
        assert_eq!(parse(raw).unwrap().subject, "Post für dich");
    }

    #[test]
    fn missing_fields_use_fallbacks() {
        let headers = parse(b"To: me@example.com\r\n\r\n").unwrap();
        assert_eq!(headers.subject, NO_SUBJECT);
        assert!(headers.sender.is_none());

        let observed = headers.into_observed(7, 42);
        assert_eq!(observed.id, "uid:7:42");
    }

    #[test]
    fn sender_comment_form() {
        assert_eq!(
            sender_name("carol@example.com (Carol)", None).as_deref(),
            Some("Carol")
        );
        assert_eq!(
            sender_name("dave@example.com", None).as_deref(),
            Some("dave@example.com")
        );
        assert_eq!(sender_name("", None), None);
    }
}

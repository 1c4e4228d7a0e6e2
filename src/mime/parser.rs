//! Raw message decoding.
//!
//! Wraps `mailparse` to turn RFC 5322 bytes into an [`Envelope`] and a
//! [`MimeBody`]. Decoding is forgiving: bad charsets degrade to lossy UTF-8
//! and bad dates degrade to the processing time, so only structurally
//! unreadable input is an error.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeader, MailHeaderMap, ParsedMail};
use thiserror::Error;

use crate::domain::{Address, Envelope, NewAttachment};

/// Errors that can occur while decoding a message.
#[derive(Debug, Error)]
pub enum MimeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),
}

/// Result type for MIME operations.
pub type Result<T> = std::result::Result<T, MimeError>;

/// Decoded body parts of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeBody {
    /// First `text/plain` part found depth-first.
    pub text: Option<String>,
    /// First `text/html` part found depth-first.
    pub html: Option<String>,
    /// Parts with an `attachment` disposition, in tree order.
    pub attachments: Vec<NewAttachment>,
}

/// Parses a header block (or a whole message) into an envelope.
///
/// `protocol_uid` seeds the synthetic Message-ID used when the header is missing.
pub fn parse_envelope(raw: &[u8], protocol_uid: &str) -> Result<Envelope> {
    let (headers, _) = mailparse::parse_headers(raw)?;
    Ok(envelope_from_headers(&headers, protocol_uid))
}

/// Parses a whole message into its bodies and attachments.
pub fn parse_body(raw: &[u8]) -> Result<MimeBody> {
    let mail = mailparse::parse_mail(raw)?;
    let mut body = MimeBody::default();
    collect_parts(&mail, &mut body);
    Ok(body)
}

fn envelope_from_headers(headers: &[MailHeader<'_>], protocol_uid: &str) -> Envelope {
    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| Envelope::generated_message_id(protocol_uid));

    let from = addresses(headers, "From")
        .into_iter()
        .next()
        .unwrap_or_else(|| Address::new(""));

    let subject = headers
        .get_first_value("Subject")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    Envelope {
        message_id,
        from,
        to: addresses(headers, "To"),
        cc: addresses(headers, "Cc"),
        subject,
        date: parse_date(headers.get_first_value("Date").as_deref(), protocol_uid),
    }
}

fn addresses(headers: &[MailHeader<'_>], name: &str) -> Vec<Address> {
    let Some(header) = headers.get_first_header(name) else {
        return Vec::new();
    };

    match mailparse::addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![single(&info.addr, info.display_name.as_deref())],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| single(&info.addr, info.display_name.as_deref()))
                    .collect(),
            })
            .collect(),
        Err(e) => {
            let raw = header.get_value();
            tracing::warn!(header = name, error = %e, "unparseable address header");
            raw.split(',')
                .map(str::trim)
                .filter(|s| s.contains('@'))
                .map(|s| Address::new(s.trim_matches(|c| c == '<' || c == '>')))
                .collect()
        }
    }
}

fn single(addr: &str, name: Option<&str>) -> Address {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => Address::with_name(addr.trim(), name),
        None => Address::new(addr.trim()),
    }
}

fn parse_date(value: Option<&str>, protocol_uid: &str) -> DateTime<Utc> {
    let parsed = value
        .and_then(|v| mailparse::dateparse(v).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0));

    match parsed {
        Some(date) => date,
        None => {
            tracing::warn!(
                uid = protocol_uid,
                raw = value.unwrap_or(""),
                "missing or unparseable Date header, using processing time"
            );
            Utc::now()
        }
    }
}

fn collect_parts(part: &ParsedMail<'_>, body: &mut MimeBody) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, body);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    if disposition.disposition == DispositionType::Attachment {
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned()
            .unwrap_or_else(|| format!("attachment-{}", body.attachments.len() + 1));
        let payload = part.get_body_raw().unwrap_or_else(|e| {
            tracing::warn!(filename = %filename, error = %e, "undecodable attachment payload");
            Vec::new()
        });
        body.attachments.push(NewAttachment {
            filename,
            mime_type: part.ctype.mimetype.clone(),
            payload,
        });
        return;
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" if body.text.is_none() => body.text = Some(decode_text(part)),
        "text/html" if body.html.is_none() => body.html = Some(decode_text(part)),
        _ => {}
    }
}

/// Decodes a text part, degrading to lossy UTF-8 instead of failing.
fn decode_text(part: &ParsedMail<'_>) -> String {
    match part.get_body() {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(charset = %part.ctype.charset, error = %e, "charset decode failed");
            part.get_body_raw()
                .map(|raw| String::from_utf8_lossy(&raw).into_owned())
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MIXED: &str = "From: \"Alice Example\" <alice@example.com>\r\n\
To: bob@corp.test, carol@corp.test\r\n\
Cc: Dave <dave@corp.test>\r\n\
Subject: =?UTF-8?Q?Caf=C3=A9?= =?UTF-8?Q?_au_lait?=\r\n\
Date: Tue, 01 Oct 2024 09:30:00 +0000\r\n\
Message-ID: <abc@example.com>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain body\r\n\
--inner\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html body</p>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
second plain part\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
aGVsbG8=\r\n\
--outer--\r\n";

    #[test]
    fn envelope_decodes_headers() {
        let envelope = parse_envelope(MIXED.as_bytes(), "7").unwrap();

        assert_eq!(envelope.message_id, "<abc@example.com>");
        assert_eq!(
            envelope.from,
            Address::with_name("alice@example.com", "Alice Example")
        );
        assert_eq!(envelope.to.len(), 2);
        assert_eq!(envelope.cc, vec![Address::with_name("dave@corp.test", "Dave")]);
        assert_eq!(envelope.subject.as_deref(), Some("Café au lait"));
        assert_eq!(envelope.date.to_rfc3339(), "2024-10-01T09:30:00+00:00");
    }

    #[test]
    fn body_takes_first_parts_depth_first() {
        let body = parse_body(MIXED.as_bytes()).unwrap();

        assert_eq!(body.text.as_deref().map(str::trim), Some("plain body"));
        assert_eq!(body.html.as_deref().map(str::trim), Some("<p>html body</p>"));
        assert_eq!(body.attachments.len(), 1);
        assert_eq!(body.attachments[0].filename, "report.pdf");
        assert_eq!(body.attachments[0].mime_type, "application/pdf");
        assert_eq!(body.attachments[0].payload, b"hello".to_vec());
        assert_eq!(body.attachments[0].size_bytes(), 5);
    }

    #[test]
    fn missing_message_id_is_synthesised() {
        let raw = b"From: x@example.com\r\nSubject: hi\r\n\r\nbody";
        let envelope = parse_envelope(raw, "42").unwrap();
        assert_eq!(envelope.message_id, "<generated-42@local>");
    }

    #[test]
    fn bad_date_falls_back_to_now() {
        let before = Utc::now();
        let raw = b"From: x@example.com\r\nDate: not a date at all\r\n\r\n";
        let envelope = parse_envelope(raw, "1").unwrap();
        assert!(envelope.date >= before);
    }

    #[test]
    fn single_part_message_is_plain_body() {
        let raw = b"From: x@example.com\r\nContent-Type: text/plain\r\n\r\nhello there";
        let body = parse_body(raw).unwrap();
        assert_eq!(body.text.as_deref(), Some("hello there"));
        assert!(body.html.is_none());
        assert!(body.attachments.is_empty());
    }

    #[test]
    fn unknown_charset_does_not_fail() {
        let raw = b"Content-Type: text/plain; charset=x-made-up\r\n\r\ncaf\xc3\xa9 ok";
        let body = parse_body(raw).unwrap();
        assert!(body.text.unwrap().contains("ok"));
    }

    #[test]
    fn unnamed_attachment_gets_placeholder_name() {
        let raw = "Content-Type: multipart/mixed; boundary=b\r\n\r\n\
--b\r\nContent-Type: application/octet-stream\r\nContent-Disposition: attachment\r\n\r\nxyz\r\n--b--\r\n";
        let body = parse_body(raw.as_bytes()).unwrap();
        assert_eq!(body.attachments[0].filename, "attachment-1");
    }

    #[test]
    fn missing_from_yields_empty_sender() {
        let envelope = parse_envelope(b"Subject: x\r\n\r\n", "9").unwrap();
        assert_eq!(envelope.from.email, "");
        assert!(envelope.to.is_empty());
    }
}

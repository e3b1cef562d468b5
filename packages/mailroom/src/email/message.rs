//! MIME assembly: queue row + rendered content + attachments → lettre Message.

use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};
use thiserror::Error;

use super::attachment::ProcessedAttachment;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
    #[error("no recipients in to list")]
    NoRecipients,
    #[error("failed to build message: {0}")]
    Build(String),
}

/// Everything needed to produce one wire-ready message.
#[derive(Debug, Clone)]
pub struct EmailContent<'a> {
    pub from: &'a str,
    pub to: &'a str,
    pub cc: Option<&'a str>,
    pub bcc: Option<&'a str>,
    pub subject: &'a str,
    pub body: &'a str,
    pub is_html: bool,
}

/// Parse a comma-separated address list into mailboxes.
pub fn parse_address_list(raw: &str) -> Result<Vec<Mailbox>, MessageError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|addr| {
            addr.parse::<Mailbox>()
                .map_err(|_| MessageError::InvalidAddress(addr.to_string()))
        })
        .collect()
}

pub fn assemble_message(
    content: &EmailContent<'_>,
    attachments: &[ProcessedAttachment],
) -> Result<Message, MessageError> {
    let from: Mailbox = content
        .from
        .parse()
        .map_err(|_| MessageError::InvalidAddress(content.from.to_string()))?;

    let mut builder = Message::builder().from(from).subject(content.subject);

    let to = parse_address_list(content.to)?;
    if to.is_empty() {
        return Err(MessageError::NoRecipients);
    }
    for mailbox in to {
        builder = builder.to(mailbox);
    }
    if let Some(cc) = content.cc {
        for mailbox in parse_address_list(cc)? {
            builder = builder.cc(mailbox);
        }
    }
    if let Some(bcc) = content.bcc {
        for mailbox in parse_address_list(bcc)? {
            builder = builder.bcc(mailbox);
        }
    }

    let body_part = if content.is_html {
        SinglePart::builder()
            .header(ContentType::TEXT_HTML)
            .body(content.body.to_string())
    } else {
        SinglePart::builder()
            .header(ContentType::TEXT_PLAIN)
            .body(content.body.to_string())
    };

    let message = if attachments.is_empty() {
        builder
            .singlepart(body_part)
            .map_err(|e| MessageError::Build(e.to_string()))?
    } else {
        let mut multipart = MultiPart::mixed().singlepart(body_part);
        for attachment in attachments {
            multipart = multipart.singlepart(attachment_part(attachment)?);
        }
        builder
            .multipart(multipart)
            .map_err(|e| MessageError::Build(e.to_string()))?
    };

    Ok(message)
}

fn attachment_part(attachment: &ProcessedAttachment) -> Result<SinglePart, MessageError> {
    let content_type = ContentType::parse(&attachment.content_type)
        .or_else(|_| ContentType::parse("application/octet-stream"))
        .map_err(|e| MessageError::Build(e.to_string()))?;

    let part = if attachment.inline {
        // Inline parts are referenced from HTML bodies by content id.
        let cid = attachment
            .content_id
            .clone()
            .unwrap_or_else(|| attachment.filename.clone());
        Attachment::new_inline(cid).body(attachment.bytes.clone(), content_type)
    } else {
        Attachment::new(attachment.filename.clone()).body(attachment.bytes.clone(), content_type)
    };

    Ok(part)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content<'a>() -> EmailContent<'a> {
        EmailContent {
            from: "noreply@example.com",
            to: "a@example.com",
            cc: None,
            bcc: None,
            subject: "Hi",
            body: "Hello",
            is_html: false,
        }
    }

    #[test]
    fn assembles_plain_text_message() {
        let message = assemble_message(&content(), &[]).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Hi"));
        assert!(raw.contains("Hello"));
    }

    #[test]
    fn assembles_html_message() {
        let mut c = content();
        c.body = "<h1>Hello</h1>";
        c.is_html = true;

        let message = assemble_message(&c, &[]).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn parses_comma_separated_lists() {
        let boxes = parse_address_list("a@example.com, b@example.com").unwrap();
        assert_eq!(boxes.len(), 2);
    }

    #[test]
    fn carries_cc_and_bcc() {
        let mut c = content();
        c.cc = Some("cc@example.com");
        c.bcc = Some("bcc@example.com");

        let message = assemble_message(&c, &[]).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("cc@example.com"));
    }

    #[test]
    fn rejects_malformed_addresses() {
        let mut c = content();
        c.to = "not-an-address";
        assert!(matches!(
            assemble_message(&c, &[]),
            Err(MessageError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_empty_recipient_list() {
        let mut c = content();
        c.to = " , ";
        assert!(matches!(
            assemble_message(&c, &[]),
            Err(MessageError::NoRecipients)
        ));
    }

    #[test]
    fn includes_attachments_as_multipart() {
        let attachment = ProcessedAttachment {
            filename: "report.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            bytes: b"%PDF-".to_vec(),
            inline: false,
            content_id: None,
        };

        let message = assemble_message(&content(), &[attachment]).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("report.pdf"));
        assert!(raw.contains("application/pdf"));
    }

    #[test]
    fn inline_attachment_uses_content_id() {
        let attachment = ProcessedAttachment {
            filename: "logo.png".to_string(),
            content_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
            inline: true,
            content_id: Some("logo".to_string()),
        };

        let message = assemble_message(&content(), &[attachment]).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Content-ID"));
        assert!(raw.contains("logo"));
    }
}

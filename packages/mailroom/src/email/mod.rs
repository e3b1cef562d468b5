//! Email composition and delivery: template rendering, attachment
//! processing, MIME assembly, and the SMTP backend.

pub mod attachment;
pub mod message;
pub mod smtp;
pub mod template;
pub mod testing;

pub use attachment::{
    specs_from_json, AttachmentOutcome, AttachmentProcessor, AttachmentSpec, ProcessedAttachment,
};
pub use message::{assemble_message, parse_address_list, EmailContent, MessageError};
pub use smtp::{LettreSmtpSender, SendOutcome, SmtpSender};
pub use template::{render_str, RenderedEmail, TemplateEngine, TemplateError};
pub use testing::MockSmtpSender;

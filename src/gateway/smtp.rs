use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MailAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{NotificationGateway, OutgoingMessage};
use crate::config::EmailConfig;
use crate::error::LabError;

fn notify_err(context: &str, e: impl std::fmt::Display) -> LabError {
    LabError::Notification {
        message: format!("{context}: {e}"),
    }
}

/// STARTTLS submission with username/password login.
pub struct SmtpNotifier {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: &EmailConfig, password: &str) -> Result<Self, LabError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| notify_err(&format!("invalid sender '{}'", config.from), e))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| notify_err(&format!("smtp relay {}", config.smtp_host), e))?
            .port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                password.to_string(),
            ));
        }

        Ok(Self {
            from,
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl NotificationGateway for SmtpNotifier {
    async fn send(&self, message: &OutgoingMessage) -> Result<(), LabError> {
        let email = build_message(&self.from, message)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| notify_err(&format!("send to {}", message.to), e))?;
        tracing::info!(to = %message.to, subject = %message.subject, "email sent");
        Ok(())
    }
}

/// Plain-text body, plus a second MIME part when there is an attachment.
fn build_message(from: &Mailbox, message: &OutgoingMessage) -> Result<Message, LabError> {
    let to: Mailbox = message
        .to
        .parse()
        .map_err(|e| notify_err(&format!("invalid recipient '{}'", message.to), e))?;

    let builder = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(message.subject.clone());

    let text = SinglePart::plain(message.body.clone());
    let built = match &message.attachment {
        None => builder.singlepart(text),
        Some(a) => {
            let content_type = ContentType::parse(&a.content_type)
                .map_err(|e| notify_err(&format!("content type '{}'", a.content_type), e))?;
            builder.multipart(
                MultiPart::mixed()
                    .singlepart(text)
                    .singlepart(MailAttachment::new(a.filename.clone()).body(a.content.clone(), content_type)),
            )
        }
    };
    built.map_err(|e| notify_err("build message", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Attachment;

    fn sender() -> Mailbox {
        "Lab Provisioning <lab@example.com>".parse().unwrap()
    }

    fn message(attachment: Option<Attachment>) -> OutgoingMessage {
        OutgoingMessage {
            to: "student@example.com".into(),
            subject: "Lab Access - Machine: lab-vm-1".into(),
            body: "Password: secret\n".into(),
            attachment,
        }
    }

    #[test]
    fn plain_message_headers() {
        let raw = String::from_utf8(build_message(&sender(), &message(None)).unwrap().formatted()).unwrap();
        assert!(raw.contains("To: student@example.com"));
        assert!(raw.contains("Subject: Lab Access - Machine: lab-vm-1"));
        assert!(raw.contains("Password: secret"));
        assert!(!raw.contains("multipart/mixed"));
    }

    #[test]
    fn attachment_becomes_mime_part() {
        let attachment = Attachment {
            filename: "student1-wireguard.conf".into(),
            content_type: "application/x-wireguard-profile".into(),
            content: b"[Interface]\n".to_vec(),
        };
        let raw =
            String::from_utf8(build_message(&sender(), &message(Some(attachment))).unwrap().formatted()).unwrap();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("application/x-wireguard-profile"));
        assert!(raw.contains("student1-wireguard.conf"));
    }

    #[test]
    fn bad_recipient_is_notification_error() {
        let mut msg = message(None);
        msg.to = "not an address".into();
        let err = build_message(&sender(), &msg).unwrap_err();
        assert!(matches!(err, LabError::Notification { .. }));
    }

    #[test]
    fn notifier_rejects_bad_sender() {
        let config = EmailConfig {
            smtp_host: "smtp.example.com".into(),
            from: "nope".into(),
            ..EmailConfig::default()
        };
        assert!(SmtpNotifier::new(&config, "pw").is_err());
    }
}

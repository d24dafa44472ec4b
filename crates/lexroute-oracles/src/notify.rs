use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use lexroute_core::config::Config;
use lexroute_core::oracle::Notifier;
use lexroute_core::types::AssignmentNotice;

/// SMTP-backed assignment notifier.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .context("build SMTP transport")?
                .port(config.smtp_port);
        if !config.smtp_user.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.smtp_user.clone(),
                config.smtp_pass.clone(),
            ));
        }
        let from = config
            .smtp_from
            .parse::<Mailbox>()
            .context("parse SMTP_FROM address")?;
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn render_body(notice: &AssignmentNotice) -> String {
        format!(
            "Dear {name},\n\n\
             Case {number} (\"{title}\") has been assigned.\n\n\
             Jurisdiction: {jurisdiction}\n\
             Urgency: {urgency}\n\
             Submitted: {submitted}\n\n\
             Please log in to the case portal for details.\n",
            name = notice.recipient_name,
            number = notice.case_number,
            title = notice.title,
            jurisdiction = notice.jurisdiction,
            urgency = notice.urgency.as_str(),
            submitted = notice.submitted_at.format("%Y-%m-%d %H:%M UTC"),
        )
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify_assignment(&self, notice: &AssignmentNotice) -> Result<()> {
        let to = notice
            .recipient_email
            .parse::<Mailbox>()
            .with_context(|| format!("parse recipient address {:?}", notice.recipient_email))?;
        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(format!(
                "[{}] Case {} assigned",
                notice.urgency.as_str(),
                notice.case_number
            ))
            .body(Self::render_body(notice))
            .context("build notification email")?;

        self.transport
            .send(email)
            .await
            .with_context(|| format!("send notification to {}", notice.recipient_email))?;
        info!("assignment notice sent to {}", notice.recipient_email);
        Ok(())
    }
}

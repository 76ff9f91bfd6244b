use axum::async_trait;
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::config::SmtpConfig;

/// The three transactional mails this service sends. Plaintext and HTML
/// bodies per kind, no templating engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mail {
    VerificationCode(i32),
    SignInCode(i32),
    ResetLink(String),
}

impl Mail {
    pub fn subject(&self) -> &'static str {
        match self {
            Mail::VerificationCode(_) => "Your Verification Code",
            Mail::SignInCode(_) => "Your Sign In Code",
            Mail::ResetLink(_) => "Reset Password Link",
        }
    }

    pub fn text(&self) -> String {
        match self {
            Mail::VerificationCode(code) => format!("Your verification code is: {}", code),
            Mail::SignInCode(code) => format!("Your sign in code is: {}", code),
            Mail::ResetLink(url) => format!("Reset your password here: {}", url),
        }
    }

    pub fn html(&self) -> String {
        match self {
            Mail::VerificationCode(code) => {
                format!("<p>Your verification code is: <strong>{}</strong></p>", code)
            }
            Mail::SignInCode(code) => {
                format!("<p>Your sign in code is: <strong>{}</strong></p>", code)
            }
            Mail::ResetLink(url) => format!(
                "<p>Click the link to reset your password: <a href=\"{url}\">{url}</a></p>"
            ),
        }
    }
}

/// Seam over the email provider. `send` resolves to a provider-confirmed
/// identifier; callers must not persist codes unless it does.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, mail: Mail) -> anyhow::Result<String>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(cfg: &SmtpConfig) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)?
            .credentials(Credentials::new(
                cfg.username.clone(),
                cfg.password.clone(),
            ))
            .build();
        let from = cfg
            .from_address
            .parse::<Mailbox>()
            .map_err(|e| anyhow::anyhow!("invalid SMTP_FROM address: {e}"))?;
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, mail: Mail) -> anyhow::Result<String> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to
                .parse::<Mailbox>()
                .map_err(|e| anyhow::anyhow!("invalid recipient address: {e}"))?)
            .subject(mail.subject())
            .multipart(MultiPart::alternative_plain_html(mail.text(), mail.html()))?;

        let response = self.transport.send(message).await?;
        anyhow::ensure!(
            response.is_positive(),
            "smtp rejected message: {}",
            response.code()
        );
        Ok(response.code().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_code_mail_carries_the_code() {
        let mail = Mail::VerificationCode(123456);
        assert_eq!(mail.subject(), "Your Verification Code");
        assert!(mail.text().contains("123456"));
        assert!(mail.html().contains("<strong>123456</strong>"));
    }

    #[test]
    fn sign_in_code_mail_carries_the_code() {
        let mail = Mail::SignInCode(654321);
        assert_eq!(mail.subject(), "Your Sign In Code");
        assert!(mail.text().contains("654321"));
        assert!(mail.html().contains("654321"));
    }

    #[test]
    fn reset_link_mail_embeds_the_url() {
        let url = "http://localhost:3000/reset-password/?reset_token=abc";
        let mail = Mail::ResetLink(url.into());
        assert_eq!(mail.subject(), "Reset Password Link");
        assert!(mail.text().contains(url));
        assert!(mail.html().contains(&format!("href=\"{}\"", url)));
    }
}

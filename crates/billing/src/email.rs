//! Reminder email delivery
//!
//! The reminder sweep talks to a [`ReminderNotifier`]. [`BillingEmailService`]
//! sends through the Resend HTTP API, or only logs when no API key is
//! configured (development).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::mandate::reminder::ReminderType;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Everything needed to render one reminder email
#[derive(Debug, Clone, Serialize)]
pub struct ReminderNotice {
    pub reminder_id: Uuid,
    pub reminder_type: ReminderType,
    pub level: i16,
    pub tenant_name: String,
    pub recipient: Option<String>,
    pub invoice_number: Option<String>,
    pub amount_due: Option<Decimal>,
    pub due_date: Option<OffsetDateTime>,
    pub subscription_end: OffsetDateTime,
}

#[async_trait]
pub trait ReminderNotifier: Send + Sync {
    /// Deliver one reminder. An error leaves the reminder pending.
    async fn send_reminder(&self, notice: &ReminderNotice) -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub from_address: String,
    pub app_base_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty()),
            from_address: std::env::var("BILLING_EMAIL_FROM")
                .unwrap_or_else(|_| "Facturation <facturation@localhost>".to_string()),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
}

#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn render(&self, notice: &ReminderNotice) -> (String, String) {
        match notice.reminder_type {
            ReminderType::Dunning => {
                let number = notice.invoice_number.as_deref().unwrap_or("-");
                let amount = notice
                    .amount_due
                    .map(|a| format!("{} €", a))
                    .unwrap_or_default();
                let due = notice
                    .due_date
                    .map(|d| d.date().to_string())
                    .unwrap_or_default();
                (
                    format!("Relance n°{} : facture {}", notice.level, number),
                    format!(
                        "<p>Bonjour,</p><p>Sauf erreur de notre part, la facture {} de {} \
                         échue le {} reste impayée pour {}.</p>\
                         <p><a href=\"{}/admin/billing\">Consulter la facturation</a></p>",
                        number, amount, due, notice.tenant_name, self.config.app_base_url
                    ),
                )
            }
            ReminderType::Renewal => (
                format!("Renouvellement de votre abonnement ({})", notice.tenant_name),
                format!(
                    "<p>Bonjour,</p><p>L'abonnement de {} arrive à échéance le {}.</p>\
                     <p><a href=\"{}/admin/billing\">Préparer le renouvellement</a></p>",
                    notice.tenant_name,
                    notice.subscription_end.date(),
                    self.config.app_base_url
                ),
            ),
        }
    }

    async fn post(
        &self,
        api_key: &str,
        recipient: &str,
        subject: String,
        html: String,
        idempotency_key: &str,
    ) -> BillingResult<()> {
        let body = ResendEmail {
            from: &self.config.from_address,
            to: [recipient],
            subject,
            html,
        };

        let body = &body;
        let http = &self.http;
        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        Retry::spawn(strategy, move || async move {
            let response = http
                .post(RESEND_API_URL)
                .bearer_auth(api_key)
                .header("Idempotency-Key", idempotency_key)
                .json(body)
                .send()
                .await
                .map_err(|e| BillingError::Notification(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                let text = response.text().await.unwrap_or_default();
                Err(BillingError::Notification(format!(
                    "Resend returned {}: {}",
                    status, text
                )))
            }
        })
        .await
    }
}

#[async_trait]
impl ReminderNotifier for BillingEmailService {
    async fn send_reminder(&self, notice: &ReminderNotice) -> BillingResult<()> {
        let recipient = notice.recipient.as_deref().ok_or_else(|| {
            BillingError::Notification(format!(
                "Tenant '{}' has no billing email",
                notice.tenant_name
            ))
        })?;
        let (subject, html) = self.render(notice);

        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::warn!(
                to = %recipient,
                subject = %subject,
                reminder_id = %notice.reminder_id,
                "Email disabled, reminder logged only"
            );
            return Ok(());
        };

        let idempotency_key = notice.reminder_id.to_string();
        self.post(api_key, recipient, subject, html, &idempotency_key)
            .await?;

        tracing::info!(
            to = %recipient,
            reminder_id = %notice.reminder_id,
            reminder_type = %notice.reminder_type,
            level = notice.level,
            "Sent reminder email"
        );
        Ok(())
    }
}

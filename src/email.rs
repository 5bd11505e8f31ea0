//! Best-effort transactional email fan-out. Every send catches and logs its
//! own failures; nothing here ever propagates into the orchestrator's control
//! flow. Successful deliveries are recorded as plan outputs so they are
//! auditable and never re-sent.

use crate::config::EmailConfig;
use crate::db::DBConnection;
use crate::models::plans::{NewPlanOutput, OutputChannel, Plan};
use crate::models::sessions::Session;
use async_trait::async_trait;
use resend_rs::types::CreateEmailBaseOptions;
use resend_rs::Resend;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum EmailError {
    #[error("Resend API key not configured")]
    ApiKeyNotFound,
    #[error("Failed to send email")]
    SendFailed,
}

/// Mail transport seam. The dispatcher owns recipients, templates, and
/// delivery auditing; the transport only moves one message.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), EmailError>;
}

pub struct ResendMailer {
    config: EmailConfig,
}

impl ResendMailer {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSender for ResendMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), EmailError> {
        let api_key = self
            .config
            .resend_api_key
            .as_ref()
            .ok_or(EmailError::ApiKeyNotFound)?;
        let resend = Resend::new(api_key);

        let email =
            CreateEmailBaseOptions::new(&self.config.from_address, [to.to_string()], subject)
                .with_html(html);

        resend.emails.send(email).await.map_err(|e| {
            error!("Failed to send email: {}", e);
            EmailError::SendFailed
        })?;
        Ok(())
    }
}

/// Notification fan-out seam. The orchestrator only knows about these two
/// moments; everything else (recipients, templates, auditing) lives behind it.
#[async_trait]
pub trait Notifications: Send + Sync {
    /// User summary + admin full plan. Each mail is independently best-effort.
    async fn plan_completed(&self, session: &Session, plan: &Plan);
    /// Admin alert, sent with the last attempt's error and again on terminal failure.
    async fn synthesis_failed(&self, session: &Session, error_detail: &str);
}

pub struct EmailDispatcher {
    db: Arc<dyn DBConnection>,
    mailer: Arc<dyn MailSender>,
}

impl EmailDispatcher {
    pub fn new(db: Arc<dyn DBConnection>, mailer: Arc<dyn MailSender>) -> Self {
        Self { db, mailer }
    }

    fn resolve_admin_email(&self, session: &Session) -> Option<String> {
        match self.db.get_invite_code_by_id(session.invite_code_id) {
            Ok(invite) => Some(invite.admin_email),
            Err(e) => {
                warn!(
                    "Could not resolve admin for session {} (invite {}): {:?}",
                    session.id, session.invite_code_id, e
                );
                None
            }
        }
    }

    /// The audit trail doubles as the re-send guard: a channel that already
    /// has a delivery row for this plan is never mailed again.
    fn already_delivered(&self, plan: &Plan, channel: OutputChannel) -> bool {
        match self.db.get_plan_outputs(plan.id) {
            Ok(outputs) => outputs.iter().any(|o| o.channel == channel),
            Err(e) => {
                warn!(
                    "Could not read delivery audit for plan {}: {:?}",
                    plan.id, e
                );
                false
            }
        }
    }

    fn record_delivery(&self, plan: &Plan, channel: OutputChannel, recipient: &str) {
        if let Err(e) = self.db.record_plan_output(NewPlanOutput {
            plan_id: plan.id,
            channel,
            recipient: recipient.to_string(),
        }) {
            error!("Failed to record plan output for plan {}: {:?}", plan.id, e);
        }
    }

    async fn send_user_summary(&self, session: &Session, plan: &Plan) {
        // No contact email on the session means the visitor opted out of mail.
        let Some(recipient) = session.contact_email.as_deref() else {
            debug!("Session {} has no contact email, skipping user summary", session.id);
            return;
        };
        if self.already_delivered(plan, OutputChannel::UserSummary) {
            debug!("User summary for plan {} already delivered", plan.id);
            return;
        }

        let summary = plan.user_summary.as_deref().unwrap_or_default();
        let html = format!(
            r#"
            <!DOCTYPE html>
            <html lang="en">
            <head>
                <meta charset="UTF-8">
                <title>Your Project Summary</title>
                <style>
                    body {{ font-family: ui-sans-serif,system-ui,sans-serif; }}
                    .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
                    h1, h2, h3 {{ font-weight: 300; }}
                </style>
            </head>
            <body>
                <div class="container">
                    <h1>Your Project Summary</h1>
                    <p>Thanks for telling us about your project. Here is what we heard:</p>
                    <p>{}</p>
                    <p>We will be in touch shortly with next steps.</p>
                </div>
            </body>
            </html>
            "#,
            summary
        );

        match self.mailer.send(recipient, "Your Project Summary", &html).await {
            Ok(()) => self.record_delivery(plan, OutputChannel::UserSummary, recipient),
            Err(e) => error!(
                "Failed to send user summary for session {}: {:?}",
                session.id, e
            ),
        }
    }

    async fn send_admin_plan(&self, session: &Session, plan: &Plan) {
        let Some(recipient) = self.resolve_admin_email(session) else {
            return;
        };
        if self.already_delivered(plan, OutputChannel::AdminFull) {
            debug!("Admin plan for plan {} already delivered", plan.id);
            return;
        }

        let html = format!(
            r#"
            <!DOCTYPE html>
            <html lang="en">
            <head>
                <meta charset="UTF-8">
                <title>Discovery Plan Ready</title>
                <style>
                    body {{ font-family: ui-sans-serif,system-ui,sans-serif; }}
                    .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
                    h1, h2, h3 {{ font-weight: 300; }}
                    pre {{ background-color: rgba(1,1,1,0.05); padding: 10px; border-radius: 5px; white-space: pre-wrap; }}
                </style>
            </head>
            <body>
                <div class="container">
                    <h1>Discovery Plan Ready</h1>
                    <p>Session {} has completed discovery.</p>
                    <p><strong>Cost estimate:</strong> {}</p>
                    <p><strong>Timeline estimate:</strong> {}</p>
                    <h2>Technical Plan</h2>
                    <pre>{}</pre>
                    <h2>Structured Requirements</h2>
                    <pre>{}</pre>
                </div>
            </body>
            </html>
            "#,
            session.id,
            plan.cost_estimate.as_deref().unwrap_or("n/a"),
            plan.timeline_estimate.as_deref().unwrap_or("n/a"),
            plan.technical_plan.as_deref().unwrap_or_default(),
            plan.structured_requirements
                .as_ref()
                .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
                .unwrap_or_default(),
        );

        match self
            .mailer
            .send(&recipient, "Discovery Plan Ready", &html)
            .await
        {
            Ok(()) => self.record_delivery(plan, OutputChannel::AdminFull, &recipient),
            Err(e) => error!(
                "Failed to send admin plan for session {}: {:?}",
                session.id, e
            ),
        }
    }
}

#[async_trait]
impl Notifications for EmailDispatcher {
    async fn plan_completed(&self, session: &Session, plan: &Plan) {
        self.send_user_summary(session, plan).await;
        self.send_admin_plan(session, plan).await;
    }

    async fn synthesis_failed(&self, session: &Session, error_detail: &str) {
        let Some(recipient) = self.resolve_admin_email(session) else {
            return;
        };

        let html = format!(
            r#"
            <!DOCTYPE html>
            <html lang="en">
            <head>
                <meta charset="UTF-8">
                <title>Plan Generation Failed</title>
                <style>
                    body {{ font-family: ui-sans-serif,system-ui,sans-serif; }}
                    .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
                    .warning {{ color: #e74c3c; }}
                </style>
            </head>
            <body>
                <div class="container">
                    <h1 class="warning">Plan Generation Failed</h1>
                    <p>Plan synthesis for session {} failed:</p>
                    <p>{}</p>
                    <p>Check the session in the admin dashboard for details.</p>
                </div>
            </body>
            </html>
            "#,
            session.id, error_detail
        );

        if let Err(e) = self
            .mailer
            .send(&recipient, "Plan Generation Failed", &html)
            .await
        {
            error!(
                "Failed to send failure alert for session {}: {:?}",
                session.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sessions::SessionStatus;
    use crate::testing::{artifacts, MockDb, RecordingMailer};

    fn dispatcher(db: &Arc<MockDb>, mailer: Arc<dyn MailSender>) -> EmailDispatcher {
        EmailDispatcher::new(db.clone(), mailer)
    }

    fn completed_plan(db: &Arc<MockDb>, session_id: uuid::Uuid) -> Plan {
        let plan = db.begin_plan_generation(session_id).unwrap();
        db.complete_plan(plan.id, &artifacts()).unwrap()
    }

    #[tokio::test]
    async fn plan_completed_mails_user_and_admin_and_records_outputs() {
        let db = MockDb::new();
        let session = db.seed_session_with(SessionStatus::Completed, 4, true);
        let plan = completed_plan(&db, session.id);
        let mailer = Arc::new(RecordingMailer::default());

        dispatcher(&db, mailer.clone())
            .plan_completed(&session, &plan)
            .await;

        let sent = mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], ("visitor@example.com".to_string(), "Your Project Summary".to_string()));
        assert_eq!(sent[1], ("admin@example.com".to_string(), "Discovery Plan Ready".to_string()));

        let outputs = db.get_plan_outputs(plan.id).unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs
            .iter()
            .any(|o| o.channel == OutputChannel::UserSummary && o.recipient == "visitor@example.com"));
        assert!(outputs
            .iter()
            .any(|o| o.channel == OutputChannel::AdminFull && o.recipient == "admin@example.com"));
    }

    #[tokio::test]
    async fn repeated_fan_out_does_not_resend() {
        let db = MockDb::new();
        let session = db.seed_session_with(SessionStatus::Completed, 4, true);
        let plan = completed_plan(&db, session.id);
        let mailer = Arc::new(RecordingMailer::default());
        let dispatcher = dispatcher(&db, mailer.clone());

        dispatcher.plan_completed(&session, &plan).await;
        dispatcher.plan_completed(&session, &plan).await;

        // The audit rows gate the second fan-out entirely.
        assert_eq!(mailer.sent().len(), 2);
        assert_eq!(db.get_plan_outputs(plan.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_contact_email_skips_user_mail() {
        let db = MockDb::new();
        let mut session = db.seed_session_with(SessionStatus::Completed, 4, true);
        session.contact_email = None;
        let plan = completed_plan(&db, session.id);
        let mailer = Arc::new(RecordingMailer::default());

        dispatcher(&db, mailer.clone())
            .plan_completed(&session, &plan)
            .await;

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "admin@example.com");

        let outputs = db.get_plan_outputs(plan.id).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].channel, OutputChannel::AdminFull);
    }

    #[tokio::test]
    async fn synthesis_failure_alerts_admin_without_recording_outputs() {
        let db = MockDb::new();
        let session = db.seed_session_with(SessionStatus::Failed, 4, true);
        let mailer = Arc::new(RecordingMailer::default());

        dispatcher(&db, mailer.clone())
            .synthesis_failed(&session, "synthesis timed out")
            .await;

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], ("admin@example.com".to_string(), "Plan Generation Failed".to_string()));
        assert_eq!(db.output_count(), 0);
    }

    #[tokio::test]
    async fn unconfigured_transport_degrades_without_recording_deliveries() {
        let db = MockDb::new();
        let session = db.seed_session_with(SessionStatus::Completed, 4, true);
        let plan = completed_plan(&db, session.id);
        let mailer = Arc::new(ResendMailer::new(EmailConfig {
            resend_api_key: None,
            from_address: "discovery@email.example.com".to_string(),
        }));
        let dispatcher = dispatcher(&db, mailer);

        // No API key: every send fails, nothing panics, nothing propagates,
        // and no delivery is recorded for auditing.
        dispatcher.plan_completed(&session, &plan).await;
        dispatcher.synthesis_failed(&session, "boom").await;

        assert_eq!(db.output_count(), 0);
    }

    #[tokio::test]
    async fn missing_invite_suppresses_admin_mail() {
        let db = MockDb::new();
        let mut session = db.seed_session_with(SessionStatus::Completed, 4, true);
        session.invite_code_id = 9999;
        let dispatcher = dispatcher(&db, Arc::new(RecordingMailer::default()));

        assert!(dispatcher.resolve_admin_email(&session).is_none());
    }
}

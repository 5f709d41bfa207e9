use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use axum::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::io::LocalStore;
use crate::models::{ContactMessage, Enrollment, Payment};
use crate::receipt::format_amount;

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Folds line breaks and other control characters into spaces so a value
/// stays on its own header line.
pub fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

impl Mail {
    pub fn new<T: AsRef<str>, S: AsRef<str>>(to: T, subject: S, body: String) -> Self {
        Self {
            to: header_value(to.as_ref()),
            subject: header_value(subject.as_ref()),
            body,
            attachments: Vec::new(),
        }
    }

    pub fn attach(mut self, filename: String, content_type: &'static str, bytes: Vec<u8>) -> Self {
        self.attachments.push(Attachment {
            filename,
            content_type,
            bytes,
        });
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands one message over; returns an identifier for the logs.
    async fn send(&self, from: &str, mail: &Mail) -> anyhow::Result<String>;
}

/// Writes every message into `outbox/<id>/` of the local store, where a relay
/// picks them up.
pub struct SpoolTransport {
    store: LocalStore,
}

impl SpoolTransport {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Transport for SpoolTransport {
    async fn send(&self, from: &str, mail: &Mail) -> anyhow::Result<String> {
        if mail.to.trim().is_empty() {
            bail!("Mail has no recipient");
        }
        let id = format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), Uuid::new_v4().simple());
        let mut message = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n",
            header_value(from),
            header_value(&mail.to),
            header_value(&mail.subject),
            Utc::now().to_rfc2822()
        );
        for attachment in &mail.attachments {
            message.push_str(&format!(
                "X-Attachment: {}; {}\r\n",
                header_value(&attachment.filename),
                attachment.content_type
            ));
        }
        message.push_str("\r\n");
        message.push_str(&mail.body);

        for attachment in &mail.attachments {
            self.store
                .write(format!("outbox/{}/{}", id, attachment.filename), &attachment.bytes)
                .await?;
        }
        self.store
            .write(format!("outbox/{}/message.eml", id), message.as_bytes())
            .await?;
        Ok(id)
    }
}

#[derive(Clone)]
pub struct Mailer {
    transport: Arc<dyn Transport>,
    from: String,
    admin: String,
    retries: u32,
    backoff: Duration,
}

impl Mailer {
    pub fn new(
        transport: Arc<dyn Transport>,
        from: String,
        admin: String,
        retries: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            transport,
            from,
            admin,
            retries: retries.max(1),
            backoff,
        }
    }

    pub fn admin(&self) -> &str {
        &self.admin
    }

    /// Tries up to `retries` times, waiting `attempt * backoff` between tries.
    pub async fn deliver(&self, mail: &Mail) -> anyhow::Result<String> {
        let mut last_error = None;
        for attempt in 1..=self.retries {
            match self.transport.send(&self.from, mail).await {
                Ok(id) => {
                    log::info!(
                        "Mail `{}` delivered to {} ({}, attempt {}/{})",
                        mail.subject,
                        mail.to,
                        id,
                        attempt,
                        self.retries
                    );
                    return Ok(id);
                }
                Err(err) => {
                    log::warn!(
                        "Mail to {} failed (attempt {}/{}): {:#}",
                        mail.to,
                        attempt,
                        self.retries,
                        err
                    );
                    last_error = Some(err);
                    if attempt < self.retries {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }
        match last_error {
            Some(err) => Err(err.context(format!(
                "mail to {} not sent after {} attempts",
                mail.to, self.retries
            ))),
            None => bail!("mail to {} was never attempted", mail.to),
        }
    }

    /// Delivers in the background; failures are only logged.
    pub fn dispatch(&self, mail: Mail) {
        let mailer = self.clone();
        tokio::spawn(async move {
            if let Err(err) = mailer.deliver(&mail).await {
                log::error!("{:#}", err);
            }
        });
    }
}

pub fn new_enrollment(admin: &str, e: &Enrollment) -> Mail {
    Mail::new(
        admin,
        format!("New enrollment - {}", e.formation),
        format!(
            "A new enrollment request was received.\n\n\
             Name: {}\nEmail: {}\nPhone: {}\nFormation: {}\nAccess code: {}\nReference: {}\n\n\
             Validate it from the admin dashboard.\n",
            e.full_name(),
            e.email,
            e.phone,
            e.formation,
            e.access_code,
            e.id
        ),
    )
}

pub fn enrollment_validated(e: &Enrollment, receipt: Vec<u8>) -> Mail {
    let terms = match e.terms() {
        Some(terms) => format!(
            "Duration: {} months\nMonthly fee: {}\nTuition total: {}\n",
            terms.months,
            format_amount(terms.monthly_fee),
            format_amount(terms.total_due())
        ),
        None => String::new(),
    };
    Mail::new(
        &e.email,
        "Enrollment confirmed - TellyTech Formation",
        format!(
            "Hello {},\n\n\
             Your enrollment in \"{}\" is confirmed. Your enrollment fee of {} has been recorded.\n\n\
             Sign in with this email and your access code: {}\n\n{}\n\
             Monthly payments are due before the 10th of each month. The certificate is issued \
             once every month and the final project are validated.\n\n\
             TellyTech Formation\n",
            e.full_name(),
            e.formation,
            format_amount(e.enrollment_fee.unwrap_or(0)),
            e.access_code,
            terms
        ),
    )
    .attach(
        format!("enrollment-receipt-{}.pdf", e.id.simple()),
        "application/pdf",
        receipt,
    )
}

pub fn payment_requested(admin: &str, e: &Enrollment, p: &Payment) -> Mail {
    Mail::new(
        admin,
        format!("New payment request - month {}", p.month),
        format!(
            "{} ({}) declared a payment.\n\nFormation: {}\nMonth: {}\nAmount: {}\nReference: {}\n",
            e.full_name(),
            e.email,
            e.formation,
            p.month,
            format_amount(p.amount),
            p.id
        ),
    )
}

pub fn payment_validated(e: &Enrollment, p: &Payment, receipt: Vec<u8>) -> Mail {
    Mail::new(
        &e.email,
        format!("Payment for month {} validated - {}", p.month, e.formation),
        format!(
            "Hello {},\n\nYour payment of {} for month {} has been validated. \
             The receipt is attached.\n\nTellyTech Formation\n",
            e.full_name(),
            format_amount(p.amount),
            p.month
        ),
    )
    .attach(
        crate::receipt::payment_receipt_name(p.month),
        "application/pdf",
        receipt,
    )
}

pub fn payment_rejected(e: &Enrollment, p: &Payment) -> Mail {
    let reason = p
        .rejection_reason
        .as_deref()
        .map(|r| format!("\nReason: {}\n", r))
        .unwrap_or_default();
    Mail::new(
        &e.email,
        format!("Payment for month {} rejected", p.month),
        format!(
            "Hello {},\n\nYour payment request for month {} could not be validated.\n{}\n\
             You can submit a new request from your dashboard.\n\nTellyTech Formation\n",
            e.full_name(),
            p.month,
            reason
        ),
    )
}

pub fn payment_reminder(e: &Enrollment, missing: &[i32]) -> Mail {
    let months = missing
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let monthly = e.monthly_fee.unwrap_or(0);
    Mail::new(
        &e.email,
        format!("Reminder: tuition payment pending - {}", e.formation),
        format!(
            "Hello {},\n\nOur records show no validated payment for month(s): {}.\n\
             Monthly fee: {}\nOutstanding: {}\n\n\
             Please settle before the 10th of the month.\n\nTellyTech Formation\n",
            e.full_name(),
            months,
            format_amount(monthly),
            format_amount(monthly * missing.len() as i64)
        ),
    )
}

pub fn submission_received(e: &Enrollment, title: &str) -> Mail {
    Mail::new(
        &e.email,
        format!("Assignment received: {}", title),
        format!(
            "Hello {},\n\nWe received your work for \"{}\". A coach will review it shortly.\n\n\
             TellyTech Formation\n",
            e.full_name(),
            title
        ),
    )
}

pub fn submission_to_review(admin: &str, e: &Enrollment, title: &str, link: &str) -> Mail {
    Mail::new(
        admin,
        format!("New assignment to review: {}", title),
        format!(
            "{} ({}, {}) submitted \"{}\".\n\nLink: {}\n",
            e.full_name(),
            e.email,
            e.formation,
            title,
            link
        ),
    )
}

pub fn submission_approved(e: &Enrollment, title: &str) -> Mail {
    Mail::new(
        &e.email,
        format!("Assignment approved: {}", title),
        format!(
            "Hello {},\n\nYour work for \"{}\" was approved. The next part is now unlocked.\n\n\
             TellyTech Formation\n",
            e.full_name(),
            title
        ),
    )
}

pub fn submission_rejected(e: &Enrollment, title: &str, feedback: &str) -> Mail {
    Mail::new(
        &e.email,
        format!("Assignment to revise: {}", title),
        format!(
            "Hello {},\n\nYour work for \"{}\" needs another pass.\n\nCoach feedback:\n{}\n\n\
             Submit a new link once it is fixed.\n\nTellyTech Formation\n",
            e.full_name(),
            title,
            feedback
        ),
    )
}

pub fn contact_to_admin(admin: &str, m: &ContactMessage) -> Mail {
    let phone = if m.phone.is_empty() { "not provided" } else { m.phone.as_str() };
    Mail::new(
        admin,
        format!("New message: {}", m.subject),
        format!(
            "From: {} {}\nEmail: {}\nPhone: {}\nSubject: {}\n\n{}\n",
            m.first_name, m.last_name, m.email, phone, m.subject, m.body
        ),
    )
}

pub fn contact_acknowledgement(m: &ContactMessage) -> Mail {
    Mail::new(
        &m.email,
        "We received your message",
        format!(
            "Hello {} {},\n\nThank you for contacting us about \"{}\". \
             Our team will get back to you shortly.\n\nYour message:\n{}\n\nTellyTech Formation\n",
            m.first_name, m.last_name, m.subject, m.body
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn send(&self, _from: &str, _mail: &Mail) -> anyhow::Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                bail!("smtp timeout #{}", call);
            }
            Ok(format!("msg-{}", call))
        }
    }

    fn mailer(transport: Arc<Flaky>, retries: u32) -> Mailer {
        Mailer::new(
            transport,
            "school@example.org".into(),
            "admin@example.org".into(),
            retries,
            Duration::ZERO,
        )
    }

    fn mail() -> Mail {
        Mail::new("student@example.org", "Hello", "Body".to_string())
    }

    #[tokio::test]
    async fn retries_until_success() {
        let transport = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let id = mailer(transport.clone(), 3).deliver(&mail()).await.unwrap();
        assert_eq!(id, "msg-3");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let transport = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let err = mailer(transport.clone(), 3).deliver(&mail()).await.unwrap_err();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert!(format!("{:#}", err).contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn zero_retries_still_tries_once() {
        let transport = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        mailer(transport.clone(), 0).deliver(&mail()).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spool_writes_message_and_attachments() {
        let root = std::env::temp_dir().join(format!("outbox-{}", Uuid::new_v4()));
        let store = LocalStore::new(&root);
        let spool = SpoolTransport::new(store.clone());
        let mail = mail().attach("receipt.pdf".into(), "application/pdf", b"%PDF".to_vec());
        let id = spool.send("school@example.org", &mail).await.unwrap();

        let eml = store.read(format!("outbox/{}/message.eml", id)).await.unwrap();
        let eml = String::from_utf8(eml).unwrap();
        assert!(eml.contains("To: student@example.org\r\n"));
        assert!(eml.contains("Subject: Hello\r\n"));
        assert!(eml.ends_with("Body"));
        assert_eq!(
            store.read(format!("outbox/{}/receipt.pdf", id)).await.unwrap(),
            b"%PDF"
        );
    }

    #[tokio::test]
    async fn spool_refuses_empty_recipient() {
        let store = LocalStore::new(std::env::temp_dir().join(format!("outbox-{}", Uuid::new_v4())));
        let spool = SpoolTransport::new(store);
        assert!(spool.send("x", &Mail::new(" ", "s", String::new())).await.is_err());
    }

    #[test]
    fn reminder_lists_missing_months() {
        let e = Enrollment {
            id: Uuid::new_v4(),
            last_name: "Sarr".into(),
            first_name: "Moussa".into(),
            email: "moussa@example.org".into(),
            phone: "770000000".into(),
            formation: "dev-web".into(),
            access_code: "1234".into(),
            status: crate::models::EnrollmentStatus::Validated,
            cohort: None,
            enrollment_fee: Some(10_000),
            months: Some(6),
            monthly_fee: Some(50_000),
            active: true,
            formation_end_date: None,
            validated_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mail = payment_reminder(&e, &[3, 4, 5]);
        assert_eq!(mail.to, "moussa@example.org");
        assert!(mail.body.contains("month(s): 3, 4, 5"));
        assert!(mail.body.contains("150 000 FCFA"));

        let welcome = enrollment_validated(&e, b"%PDF".to_vec());
        assert!(welcome.body.contains("1234"));
        assert!(welcome.body.contains("300 000 FCFA"));
        assert_eq!(welcome.attachments.len(), 1);
    }

    #[test]
    fn header_values_stay_on_one_line() {
        assert_eq!(header_value("Hi\r\nBcc: everyone@victim.org"), "Hi  Bcc: everyone@victim.org");
        assert_eq!(header_value(" plain "), "plain");
    }

    #[tokio::test]
    async fn contact_subject_cannot_add_headers() {
        let message = ContactMessage {
            id: Uuid::new_v4(),
            first_name: "Awa".into(),
            last_name: "Diop".into(),
            email: "awa@example.org\nCc: someone@example.org".into(),
            phone: String::new(),
            subject: "Hi\r\nBcc: everyone@victim.org".into(),
            body: "Line one\nLine two".into(),
            is_read: false,
            created_at: Utc::now(),
        };
        let store = LocalStore::new(std::env::temp_dir().join(format!("outbox-{}", Uuid::new_v4())));
        let spool = SpoolTransport::new(store.clone());

        for mail in [
            contact_to_admin("admin@example.org", &message),
            contact_acknowledgement(&message),
        ] {
            let id = spool.send("school@example.org", &mail).await.unwrap();
            let eml = store.read(format!("outbox/{}/message.eml", id)).await.unwrap();
            let eml = String::from_utf8(eml).unwrap();
            let headers = &eml[..eml.find("\r\n\r\n").unwrap()];
            assert!(headers.lines().all(|line| !line.starts_with("Bcc:") && !line.starts_with("Cc:")));
            assert_eq!(headers.lines().count(), 5);
        }
        assert!(contact_to_admin("admin@example.org", &message).body.contains("Line one\nLine two"));
    }
}

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use axum::Extension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{Admin, Session, Student};
use crate::form::{Filter, JsonBody};
use crate::ledger::{
    self, formation_breakdown, FormationBreakdown, LedgerSummary, MonthRequest, StudentLedger,
};
use crate::mail::{self, Mailer};
use crate::models::{Enrollment, EnrollmentStatus, Payment, PaymentStatus, Role};
use crate::receipt;
use crate::{created, proceeds, Context, Created, Error, Payload};

/// Unique on `(enrollment_id, month)`: a concurrent request for the same month fails here.
const INSERT_PAYMENT: &str = "INSERT INTO payments (id, enrollment_id, month, amount, status, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, NOW(), NOW()) RETURNING *";
const REOPEN_PAYMENT: &str = "UPDATE payments SET status = $2, amount = $3, rejection_reason = NULL, updated_at = NOW() \
     WHERE id = $1 AND status = $4 RETURNING *";
const VALIDATE_PAYMENT: &str = "UPDATE payments SET status = $2, validated_at = $3, receipt_path = $4, \
     rejection_reason = NULL, updated_at = $3 \
     WHERE id = $1 AND status <> $2 RETURNING *";
const REJECT_PAYMENT: &str = "UPDATE payments SET status = $2, rejection_reason = $3, updated_at = NOW() \
     WHERE id = $1 AND status = $4 RETURNING *";

/// Another request for the month got in first.
fn month_taken(err: sqlx::Error, month: i32) -> Error {
    match Error::from(err) {
        Error::Conflict { .. } => Error::conflict(format!("Month {} was already requested", month)),
        other => other,
    }
}

fn receipt_url(public_url: &str, payment: &Payment) -> Option<String> {
    match payment.status {
        PaymentStatus::Validated => Some(format!("{}/api/payments/receipts/{}", public_url, payment.id)),
        _ => None,
    }
}

async fn find(pg: &PgPool, id: Uuid) -> Result<Payment, Error> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found("Payment not found"))
}

async fn payments_of(pg: &PgPool, enrollment_id: Uuid) -> Result<Vec<Payment>, Error> {
    Ok(sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE enrollment_id = $1 ORDER BY month ASC",
    )
    .bind(enrollment_id)
    .fetch_all(pg)
    .await?)
}

async fn enrollment_of(pg: &PgPool, payment: &Payment) -> Result<Enrollment, Error> {
    sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1")
        .bind(payment.enrollment_id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found("Enrollment not found"))
}

fn terms_of(enrollment: &Enrollment) -> Result<ledger::TuitionTerms, Error> {
    enrollment
        .terms()
        .ok_or_else(|| Error::invalid("Tuition terms have not been set for this enrollment"))
}

pub async fn dashboard(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
) -> Payload<Dashboard> {
    let terms = terms_of(&enrollment)?;
    let payments = payments_of(&pg, enrollment.id).await?;
    let statistics = ledger::summarize(terms, &payments);
    let payments = payments
        .into_iter()
        .map(|payment| PaymentView {
            receipt_url: receipt_url(&ctx.config.public_url, &payment),
            payment,
        })
        .collect();

    proceeds(Dashboard {
        student: StudentInfo {
            id: enrollment.id,
            name: enrollment.full_name(),
            email: enrollment.email.clone(),
            phone: enrollment.phone.clone(),
            formation: enrollment.formation.clone(),
            cohort: enrollment.cohort,
            enrollment_fee: enrollment.enrollment_fee,
            months: terms.months,
            monthly_fee: terms.monthly_fee,
            validated_at: enrollment.validated_at,
        },
        statistics,
        payments,
    })
}

pub async fn request(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    JsonBody(body): JsonBody<PaymentRequest>,
) -> Created<PaymentRecorded> {
    let terms = terms_of(&enrollment)?;
    let (month, amount) = match (body.month, body.amount) {
        (Some(month), Some(amount)) => (month, amount),
        _ => return Err(Error::invalid("`month` and `amount` are required")),
    };
    let existing = payments_of(&pg, enrollment.id).await?;

    let payment = match ledger::check_month_request(terms, &existing, month, amount)? {
        MonthRequest::Create => sqlx::query_as::<_, Payment>(INSERT_PAYMENT)
            .bind(Uuid::new_v4())
            .bind(enrollment.id)
            .bind(month)
            .bind(amount)
            .bind(PaymentStatus::Pending)
            .fetch_one(&pg)
            .await
            .map_err(|err| month_taken(err, month))?,
        MonthRequest::Reopen(id) => sqlx::query_as::<_, Payment>(REOPEN_PAYMENT)
            .bind(id)
            .bind(PaymentStatus::Pending)
            .bind(amount)
            .bind(PaymentStatus::Rejected)
            .fetch_optional(&pg)
            .await?
            .ok_or_else(|| Error::conflict(format!("Month {} was already requested", month)))?,
    };

    log::info!(
        "Payment requested: {} month {} ({})",
        enrollment.email,
        payment.month,
        payment.amount
    );
    ctx.mailer
        .dispatch(mail::payment_requested(ctx.mailer.admin(), &enrollment, &payment));
    created(PaymentRecorded { payment })
}

pub async fn download_receipt(
    session: Session,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(id): Path<String>,
) -> Result<(HeaderMap, Vec<u8>), Error> {
    let id = Uuid::from_str(&id)?;
    let payment = find(&pg, id).await?;
    if session.user.role == Role::Student {
        let owns = session
            .enrollment
            .as_ref()
            .map(|e| e.id == payment.enrollment_id)
            .unwrap_or(false);
        if !owns {
            return Err(Error::forbidden("This receipt belongs to another student"));
        }
    }
    if payment.status != PaymentStatus::Validated {
        return Err(Error::invalid("Receipts exist only for validated payments"));
    }

    let path = payment
        .receipt_path
        .clone()
        .unwrap_or_else(|| receipt::payment_receipt_path(&payment.id));
    let pdf = if ctx.store.exists(&path) {
        ctx.store.read(&path).await?
    } else {
        log::warn!("Receipt {} missing, rendering it again", path);
        let enrollment = enrollment_of(&pg, &payment).await?;
        let issued_at = payment.validated_at.unwrap_or_else(Utc::now);
        let pdf = receipt::payment_receipt(&enrollment, &payment, issued_at);
        ctx.store.write(&path, &pdf).await?;
        sqlx::query("UPDATE payments SET receipt_path = $2 WHERE id = $1")
            .bind(payment.id)
            .bind(&path)
            .execute(&pg)
            .await?;
        pdf
    };

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    let disposition = format!(
        "attachment; filename=\"{}\"",
        receipt::payment_receipt_name(payment.month)
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(|err| Error::unknown(err.to_string()))?,
    );
    Ok((headers, pdf))
}

async fn listing(
    pg: &PgPool,
    status: PaymentStatus,
    filter: &Filter,
) -> Result<Vec<PaymentListing>, Error> {
    let order = match status {
        PaymentStatus::Validated => "p.validated_at DESC NULLS LAST",
        _ => "p.created_at DESC",
    };
    Ok(sqlx::query_as::<_, PaymentListing>(&format!(
        "SELECT p.id, p.enrollment_id, p.month, p.amount, p.status, p.rejection_reason, \
         p.validated_at, p.created_at, e.first_name, e.last_name, e.email, e.phone, e.formation, e.cohort \
         FROM payments p JOIN enrollments e ON e.id = p.enrollment_id \
         WHERE p.status = $1 AND ($2::TEXT IS NULL OR e.formation ILIKE '%' || $2 || '%') \
         ORDER BY {}",
        order
    ))
    .bind(status)
    .bind(filter.formation())
    .fetch_all(pg)
    .await?)
}

pub async fn pending(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<PaymentList> {
    let payments = listing(&pg, PaymentStatus::Pending, &filter).await?;
    proceeds(PaymentList {
        count: payments.len(),
        payments,
    })
}

pub async fn validated(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<PaymentList> {
    let payments = listing(&pg, PaymentStatus::Validated, &filter).await?;
    proceeds(PaymentList {
        count: payments.len(),
        payments,
    })
}

pub async fn validate(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(id): Path<String>,
) -> Payload<PaymentValidated> {
    let id = Uuid::from_str(&id)?;
    let payment = find(&pg, id).await?;
    ledger::check_validation(&payment)?;
    let enrollment = enrollment_of(&pg, &payment).await?;

    let now = Utc::now();
    let path = receipt::payment_receipt_path(&payment.id);
    let payment = sqlx::query_as::<_, Payment>(VALIDATE_PAYMENT)
        .bind(payment.id)
        .bind(PaymentStatus::Validated)
        .bind(now)
        .bind(&path)
        .fetch_optional(&pg)
        .await?
        .ok_or_else(|| Error::conflict("This payment is already validated"))?;

    let pdf = receipt::payment_receipt(&enrollment, &payment, now);
    if let Err(err) = ctx.store.write(&path, &pdf).await {
        log::warn!("Could not store receipt {}: {:#}", path, err);
    }
    log::info!(
        "Payment {} validated: {} month {}",
        payment.id,
        enrollment.email,
        payment.month
    );
    ctx.mailer
        .dispatch(mail::payment_validated(&enrollment, &payment, pdf));

    proceeds(PaymentValidated {
        receipt_url: receipt_url(&ctx.config.public_url, &payment),
        payment,
    })
}

pub async fn reject(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(id): Path<String>,
    body: Option<JsonBody<RejectRequest>>,
) -> Payload<PaymentRecorded> {
    let id = Uuid::from_str(&id)?;
    let payment = find(&pg, id).await?;
    ledger::check_rejection(&payment)?;
    let reason = body.and_then(|JsonBody(body)| crate::form::optional(body.reason.as_ref()));

    let payment = match sqlx::query_as::<_, Payment>(REJECT_PAYMENT)
        .bind(payment.id)
        .bind(PaymentStatus::Rejected)
        .bind(reason)
        .bind(PaymentStatus::Pending)
        .fetch_optional(&pg)
        .await?
    {
        Some(payment) => payment,
        None => {
            // Settled in the meantime; report the state it settled in.
            ledger::check_rejection(&find(&pg, id).await?)?;
            return Err(Error::conflict("This payment is no longer pending"));
        }
    };
    let enrollment = enrollment_of(&pg, &payment).await?;

    log::info!("Payment {} rejected: {} month {}", payment.id, enrollment.email, payment.month);
    ctx.mailer.dispatch(mail::payment_rejected(&enrollment, &payment));
    proceeds(PaymentRecorded { payment })
}

/// Validated enrollments paired with their validated months.
async fn ledgers(
    pg: &PgPool,
    formation: Option<String>,
    active_only: bool,
) -> Result<Vec<(Enrollment, StudentLedger)>, Error> {
    let enrollments = sqlx::query_as::<_, Enrollment>(
        "SELECT * FROM enrollments \
         WHERE status = $1 AND ($2::TEXT IS NULL OR formation ILIKE '%' || $2 || '%') \
         AND (active OR NOT $3) \
         ORDER BY last_name, first_name",
    )
    .bind(EnrollmentStatus::Validated)
    .bind(formation)
    .bind(active_only)
    .fetch_all(pg)
    .await?;

    let ids: Vec<Uuid> = enrollments.iter().map(|e| e.id).collect();
    let paid = sqlx::query_as::<_, (Uuid, i32, i64)>(
        "SELECT enrollment_id, month, amount FROM payments \
         WHERE status = $1 AND enrollment_id = ANY($2)",
    )
    .bind(PaymentStatus::Validated)
    .bind(ids)
    .fetch_all(pg)
    .await?;

    let mut by_enrollment: HashMap<Uuid, Vec<(i32, i64)>> = HashMap::new();
    for (enrollment_id, month, amount) in paid {
        by_enrollment
            .entry(enrollment_id)
            .or_default()
            .push((month, amount));
    }

    Ok(enrollments
        .into_iter()
        .filter_map(|e| {
            let terms = e.terms()?;
            let paid = by_enrollment.remove(&e.id).unwrap_or_default();
            let mut validated_months: Vec<i32> = paid.iter().map(|(m, _)| *m).collect();
            validated_months.sort_unstable();
            let ledger = StudentLedger {
                enrollment_id: e.id,
                name: e.full_name(),
                email: e.email.clone(),
                formation: e.formation.clone(),
                months: terms.months,
                monthly_fee: terms.monthly_fee,
                validated_months,
                revenue: paid.iter().map(|(_, amount)| amount).sum(),
            };
            Some((e, ledger))
        })
        .collect())
}

pub async fn stats(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<PaymentStats> {
    let students: Vec<StudentLedger> = ledgers(&pg, filter.formation(), false)
        .await?
        .into_iter()
        .map(|(_, ledger)| ledger)
        .collect();
    let (pending, rejected) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT COUNT(*) FILTER (WHERE p.status = 'PENDING'), COUNT(*) FILTER (WHERE p.status = 'REJECTED') \
         FROM payments p JOIN enrollments e ON e.id = p.enrollment_id \
         WHERE ($1::TEXT IS NULL OR e.formation ILIKE '%' || $1 || '%')",
    )
    .bind(filter.formation())
    .fetch_one(&pg)
    .await?;

    proceeds(PaymentStats {
        students: students.len(),
        revenue: students.iter().map(|s| s.revenue).sum(),
        pending_payments: pending,
        rejected_payments: rejected,
        formations: formation_breakdown(students, None, false),
    })
}

pub async fn detailed_stats(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<DetailedStats> {
    if let Some(month) = filter.month {
        if month < 1 {
            return Err(Error::invalid("`month` must be at least 1"));
        }
    }
    let students: Vec<StudentLedger> = ledgers(&pg, filter.formation(), false)
        .await?
        .into_iter()
        .map(|(_, ledger)| ledger)
        .collect();
    proceeds(DetailedStats {
        month: filter.month,
        formations: formation_breakdown(students, filter.month, true),
    })
}

pub async fn unpaid(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<UnpaidList> {
    let students: Vec<UnpaidStudent> = ledgers(&pg, filter.formation(), true)
        .await?
        .into_iter()
        .filter_map(|(e, ledger)| UnpaidStudent::of(&e, &ledger))
        .collect();
    proceeds(UnpaidList {
        count: students.len(),
        students,
    })
}

/// Emails every active student who still owes a month. Shared by the admin
/// endpoint and the monthly scheduler.
pub async fn send_reminders(
    pg: &PgPool,
    mailer: &Mailer,
    formation: Option<String>,
) -> Result<ReminderReport, Error> {
    let mut report = ReminderReport::default();
    for (enrollment, ledger) in ledgers(pg, formation, true).await? {
        let student = match UnpaidStudent::of(&enrollment, &ledger) {
            Some(student) => student,
            None => continue,
        };
        match mailer
            .deliver(&mail::payment_reminder(&enrollment, &student.missing_months))
            .await
        {
            Ok(_) => report.sent.push(student),
            Err(err) => {
                log::error!("Reminder to {} failed: {:#}", enrollment.email, err);
                report.failed.push(ReminderFailure {
                    email: enrollment.email.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
    log::info!(
        "Payment reminders: {} sent, {} failed",
        report.sent.len(),
        report.failed.len()
    );
    Ok(report)
}

pub async fn reminders(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Query(filter): Query<Filter>,
) -> Payload<ReminderReport> {
    let report = send_reminders(&pg, &ctx.mailer, filter.formation()).await?;
    proceeds(report)
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    pub month: Option<i32>,
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentInfo {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub formation: String,
    pub cohort: Option<i32>,
    pub enrollment_fee: Option<i64>,
    pub months: i32,
    pub monthly_fee: i64,
    pub validated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentView {
    #[serde(flatten)]
    pub payment: Payment,
    pub receipt_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub student: StudentInfo,
    pub statistics: LedgerSummary,
    pub payments: Vec<PaymentView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecorded {
    pub payment: Payment,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentValidated {
    pub payment: Payment,
    pub receipt_url: Option<String>,
}

/// A payment joined with the student who declared it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentListing {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub month: i32,
    pub amount: i64,
    pub status: PaymentStatus,
    pub rejection_reason: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub formation: String,
    pub cohort: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentList {
    pub count: usize,
    pub payments: Vec<PaymentListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentStats {
    pub students: usize,
    pub revenue: i64,
    pub pending_payments: i64,
    pub rejected_payments: i64,
    pub formations: Vec<FormationBreakdown>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedStats {
    pub month: Option<i32>,
    pub formations: Vec<FormationBreakdown>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnpaidStudent {
    pub enrollment_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub formation: String,
    pub cohort: Option<i32>,
    pub missing_months: Vec<i32>,
    pub amount_owed: i64,
}

impl UnpaidStudent {
    /// `None` when every month of the plan is paid.
    fn of(e: &Enrollment, ledger: &StudentLedger) -> Option<Self> {
        let missing = ledger::missing_months(ledger.months, ledger.validated_months.iter().copied());
        if missing.is_empty() {
            return None;
        }
        Some(Self {
            enrollment_id: e.id,
            name: ledger.name.clone(),
            email: e.email.clone(),
            phone: e.phone.clone(),
            formation: e.formation.clone(),
            cohort: e.cohort,
            amount_owed: ledger.monthly_fee * missing.len() as i64,
            missing_months: missing,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnpaidList {
    pub count: usize,
    pub students: Vec<UnpaidStudent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReminderFailure {
    pub email: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReminderReport {
    pub sent: Vec<UnpaidStudent>,
    pub failed: Vec<ReminderFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment() -> Enrollment {
        Enrollment {
            id: Uuid::new_v4(),
            last_name: "Ndiaye".into(),
            first_name: "Moussa".into(),
            email: "moussa@example.org".into(),
            phone: "770000001".into(),
            formation: "dev-web".into(),
            access_code: "5521".into(),
            status: EnrollmentStatus::Validated,
            cohort: Some(1),
            enrollment_fee: Some(25_000),
            months: Some(6),
            monthly_fee: Some(50_000),
            active: true,
            formation_end_date: None,
            validated_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn ledger_for(e: &Enrollment, validated_months: Vec<i32>) -> StudentLedger {
        StudentLedger {
            enrollment_id: e.id,
            name: e.full_name(),
            email: e.email.clone(),
            formation: e.formation.clone(),
            months: 6,
            monthly_fee: 50_000,
            revenue: 50_000 * validated_months.len() as i64,
            validated_months,
        }
    }

    fn payment(status: PaymentStatus) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            enrollment_id: Uuid::new_v4(),
            month: 2,
            amount: 50_000,
            status,
            receipt_path: None,
            rejection_reason: None,
            validated_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn unpaid_students_list_missing_months() {
        let e = enrollment();
        let student = UnpaidStudent::of(&e, &ledger_for(&e, vec![1, 2])).unwrap();
        assert_eq!(student.missing_months, vec![3, 4, 5, 6]);
        assert_eq!(student.amount_owed, 200_000);
        assert_eq!(student.name, "Moussa Ndiaye");
    }

    #[test]
    fn fully_paid_students_are_not_unpaid() {
        let e = enrollment();
        assert!(UnpaidStudent::of(&e, &ledger_for(&e, (1..=6).collect())).is_none());
    }

    #[test]
    fn receipts_only_link_validated_payments() {
        let validated = payment(PaymentStatus::Validated);
        let url = receipt_url("http://localhost:8000", &validated).unwrap();
        assert_eq!(url, format!("http://localhost:8000/api/payments/receipts/{}", validated.id));
        assert!(receipt_url("http://localhost:8000", &payment(PaymentStatus::Pending)).is_none());
        assert!(receipt_url("http://localhost:8000", &payment(PaymentStatus::Rejected)).is_none());
    }

    #[test]
    fn payment_view_flattens_payment() {
        let view = PaymentView {
            receipt_url: None,
            payment: payment(PaymentStatus::Pending),
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["month"], 2);
        assert_eq!(json["status"], "PENDING");
        assert!(json.get("receipt_path").is_none());
        assert!(json["receipt_url"].is_null());
    }

    #[test]
    fn one_payment_row_per_month() {
        let schema = include_str!("../migrations/20251001000000_init.sql");
        let payments = &schema[schema.find("CREATE TABLE payments").unwrap()..];
        let payments = &payments[..payments.find(");").unwrap()];
        assert!(payments.contains("UNIQUE (enrollment_id, month)"));
    }

    #[test]
    fn status_changes_are_guarded_in_sql() {
        // Binds: $2 new status, $4 the status the row must still have.
        assert!(REJECT_PAYMENT.contains("WHERE id = $1 AND status = $4"));
        assert!(REOPEN_PAYMENT.contains("WHERE id = $1 AND status = $4"));
        assert!(VALIDATE_PAYMENT.contains("WHERE id = $1 AND status <> $2"));
        for sql in [REJECT_PAYMENT, REOPEN_PAYMENT, VALIDATE_PAYMENT, INSERT_PAYMENT] {
            assert!(sql.ends_with("RETURNING *"));
        }
    }

    #[test]
    fn lost_month_race_keeps_other_errors() {
        assert!(matches!(
            month_taken(sqlx::Error::RowNotFound, 3),
            Error::NotFound { .. }
        ));
    }
}

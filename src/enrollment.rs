use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::Extension;
use chrono::{NaiveDate, Utc};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{hash_password, Admin};
use crate::form::{self, Filter, JsonBody};
use crate::models::{Enrollment, EnrollmentStatus, Role, UserAccount};
use crate::{created, mail, proceeds, receipt, Context, Created, Error, Payload};

pub fn access_code() -> String {
    thread_rng().gen_range(1000..=9999).to_string()
}

/// Fields an admin must fill in when validating. Every amount must be positive.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateRequest {
    pub enrollment_fee: Option<i64>,
    pub months: Option<i32>,
    pub monthly_fee: Option<i64>,
    pub cohort: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terms {
    pub enrollment_fee: i64,
    pub months: i32,
    pub monthly_fee: i64,
    pub cohort: Option<i32>,
}

impl ValidateRequest {
    pub fn terms(&self) -> Result<Terms, Error> {
        let (enrollment_fee, months, monthly_fee) =
            match (self.enrollment_fee, self.months, self.monthly_fee) {
                (Some(fee), Some(months), Some(monthly)) => (fee, months, monthly),
                _ => {
                    return Err(Error::invalid(
                        "`enrollment_fee`, `months` and `monthly_fee` are required",
                    ))
                }
            };
        if enrollment_fee <= 0 || months <= 0 || monthly_fee <= 0 {
            return Err(Error::invalid("Amounts and duration must be positive"));
        }
        if let Some(cohort) = self.cohort {
            if cohort <= 0 {
                return Err(Error::invalid("`cohort` must be positive"));
            }
        }
        Ok(Terms {
            enrollment_fee,
            months,
            monthly_fee,
            cohort: self.cohort,
        })
    }
}

pub async fn signup(
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    JsonBody(body): JsonBody<EnrollmentRequest>,
) -> Created<EnrollmentCreated> {
    let last_name = form::required("last_name", body.last_name.as_ref())?;
    let first_name = form::required("first_name", body.first_name.as_ref())?;
    let email = form::email(body.email.as_ref())?;
    let phone = form::required("phone", body.phone.as_ref())?;
    let formation = form::required("formation", body.formation.as_ref())?;

    let taken = sqlx::query_as::<_, (Uuid,)>("SELECT id FROM enrollments WHERE email = $1")
        .bind(&email)
        .fetch_optional(&pg)
        .await?;
    if taken.is_some() {
        return Err(Error::conflict("An enrollment already exists for this email"));
    }

    let now = Utc::now();
    let enrollment = sqlx::query_as::<_, Enrollment>(
        "INSERT INTO enrollments \
         (id, last_name, first_name, email, phone, formation, access_code, status, active, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $9) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(last_name)
    .bind(first_name)
    .bind(email)
    .bind(phone)
    .bind(formation)
    .bind(access_code())
    .bind(EnrollmentStatus::Pending)
    .bind(now)
    .fetch_one(&pg)
    .await?;

    log::info!("New enrollment {} for {}", enrollment.id, enrollment.formation);
    ctx.mailer
        .dispatch(mail::new_enrollment(ctx.mailer.admin(), &enrollment));

    created(EnrollmentCreated {
        id: enrollment.id,
        status: enrollment.status,
    })
}

async fn list_by_status(
    pg: &PgPool,
    status: EnrollmentStatus,
    filter: &Filter,
) -> Result<Vec<Enrollment>, Error> {
    let order = match status {
        EnrollmentStatus::Pending => "created_at DESC",
        EnrollmentStatus::Validated => "validated_at DESC NULLS LAST",
    };
    Ok(sqlx::query_as::<_, Enrollment>(&format!(
        "SELECT * FROM enrollments \
         WHERE status = $1 AND ($2::TEXT IS NULL OR formation ILIKE '%' || $2 || '%') \
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
) -> Payload<EnrollmentList> {
    let enrollments = list_by_status(&pg, EnrollmentStatus::Pending, &filter).await?;
    proceeds(EnrollmentList {
        count: enrollments.len(),
        enrollments,
    })
}

pub async fn validated(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<EnrollmentList> {
    let enrollments = list_by_status(&pg, EnrollmentStatus::Validated, &filter).await?;
    proceeds(EnrollmentList {
        count: enrollments.len(),
        enrollments,
    })
}

async fn find(pg: &PgPool, id: Uuid) -> Result<Enrollment, Error> {
    sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found("Enrollment not found"))
}

pub fn check_validation(enrollment: &Enrollment) -> Result<(), Error> {
    match enrollment.status {
        EnrollmentStatus::Pending => Ok(()),
        EnrollmentStatus::Validated => Err(Error::conflict("This enrollment is already validated")),
    }
}

pub async fn validate(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<ValidateRequest>,
) -> Payload<EnrollmentValidated> {
    let id = Uuid::from_str(&id)?;
    let enrollment = find(&pg, id).await?;
    check_validation(&enrollment)?;
    let terms = body.terms()?;

    let account = sqlx::query_as::<_, UserAccount>("SELECT * FROM users WHERE email = $1")
        .bind(&enrollment.email)
        .fetch_optional(&pg)
        .await?;
    if account.is_some() {
        return Err(Error::conflict("An account already exists for this email"));
    }

    let password_hash = hash_password(&enrollment.access_code)?;
    let now = Utc::now();
    let mut tx = pg.begin().await?;
    let account = sqlx::query_as::<_, UserAccount>(
        "INSERT INTO users (id, name, email, password_hash, role, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(enrollment.full_name())
    .bind(&enrollment.email)
    .bind(password_hash)
    .bind(Role::Student)
    .bind(now)
    .fetch_one(&mut tx)
    .await?;
    let enrollment = sqlx::query_as::<_, Enrollment>(
        "UPDATE enrollments SET status = $2, enrollment_fee = $3, months = $4, monthly_fee = $5, \
         cohort = $6, validated_at = $7, updated_at = $7 \
         WHERE id = $1 AND status = $8 RETURNING *",
    )
    .bind(id)
    .bind(EnrollmentStatus::Validated)
    .bind(terms.enrollment_fee)
    .bind(terms.months)
    .bind(terms.monthly_fee)
    .bind(terms.cohort)
    .bind(now)
    .bind(EnrollmentStatus::Pending)
    .fetch_optional(&mut tx)
    .await?
    .ok_or_else(|| Error::conflict("This enrollment is already validated"))?;
    tx.commit().await?;

    log::info!(
        "Enrollment {} validated ({} months x {})",
        enrollment.id,
        terms.months,
        terms.monthly_fee
    );

    let pdf = receipt::enrollment_receipt(&enrollment, now);
    let path = format!("receipts/enrollments/{}.pdf", enrollment.id);
    if let Err(err) = ctx.store.write(&path, &pdf).await {
        log::warn!("Could not store enrollment receipt {}: {:#}", path, err);
    }
    ctx.mailer.dispatch(mail::enrollment_validated(&enrollment, pdf));

    proceeds(EnrollmentValidated {
        enrollment,
        user_id: account.id,
    })
}

pub async fn stats(_: Admin, Extension(pg): Extension<PgPool>) -> Payload<EnrollmentStats> {
    let (total, pending, validated, active) = sqlx::query_as::<_, (i64, i64, i64, i64)>(
        "SELECT COUNT(*), \
         COUNT(*) FILTER (WHERE status = 'PENDING'), \
         COUNT(*) FILTER (WHERE status = 'VALIDATED'), \
         COUNT(*) FILTER (WHERE active) \
         FROM enrollments",
    )
    .fetch_one(&pg)
    .await?;
    let by_formation = sqlx::query_as::<_, (String, i64)>(
        "SELECT formation, COUNT(*) AS n FROM enrollments GROUP BY formation ORDER BY n DESC, formation",
    )
    .fetch_all(&pg)
    .await?
    .into_iter()
    .map(|(formation, count)| FormationCount { formation, count })
    .collect();

    proceeds(EnrollmentStats {
        total,
        pending,
        validated,
        active,
        by_formation,
    })
}

pub async fn deactivate(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<String>,
    body: Option<JsonBody<DeactivateRequest>>,
) -> Payload<EnrollmentUpdated> {
    let id = Uuid::from_str(&id)?;
    let end_date = body
        .and_then(|JsonBody(body)| body.end_date)
        .unwrap_or_else(|| Utc::now().naive_utc().date());
    let enrollment = sqlx::query_as::<_, Enrollment>(
        "UPDATE enrollments SET active = FALSE, formation_end_date = $2, updated_at = NOW() \
         WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(end_date)
    .fetch_optional(&pg)
    .await?
    .ok_or_else(|| Error::not_found("Enrollment not found"))?;

    sqlx::query("DELETE FROM user_sessions WHERE user_id IN (SELECT id FROM users WHERE email = $1)")
        .bind(&enrollment.email)
        .execute(&pg)
        .await?;
    log::info!("Enrollment {} deactivated (ends {})", enrollment.id, end_date);
    proceeds(EnrollmentUpdated { enrollment })
}

pub async fn reactivate(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Path(id): Path<String>,
) -> Payload<EnrollmentUpdated> {
    let id = Uuid::from_str(&id)?;
    let enrollment = sqlx::query_as::<_, Enrollment>(
        "UPDATE enrollments SET active = TRUE, formation_end_date = NULL, updated_at = NOW() \
         WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .fetch_optional(&pg)
    .await?
    .ok_or_else(|| Error::not_found("Enrollment not found"))?;
    log::info!("Enrollment {} reactivated", enrollment.id);
    proceeds(EnrollmentUpdated { enrollment })
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentRequest {
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub formation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeactivateRequest {
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentCreated {
    pub id: Uuid,
    pub status: EnrollmentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentList {
    pub count: usize,
    pub enrollments: Vec<Enrollment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentValidated {
    pub enrollment: Enrollment,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentUpdated {
    pub enrollment: Enrollment,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormationCount {
    pub formation: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentStats {
    pub total: i64,
    pub pending: i64,
    pub validated: i64,
    pub active: i64,
    pub by_formation: Vec<FormationCount>,
}

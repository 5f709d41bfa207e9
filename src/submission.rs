use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::Extension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{Admin, Student};
use crate::course::{percentage, PartRef, PartStatuses};
use crate::form::{self, Filter, JsonBody};
use crate::models::{Assignment, Enrollment, PartSubmission, Submission, SubmissionStatus};
use crate::{created, mail, proceeds, Context, Created, Error, Payload};

/// Latest status per part for one student. There is at most one submission
/// per (assignment, enrollment), so the row is the latest one.
pub async fn part_statuses(pg: &PgPool, enrollment_id: Uuid, formation: &str) -> Result<PartStatuses, Error> {
    let rows = sqlx::query_as::<_, (String, SubmissionStatus)>(
        "SELECT a.part_id, s.status FROM submissions s \
         JOIN assignments a ON a.id = s.assignment_id \
         WHERE s.enrollment_id = $1 AND a.formation = $2",
    )
    .bind(enrollment_id)
    .bind(formation)
    .fetch_all(pg)
    .await?;
    Ok(rows.into_iter().collect())
}

pub async fn part_submissions(pg: &PgPool, enrollment_id: Uuid) -> Result<Vec<PartSubmission>, Error> {
    Ok(sqlx::query_as::<_, PartSubmission>(
        "SELECT s.id, a.part_id, a.lesson_id, a.module_id, a.part_title, \
         s.link, s.status, s.feedback, s.created_at, s.updated_at \
         FROM submissions s JOIN assignments a ON a.id = s.assignment_id \
         WHERE s.enrollment_id = $1 ORDER BY s.updated_at DESC",
    )
    .bind(enrollment_id)
    .fetch_all(pg)
    .await?)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmissionCounts {
    pub total: i64,
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
    pub approval_rate: u32,
}

impl SubmissionCounts {
    pub fn tally<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a SubmissionStatus>,
    {
        let mut counts = SubmissionCounts::default();
        for status in statuses {
            counts.total += 1;
            match status {
                SubmissionStatus::Pending => counts.pending += 1,
                SubmissionStatus::Approved => counts.approved += 1,
                SubmissionStatus::Rejected => counts.rejected += 1,
            }
        }
        counts.approval_rate = percentage(counts.approved as usize, counts.total as usize);
        counts
    }
}

/// Submission counts and validated students matching a formation/cohort filter.
pub async fn filtered_counts(pg: &PgPool, filter: &Filter) -> Result<(SubmissionCounts, i64), Error> {
    let (total, pending, approved, rejected) = sqlx::query_as::<_, (i64, i64, i64, i64)>(
        "SELECT COUNT(*), \
         COUNT(*) FILTER (WHERE s.status = 'PENDING'), \
         COUNT(*) FILTER (WHERE s.status = 'APPROVED'), \
         COUNT(*) FILTER (WHERE s.status = 'REJECTED') \
         FROM submissions s JOIN enrollments e ON e.id = s.enrollment_id \
         WHERE ($1::TEXT IS NULL OR e.formation ILIKE '%' || $1 || '%') \
         AND ($2::INT IS NULL OR e.cohort = $2)",
    )
    .bind(filter.formation())
    .bind(filter.cohort)
    .fetch_one(pg)
    .await?;
    let (students,) = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM enrollments \
         WHERE status = 'VALIDATED' AND active \
         AND ($1::TEXT IS NULL OR formation ILIKE '%' || $1 || '%') \
         AND ($2::INT IS NULL OR cohort = $2)",
    )
    .bind(filter.formation())
    .bind(filter.cohort)
    .fetch_one(pg)
    .await?;

    let counts = SubmissionCounts {
        total,
        pending,
        approved,
        rejected,
        approval_rate: percentage(approved as usize, total as usize),
    };
    Ok((counts, students))
}

/// What a new submission does to the student's row for that assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resubmit {
    Fresh,
    /// The earlier work was rejected; the same row goes back to review.
    Reuse(Uuid),
}

pub fn resubmission(existing: Option<&Submission>) -> Result<Resubmit, Error> {
    match existing {
        None => Ok(Resubmit::Fresh),
        Some(s) => match s.status {
            SubmissionStatus::Approved => Err(Error::conflict("This part is already approved")),
            SubmissionStatus::Pending => Err(Error::conflict(
                "A submission for this part is already awaiting review",
            )),
            SubmissionStatus::Rejected => Ok(Resubmit::Reuse(s.id)),
        },
    }
}

fn notification_title(located: &PartRef<'_>) -> String {
    format!("{} - {}", located.lesson.title, located.part.title)
}

pub async fn submit(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    JsonBody(body): JsonBody<SubmissionRequest>,
) -> Created<SubmissionRecorded> {
    let part_id = form::required("part_id", body.part_id.as_ref())?;
    let lesson_id = form::required("lesson_id", body.lesson_id.as_ref())?;
    let module_id = form::required("module_id", body.module_id.as_ref())?;
    let link = form::required("link", body.link.as_ref())?;

    let course = ctx
        .courses
        .load(&enrollment.formation)
        .await?
        .ok_or_else(|| Error::not_found(format!("No course for formation `{}`", enrollment.formation)))?;
    let located = course
        .locate(&part_id)
        .ok_or_else(|| Error::not_found(format!("Part `{}` does not exist", part_id)))?;
    if located.lesson.id != lesson_id || located.module.id != module_id {
        return Err(Error::invalid(format!(
            "Part `{}` belongs to lesson `{}` of module `{}`",
            part_id, located.lesson.id, located.module.id
        )));
    }

    let statuses = part_statuses(&pg, enrollment.id, &enrollment.formation).await?;
    if course.is_part_accessible(&part_id, &statuses) != Some(true) {
        return Err(Error::Locked {
            message: "Finish and get the previous part approved first".to_string(),
        });
    }

    let assignment = sqlx::query_as::<_, Assignment>(
        "INSERT INTO assignments (id, part_id, lesson_id, module_id, formation, part_title, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
         ON CONFLICT (part_id, formation) DO UPDATE SET part_title = EXCLUDED.part_title \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(&part_id)
    .bind(&lesson_id)
    .bind(&module_id)
    .bind(&enrollment.formation)
    .bind(&located.part.title)
    .fetch_one(&pg)
    .await?;

    let existing = sqlx::query_as::<_, Submission>(
        "SELECT * FROM submissions WHERE assignment_id = $1 AND enrollment_id = $2",
    )
    .bind(assignment.id)
    .bind(enrollment.id)
    .fetch_optional(&pg)
    .await?;

    let submission = match resubmission(existing.as_ref())? {
        Resubmit::Reuse(id) => sqlx::query_as::<_, Submission>(
            "UPDATE submissions SET link = $2, status = $3, feedback = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = $4 RETURNING *",
        )
        .bind(id)
        .bind(&link)
        .bind(SubmissionStatus::Pending)
        .bind(SubmissionStatus::Rejected)
        .fetch_optional(&pg)
        .await?
        .ok_or_else(|| Error::conflict("A submission for this part is already awaiting review"))?,
        Resubmit::Fresh => sqlx::query_as::<_, Submission>(
            "INSERT INTO submissions (id, assignment_id, enrollment_id, link, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, NOW(), NOW()) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(assignment.id)
        .bind(enrollment.id)
        .bind(&link)
        .bind(SubmissionStatus::Pending)
        .fetch_one(&pg)
        .await?,
    };

    let title = notification_title(&located);
    log::info!("Submission {} for part {} by {}", submission.id, part_id, enrollment.email);
    ctx.mailer.dispatch(mail::submission_received(&enrollment, &title));
    ctx.mailer.dispatch(mail::submission_to_review(
        ctx.mailer.admin(),
        &enrollment,
        &title,
        &link,
    ));

    created(SubmissionRecorded { submission })
}

pub async fn mine(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
) -> Payload<MySubmissions> {
    let submissions = part_submissions(&pg, enrollment.id).await?;
    proceeds(MySubmissions {
        count: submissions.len(),
        submissions,
    })
}

pub async fn list(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<SubmissionList> {
    let submissions = sqlx::query_as::<_, SubmissionListing>(
        "SELECT s.id, s.enrollment_id, s.link, s.status, s.feedback, s.created_at, s.updated_at, \
         a.part_id, a.lesson_id, a.module_id, a.part_title, \
         e.first_name, e.last_name, e.email, e.formation, e.cohort \
         FROM submissions s \
         JOIN assignments a ON a.id = s.assignment_id \
         JOIN enrollments e ON e.id = s.enrollment_id \
         WHERE ($1::submission_status IS NULL OR s.status = $1) \
         AND ($2::TEXT IS NULL OR e.formation ILIKE '%' || $2 || '%') \
         AND ($3::INT IS NULL OR e.cohort = $3) \
         ORDER BY s.updated_at DESC",
    )
    .bind(filter.status)
    .bind(filter.formation())
    .bind(filter.cohort)
    .fetch_all(&pg)
    .await?;
    proceeds(SubmissionList {
        count: submissions.len(),
        submissions,
    })
}

pub async fn stats(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<SubmissionStats> {
    let (submissions, active_students) = filtered_counts(&pg, &filter).await?;
    proceeds(SubmissionStats {
        submissions,
        active_students,
    })
}

/// Reviewed submission with what the notification needs.
async fn review_target(pg: &PgPool, id: Uuid) -> Result<(Submission, Enrollment, String), Error> {
    let submission = sqlx::query_as::<_, Submission>("SELECT * FROM submissions WHERE id = $1")
        .bind(id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found("Submission not found"))?;
    let enrollment = sqlx::query_as::<_, Enrollment>("SELECT * FROM enrollments WHERE id = $1")
        .bind(submission.enrollment_id)
        .fetch_one(pg)
        .await?;
    let (title,) = sqlx::query_as::<_, (String,)>("SELECT part_title FROM assignments WHERE id = $1")
        .bind(submission.assignment_id)
        .fetch_one(pg)
        .await?;
    Ok((submission, enrollment, title))
}

pub async fn approve(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(id): Path<String>,
    body: Option<JsonBody<ReviewRequest>>,
) -> Payload<SubmissionRecorded> {
    let id = Uuid::from_str(&id)?;
    let (submission, enrollment, title) = review_target(&pg, id).await?;
    if submission.status == SubmissionStatus::Approved {
        return Err(Error::conflict("This submission is already approved"));
    }
    let feedback = body.and_then(|JsonBody(body)| form::optional(body.feedback.as_ref()));

    let submission = sqlx::query_as::<_, Submission>(
        "UPDATE submissions SET status = $2, feedback = $3, updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(submission.id)
    .bind(SubmissionStatus::Approved)
    .bind(feedback)
    .fetch_one(&pg)
    .await?;

    log::info!("Submission {} approved for {}", submission.id, enrollment.email);
    ctx.mailer.dispatch(mail::submission_approved(&enrollment, &title));
    proceeds(SubmissionRecorded { submission })
}

pub async fn reject(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<ReviewRequest>,
) -> Payload<SubmissionRecorded> {
    let id = Uuid::from_str(&id)?;
    let feedback = form::required("feedback", body.feedback.as_ref())?;
    let (submission, enrollment, title) = review_target(&pg, id).await?;

    let submission = sqlx::query_as::<_, Submission>(
        "UPDATE submissions SET status = $2, feedback = $3, updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(submission.id)
    .bind(SubmissionStatus::Rejected)
    .bind(&feedback)
    .fetch_one(&pg)
    .await?;

    log::info!("Submission {} rejected for {}", submission.id, enrollment.email);
    ctx.mailer
        .dispatch(mail::submission_rejected(&enrollment, &title, &feedback));
    proceeds(SubmissionRecorded { submission })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionRequest {
    pub part_id: Option<String>,
    pub lesson_id: Option<String>,
    pub module_id: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequest {
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionRecorded {
    pub submission: Submission,
}

#[derive(Debug, Clone, Serialize)]
pub struct MySubmissions {
    pub count: usize,
    pub submissions: Vec<PartSubmission>,
}

/// A submission with its part and its author.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubmissionListing {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub link: String,
    pub status: SubmissionStatus,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub part_id: String,
    pub lesson_id: String,
    pub module_id: String,
    pub part_title: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub formation: String,
    pub cohort: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionList {
    pub count: usize,
    pub submissions: Vec<SubmissionListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionStats {
    pub submissions: SubmissionCounts,
    pub active_students: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_tally_statuses() {
        let statuses = [
            SubmissionStatus::Approved,
            SubmissionStatus::Approved,
            SubmissionStatus::Pending,
            SubmissionStatus::Rejected,
        ];
        let counts = SubmissionCounts::tally(&statuses);
        assert_eq!(counts.total, 4);
        assert_eq!(counts.approved, 2);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.rejected, 1);
        assert_eq!(counts.approval_rate, 50);
    }

    #[test]
    fn empty_tally_has_zero_rate() {
        let none: [SubmissionStatus; 0] = [];
        let counts = SubmissionCounts::tally(&none);
        assert_eq!(counts, SubmissionCounts::default());
    }

    #[test]
    fn submission_requests_tolerate_missing_fields() {
        let body: SubmissionRequest =
            serde_json::from_str(r#"{"part_id": "p1", "link": "https://github.com/awa/todo"}"#).unwrap();
        assert!(form::required("module_id", body.module_id.as_ref()).is_err());
        assert_eq!(form::required("part_id", body.part_id.as_ref()).unwrap(), "p1");
    }

    fn submission(status: SubmissionStatus) -> Submission {
        Submission {
            id: Uuid::new_v4(),
            assignment_id: Uuid::new_v4(),
            enrollment_id: Uuid::new_v4(),
            link: "https://github.com/awa/landing".into(),
            status,
            feedback: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn first_submission_creates_a_row() {
        assert_eq!(resubmission(None).unwrap(), Resubmit::Fresh);
    }

    #[test]
    fn rejected_work_reuses_its_row() {
        let rejected = submission(SubmissionStatus::Rejected);
        assert_eq!(resubmission(Some(&rejected)).unwrap(), Resubmit::Reuse(rejected.id));
    }

    #[test]
    fn approved_or_pending_work_cannot_be_resubmitted() {
        for status in [SubmissionStatus::Approved, SubmissionStatus::Pending] {
            let err = resubmission(Some(&submission(status))).unwrap_err();
            assert!(matches!(err, Error::Conflict { .. }));
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn titles_come_from_the_course_tree() {
        let course = crate::course::CourseLibrary::new("data/courses")
            .load("dev-web")
            .await
            .unwrap()
            .unwrap();
        let located = course.locate("m1-l1-p2").unwrap();
        assert_eq!(notification_title(&located), "HTML structure - Forms");

        let body: SubmissionRequest = serde_json::from_str(
            r#"{"part_id": "m1-l1-p2", "lesson_id": "m1-l1", "module_id": "m1",
                "link": "https://github.com/awa/forms", "part_title": "Anything"}"#,
        )
        .unwrap();
        assert_eq!(body.part_id.as_deref(), Some("m1-l1-p2"));
    }
}

use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::Extension;
use serde::Serialize;
use serde_with::skip_serializing_none;
use sqlx::PgPool;

use crate::auth::{Admin, Student};
use crate::course::{
    self, AnnotatedCourse, AnnotatedPart, Course, CourseListing, CourseStats, ModuleProgress,
    NextLesson, PartState, PartStatuses, Progress,
};
use crate::form::Filter;
use crate::models::{Enrollment, PartSubmission};
use crate::submission::{self, SubmissionCounts, SubmissionStats};
use crate::{proceeds, Context, Error, Payload};

async fn course_for(ctx: &Context, formation: &str) -> Result<Course, Error> {
    ctx.courses
        .load(formation)
        .await?
        .ok_or_else(|| Error::not_found(format!("No course for formation `{}`", formation)))
}

/// The student's course together with their part statuses.
async fn learner_view(
    ctx: &Context,
    pg: &PgPool,
    enrollment: &Enrollment,
) -> Result<(Course, PartStatuses), Error> {
    let course = course_for(ctx, &enrollment.formation).await?;
    let statuses = submission::part_statuses(pg, enrollment.id, &enrollment.formation).await?;
    Ok((course, statuses))
}

pub async fn formations(Extension(ctx): Extension<Arc<Context>>) -> Payload<CourseCatalog> {
    let courses = ctx.courses.list().await?;
    proceeds(CourseCatalog {
        count: courses.len(),
        courses,
    })
}

pub async fn my_course(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
) -> Payload<MyCourse> {
    let (course, statuses) = learner_view(&ctx, &pg, &enrollment).await?;
    proceeds(MyCourse {
        course: course::annotate(&course, &statuses),
    })
}

pub async fn my_progress(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
) -> Payload<CourseProgress> {
    let (course, statuses) = learner_view(&ctx, &pg, &enrollment).await?;
    proceeds(CourseProgress {
        formation: course.formation.clone(),
        progress: course::course_progress(&course, &statuses),
        stats: course.stats(),
    })
}

pub async fn next_lesson(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
) -> Payload<UpNext> {
    let (course, statuses) = learner_view(&ctx, &pg, &enrollment).await?;
    proceeds(UpNext {
        next_lesson: course::next_lesson(&course, &statuses),
    })
}

pub async fn lesson(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path((module_id, lesson_id)): Path<(String, String)>,
) -> Payload<LessonView> {
    let (course, statuses) = learner_view(&ctx, &pg, &enrollment).await?;
    let module = course
        .module(&module_id)
        .ok_or_else(|| Error::not_found(format!("Module `{}` does not exist", module_id)))?;
    let lesson = course
        .lesson(&module_id, &lesson_id)
        .ok_or_else(|| Error::not_found(format!("Lesson `{}` does not exist", lesson_id)))?;
    if course.is_lesson_accessible(&module_id, &lesson_id, &statuses) != Some(true) {
        return Err(Error::Locked {
            message: "This lesson unlocks once the previous part is approved".to_string(),
        });
    }

    let submissions = submission::part_submissions(&pg, enrollment.id)
        .await?
        .into_iter()
        .filter(|s| s.module_id == module.id && s.lesson_id == lesson.id)
        .collect();
    proceeds(LessonView {
        module_id: module.id.clone(),
        module_title: module.title.clone(),
        lesson_id: lesson.id.clone(),
        title: lesson.title.clone(),
        description: lesson.description.clone(),
        video_url: lesson.video_url.clone(),
        assignment: lesson.assignment.as_ref().map(|a| a.instruction.clone()),
        parts: lesson
            .parts
            .iter()
            .map(|part| AnnotatedPart {
                part: part.clone(),
                state: course.part_state(&part.id, &statuses),
            })
            .collect(),
        submissions,
    })
}

pub async fn module_progress(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(module_id): Path<String>,
) -> Payload<ModuleProgress> {
    let (course, statuses) = learner_view(&ctx, &pg, &enrollment).await?;
    let progress = course::module_progress(&course, &module_id, &statuses)
        .ok_or_else(|| Error::not_found(format!("Module `{}` does not exist", module_id)))?;
    proceeds(progress)
}

pub async fn course_stats(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(formation): Path<String>,
) -> Payload<CourseOverview> {
    let course = course_for(&ctx, &formation).await?;
    let filter = Filter {
        formation: Some(course.formation.clone()),
        ..Filter::default()
    };
    let (submissions, active_students) = submission::filtered_counts(&pg, &filter).await?;
    proceeds(CourseOverview {
        formation: course.formation.clone(),
        title: course.title.clone(),
        stats: course.stats(),
        active_students,
        submissions,
    })
}

pub async fn my_submissions(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
) -> Payload<SubmissionProgress> {
    let submissions = submission::part_submissions(&pg, enrollment.id).await?;
    proceeds(SubmissionProgress {
        stats: SubmissionCounts::tally(submissions.iter().map(|s| &s.status)),
        submissions,
    })
}

pub async fn part_access(
    Student { enrollment, .. }: Student,
    Extension(pg): Extension<PgPool>,
    Extension(ctx): Extension<Arc<Context>>,
    Path(part_id): Path<String>,
) -> Payload<PartAccess> {
    let (course, statuses) = learner_view(&ctx, &pg, &enrollment).await?;
    let accessible = course
        .is_part_accessible(&part_id, &statuses)
        .ok_or_else(|| Error::not_found(format!("Part `{}` does not exist", part_id)))?;
    let predecessor = course.predecessor(&part_id).map(|p| p.part.id.clone());
    let submission = submission::part_submissions(&pg, enrollment.id)
        .await?
        .into_iter()
        .find(|s| s.part_id == part_id);
    proceeds(PartAccess {
        state: course.part_state(&part_id, &statuses),
        part_id,
        accessible,
        locked: !accessible,
        predecessor,
        submission,
    })
}

pub async fn global_stats(
    _: Admin,
    Extension(pg): Extension<PgPool>,
    Query(filter): Query<Filter>,
) -> Payload<SubmissionStats> {
    let (submissions, active_students) = submission::filtered_counts(&pg, &filter).await?;
    proceeds(SubmissionStats {
        submissions,
        active_students,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseCatalog {
    pub count: usize,
    pub courses: Vec<CourseListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MyCourse {
    pub course: AnnotatedCourse,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseProgress {
    pub formation: String,
    pub progress: Progress,
    pub stats: CourseStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpNext {
    pub next_lesson: NextLesson,
}

#[derive(Debug, Clone, Serialize)]
pub struct LessonView {
    pub module_id: String,
    pub module_title: String,
    pub lesson_id: String,
    pub title: String,
    pub description: Option<String>,
    pub video_url: Option<String>,
    pub assignment: Option<String>,
    pub parts: Vec<AnnotatedPart>,
    pub submissions: Vec<PartSubmission>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseOverview {
    pub formation: String,
    pub title: String,
    pub stats: CourseStats,
    pub active_students: i64,
    pub submissions: SubmissionCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionProgress {
    pub stats: SubmissionCounts,
    pub submissions: Vec<PartSubmission>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct PartAccess {
    pub part_id: String,
    pub accessible: bool,
    pub locked: bool,
    pub state: PartState,
    pub predecessor: Option<String>,
    pub submission: Option<PartSubmission>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::CourseLibrary;
    use crate::models::SubmissionStatus;

    #[tokio::test]
    async fn bundled_course_loads_and_gates() {
        let library = CourseLibrary::new("data/courses");
        let course = library.load("dev-web").await.unwrap().unwrap();
        let stats = course.stats();
        assert_eq!((stats.modules, stats.lessons, stats.parts), (2, 3, 4));
        assert_eq!(stats.assignments, 1);

        let mut statuses = PartStatuses::new();
        assert_eq!(course.is_lesson_accessible("m2", "m2-l1", &statuses), Some(false));
        statuses.insert("m1-l2-p1".into(), SubmissionStatus::Approved);
        assert_eq!(course.is_lesson_accessible("m2", "m2-l1", &statuses), Some(true));

        let listing = library.list().await.unwrap();
        assert!(listing.iter().any(|c| c.formation == "dev-web" && c.lessons == 3));
    }

    #[test]
    fn part_access_omits_missing_submission() {
        let access = PartAccess {
            part_id: "m1-l1-p2".into(),
            accessible: false,
            locked: true,
            state: PartState::Locked,
            predecessor: Some("m1-l1-p1".into()),
            submission: None,
        };
        let json = serde_json::to_value(&access).unwrap();
        assert_eq!(json["state"], "LOCKED");
        assert_eq!(json["predecessor"], "m1-l1-p1");
        assert!(json.get("submission").is_none());
    }
}

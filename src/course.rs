//! Static course trees (module → lesson → part) loaded from JSON, and the
//! sequential unlock rule: a part opens once the part before it, in tree
//! order, has an approved submission.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::models::SubmissionStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub formation: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub modules: Vec<Module>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default)]
    pub assignment: Option<LessonAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub exercise: Option<Exercise>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub instruction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonAssignment {
    pub instruction: String,
}

/// Where a part sits in its course.
#[derive(Debug, Clone, Copy)]
pub struct PartRef<'a> {
    pub module: &'a Module,
    pub lesson: &'a Lesson,
    pub part: &'a Part,
}

/// Latest submission status per part id, for a single learner.
pub type PartStatuses = HashMap<String, SubmissionStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartState {
    Approved,
    Pending,
    Rejected,
    Accessible,
    Locked,
}

impl From<SubmissionStatus> for PartState {
    fn from(status: SubmissionStatus) -> Self {
        match status {
            SubmissionStatus::Approved => PartState::Approved,
            SubmissionStatus::Pending => PartState::Pending,
            SubmissionStatus::Rejected => PartState::Rejected,
        }
    }
}

impl Course {
    pub fn parts(&self) -> impl Iterator<Item = PartRef<'_>> {
        self.modules.iter().flat_map(|module| {
            module.lessons.iter().flat_map(move |lesson| {
                lesson
                    .parts
                    .iter()
                    .map(move |part| PartRef { module, lesson, part })
            })
        })
    }

    pub fn locate(&self, part_id: &str) -> Option<PartRef<'_>> {
        self.parts().find(|r| r.part.id == part_id)
    }

    /// Previous part in tree order. Lessons and modules without parts are
    /// skipped, so the predecessor of a module's first part is the last part
    /// of the nearest earlier module that has one.
    pub fn predecessor(&self, part_id: &str) -> Option<PartRef<'_>> {
        let mut previous = None;
        for current in self.parts() {
            if current.part.id == part_id {
                return previous;
            }
            previous = Some(current);
        }
        None
    }

    pub fn module(&self, module_id: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == module_id)
    }

    pub fn lesson(&self, module_id: &str, lesson_id: &str) -> Option<&Lesson> {
        self.module(module_id)?
            .lessons
            .iter()
            .find(|l| l.id == lesson_id)
    }

    /// Returns `None` when the part is not in this course.
    pub fn is_part_accessible(&self, part_id: &str, statuses: &PartStatuses) -> Option<bool> {
        self.locate(part_id)?;
        Some(match self.predecessor(part_id) {
            None => true,
            Some(prev) => statuses.get(&prev.part.id) == Some(&SubmissionStatus::Approved),
        })
    }

    /// A lesson opens with its first part. A lesson without parts opens when
    /// the last part before it in the tree is approved.
    pub fn is_lesson_accessible(
        &self,
        module_id: &str,
        lesson_id: &str,
        statuses: &PartStatuses,
    ) -> Option<bool> {
        let lesson = self.lesson(module_id, lesson_id)?;
        if let Some(first) = lesson.parts.first() {
            return self.is_part_accessible(&first.id, statuses);
        }
        let mut last_before: Option<&Part> = None;
        'tree: for module in &self.modules {
            for l in &module.lessons {
                if module.id == module_id && l.id == lesson_id {
                    break 'tree;
                }
                if let Some(p) = l.parts.last() {
                    last_before = Some(p);
                }
            }
        }
        Some(match last_before {
            None => true,
            Some(prev) => statuses.get(&prev.id) == Some(&SubmissionStatus::Approved),
        })
    }

    pub fn part_state(&self, part_id: &str, statuses: &PartStatuses) -> PartState {
        if let Some(status) = statuses.get(part_id) {
            return (*status).into();
        }
        match self.is_part_accessible(part_id, statuses) {
            Some(true) => PartState::Accessible,
            _ => PartState::Locked,
        }
    }

    pub fn stats(&self) -> CourseStats {
        let lessons = self.modules.iter().flat_map(|m| m.lessons.iter());
        let mut stats = CourseStats {
            modules: self.modules.len(),
            ..CourseStats::default()
        };
        for lesson in lessons {
            stats.lessons += 1;
            stats.parts += lesson.parts.len();
            stats.exercises += lesson.parts.iter().filter(|p| p.exercise.is_some()).count();
            if lesson.assignment.is_some() {
                stats.assignments += 1;
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CourseStats {
    pub modules: usize,
    pub lessons: usize,
    pub parts: usize,
    pub exercises: usize,
    pub assignments: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LessonState {
    Completed,
    InProgress,
    Accessible,
    Locked,
}

fn lesson_state(course: &Course, module: &Module, lesson: &Lesson, statuses: &PartStatuses) -> LessonState {
    let approved = lesson
        .parts
        .iter()
        .filter(|p| statuses.get(&p.id) == Some(&SubmissionStatus::Approved))
        .count();
    if !lesson.parts.is_empty() && approved == lesson.parts.len() {
        return LessonState::Completed;
    }
    if lesson.parts.iter().any(|p| statuses.contains_key(&p.id)) {
        return LessonState::InProgress;
    }
    match course.is_lesson_accessible(&module.id, &lesson.id, statuses) {
        Some(true) => LessonState::Accessible,
        _ => LessonState::Locked,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total_lessons: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub not_started: usize,
    pub percentage: u32,
}

impl Progress {
    fn tally<'a, I>(course: &Course, lessons: I, statuses: &PartStatuses) -> Self
    where
        I: IntoIterator<Item = (&'a Module, &'a Lesson)>,
    {
        let mut progress = Progress::default();
        for (module, lesson) in lessons {
            progress.total_lessons += 1;
            match lesson_state(course, module, lesson, statuses) {
                LessonState::Completed => progress.completed += 1,
                LessonState::InProgress => progress.in_progress += 1,
                LessonState::Accessible | LessonState::Locked => progress.not_started += 1,
            }
        }
        progress.percentage = percentage(progress.completed, progress.total_lessons);
        progress
    }
}

pub fn percentage(part: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((part as f64 / total as f64) * 100.0).round() as u32
}

pub fn course_progress(course: &Course, statuses: &PartStatuses) -> Progress {
    let lessons = course
        .modules
        .iter()
        .flat_map(|m| m.lessons.iter().map(move |l| (m, l)));
    Progress::tally(course, lessons, statuses)
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleProgress {
    pub module_id: String,
    pub module_title: String,
    #[serde(flatten)]
    pub progress: Progress,
}

pub fn module_progress(course: &Course, module_id: &str, statuses: &PartStatuses) -> Option<ModuleProgress> {
    let module = course.module(module_id)?;
    let lessons = module.lessons.iter().map(|l| (module, l));
    Some(ModuleProgress {
        module_id: module.id.clone(),
        module_title: module.title.clone(),
        progress: Progress::tally(course, lessons, statuses),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct LessonHeader {
    pub module_id: String,
    pub module_title: String,
    pub lesson_id: String,
    pub lesson_title: String,
    pub description: Option<String>,
    pub order: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextLesson {
    Available(LessonHeader),
    Blocked(LessonHeader),
    Completed,
}

/// First lesson that is not completed, in tree order.
pub fn next_lesson(course: &Course, statuses: &PartStatuses) -> NextLesson {
    for module in &course.modules {
        for lesson in &module.lessons {
            let state = lesson_state(course, module, lesson, statuses);
            if state == LessonState::Completed {
                continue;
            }
            let header = LessonHeader {
                module_id: module.id.clone(),
                module_title: module.title.clone(),
                lesson_id: lesson.id.clone(),
                lesson_title: lesson.title.clone(),
                description: lesson.description.clone(),
                order: lesson.order,
            };
            return if state == LessonState::Locked {
                NextLesson::Blocked(header)
            } else {
                NextLesson::Available(header)
            };
        }
    }
    NextLesson::Completed
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedPart {
    #[serde(flatten)]
    pub part: Part,
    pub state: PartState,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedLesson {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub order: u32,
    pub video_url: Option<String>,
    pub state: LessonState,
    pub parts: Vec<AnnotatedPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedModule {
    pub id: String,
    pub title: String,
    pub order: u32,
    pub lessons: Vec<AnnotatedLesson>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedCourse {
    pub formation: String,
    pub title: String,
    pub description: Option<String>,
    pub progress: Progress,
    pub modules: Vec<AnnotatedModule>,
}

pub fn annotate(course: &Course, statuses: &PartStatuses) -> AnnotatedCourse {
    let modules = course
        .modules
        .iter()
        .map(|module| AnnotatedModule {
            id: module.id.clone(),
            title: module.title.clone(),
            order: module.order,
            lessons: module
                .lessons
                .iter()
                .map(|lesson| AnnotatedLesson {
                    id: lesson.id.clone(),
                    title: lesson.title.clone(),
                    description: lesson.description.clone(),
                    order: lesson.order,
                    video_url: lesson.video_url.clone(),
                    state: lesson_state(course, module, lesson, statuses),
                    parts: lesson
                        .parts
                        .iter()
                        .map(|part| AnnotatedPart {
                            part: part.clone(),
                            state: course.part_state(&part.id, statuses),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    AnnotatedCourse {
        formation: course.formation.clone(),
        title: course.title.clone(),
        description: course.description.clone(),
        progress: course_progress(course, statuses),
        modules,
    }
}

/// Reads course trees from `<dir>/<formation>.json` on every call.
#[derive(Debug, Clone)]
pub struct CourseLibrary {
    dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseListing {
    pub formation: String,
    pub title: String,
    pub description: Option<String>,
    pub duration: Option<String>,
    pub level: Option<String>,
    pub modules: usize,
    pub lessons: usize,
}

impl CourseLibrary {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, formation: &str) -> anyhow::Result<PathBuf> {
        let valid = !formation.is_empty()
            && formation
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            bail!("Invalid formation key `{}`", formation);
        }
        Ok(self.dir.join(format!("{}.json", formation)))
    }

    /// `Ok(None)` when no course file exists for this formation.
    pub async fn load(&self, formation: &str) -> anyhow::Result<Option<Course>> {
        let path = match self.path_for(formation) {
            Ok(path) => path,
            Err(_) => return Ok(None),
        };
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let course = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(course))
    }

    pub async fn list(&self) -> anyhow::Result<Vec<CourseListing>> {
        let mut listings = Vec::new();
        if !Path::new(&self.dir).exists() {
            return Ok(listings);
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        for key in keys {
            match self.load(&key).await {
                Ok(Some(course)) => {
                    let stats = course.stats();
                    listings.push(CourseListing {
                        formation: course.formation,
                        title: course.title,
                        description: course.description,
                        duration: course.duration,
                        level: course.level,
                        modules: stats.modules,
                        lessons: stats.lessons,
                    });
                }
                Ok(None) => {}
                Err(err) => log::warn!("Skipping course `{}`: {:#}", key, err),
            }
        }
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(id: &str) -> Part {
        Part {
            id: id.into(),
            title: format!("Part {}", id),
            content: None,
            order: 0,
            exercise: None,
        }
    }

    fn lesson(id: &str, parts: &[&str]) -> Lesson {
        Lesson {
            id: id.into(),
            title: format!("Lesson {}", id),
            description: None,
            order: 0,
            video_url: None,
            parts: parts.iter().map(|p| part(p)).collect(),
            assignment: None,
        }
    }

    fn module(id: &str, lessons: Vec<Lesson>) -> Module {
        Module {
            id: id.into(),
            title: format!("Module {}", id),
            order: 0,
            lessons,
        }
    }

    /// m1: l1[p1,p2] l2[p3]   m2: l3[] l4[p4]   m3: (empty)   m4: l5[p5]
    fn course() -> Course {
        Course {
            formation: "dev-web".into(),
            title: "Web".into(),
            description: None,
            duration: None,
            level: None,
            modules: vec![
                module("m1", vec![lesson("l1", &["p1", "p2"]), lesson("l2", &["p3"])]),
                module("m2", vec![lesson("l3", &[]), lesson("l4", &["p4"])]),
                module("m3", vec![]),
                module("m4", vec![lesson("l5", &["p5"])]),
            ],
        }
    }

    fn statuses(pairs: &[(&str, SubmissionStatus)]) -> PartStatuses {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn predecessor_follows_tree_order() {
        let c = course();
        assert!(c.predecessor("p1").is_none());
        assert_eq!(c.predecessor("p2").unwrap().part.id, "p1");
        assert_eq!(c.predecessor("p3").unwrap().part.id, "p2");
        assert_eq!(c.predecessor("p4").unwrap().part.id, "p3");
        assert_eq!(c.predecessor("p5").unwrap().part.id, "p4");
        assert!(c.predecessor("nope").is_none());
    }

    #[test]
    fn first_part_is_always_accessible() {
        let c = course();
        assert_eq!(c.is_part_accessible("p1", &PartStatuses::new()), Some(true));
        let rejected = statuses(&[("p1", SubmissionStatus::Rejected)]);
        assert_eq!(c.is_part_accessible("p1", &rejected), Some(true));
    }

    #[test]
    fn accessible_iff_predecessor_approved() {
        let c = course();
        let all = [
            None,
            Some(SubmissionStatus::Pending),
            Some(SubmissionStatus::Rejected),
            Some(SubmissionStatus::Approved),
        ];
        for target in ["p2", "p3", "p4", "p5"] {
            let prev = c.predecessor(target).unwrap().part.id.clone();
            for status in all {
                let mut map = PartStatuses::new();
                if let Some(status) = status {
                    map.insert(prev.clone(), status);
                }
                assert_eq!(
                    c.is_part_accessible(target, &map),
                    Some(status == Some(SubmissionStatus::Approved)),
                    "{} with predecessor {:?}",
                    target,
                    status
                );
            }
        }
    }

    #[test]
    fn unknown_part_has_no_answer() {
        assert_eq!(course().is_part_accessible("ghost", &PartStatuses::new()), None);
    }

    #[test]
    fn lessons_open_with_their_first_part() {
        let c = course();
        let none = PartStatuses::new();
        assert_eq!(c.is_lesson_accessible("m1", "l1", &none), Some(true));
        assert_eq!(c.is_lesson_accessible("m1", "l2", &none), Some(false));
        // l3 has no parts: it opens once p3 is approved.
        assert_eq!(c.is_lesson_accessible("m2", "l3", &none), Some(false));
        let p3 = statuses(&[("p3", SubmissionStatus::Approved)]);
        assert_eq!(c.is_lesson_accessible("m2", "l3", &p3), Some(true));
        assert_eq!(c.is_lesson_accessible("m2", "l4", &p3), Some(true));
        assert_eq!(c.is_lesson_accessible("m2", "missing", &p3), None);
    }

    #[test]
    fn part_states_mix_submissions_and_gating() {
        let c = course();
        let s = statuses(&[
            ("p1", SubmissionStatus::Approved),
            ("p2", SubmissionStatus::Rejected),
        ]);
        assert_eq!(c.part_state("p1", &s), PartState::Approved);
        assert_eq!(c.part_state("p2", &s), PartState::Rejected);
        assert_eq!(c.part_state("p3", &s), PartState::Locked);
    }

    #[test]
    fn progress_counts_completed_lessons() {
        let c = course();
        let s = statuses(&[
            ("p1", SubmissionStatus::Approved),
            ("p2", SubmissionStatus::Approved),
            ("p3", SubmissionStatus::Pending),
        ]);
        let progress = course_progress(&c, &s);
        assert_eq!(progress.total_lessons, 5);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.in_progress, 1);
        assert_eq!(progress.not_started, 3);
        assert_eq!(progress.percentage, 20);

        let m1 = module_progress(&c, "m1", &s).unwrap();
        assert_eq!(m1.progress.percentage, 50);
        assert!(module_progress(&c, "m9", &s).is_none());
    }

    #[test]
    fn next_lesson_walks_the_tree() {
        let c = course();
        match next_lesson(&c, &PartStatuses::new()) {
            NextLesson::Available(h) => assert_eq!(h.lesson_id, "l1"),
            other => panic!("unexpected {:?}", other),
        }

        let s = statuses(&[
            ("p1", SubmissionStatus::Approved),
            ("p2", SubmissionStatus::Pending),
        ]);
        match next_lesson(&c, &s) {
            NextLesson::Available(h) => assert_eq!(h.lesson_id, "l1"),
            other => panic!("unexpected {:?}", other),
        }

        let s = statuses(&[
            ("p1", SubmissionStatus::Approved),
            ("p2", SubmissionStatus::Approved),
            ("p3", SubmissionStatus::Approved),
        ]);
        // l3 has no parts and is never completed, but it is open.
        match next_lesson(&c, &s) {
            NextLesson::Available(h) => assert_eq!(h.lesson_id, "l3"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn next_lesson_reports_completion() {
        let c = Course {
            modules: vec![module("m1", vec![lesson("l1", &["p1"])])],
            ..course()
        };
        let s = statuses(&[("p1", SubmissionStatus::Approved)]);
        assert!(matches!(next_lesson(&c, &s), NextLesson::Completed));
    }

    #[test]
    fn stats_count_everything() {
        let mut c = course();
        c.modules[0].lessons[0].parts[0].exercise = Some(Exercise {
            instruction: "Build a page".into(),
        });
        c.modules[0].lessons[1].assignment = Some(LessonAssignment {
            instruction: "Final".into(),
        });
        assert_eq!(
            c.stats(),
            CourseStats {
                modules: 4,
                lessons: 5,
                parts: 5,
                exercises: 1,
                assignments: 1,
            }
        );
    }

    #[test]
    fn annotated_course_serializes_states() {
        let c = course();
        let json = serde_json::to_value(annotate(&c, &PartStatuses::new())).unwrap();
        assert_eq!(json["modules"][0]["lessons"][0]["parts"][0]["state"], "ACCESSIBLE");
        assert_eq!(json["modules"][0]["lessons"][0]["parts"][1]["state"], "LOCKED");
        assert_eq!(json["modules"][0]["lessons"][0]["state"], "ACCESSIBLE");
        assert_eq!(json["progress"]["total_lessons"], 5);
    }

    #[tokio::test]
    async fn library_loads_and_lists_json_courses() {
        let dir = std::env::temp_dir().join(format!("courses-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let json = serde_json::to_vec(&course()).unwrap();
        tokio::fs::write(dir.join("dev-web.json"), json).await.unwrap();
        tokio::fs::write(dir.join("broken.json"), b"{").await.unwrap();
        tokio::fs::write(dir.join("notes.txt"), b"ignored").await.unwrap();

        let library = CourseLibrary::new(&dir);
        let loaded = library.load("dev-web").await.unwrap().unwrap();
        assert_eq!(loaded.modules.len(), 4);
        assert!(library.load("missing").await.unwrap().is_none());
        assert!(library.load("../etc").await.unwrap().is_none());

        let listings = library.list().await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].lessons, 5);
    }
}

use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{AppError, AppJson};
use crate::login::AuthUser;
use crate::state::SharedState;
use crate::store::{Db, User};

/// Attendance goal used for the `neededToReach75` figure
pub const TARGET_PERCENT: u32 = 75;

/// Minimum spacing between two marks on the same subject
pub const MARK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// A course tracked for attendance
///
/// Holds cumulative class counts and the time it was last marked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub total_classes: u64,
    #[serde(default)]
    pub attended_classes: u64,
    #[serde(default)]
    pub last_marked: Option<DateTime<Utc>>,
}

/// Returned when a subject was marked less than [`MARK_INTERVAL`] ago
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkRejected {
    pub retry_after: Duration,
}

/// Subject plus derived statistics, as sent to the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectView {
    #[serde(flatten)]
    pub subject: Subject,
    pub percentage: f64,
    #[serde(rename = "neededToReach75")]
    pub needed_to_reach_75: u64,
}

/// Totals across every subject of one user
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OverallStats {
    pub total_classes_all: u64,
    pub total_attended_all: u64,
    pub overall_pct: f64,
}

/// Share of attended classes, in percent
///
/// # Examples
/// ```
/// use vidyasphere::attendance::percentage;
///
/// assert_eq!(percentage(0, 0), 0.0);
/// assert_eq!(percentage(3, 4), 75.0);
/// ```
pub fn percentage(attended: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * attended as f64 / total as f64
    }
}

/// Smallest number of consecutive attended classes that lifts the ratio to
/// `target_percent`
///
/// Solves `(attended + n) / (total + n) >= target` for the least `n`, i.e.
/// `ceil((target * total - attended) / (1 - target))` floored at zero. The
/// target is scaled to an integer percentage so the division is exact.
/// Targets outside `1..=99` are clamped into that range.
///
/// # Examples
/// ```
/// use vidyasphere::attendance::needed_to_reach;
///
/// assert_eq!(needed_to_reach(3, 4, 75), 0);
/// assert_eq!(needed_to_reach(1, 4, 75), 8);
/// ```
pub fn needed_to_reach(attended: u64, total: u64, target_percent: u32) -> u64 {
    let target = u128::from(target_percent.clamp(1, 99));
    let wanted = target * u128::from(total);
    let have = 100 * u128::from(attended);
    if have >= wanted {
        return 0;
    }
    let denom = 100 - target;
    ((wanted - have).div_ceil(denom)) as u64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl Subject {
    pub fn new(name: &str) -> Self {
        Subject {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            total_classes: 0,
            attended_classes: 0,
            last_marked: None,
        }
    }

    /// Time left before the subject may be marked again, if any
    pub fn cooldown(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_marked?;
        let elapsed = now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO);
        MARK_INTERVAL.checked_sub(elapsed).filter(|left| !left.is_zero())
    }

    pub fn can_mark(&self, now: DateTime<Utc>) -> bool {
        self.cooldown(now).is_none()
    }

    /// Record one class, attended or not
    ///
    /// Rejected with the remaining wait if the last mark is under 24 hours old.
    /// A `last_marked` in the future (clock skew) counts as zero elapsed time.
    pub fn mark(&mut self, present: bool, now: DateTime<Utc>) -> Result<(), MarkRejected> {
        if let Some(retry_after) = self.cooldown(now) {
            return Err(MarkRejected { retry_after });
        }

        self.total_classes += 1;
        if present {
            self.attended_classes += 1;
        }
        self.last_marked = Some(now);
        Ok(())
    }

    pub fn view(&self) -> SubjectView {
        SubjectView {
            subject: self.clone(),
            percentage: round2(percentage(self.attended_classes, self.total_classes)),
            needed_to_reach_75: needed_to_reach(
                self.attended_classes,
                self.total_classes,
                TARGET_PERCENT,
            ),
        }
    }
}

pub fn overall(subjects: &[Subject]) -> OverallStats {
    let total_classes_all = subjects.iter().map(|s| s.total_classes).sum();
    let total_attended_all = subjects.iter().map(|s| s.attended_classes).sum();

    OverallStats {
        total_classes_all,
        total_attended_all,
        overall_pct: round2(percentage(total_attended_all, total_classes_all)),
    }
}

/// Subjects that are due to be marked
pub fn pending(subjects: &[Subject], now: DateTime<Utc>) -> Vec<&Subject> {
    subjects.iter().filter(|s| s.can_mark(now)).collect()
}

impl From<MarkRejected> for AppError {
    fn from(rejected: MarkRejected) -> Self {
        AppError::AlreadyMarked {
            retry_after: rejected.retry_after,
        }
    }
}

fn current_user<'a>(db: &'a Db, auth: &AuthUser) -> Result<&'a User, AppError> {
    db.user(&auth.user_id)
        .ok_or_else(|| AppError::not_found("user not found"))
}

fn current_user_mut<'a>(db: &'a mut Db, auth: &AuthUser) -> Result<&'a mut User, AppError> {
    db.user_mut(&auth.user_id)
        .ok_or_else(|| AppError::not_found("user not found"))
}

#[derive(Debug, Deserialize)]
pub struct NewSubjectRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkRequest {
    #[serde(default)]
    pub present: bool,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    pub subscription: Option<Value>,
}

/// All subjects of the signed-in user with their statistics
pub async fn handle_list_subjects(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    state.db.read(|db| {
        let user = current_user(db, &auth)?;
        let subjects: Vec<SubjectView> = user.subjects.iter().map(Subject::view).collect();
        Ok(Json(json!({
            "subjects": subjects,
            "overall": overall(&user.subjects),
        })))
    })
}

pub async fn handle_add_subject(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthUser>,
    AppJson(req): AppJson<NewSubjectRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("subject name required"));
    }

    let subject = state.db.write(|db| {
        let user = current_user_mut(db, &auth)?;
        if user
            .subjects
            .iter()
            .any(|s| s.name.to_lowercase() == name.to_lowercase())
        {
            return Err(AppError::bad_request("subject already exists"));
        }
        let subject = Subject::new(name);
        user.subjects.push(subject.clone());
        Ok(subject)
    })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "subject added", "subject": subject })),
    ))
}

pub async fn handle_remove_subject(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.db.write(|db| {
        let user = current_user_mut(db, &auth)?;
        let before = user.subjects.len();
        user.subjects.retain(|s| s.id != id);
        if user.subjects.len() == before {
            return Err(AppError::not_found("subject not found"));
        }
        Ok(())
    })?;

    Ok(Json(json!({ "message": "subject removed" })))
}

/// Mark one class present or absent, at most once per 24 hours
pub async fn handle_mark(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    AppJson(req): AppJson<MarkRequest>,
) -> Result<Json<Value>, AppError> {
    let now = Utc::now();

    let (view, stats) = state.db.write(|db| {
        let user = current_user_mut(db, &auth)?;
        let subject = user
            .subjects
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::not_found("subject not found"))?;
        subject.mark(req.present, now)?;
        let view = subject.view();
        Ok::<_, AppError>((view, overall(&user.subjects)))
    })?;

    info!(
        "{}: marked {} ({}% now)",
        view.subject.name,
        if req.present { "present" } else { "absent" },
        view.percentage
    );

    Ok(Json(json!({
        "message": "marked",
        "subject": view,
        "overall": stats,
    })))
}

/// Subjects still open for marking, for client-side reminders
pub async fn handle_reminders(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<Value>, AppError> {
    let now = Utc::now();
    state.db.read(|db| {
        let user = current_user(db, &auth)?;
        let due: Vec<Value> = pending(&user.subjects, now)
            .into_iter()
            .map(|s| json!({ "id": s.id, "name": s.name }))
            .collect();
        let message = if due.is_empty() {
            "All subjects marked for today".to_string()
        } else {
            format!("You have {} subject(s) pending for today.", due.len())
        };
        Ok(Json(json!({ "pending": due, "message": message })))
    })
}

/// Remember the browser push subscription of the signed-in user
pub async fn handle_subscribe(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthUser>,
    AppJson(req): AppJson<SubscribeRequest>,
) -> Result<Json<Value>, AppError> {
    let subscription = req
        .subscription
        .filter(|s| !s.is_null())
        .ok_or_else(|| AppError::bad_request("subscription required"))?;

    state.db.write(|db| {
        current_user_mut(db, &auth)?.push_subscription = Some(subscription);
        Ok::<_, AppError>(())
    })?;

    Ok(Json(json!({ "message": "subscribed" })))
}

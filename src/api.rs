use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rocket::State;
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use validator::Validate;

use crate::cache::TabularCache;
use crate::config::AppConfig;
use crate::controller::{Action, MarkingController, View};
use crate::error::AppError;
use crate::models::{
    AttendanceStatus, Mark, OperatorId, RosterEntry, SlotId, format_date, parse_date,
};
use crate::report::{MonthSpec, MonthlyReport, monthly_report};
use crate::store::{AttendanceStore, BulkUpsert};
use crate::validation::{ApiError, AppErrorExt, JsonValidateExt, ToValidationResponse};

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}

#[post("/operators/<operator>/actions", data = "<action>")]
pub async fn api_operator_action(
    operator: OperatorId,
    action: Json<Action>,
    controller: &State<MarkingController>,
) -> Result<Json<View>, ApiError> {
    let view = controller
        .handle(operator, action.into_inner())
        .await
        .validate_custom()?;

    Ok(Json(view))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RosterResponse {
    pub group_id: String,
    pub subjects: Vec<String>,
}

#[get("/roster")]
pub async fn api_get_roster(
    cache: &State<Arc<TabularCache>>,
    config: &State<Arc<AppConfig>>,
) -> Result<Json<RosterResponse>, ApiError> {
    let roster = cache.get_roster().await.validate_custom()?;

    Ok(Json(RosterResponse {
        group_id: config.group_id.clone(),
        subjects: roster.into_iter().map(|e| e.subject_name).collect(),
    }))
}

#[derive(Deserialize, Validate)]
pub struct AddSubjectRequest {
    #[validate(length(min = 1, max = 200, message = "Name must be 1 to 200 characters"))]
    name: String,
}

#[post("/roster", data = "<request>")]
pub async fn api_add_subject(
    request: Json<AddSubjectRequest>,
    store: &State<Arc<AttendanceStore>>,
) -> Result<Custom<Json<RosterEntry>>, ApiError> {
    let validated = request.validate_custom()?;

    let entry = store.add_subject(&validated.name).await.validate_custom()?;

    Ok(Custom(Status::Created, Json(entry)))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AttendanceResponse {
    pub date: String,
    pub slot: SlotId,
    pub time_range: Option<String>,
    pub marks: BTreeMap<String, Mark>,
}

#[get("/attendance?<date>&<slot>")]
pub async fn api_get_attendance(
    date: &str,
    slot: SlotId,
    cache: &State<Arc<TabularCache>>,
    config: &State<Arc<AppConfig>>,
) -> Result<Json<AttendanceResponse>, ApiError> {
    let date = parse_date(date).validate_custom()?;
    check_slots(config, [slot]).validate_custom()?;

    let marks = cache.get_attendance(date, slot).await.validate_custom()?;

    Ok(Json(AttendanceResponse {
        date: format_date(date),
        slot,
        time_range: config.slots.time_range(slot).map(String::from),
        marks: marks.into_iter().collect(),
    }))
}

#[derive(Deserialize, Validate)]
pub struct UpsertRequest {
    date: String,
    #[validate(length(min = 1, message = "Select at least one slot"))]
    slots: Vec<SlotId>,
    #[validate(length(min = 1, message = "Select at least one subject"))]
    subjects: Vec<String>,
    status: AttendanceStatus,
    reason: Option<String>,
}

#[put("/attendance", data = "<request>")]
pub async fn api_upsert_attendance(
    request: Json<UpsertRequest>,
    store: &State<Arc<AttendanceStore>>,
    cache: &State<Arc<TabularCache>>,
    config: &State<Arc<AppConfig>>,
) -> Result<Json<BulkUpsert>, ApiError> {
    let validated = request.validate_custom()?;

    let date = parse_date(&validated.date).validate_custom()?;
    check_slots(config, validated.slots.iter().copied()).validate_custom()?;

    let roster = cache.get_roster().await.validate_custom()?;
    if let Some(unknown) = validated
        .subjects
        .iter()
        .find(|s| !roster.iter().any(|e| &e.subject_name == *s))
    {
        return Err(
            AppError::NotFound(format!("Subject '{}' is not on the roster", unknown))
                .to_validation_response(),
        );
    }

    let slots: BTreeSet<SlotId> = validated.slots.into_iter().collect();
    let outcome = store
        .upsert_many(
            date,
            &slots,
            &validated.subjects,
            validated.status,
            validated.reason.as_deref(),
        )
        .await
        .validate_custom()?;

    Ok(Json(outcome))
}

#[get("/reports/monthly?<month>")]
pub async fn api_monthly_report(
    month: Option<&str>,
    store: &State<Arc<AttendanceStore>>,
    cache: &State<Arc<TabularCache>>,
    config: &State<Arc<AppConfig>>,
) -> Result<Json<MonthlyReport>, ApiError> {
    let month = month
        .unwrap_or("current")
        .parse::<MonthSpec>()
        .validate_custom()?;

    let report = monthly_report(store, cache, &config.slots, month)
        .await
        .validate_custom()?;

    Ok(Json(report))
}

fn check_slots(
    config: &AppConfig,
    slots: impl IntoIterator<Item = SlotId>,
) -> Result<(), AppError> {
    match slots.into_iter().find(|slot| !config.slots.contains(*slot)) {
        Some(slot) => Err(AppError::Validation(format!(
            "Slot {} is not in the timetable",
            slot
        ))),
        None => Ok(()),
    }
}

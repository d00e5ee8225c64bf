//! 대시보드용 REST API
//!
//! 모든 응답은 `{ success, data, error }` 형식이며, 실패는 `AppError` 가 상태 코드와 함께 변환합니다.
//! 인증은 `Authorization: Bearer <token>` 헤더로 합니다.

use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{self, Session, SessionStore};
use crate::dashboard::{self, DashboardSummary};
use crate::db::{AppointmentFilter, Database};
use crate::error::{AppError, AppResult};
use crate::forms::*;
use crate::listing::{self, ListParams, Page};
use crate::models::*;
use crate::permissions::{accessible_modules, role_permissions, Action, Module, Role, RolePermissions};
use crate::validation::{Validate, ValidationErrors};

/// API 상태 (DB + 세션)
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<Database>,
    pub sessions: SessionStore,
}

impl ApiState {
    pub fn new(db: Arc<Database>, sessions: SessionStore) -> Self {
        Self { db, sessions }
    }

    /// 인증 + 권한 확인
    fn authorize(&self, headers: &HeaderMap, module: Module, action: Action) -> AppResult<Session> {
        let session = self.sessions.authenticate(headers)?;
        session.require(module, action)?;
        Ok(session)
    }
}

/// API 응답 래퍼
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

type ApiResult<T> = AppResult<Json<ApiResponse<T>>>;
type Created<T> = AppResult<(StatusCode, Json<ApiResponse<T>>)>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

fn created<T>(data: T) -> Created<T> {
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(data))))
}

/// 요청 본문 파싱 + 검증
fn form<T: Validate>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    let Json(form) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    validated(&form)?;
    Ok(form)
}

/// 쿼리 문자열 추출 (형식 오류도 JSON 응답)
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(ApiQuery(value)),
            Err(e) => Err(AppError::BadRequest(e.body_text())),
        }
    }
}

/// 경로 파라미터 추출 (형식 오류도 JSON 응답)
pub struct ApiPath<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(ApiPath(value)),
            Err(e) => Err(AppError::BadRequest(e.body_text())),
        }
    }
}

/// 없는 API 경로
async fn api_not_found(uri: Uri) -> AppError {
    AppError::not_found(format!("route {}", uri.path()))
}

/// 웹 API 라우터 생성 (`/api` 아래에 연결)
pub fn create_web_api_router(state: ApiState) -> Router {
    Router::new()
        // 인증
        .route("/auth/login", post(login_api))
        .route("/auth/logout", post(logout_api))
        .route("/auth/me", get(me_api))
        .route("/permissions", get(permissions_api))
        .route("/dashboard", get(dashboard_api))
        // 환자 관리
        .route("/patients", get(list_patients_api).post(create_patient_api))
        .route(
            "/patients/{id}",
            get(get_patient_api)
                .put(update_patient_api)
                .delete(delete_patient_api),
        )
        .route(
            "/patients/{id}/history",
            get(get_history_api).put(save_history_api),
        )
        .route("/patients/{id}/export", get(export_patient_api))
        // 예약
        .route(
            "/appointments",
            get(list_appointments_api).post(create_appointment_api),
        )
        .route(
            "/appointments/{id}",
            get(get_appointment_api)
                .put(update_appointment_api)
                .delete(delete_appointment_api),
        )
        .route("/appointments/{id}/status", post(appointment_status_api))
        // 진료 기록
        .route(
            "/patients/{id}/consultations",
            get(list_consultations_api).post(create_consultation_api),
        )
        .route(
            "/consultations/{id}",
            get(get_consultation_api)
                .put(update_consultation_api)
                .delete(delete_consultation_api),
        )
        // 처방
        .route(
            "/patients/{id}/prescriptions",
            get(list_prescriptions_api).post(create_prescription_api),
        )
        .route(
            "/prescriptions/{id}",
            get(get_prescription_api)
                .put(update_prescription_api)
                .delete(delete_prescription_api),
        )
        // 검사 결과
        .route(
            "/patients/{id}/lab-reports",
            get(list_lab_reports_api).post(create_lab_report_api),
        )
        .route(
            "/lab-reports/{id}",
            get(get_lab_report_api)
                .put(update_lab_report_api)
                .delete(delete_lab_report_api),
        )
        // 수납
        .route("/invoices", get(list_invoices_api).post(create_invoice_api))
        .route(
            "/invoices/{id}",
            get(get_invoice_api)
                .put(update_invoice_api)
                .delete(cancel_invoice_api),
        )
        .route("/invoices/{id}/payments", post(record_payment_api))
        // 사용자 관리
        .route("/users", get(list_users_api).post(create_user_api))
        .route(
            "/users/{id}",
            get(get_user_api).put(update_user_api).delete(delete_user_api),
        )
        // 설정
        .route("/settings", get(get_settings_api).put(save_settings_api))
        .fallback(api_not_found)
        .with_state(state)
}

// ============ 조회 헬퍼 ============

fn load_patient(db: &Database, id: &str) -> AppResult<Patient> {
    db.get_patient(id)?
        .ok_or_else(|| AppError::not_found(format!("patient {}", id)))
}

/// 신규 기록 대상 환자 (비활성 환자는 거부)
fn load_active_patient(db: &Database, id: &str) -> AppResult<Patient> {
    let patient = load_patient(db, id)?;
    if !patient.is_active() {
        return Err(AppError::BadRequest(format!(
            "비활성 환자입니다: {}",
            patient.patient_code
        )));
    }
    Ok(patient)
}

fn load_user(db: &Database, id: &str) -> AppResult<UserAccount> {
    db.get_user(id)?
        .ok_or_else(|| AppError::not_found(format!("user {}", id)))
}

fn field_error(field: &str, message: &str) -> AppError {
    let mut errors = ValidationErrors::default();
    errors.add(field, message);
    AppError::Validation(errors)
}

// ============ 인증 API ============

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserInfo,
    pub modules: Vec<Module>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub user: UserInfo,
    pub modules: Vec<Module>,
    pub permissions: RolePermissions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PermissionsResponse {
    pub role: Role,
    pub permissions: RolePermissions,
}

async fn login_api(
    State(state): State<ApiState>,
    payload: Result<Json<LoginForm>, JsonRejection>,
) -> ApiResult<LoginResponse> {
    let req = form(payload)?;
    let session = auth::login(&state.db, &state.sessions, &req.username, &req.password)?;
    let user = load_user(&state.db, &session.user_id)?;

    ok(LoginResponse {
        token: session.token,
        modules: accessible_modules(user.role),
        user: user.into(),
    })
}

async fn logout_api(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<()> {
    let session = state.sessions.authenticate(&headers)?;
    state.sessions.remove(&session.token);
    log::info!("로그아웃: {}", session.username);
    ok(())
}

async fn me_api(State(state): State<ApiState>, headers: HeaderMap) -> ApiResult<MeResponse> {
    let session = state.sessions.authenticate(&headers)?;
    let user = load_user(&state.db, &session.user_id)?;

    ok(MeResponse {
        modules: accessible_modules(user.role),
        permissions: role_permissions(user.role).clone(),
        user: user.into(),
    })
}

async fn permissions_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<PermissionsResponse> {
    let session = state.sessions.authenticate(&headers)?;
    ok(PermissionsResponse {
        role: session.role,
        permissions: role_permissions(session.role).clone(),
    })
}

async fn dashboard_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<DashboardSummary> {
    let session = state.authorize(&headers, Module::Dashboard, Action::View)?;
    ok(dashboard::build_summary(&state.db, &session, Utc::now())?)
}

// ============ 환자 API ============

async fn list_patients_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<Page<Patient>> {
    let session = state.authorize(&headers, Module::Patients, Action::View)?;
    let mut patients = state.db.list_patients()?;
    if let Some(own) = session.patient_scope() {
        patients.retain(|p| p.id == own);
    }
    ok(listing::apply(patients, &params))
}

async fn create_patient_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<PatientForm>, JsonRejection>,
) -> Created<Patient> {
    state.authorize(&headers, Module::Patients, Action::Create)?;
    let req = form(payload)?;

    let code = state.db.next_code("patient", "PT")?;
    let patient = req.into_patient(code)?;
    state.db.create_patient(&patient)?;
    created(patient)
}

async fn get_patient_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Patient> {
    let session = state.authorize(&headers, Module::Patients, Action::View)?;
    session.ensure_patient_access(&id)?;
    ok(load_patient(&state.db, &id)?)
}

async fn update_patient_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<PatientForm>, JsonRejection>,
) -> ApiResult<Patient> {
    let session = state.authorize(&headers, Module::Patients, Action::Update)?;
    let req = form(payload)?;

    let mut patient = load_patient(&state.db, &id)?;
    let before = patient.status;
    req.apply(&mut patient)?;
    if patient.status != before {
        // 비활성화는 삭제 권한과 같은 수준
        if patient.status == PatientStatus::Inactive {
            session.require(Module::Patients, Action::Delete)?;
        }
        log::info!("환자 상태 변경: {} {} -> {} (by {})", patient.id, before, patient.status, session.username);
    }
    state.db.update_patient(&patient)?;
    ok(patient)
}

/// 소프트 삭제 (Inactive 전환)
async fn delete_patient_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Patient> {
    let session = state.authorize(&headers, Module::Patients, Action::Delete)?;
    state.db.set_patient_status(&id, PatientStatus::Inactive)?;
    log::info!("환자 비활성화: {} (by {})", id, session.username);
    ok(load_patient(&state.db, &id)?)
}

async fn get_history_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<MedicalHistory> {
    let session = state.authorize(&headers, Module::Patients, Action::View)?;
    session.ensure_patient_access(&id)?;
    load_patient(&state.db, &id)?;

    let history = state
        .db
        .get_medical_history(&id)?
        .unwrap_or_else(|| MedicalHistory::empty(&id));
    ok(history)
}

async fn save_history_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<MedicalHistoryForm>, JsonRejection>,
) -> ApiResult<MedicalHistory> {
    state.authorize(&headers, Module::Patients, Action::Update)?;
    let req = form(payload)?;
    load_patient(&state.db, &id)?;

    let history = req.into_history(&id)?;
    state.db.save_medical_history(&history)?;
    ok(history)
}

async fn export_patient_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<PatientExport> {
    let session = state.authorize(&headers, Module::Patients, Action::View)?;
    session.ensure_patient_access(&id)?;
    let export = state.db.export_patient_data(&id)?;
    log::info!("환자 데이터 내보내기: {} (by {})", export.patient.patient_code, session.username);
    ok(export)
}

// ============ 예약 API ============

/// 예약 목록 추가 조건
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AppointmentQuery {
    pub patient_id: Option<String>,
    pub doctor_id: Option<String>,
    /// YYYY-MM-DD (해당 일자 예약만)
    pub date: Option<String>,
}

/// 담당의는 활성 의사 계정이어야 함
fn check_doctor(db: &Database, doctor_id: &str) -> AppResult<()> {
    match db.get_user(doctor_id)? {
        Some(u) if u.role == Role::Doctor && u.is_active => Ok(()),
        _ => Err(field_error("doctor_id", "담당 의사를 찾을 수 없습니다")),
    }
}

/// 같은 의사의 겹치는 예약이 있으면 409
fn load_appointment(db: &Database, id: &str) -> AppResult<Appointment> {
    db.get_appointment(id)?
        .ok_or_else(|| AppError::not_found(format!("appointment {}", id)))
}

async fn list_appointments_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<ListParams>,
    ApiQuery(query): ApiQuery<AppointmentQuery>,
) -> ApiResult<Page<Appointment>> {
    let session = state.authorize(&headers, Module::Appointments, Action::View)?;

    let (from, to) = match query.date.as_deref() {
        Some(d) if !d.trim().is_empty() => {
            let start = parse_date(d)?.and_time(NaiveTime::default()).and_utc();
            (Some(start), Some(start + chrono::Duration::days(1)))
        }
        _ => (None, None),
    };
    let filter = AppointmentFilter {
        patient_id: session.patient_scope().or(query.patient_id.as_deref()),
        doctor_id: query.doctor_id.as_deref(),
        from,
        to,
    };

    let appointments = state.db.list_appointments(&filter)?;
    ok(listing::apply(appointments, &params))
}

async fn create_appointment_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<AppointmentForm>, JsonRejection>,
) -> Created<Appointment> {
    let session = state.authorize(&headers, Module::Appointments, Action::Create)?;
    let req = form(payload)?;
    session.ensure_patient_access(req.patient_id.trim())?;

    let appt = req.into_appointment()?;
    load_active_patient(&state.db, &appt.patient_id)?;
    check_doctor(&state.db, &appt.doctor_id)?;

    // 겹침 검사는 저장과 같은 트랜잭션에서 수행 (409)
    state.db.create_appointment(&appt)?;
    log::info!(
        "예약 등록: {} {} (by {})",
        appt.patient_id,
        appt.scheduled_at.to_rfc3339(),
        session.username
    );
    created(appt)
}

async fn get_appointment_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Appointment> {
    let session = state.authorize(&headers, Module::Appointments, Action::View)?;
    let appt = load_appointment(&state.db, &id)?;
    session.ensure_patient_access(&appt.patient_id)?;
    ok(appt)
}

async fn update_appointment_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<AppointmentForm>, JsonRejection>,
) -> ApiResult<Appointment> {
    state.authorize(&headers, Module::Appointments, Action::Update)?;
    let req = form(payload)?;

    let mut appt = load_appointment(&state.db, &id)?;
    if appt.status.is_terminal() {
        return Err(AppError::BadRequest(format!(
            "종료된 예약은 수정할 수 없습니다 ({})",
            appt.status
        )));
    }
    req.apply(&mut appt)?;
    load_patient(&state.db, &appt.patient_id)?;
    check_doctor(&state.db, &appt.doctor_id)?;

    state.db.update_appointment(&appt)?;
    ok(appt)
}

async fn delete_appointment_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<()> {
    state.authorize(&headers, Module::Appointments, Action::Delete)?;
    state.db.delete_appointment(&id)?;
    ok(())
}

async fn appointment_status_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<AppointmentStatusForm>, JsonRejection>,
) -> ApiResult<Appointment> {
    let session = state.authorize(&headers, Module::Appointments, Action::Update)?;
    let req = form(payload)?;

    let mut appt = load_appointment(&state.db, &id)?;
    let from = appt.status;
    appt.transition(AppointmentStatus::parse(req.status.trim())?)?;
    state.db.save_appointment_status(&appt, from)?;
    log::info!("예약 상태 변경: {} -> {} (by {})", appt.id, appt.status, session.username);
    ok(appt)
}

// ============ 진료 기록 API ============

fn load_consultation(db: &Database, id: &str) -> AppResult<Consultation> {
    db.get_consultation(id)?
        .ok_or_else(|| AppError::not_found(format!("consultation {}", id)))
}

async fn list_consultations_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(patient_id): ApiPath<String>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<Page<Consultation>> {
    let session = state.authorize(&headers, Module::Consultations, Action::View)?;
    session.ensure_patient_access(&patient_id)?;
    load_patient(&state.db, &patient_id)?;

    let items = state.db.get_consultations_by_patient(&patient_id)?;
    ok(listing::apply(items, &params))
}

async fn create_consultation_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(patient_id): ApiPath<String>,
    payload: Result<Json<ConsultationForm>, JsonRejection>,
) -> Created<Consultation> {
    let session = state.authorize(&headers, Module::Consultations, Action::Create)?;
    let req = form(payload)?;
    load_active_patient(&state.db, &patient_id)?;

    let consultation = req.into_consultation(&patient_id, &session.user_id)?;
    state.db.create_consultation(&consultation)?;
    created(consultation)
}

async fn get_consultation_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Consultation> {
    let session = state.authorize(&headers, Module::Consultations, Action::View)?;
    let consultation = load_consultation(&state.db, &id)?;
    session.ensure_patient_access(&consultation.patient_id)?;
    ok(consultation)
}

async fn update_consultation_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<ConsultationForm>, JsonRejection>,
) -> ApiResult<Consultation> {
    state.authorize(&headers, Module::Consultations, Action::Update)?;
    let req = form(payload)?;

    let mut consultation = load_consultation(&state.db, &id)?;
    req.apply(&mut consultation)?;
    state.db.update_consultation(&consultation)?;
    ok(consultation)
}

async fn delete_consultation_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<()> {
    state.authorize(&headers, Module::Consultations, Action::Delete)?;
    state.db.delete_consultation(&id)?;
    ok(())
}

// ============ 처방 API ============

fn load_prescription(db: &Database, id: &str) -> AppResult<Prescription> {
    db.get_prescription(id)?
        .ok_or_else(|| AppError::not_found(format!("prescription {}", id)))
}

async fn list_prescriptions_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(patient_id): ApiPath<String>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<Page<Prescription>> {
    let session = state.authorize(&headers, Module::Prescriptions, Action::View)?;
    session.ensure_patient_access(&patient_id)?;
    load_patient(&state.db, &patient_id)?;

    let items = state.db.get_prescriptions_by_patient(&patient_id)?;
    ok(listing::apply(items, &params))
}

async fn create_prescription_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(patient_id): ApiPath<String>,
    payload: Result<Json<PrescriptionForm>, JsonRejection>,
) -> Created<Prescription> {
    let session = state.authorize(&headers, Module::Prescriptions, Action::Create)?;
    let req = form(payload)?;
    load_active_patient(&state.db, &patient_id)?;

    let prescription = req.into_prescription(&patient_id, &session.user_id)?;
    state.db.create_prescription(&prescription)?;
    created(prescription)
}

async fn get_prescription_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<Prescription> {
    let session = state.authorize(&headers, Module::Prescriptions, Action::View)?;
    let prescription = load_prescription(&state.db, &id)?;
    session.ensure_patient_access(&prescription.patient_id)?;
    ok(prescription)
}

async fn update_prescription_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<PrescriptionForm>, JsonRejection>,
) -> ApiResult<Prescription> {
    state.authorize(&headers, Module::Prescriptions, Action::Update)?;
    let req = form(payload)?;

    let mut prescription = load_prescription(&state.db, &id)?;
    req.apply(&mut prescription)?;
    state.db.update_prescription(&prescription)?;
    ok(prescription)
}

async fn delete_prescription_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<()> {
    state.authorize(&headers, Module::Prescriptions, Action::Delete)?;
    state.db.delete_prescription(&id)?;
    ok(())
}

// ============ 검사 결과 API ============

fn load_lab_report(db: &Database, id: &str) -> AppResult<LabReport> {
    db.get_lab_report(id)?
        .ok_or_else(|| AppError::not_found(format!("lab report {}", id)))
}

async fn list_lab_reports_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(patient_id): ApiPath<String>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<Page<LabReport>> {
    let session = state.authorize(&headers, Module::LabReports, Action::View)?;
    session.ensure_patient_access(&patient_id)?;
    load_patient(&state.db, &patient_id)?;

    let items = state.db.get_lab_reports_by_patient(&patient_id)?;
    ok(listing::apply(items, &params))
}

async fn create_lab_report_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(patient_id): ApiPath<String>,
    payload: Result<Json<LabReportForm>, JsonRejection>,
) -> Created<LabReport> {
    let session = state.authorize(&headers, Module::LabReports, Action::Create)?;
    let req = form(payload)?;
    load_active_patient(&state.db, &patient_id)?;

    let report = req.into_report(&patient_id, &session.user_id)?;
    state.db.create_lab_report(&report)?;
    created(report)
}

async fn get_lab_report_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<LabReport> {
    let session = state.authorize(&headers, Module::LabReports, Action::View)?;
    let report = load_lab_report(&state.db, &id)?;
    session.ensure_patient_access(&report.patient_id)?;
    ok(report)
}

async fn update_lab_report_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<LabReportForm>, JsonRejection>,
) -> ApiResult<LabReport> {
    state.authorize(&headers, Module::LabReports, Action::Update)?;
    let req = form(payload)?;

    let mut report = load_lab_report(&state.db, &id)?;
    req.apply(&mut report)?;
    state.db.update_lab_report(&report)?;
    ok(report)
}

async fn delete_lab_report_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<()> {
    state.authorize(&headers, Module::LabReports, Action::Delete)?;
    state.db.delete_lab_report(&id)?;
    ok(())
}

// ============ 수납 API ============

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InvoiceQuery {
    pub patient_id: Option<String>,
}

fn load_invoice(db: &Database, id: &str) -> AppResult<Invoice> {
    db.get_invoice(id)?
        .ok_or_else(|| AppError::not_found(format!("invoice {}", id)))
}

fn invoice_detail(db: &Database, invoice: Invoice) -> AppResult<InvoiceDetail> {
    let payments = db.get_payments_by_invoice(&invoice.id)?;
    Ok(InvoiceDetail {
        totals: invoice.totals(),
        invoice,
        payments,
    })
}

async fn list_invoices_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<ListParams>,
    ApiQuery(query): ApiQuery<InvoiceQuery>,
) -> ApiResult<Page<InvoiceDetail>> {
    let session = state.authorize(&headers, Module::Billing, Action::View)?;
    let scope = session.patient_scope().or(query.patient_id.as_deref());

    // 수납 내역은 현재 페이지 항목만 조회
    let page = listing::apply(state.db.list_invoices(scope)?, &params);
    let mut items = Vec::with_capacity(page.items.len());
    for inv in page.items {
        items.push(invoice_detail(&state.db, inv)?);
    }
    ok(Page {
        items,
        total: page.total,
        page: page.page,
        per_page: page.per_page,
        total_pages: page.total_pages,
    })
}

async fn create_invoice_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<InvoiceForm>, JsonRejection>,
) -> Created<InvoiceDetail> {
    let session = state.authorize(&headers, Module::Billing, Action::Create)?;
    let req = form(payload)?;
    load_patient(&state.db, req.patient_id.trim())?;

    let number = state.db.next_code("invoice", "INV")?;
    let invoice = req.into_invoice(number)?;
    state.db.create_invoice(&invoice)?;
    log::info!("청구서 발행: {} (by {})", invoice.invoice_number, session.username);
    created(invoice_detail(&state.db, invoice)?)
}

async fn get_invoice_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<InvoiceDetail> {
    let session = state.authorize(&headers, Module::Billing, Action::View)?;
    let invoice = load_invoice(&state.db, &id)?;
    session.ensure_patient_access(&invoice.patient_id)?;
    ok(invoice_detail(&state.db, invoice)?)
}

async fn update_invoice_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<InvoiceForm>, JsonRejection>,
) -> ApiResult<InvoiceDetail> {
    state.authorize(&headers, Module::Billing, Action::Update)?;
    let req = form(payload)?;

    let mut invoice = load_invoice(&state.db, &id)?;
    if !invoice.is_editable() {
        return Err(AppError::BadRequest(format!(
            "수정할 수 없는 청구서입니다 ({})",
            invoice.status
        )));
    }
    load_patient(&state.db, req.patient_id.trim())?;
    req.apply(&mut invoice)?;
    state.db.update_invoice(&invoice)?;
    ok(invoice_detail(&state.db, invoice)?)
}

/// 청구서 취소 (완납 청구서는 불가)
async fn cancel_invoice_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<InvoiceDetail> {
    let session = state.authorize(&headers, Module::Billing, Action::Delete)?;
    let mut invoice = load_invoice(&state.db, &id)?;
    if !invoice.is_editable() {
        return Err(AppError::BadRequest(format!(
            "취소할 수 없는 청구서입니다 ({})",
            invoice.status
        )));
    }

    invoice.status = InvoiceStatus::Cancelled;
    state.db.update_invoice(&invoice)?;
    log::info!("청구서 취소: {} (by {})", invoice.invoice_number, session.username);
    ok(invoice_detail(&state.db, invoice)?)
}

async fn record_payment_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<PaymentForm>, JsonRejection>,
) -> Created<InvoiceDetail> {
    let session = state.authorize(&headers, Module::Billing, Action::Update)?;
    let req = form(payload)?;

    let invoice = load_invoice(&state.db, &id)?;
    let payment = req.into_payment(&invoice.id, &session.user_id)?;
    let invoice = state.db.record_payment(&payment)?;
    created(invoice_detail(&state.db, invoice)?)
}

// ============ 사용자 관리 API ============

/// 대상 역할을 관리할 수 있는지 확인
fn ensure_can_manage(session: &Session, target: Role) -> AppResult<()> {
    if session.role.can_manage(target) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("cannot manage {} accounts", target)))
    }
}

/// 환자 계정은 실제 환자 기록과 연결
fn check_linked_patient(db: &Database, account: &UserAccount) -> AppResult<()> {
    match account.patient_id.as_deref() {
        Some(pid) if db.get_patient(pid)?.is_some() => Ok(()),
        Some(_) => Err(field_error("patient_id", "환자 기록을 찾을 수 없습니다")),
        None if account.role == Role::Patient => {
            Err(field_error("patient_id", "환자 계정은 환자 기록과 연결되어야 합니다"))
        }
        None => Ok(()),
    }
}

async fn list_users_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<Page<UserInfo>> {
    state.authorize(&headers, Module::Users, Action::View)?;
    ok(listing::apply(state.db.list_users()?, &params))
}

async fn create_user_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<UserForm>, JsonRejection>,
) -> Created<UserInfo> {
    let session = state.authorize(&headers, Module::Users, Action::Create)?;
    let req = form(payload)?;
    ensure_can_manage(&session, req.role()?)?;

    let account = req.into_account(auth::hash_password(&req.password)?)?;
    check_linked_patient(&state.db, &account)?;
    state.db.create_user(&account)?;
    created(UserInfo::from(account))
}

async fn get_user_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<UserInfo> {
    state.authorize(&headers, Module::Users, Action::View)?;
    ok(load_user(&state.db, &id)?.into())
}

async fn update_user_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
    payload: Result<Json<UserUpdateForm>, JsonRejection>,
) -> ApiResult<UserInfo> {
    let session = state.authorize(&headers, Module::Users, Action::Update)?;
    let req = form(payload)?;

    let mut account = load_user(&state.db, &id)?;
    let new_role = req.role()?;
    ensure_can_manage(&session, account.role)?;
    ensure_can_manage(&session, new_role)?;
    if account.id == session.user_id && (!req.is_active || new_role != account.role) {
        return Err(AppError::BadRequest(
            "자신의 계정은 비활성화하거나 역할을 변경할 수 없습니다".to_string(),
        ));
    }

    let old_role = account.role;
    let old_patient = account.patient_id.clone();
    req.apply(&mut account)?;
    let password_changed = match req.new_password() {
        Some(pw) => {
            account.password_hash = auth::hash_password(pw)?;
            true
        }
        None => false,
    };
    check_linked_patient(&state.db, &account)?;
    state.db.update_user(&account)?;

    // 세션에 담긴 권한 범위가 바뀌면 기존 세션 종료
    let scope_changed = account.role != old_role || account.patient_id != old_patient;
    if !account.is_active || scope_changed || password_changed {
        let dropped = state.sessions.remove_user_sessions(&account.id);
        log::info!("세션 종료: {} ({}개)", account.username, dropped);
    }
    ok(account.into())
}

async fn delete_user_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiPath(id): ApiPath<String>,
) -> ApiResult<()> {
    let session = state.authorize(&headers, Module::Users, Action::Delete)?;
    let account = load_user(&state.db, &id)?;
    if account.id == session.user_id {
        return Err(AppError::BadRequest("자신의 계정은 삭제할 수 없습니다".to_string()));
    }
    ensure_can_manage(&session, account.role)?;

    state.db.delete_user(&account.id)?;
    state.sessions.remove_user_sessions(&account.id);
    ok(())
}

// ============ 설정 API ============

async fn get_settings_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<ClinicSettings> {
    state.authorize(&headers, Module::Settings, Action::View)?;
    ok(state.db.get_clinic_settings()?.unwrap_or_default())
}

async fn save_settings_api(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<ClinicSettingsForm>, JsonRejection>,
) -> ApiResult<ClinicSettings> {
    state.authorize(&headers, Module::Settings, Action::Update)?;
    let req = form(payload)?;

    let mut settings = state.db.get_clinic_settings()?.unwrap_or_default();
    req.apply(&mut settings);
    state.db.save_clinic_settings(&settings)?;
    ok(settings)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    pub fn test_state() -> ApiState {
        let db = Database::open_in_memory().unwrap();
        db.ensure_bootstrap_admin("admin", "changeme123").unwrap();
        ApiState::new(Arc::new(db), SessionStore::new(24))
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", t));
        }
        let request = match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn login(app: &Router, username: &str, password: &str) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "username": username, "password": password })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["data"]["token"].as_str().unwrap().to_string()
    }

    async fn create_user(app: &Router, token: &str, username: &str, role: &str, patient_id: Option<&str>) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/users",
            Some(token),
            Some(json!({
                "username": username,
                "full_name": format!("{} user", role),
                "password": "password123",
                "role": role,
                "patient_id": patient_id,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["data"]["id"].as_str().unwrap().to_string()
    }

    async fn create_patient(app: &Router, token: &str, first_name: &str) -> Value {
        let (status, body) = call(
            app,
            Method::POST,
            "/patients",
            Some(token),
            Some(json!({
                "first_name": first_name,
                "last_name": "Park",
                "date_of_birth": "1990-03-15",
                "gender": "female",
                "phone": "010-1234-5678",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body["data"].clone()
    }

    #[tokio::test]
    async fn test_login_me_logout() {
        let app = create_web_api_router(test_state());

        let (status, body) = call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "username": "admin", "password": "wrongpass1" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = call(&app, Method::GET, "/auth/me", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = login(&app, "admin", "changeme123").await;
        let (status, body) = call(&app, Method::GET, "/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["user"]["role"], "super_admin");
        assert_eq!(body["data"]["permissions"]["billing"]["delete"], true);
        assert!(body["data"]["user"].get("password_hash").is_none());

        let (status, _) = call(&app, Method::POST, "/auth/logout", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::GET, "/auth/me", Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_role_permissions_enforced() {
        let app = create_web_api_router(test_state());
        let admin = login(&app, "admin", "changeme123").await;
        create_user(&app, &admin, "nurse.kim", "nurse", None).await;
        let nurse = login(&app, "nurse.kim", "password123").await;

        let (status, _) = call(&app, Method::GET, "/patients", Some(&nurse), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::GET, "/invoices", Some(&nurse), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], false);
        let (status, _) = call(&app, Method::GET, "/users", Some(&nurse), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&app, Method::GET, "/permissions", Some(&nurse), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["role"], "nurse");
        assert_eq!(body["data"]["permissions"]["billing"]["view"], false);

        let (status, body) = call(&app, Method::GET, "/dashboard", Some(&nurse), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["cards"]["unpaid_invoices"].is_null());
    }

    #[tokio::test]
    async fn test_patient_validation_and_soft_delete() {
        let app = create_web_api_router(test_state());
        let token = login(&app, "admin", "changeme123").await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/patients",
            Some(&token),
            Some(json!({
                "first_name": "",
                "last_name": "Lee",
                "date_of_birth": "2999-01-01",
                "gender": "unknown",
                "phone": "12",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        for field in ["first_name", "date_of_birth", "gender", "phone"] {
            assert!(body["errors"][field].is_array(), "{} 오류 누락", field);
        }

        let patient = create_patient(&app, &token, "Soyeon").await;
        assert_eq!(patient["patient_code"], "PT-000001");
        create_patient(&app, &token, "Minji").await;
        let id = patient["id"].as_str().unwrap();

        let (status, body) = call(&app, Method::GET, "/patients?search=soy", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);

        let (status, body) = call(&app, Method::DELETE, &format!("/patients/{}", id), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "Inactive");

        let (status, body) = call(&app, Method::GET, "/patients?status=Active", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);

        let (status, _) = call(&app, Method::GET, "/patients/missing", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/patients/{}", id),
            Some(&token),
            Some(json!({
                "first_name": "Soyeon",
                "last_name": "Park",
                "date_of_birth": "1990-03-15",
                "gender": "female",
                "phone": "010-1234-5678",
                "status": "Active",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["status"], "Active");
        let (_, body) = call(&app, Method::GET, "/patients?status=Active", Some(&token), None).await;
        assert_eq!(body["data"]["total"], 2);

        // 의사는 수정 권한만 있으므로 비활성화 불가
        create_user(&app, &token, "dr.kim", "doctor", None).await;
        let doctor = login(&app, "dr.kim", "password123").await;
        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/patients/{}", id),
            Some(&doctor),
            Some(json!({
                "first_name": "Soyeon",
                "last_name": "Park",
                "date_of_birth": "1990-03-15",
                "gender": "female",
                "phone": "010-1234-5678",
                "status": "Inactive",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (_, body) = call(&app, Method::GET, &format!("/patients/{}", id), Some(&token), None).await;
        assert_eq!(body["data"]["status"], "Active");

        let (status, body) = call(&app, Method::GET, &format!("/patients/{}/history", id), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["smoking"], "never");
    }

    #[tokio::test]
    async fn test_appointment_overlap_and_completion() {
        let app = create_web_api_router(test_state());
        let token = login(&app, "admin", "changeme123").await;
        let doctor_id = create_user(&app, &token, "dr.han", "doctor", None).await;
        let patient = create_patient(&app, &token, "Yerin").await;
        let patient_id = patient["id"].as_str().unwrap();

        let booking = |at: &str| {
            json!({
                "patient_id": patient_id,
                "doctor_id": doctor_id,
                "scheduled_at": at,
                "duration_minutes": 30,
                "appointment_type": "consultation",
            })
        };

        let (status, body) = call(
            &app,
            Method::POST,
            "/appointments",
            Some(&token),
            Some(booking("2030-01-10T09:00:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        let appt_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            Method::POST,
            "/appointments",
            Some(&token),
            Some(booking("2030-01-10T09:15:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            Method::POST,
            "/appointments",
            Some(&token),
            Some(booking("2030-01-10T09:30:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let status_uri = format!("/appointments/{}/status", appt_id);
        let (status, body) = call(
            &app,
            Method::POST,
            &status_uri,
            Some(&token),
            Some(json!({ "status": "completed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "completed");

        let (status, _) = call(
            &app,
            Method::POST,
            &status_uri,
            Some(&token),
            Some(json!({ "status": "confirmed" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, Method::GET, &format!("/patients/{}", patient_id), Some(&token), None).await;
        assert_eq!(body["data"]["visit_count"], 1);

        let (status, body) = call(&app, Method::GET, "/appointments?date=2030-01-10", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 2);
    }

    #[tokio::test]
    async fn test_invoice_payments() {
        let app = create_web_api_router(test_state());
        let token = login(&app, "admin", "changeme123").await;
        let patient = create_patient(&app, &token, "Dahye").await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/invoices",
            Some(&token),
            Some(json!({
                "patient_id": patient["id"],
                "items": [
                    { "description": "Consultation", "quantity": 1, "unit_price_cents": 3000 },
                    { "description": "Blood test", "quantity": 2, "unit_price_cents": 1000 }
                ],
                "tax_rate_bp": 1000,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["data"]["invoice_number"], "INV-000001");
        assert_eq!(body["data"]["totals"]["total_cents"], 5500);
        let id = body["data"]["id"].as_str().unwrap().to_string();
        let pay_uri = format!("/invoices/{}/payments", id);

        let (status, _) = call(
            &app,
            Method::POST,
            &pay_uri,
            Some(&token),
            Some(json!({ "amount_cents": 9000, "method": "cash" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::POST,
            &pay_uri,
            Some(&token),
            Some(json!({ "amount_cents": 2500, "method": "card" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["status"], "partially_paid");
        assert_eq!(body["data"]["totals"]["balance_cents"], 3000);
        assert_eq!(body["data"]["payments"].as_array().unwrap().len(), 1);

        call(
            &app,
            Method::POST,
            &pay_uri,
            Some(&token),
            Some(json!({ "amount_cents": 3000, "method": "cash" })),
        )
        .await;
        let (status, _) = call(&app, Method::DELETE, &format!("/invoices/{}", id), Some(&token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, Method::GET, "/invoices?status=paid", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);
    }

    async fn create_invoice(app: &Router, token: &str, patient_id: &Value, price: i64, discount: i64) -> (StatusCode, Value) {
        call(
            app,
            Method::POST,
            "/invoices",
            Some(token),
            Some(json!({
                "patient_id": patient_id,
                "items": [{ "description": "Consultation", "quantity": 1, "unit_price_cents": price }],
                "discount_cents": discount,
            })),
        )
        .await
    }

    #[tokio::test]
    async fn test_invoice_edge_cases() {
        let app = create_web_api_router(test_state());
        let token = login(&app, "admin", "changeme123").await;
        let patient = create_patient(&app, &token, "Eunji").await;

        let (status, body) = create_invoice(&app, &token, &patient["id"], 1_000, 1_500).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"]["discount_cents"].is_array());

        let (status, body) = create_invoice(&app, &token, &patient["id"], 2_000, 2_000).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["status"], "paid");
        assert_eq!(body["data"]["totals"]["total_cents"], 0);

        let (_, body) = create_invoice(&app, &token, &patient["id"], 5_000, 0).await;
        let id = body["data"]["id"].as_str().unwrap().to_string();
        let pay_uri = format!("/invoices/{}/payments", id);
        let (status, _) = call(
            &app,
            Method::POST,
            &pay_uri,
            Some(&token),
            Some(json!({ "amount_cents": 4000, "method": "cash" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        // 총액을 납부액보다 작게 수정할 수 없음
        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/invoices/{}", id),
            Some(&token),
            Some(json!({
                "patient_id": patient["id"],
                "items": [{ "description": "Consultation", "quantity": 1, "unit_price_cents": 3000 }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            &app,
            Method::POST,
            &pay_uri,
            Some(&token),
            Some(json!({ "amount_cents": 1000, "method": "card" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = call(
            &app,
            Method::POST,
            &pay_uri,
            Some(&token),
            Some(json!({ "amount_cents": 1, "method": "card" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);

        let (_, body) = create_invoice(&app, &token, &patient["id"], 3_000, 0).await;
        let cancelled_id = body["data"]["id"].as_str().unwrap().to_string();
        let (status, body) = call(&app, Method::DELETE, &format!("/invoices/{}", cancelled_id), Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "cancelled");
        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/invoices/{}/payments", cancelled_id),
            Some(&token),
            Some(json!({ "amount_cents": 100, "method": "cash" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::POST,
            "/invoices",
            Some(&token),
            Some(json!({
                "patient_id": patient["id"],
                "items": [{ "description": "MRI", "quantity": i64::MAX, "unit_price_cents": 2 }],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"]["items[0].quantity"].is_array());
    }

    #[tokio::test]
    async fn test_malformed_requests_use_envelope() {
        let app = create_web_api_router(test_state());
        let token = login(&app, "admin", "changeme123").await;

        let (status, body) = call(&app, Method::GET, "/patients?page=abc", Some(&token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());

        let (status, body) = call(&app, Method::GET, "/appointments?order=sideways", Some(&token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(&app, Method::GET, "/no-such-route", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_patient_account_sees_only_own_records() {
        let app = create_web_api_router(test_state());
        let admin = login(&app, "admin", "changeme123").await;
        let mine = create_patient(&app, &admin, "Jia").await;
        let other = create_patient(&app, &admin, "Hyejin").await;
        let mine_id = mine["id"].as_str().unwrap();
        let other_id = other["id"].as_str().unwrap();

        create_user(&app, &admin, "jia.park", "patient", Some(mine_id)).await;
        let token = login(&app, "jia.park", "password123").await;

        let (status, body) = call(&app, Method::GET, "/patients", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["items"][0]["id"], mine_id);

        let (status, _) = call(&app, Method::GET, &format!("/patients/{}", other_id), Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/patients/{}/consultations", other_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/patients/{}/lab-reports", mine_id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&app, Method::POST, "/patients", Some(&token), Some(json!({}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_user_management_rules() {
        let app = create_web_api_router(test_state());
        let root = login(&app, "admin", "changeme123").await;
        create_user(&app, &root, "office.admin", "admin", None).await;
        let nurse_id = create_user(&app, &root, "nurse.lee", "nurse", None).await;
        let admin = login(&app, "office.admin", "password123").await;

        // admin 은 super_admin 계정을 만들 수 없음
        let (status, _) = call(
            &app,
            Method::POST,
            "/users",
            Some(&admin),
            Some(json!({
                "username": "root2",
                "full_name": "Root",
                "password": "password123",
                "role": "super_admin",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            Method::POST,
            "/users",
            Some(&admin),
            Some(json!({
                "username": "nurse.lee",
                "full_name": "Duplicate",
                "password": "password123",
                "role": "nurse",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let nurse = login(&app, "nurse.lee", "password123").await;
        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/users/{}", nurse_id),
            Some(&admin),
            Some(json!({
                "full_name": "Nurse Lee",
                "role": "nurse",
                "is_active": false,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["is_active"], false);

        let (status, _) = call(&app, Method::GET, "/dashboard", Some(&nurse), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = call(&app, Method::GET, "/users?status=nurse", Some(&root), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);

        let (_, me) = call(&app, Method::GET, "/auth/me", Some(&admin), None).await;
        let admin_id = me["data"]["user"]["id"].as_str().unwrap().to_string();
        let (status, body) = call(&app, Method::DELETE, &format!("/users/{}", admin_id), Some(&admin), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(&app, Method::DELETE, &format!("/users/{}", nurse_id), Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_relinking_patient_account_ends_sessions() {
        let app = create_web_api_router(test_state());
        let admin = login(&app, "admin", "changeme123").await;
        let first = create_patient(&app, &admin, "Sora").await;
        let second = create_patient(&app, &admin, "Haneul").await;
        let user_id = create_user(&app, &admin, "sora.kim", "patient", first["id"].as_str()).await;
        let token = login(&app, "sora.kim", "password123").await;

        let first_uri = format!("/patients/{}", first["id"].as_str().unwrap());
        let (status, _) = call(&app, Method::GET, &first_uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/users/{}", user_id),
            Some(&admin),
            Some(json!({
                "full_name": "Sora Kim",
                "role": "patient",
                "is_active": true,
                "patient_id": second["id"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        // 이전 환자 범위를 가진 토큰은 더 이상 쓸 수 없음
        let (status, _) = call(&app, Method::GET, &first_uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = login(&app, "sora.kim", "password123").await;
        let (status, _) = call(&app, Method::GET, &first_uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let app = create_web_api_router(test_state());
        let token = login(&app, "admin", "changeme123").await;

        let (status, body) = call(
            &app,
            Method::PUT,
            "/settings",
            Some(&token),
            Some(json!({ "clinic_name": "Hanbit Clinic", "currency": "krw" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["errors"]["currency"].is_array());

        let (status, _) = call(
            &app,
            Method::PUT,
            "/settings",
            Some(&token),
            Some(json!({ "clinic_name": "Hanbit Clinic", "currency": "KRW" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, Method::GET, "/settings", Some(&token), None).await;
        assert_eq!(body["data"]["clinic_name"], "Hanbit Clinic");
        assert_eq!(body["data"]["currency"], "KRW");
    }
}

//! 역할별 대시보드 요약

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Session;
use crate::db::Database;
use crate::error::AppResult;
use crate::permissions::{accessible_modules, has_permission, Action, Module};

/// 대시보드 카드 (조회 권한이 없는 모듈은 None)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardCards {
    pub active_patients: Option<i64>,
    pub todays_appointments: Option<i64>,
    pub upcoming_appointments: Option<i64>,
    pub pending_lab_reports: Option<i64>,
    pub active_prescriptions: Option<i64>,
    pub unpaid_invoices: Option<i64>,
    pub outstanding_cents: Option<i64>,
    pub active_users: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub full_name: String,
    pub role: String,
    pub role_label: String,
    /// 메뉴 구성용
    pub modules: Vec<Module>,
    pub cards: DashboardCards,
    pub generated_at: DateTime<Utc>,
}

/// 세션 기준 대시보드 요약 생성
pub fn build_summary(db: &Database, session: &Session, now: DateTime<Utc>) -> AppResult<DashboardSummary> {
    let counts = db.dashboard_counts(session.patient_scope(), now)?;
    let can = |module: Module| has_permission(session.role, module, Action::View);
    let when = |module: Module, value: i64| can(module).then_some(value);

    let cards = DashboardCards {
        active_patients: when(Module::Patients, counts.active_patients),
        todays_appointments: when(Module::Appointments, counts.todays_appointments),
        upcoming_appointments: when(Module::Appointments, counts.upcoming_appointments),
        pending_lab_reports: when(Module::LabReports, counts.pending_lab_reports),
        active_prescriptions: when(Module::Prescriptions, counts.active_prescriptions),
        unpaid_invoices: when(Module::Billing, counts.unpaid_invoices),
        outstanding_cents: when(Module::Billing, counts.outstanding_cents),
        active_users: when(Module::Users, counts.active_users),
    };

    Ok(DashboardSummary {
        full_name: session.full_name.clone(),
        role: session.role.as_str().to_string(),
        role_label: session.role.label().to_string(),
        modules: accessible_modules(session.role),
        cards,
        generated_at: now,
    })
}

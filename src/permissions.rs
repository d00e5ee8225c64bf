//! 역할별 권한 테이블
//!
//! 역할(Role) × 모듈(Module) 마다 view/create/update/delete 권한을 정적으로 정의합니다.
//! 모든 역할이 모든 모듈에 대한 항목을 가지므로 기본값 처리가 필요 없습니다.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// 사용자 역할 (고정된 8종)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Admin,
    Doctor,
    Nurse,
    Receptionist,
    Pharmacist,
    LabTechnician,
    Patient,
}

impl Role {
    pub const ALL: [Role; 8] = [
        Role::SuperAdmin,
        Role::Admin,
        Role::Doctor,
        Role::Nurse,
        Role::Receptionist,
        Role::Pharmacist,
        Role::LabTechnician,
        Role::Patient,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::Admin => "admin",
            Role::Doctor => "doctor",
            Role::Nurse => "nurse",
            Role::Receptionist => "receptionist",
            Role::Pharmacist => "pharmacist",
            Role::LabTechnician => "lab_technician",
            Role::Patient => "patient",
        }
    }

    /// 화면 표시용 이름
    pub fn label(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "Super Admin",
            Role::Admin => "Admin",
            Role::Doctor => "Doctor",
            Role::Nurse => "Nurse",
            Role::Receptionist => "Receptionist",
            Role::Pharmacist => "Pharmacist",
            Role::LabTechnician => "Lab Technician",
            Role::Patient => "Patient",
        }
    }

    /// 직원 역할 여부 (환자 계정 제외)
    pub fn is_staff(&self) -> bool {
        !matches!(self, Role::Patient)
    }

    /// 이 역할이 `target` 역할의 계정을 생성/수정/삭제할 수 있는지
    pub fn can_manage(&self, target: Role) -> bool {
        match self {
            Role::SuperAdmin => true,
            Role::Admin => !matches!(target, Role::SuperAdmin | Role::Admin),
            _ => false,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| AppError::BadRequest(format!("알 수 없는 역할: {}", s)))
    }
}

/// 기능 영역
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Dashboard,
    Patients,
    Appointments,
    Consultations,
    Prescriptions,
    LabReports,
    Billing,
    Users,
    Settings,
}

impl Module {
    pub const ALL: [Module; 9] = [
        Module::Dashboard,
        Module::Patients,
        Module::Appointments,
        Module::Consultations,
        Module::Prescriptions,
        Module::LabReports,
        Module::Billing,
        Module::Users,
        Module::Settings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Dashboard => "dashboard",
            Module::Patients => "patients",
            Module::Appointments => "appointments",
            Module::Consultations => "consultations",
            Module::Prescriptions => "prescriptions",
            Module::LabReports => "lab_reports",
            Module::Billing => "billing",
            Module::Users => "users",
            Module::Settings => "settings",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    View,
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// 단일 모듈에 대한 CRUD 권한
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permission {
    pub view: bool,
    pub create: bool,
    pub update: bool,
    pub delete: bool,
}

impl Permission {
    const fn new(view: bool, create: bool, update: bool, delete: bool) -> Self {
        Self { view, create, update, delete }
    }

    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::View => self.view,
            Action::Create => self.create,
            Action::Update => self.update,
            Action::Delete => self.delete,
        }
    }
}

const NONE: Permission = Permission::new(false, false, false, false);
const VIEW: Permission = Permission::new(true, false, false, false);
const VIEW_CREATE: Permission = Permission::new(true, true, false, false);
const VIEW_UPDATE: Permission = Permission::new(true, false, true, false);
const EDIT: Permission = Permission::new(true, true, true, false);
const FULL: Permission = Permission::new(true, true, true, true);

/// 역할 하나의 모듈별 권한
pub type RolePermissions = BTreeMap<Module, Permission>;

fn role_row(role: Role) -> [Permission; 9] {
    use Role::*;
    // 순서: dashboard, patients, appointments, consultations, prescriptions,
    //       lab_reports, billing, users, settings
    match role {
        SuperAdmin => [FULL; 9],
        Admin => [VIEW, FULL, FULL, VIEW, VIEW, VIEW, FULL, FULL, VIEW_UPDATE],
        Doctor => [VIEW, EDIT, EDIT, FULL, FULL, EDIT, VIEW, NONE, VIEW],
        Nurse => [VIEW, VIEW_UPDATE, EDIT, EDIT, VIEW, VIEW_CREATE, NONE, NONE, NONE],
        Receptionist => [VIEW, EDIT, FULL, NONE, NONE, NONE, EDIT, NONE, NONE],
        Pharmacist => [VIEW, VIEW, NONE, NONE, VIEW_UPDATE, NONE, VIEW, NONE, NONE],
        LabTechnician => [VIEW, VIEW, NONE, NONE, NONE, EDIT, NONE, NONE, NONE],
        Patient => [VIEW, VIEW, VIEW_CREATE, VIEW, VIEW, VIEW, VIEW, NONE, NONE],
    }
}

static PERMISSION_TABLE: Lazy<HashMap<Role, RolePermissions>> = Lazy::new(|| {
    Role::ALL
        .iter()
        .map(|&role| {
            let row = role_row(role);
            let perms = Module::ALL.iter().copied().zip(row).collect();
            (role, perms)
        })
        .collect()
});

/// 역할의 전체 권한 조회
pub fn role_permissions(role: Role) -> &'static RolePermissions {
    // 테이블은 Role::ALL 전체로 채워지므로 항상 존재
    &PERMISSION_TABLE[&role]
}

pub fn has_permission(role: Role, module: Module, action: Action) -> bool {
    role_permissions(role)
        .get(&module)
        .map(|p| p.allows(action))
        .unwrap_or(false)
}

/// 조회 권한이 있는 모듈 목록 (대시보드 메뉴 구성용)
pub fn accessible_modules(role: Role) -> Vec<Module> {
    Module::ALL
        .iter()
        .copied()
        .filter(|&m| has_permission(role, m, Action::View))
        .collect()
}

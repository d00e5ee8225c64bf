use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::permissions::Role;

/// DB 컬럼과 JSON 에서 같은 문자열 태그를 쓰는 열거형 정의
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $tag)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
            pub const TAGS: &'static [&'static str] = &[$($tag),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }

            pub fn parse(s: &str) -> AppResult<Self> {
                match s {
                    $($tag => Ok($name::$variant),)+
                    other => Err(AppError::BadRequest(format!(
                        "{}: 알 수 없는 값 '{}'", stringify!($name), other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ============ 의원 설정 ============

/// 의원 설정 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicSettings {
    pub id: String,
    pub clinic_name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub currency: String, // ISO 4217 (예: KRW, USD)
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ClinicSettings {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            clinic_name: "Clinic".to_string(),
            address: None,
            phone: None,
            email: None,
            currency: "USD".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============ 환자 ============

text_enum!(
    /// 성별
    Gender { Male => "male", Female => "female", Other => "other" }
);

text_enum!(
    /// 환자 상태 (삭제는 Inactive 로 전환)
    PatientStatus { Active => "Active", Inactive => "Inactive" }
);

/// 환자 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    pub patient_code: String, // PT-000001
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub blood_group: Option<String>,
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub status: PatientStatus,
    pub visit_count: i64,
    pub last_visit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// 기준일 시점의 만 나이
    pub fn age_on(&self, today: NaiveDate) -> u32 {
        today.years_since(self.date_of_birth).unwrap_or(0)
    }

    pub fn is_active(&self) -> bool {
        self.status == PatientStatus::Active
    }
}

text_enum!(
    /// 흡연 여부
    SmokingStatus { Never => "never", Former => "former", Current => "current" }
);

text_enum!(
    /// 음주 빈도
    AlcoholUse { None => "none", Occasional => "occasional", Regular => "regular" }
);

/// 병력 (환자당 1건)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicalHistory {
    pub patient_id: String,
    pub allergies: Option<String>,
    pub chronic_conditions: Option<String>,
    pub past_surgeries: Option<String>,
    pub family_history: Option<String>,
    pub current_medications: Option<String>,
    pub smoking: SmokingStatus,
    pub alcohol: AlcoholUse,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl MedicalHistory {
    /// 기록이 없는 환자의 빈 병력
    pub fn empty(patient_id: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            allergies: None,
            chronic_conditions: None,
            past_surgeries: None,
            family_history: None,
            current_medications: None,
            smoking: SmokingStatus::Never,
            alcohol: AlcoholUse::None,
            notes: None,
            updated_at: Utc::now(),
        }
    }
}

// ============ 예약 ============

text_enum!(
    AppointmentType {
        Consultation => "consultation",
        FollowUp => "follow_up",
        Checkup => "checkup",
        Emergency => "emergency",
        Procedure => "procedure",
    }
);

text_enum!(
    /// 예약 상태
    AppointmentStatus {
        Scheduled => "scheduled",
        Confirmed => "confirmed",
        Completed => "completed",
        Cancelled => "cancelled",
        NoShow => "no_show",
    }
);

impl AppointmentStatus {
    /// 종료 상태 (더 이상 변경 불가)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }

    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match self {
            Scheduled => matches!(next, Confirmed | Completed | Cancelled | NoShow),
            Confirmed => matches!(next, Completed | Cancelled | NoShow),
            Completed | Cancelled | NoShow => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub appointment_type: AppointmentType,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.scheduled_at + chrono::Duration::minutes(self.duration_minutes)
    }

    /// 시간대가 겹치는지 (끝 시각 == 시작 시각은 겹치지 않음)
    pub fn overlaps(&self, start: DateTime<Utc>, duration_minutes: i64) -> bool {
        let end = start + chrono::Duration::minutes(duration_minutes);
        self.scheduled_at < end && start < self.ends_at()
    }

    /// 상태 전이 적용
    pub fn transition(&mut self, next: AppointmentStatus) -> AppResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::BadRequest(format!(
                "예약 상태를 {}에서 {}(으)로 변경할 수 없습니다",
                self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

// ============ 진료 기록 ============

/// 활력 징후
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    pub blood_pressure: Option<String>, // 120/80
    pub pulse: Option<i64>,             // bpm
    pub temperature: Option<f64>,       // °C
    pub weight: Option<f64>,            // kg
    pub height: Option<f64>,            // cm
}

impl Vitals {
    /// 체질량지수 (키/몸무게가 모두 있을 때)
    pub fn bmi(&self) -> Option<f64> {
        match (self.weight, self.height) {
            (Some(w), Some(h)) if h > 0.0 => {
                let m = h / 100.0;
                Some((w / (m * m) * 10.0).round() / 10.0)
            }
            _ => None,
        }
    }
}

/// 진료 기록
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consultation {
    pub id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub appointment_id: Option<String>,
    pub consultation_date: NaiveDate,
    pub chief_complaint: String,
    pub symptoms: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_plan: Option<String>,
    pub vitals: Vitals,
    pub follow_up_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============ 처방 ============

/// 처방 약품 항목
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationItem {
    pub name: String,
    pub dosage: String,    // 500mg
    pub frequency: String, // 1일 3회
    pub duration_days: i64,
    pub instructions: Option<String>,
}

text_enum!(
    PrescriptionStatus {
        Active => "active",
        Dispensed => "dispensed",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prescription {
    pub id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub consultation_id: Option<String>,
    pub prescribed_on: NaiveDate,
    pub medications: Vec<MedicationItem>,
    pub status: PrescriptionStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============ 검사 결과 ============

text_enum!(
    LabStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

text_enum!(
    ResultFlag { Normal => "normal", Low => "low", High => "high", Critical => "critical" }
);

/// 검사 항목별 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabResultItem {
    pub parameter: String,
    pub value: String,
    pub unit: Option<String>,
    pub reference_range: Option<String>,
    pub flag: ResultFlag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabReport {
    pub id: String,
    pub patient_id: String,
    pub ordered_by: String,
    pub test_name: String,
    pub test_category: String,
    pub sample_type: Option<String>,
    pub status: LabStatus,
    pub results: Vec<LabResultItem>,
    pub remarks: Option<String>,
    pub ordered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LabReport {
    /// 이상 소견 항목 존재 여부
    pub fn has_abnormal_results(&self) -> bool {
        self.results.iter().any(|r| r.flag != ResultFlag::Normal)
    }

    /// 상태 변경 (완료 시각 기록 포함)
    pub fn set_status(&mut self, status: LabStatus) {
        if status == LabStatus::Completed && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        } else if status != LabStatus::Completed {
            self.completed_at = None;
        }
        self.status = status;
    }
}

// ============ 수납 ============

/// 청구서 항목 (금액은 최소 화폐 단위)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

/// 항목당 최대 수량
pub const MAX_ITEM_QUANTITY: i64 = 10_000;
/// 항목 단가 상한 (최소 화폐 단위)
pub const MAX_UNIT_PRICE_CENTS: i64 = 10_000_000_000;
/// 청구서 공급가 합계 상한
pub const MAX_SUBTOTAL_CENTS: i64 = 1_000_000_000_000_000;

impl InvoiceItem {
    /// 수량 x 단가 (범위를 넘으면 None)
    pub fn line_total(&self) -> Option<i64> {
        self.quantity.checked_mul(self.unit_price_cents)
    }
}

/// 항목 합계 (곱셈/덧셈 중 범위를 넘으면 None)
pub fn checked_subtotal(items: &[InvoiceItem]) -> Option<i64> {
    items
        .iter()
        .try_fold(0i64, |acc, item| acc.checked_add(item.line_total()?))
}

text_enum!(
    InvoiceStatus {
        Unpaid => "unpaid",
        PartiallyPaid => "partially_paid",
        Paid => "paid",
        Cancelled => "cancelled",
    }
);

text_enum!(
    PaymentMethod {
        Cash => "cash",
        Card => "card",
        Insurance => "insurance",
        BankTransfer => "bank_transfer",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub invoice_number: String, // INV-000001
    pub patient_id: String,
    pub items: Vec<InvoiceItem>,
    pub discount_cents: i64,
    pub tax_rate_bp: i64, // 1000 = 10%
    pub amount_paid_cents: i64,
    pub status: InvoiceStatus,
    pub due_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 청구 금액 요약
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub amount_paid_cents: i64,
    pub balance_cents: i64,
}

/// 공급가 합계 / 할인 / 세율로 세액과 총액 계산 (세액은 반올림)
///
/// 검증을 거친 입력은 범위 안에 있으므로, 범위를 넘는 값은 i64::MAX 로 고정
pub fn compute_totals(items: &[InvoiceItem], discount_cents: i64, tax_rate_bp: i64) -> (i64, i64, i64) {
    let subtotal = checked_subtotal(items).unwrap_or(i64::MAX);
    let taxable = subtotal.saturating_sub(discount_cents).max(0);
    let tax = (i128::from(taxable) * i128::from(tax_rate_bp) + 5_000) / 10_000;
    let tax = i64::try_from(tax).unwrap_or(i64::MAX);
    (subtotal, tax, taxable.saturating_add(tax))
}

impl Invoice {
    pub fn totals(&self) -> InvoiceTotals {
        let (subtotal, tax, total) = compute_totals(&self.items, self.discount_cents, self.tax_rate_bp);
        InvoiceTotals {
            subtotal_cents: subtotal,
            discount_cents: self.discount_cents,
            tax_cents: tax,
            total_cents: total,
            amount_paid_cents: self.amount_paid_cents,
            balance_cents: total.saturating_sub(self.amount_paid_cents).max(0),
        }
    }

    pub fn balance_cents(&self) -> i64 {
        self.totals().balance_cents
    }

    /// 납부액 기준으로 상태 재계산 (취소된 청구서는 유지)
    pub fn refresh_status(&mut self) {
        if self.status == InvoiceStatus::Cancelled {
            return;
        }
        let total = self.totals().total_cents;
        self.status = if total <= 0 || self.amount_paid_cents >= total {
            InvoiceStatus::Paid
        } else if self.amount_paid_cents <= 0 {
            InvoiceStatus::Unpaid
        } else {
            InvoiceStatus::PartiallyPaid
        };
    }

    /// 수납 처리
    pub fn apply_payment(&mut self, amount_cents: i64) -> AppResult<()> {
        match self.status {
            InvoiceStatus::Cancelled => {
                return Err(AppError::BadRequest("취소된 청구서입니다".to_string()))
            }
            InvoiceStatus::Paid => {
                return Err(AppError::BadRequest("이미 완납된 청구서입니다".to_string()))
            }
            _ => {}
        }
        if amount_cents <= 0 {
            return Err(AppError::BadRequest("결제 금액은 0보다 커야 합니다".to_string()));
        }
        let balance = self.balance_cents();
        if amount_cents > balance {
            return Err(AppError::BadRequest(format!(
                "결제 금액이 잔액({})을 초과합니다",
                balance
            )));
        }
        self.amount_paid_cents += amount_cents;
        self.refresh_status();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_editable(&self) -> bool {
        matches!(self.status, InvoiceStatus::Unpaid | InvoiceStatus::PartiallyPaid)
    }
}

/// 수납 기록
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub invoice_id: String,
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub received_by: String,
    pub paid_at: DateTime<Utc>,
}

/// 청구서 + 금액 요약 + 수납 내역 (API 응답용)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDetail {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub totals: InvoiceTotals,
    pub payments: Vec<Payment>,
}

// ============ 사용자 계정 ============

/// 사용자 계정 (DB 내부용, 비밀번호 해시 포함)
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub patient_id: Option<String>, // 환자 계정과 연결된 환자 ID
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(username: String, full_name: String, password_hash: String, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            username,
            full_name,
            email: None,
            password_hash,
            role,
            is_active: true,
            patient_id: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 클라이언트에 전달되는 사용자 정보 (비밀번호 해시 제외)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub email: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub patient_id: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<UserAccount> for UserInfo {
    fn from(a: UserAccount) -> Self {
        Self {
            id: a.id,
            username: a.username,
            full_name: a.full_name,
            email: a.email,
            role: a.role,
            is_active: a.is_active,
            patient_id: a.patient_id,
            last_login_at: a.last_login_at,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

// ============ 내보내기 ============

/// 환자 1명의 전체 기록
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientExport {
    pub patient: Patient,
    pub medical_history: MedicalHistory,
    pub appointments: Vec<Appointment>,
    pub consultations: Vec<Consultation>,
    pub prescriptions: Vec<Prescription>,
    pub lab_reports: Vec<LabReport>,
    pub invoices: Vec<Invoice>,
    pub exported_at: DateTime<Utc>,
}

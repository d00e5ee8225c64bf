//! 대화상자(폼) 입력 모델
//!
//! 각 폼은 클라이언트가 보내는 원본 값(열거형/날짜는 문자열)을 그대로 받고,
//! `Validate` 로 규칙을 검사한 뒤 도메인 모델로 변환합니다.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::*;
use crate::permissions::Role;
use crate::validation::{is_strong_password, Rule, Validate, ValidationErrors, Validator};

const NAME: &[Rule] = &[Rule::Required, Rule::MaxLen(50)];
const BLOOD_GROUPS: &[&str] = &["A+", "A-", "B+", "B-", "AB+", "AB-", "O+", "O-"];

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn is_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

fn is_datetime(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
}

fn is_blood_pressure(s: &str) -> bool {
    let mut parts = s.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(sys), Some(dia), None) => [sys, dia]
            .iter()
            .all(|p| (2..=3).contains(&p.len()) && p.chars().all(|c| c.is_ascii_digit())),
        _ => false,
    }
}

fn is_username(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_currency(s: &str) -> bool {
    s.len() == 3 && s.chars().all(|c| c.is_ascii_uppercase())
}

pub fn parse_date(s: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("잘못된 날짜 형식: {}", s)))
}

pub fn parse_datetime(s: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| AppError::BadRequest(format!("잘못된 일시 형식: {}", s)))
}

fn parse_opt_date(s: &Option<String>) -> AppResult<Option<NaiveDate>> {
    match s.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => parse_date(v).map(Some),
        _ => Ok(None),
    }
}

/// 공백 문자열은 None 으로 정리
fn clean(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// 검증 후 변환
pub fn validated<F: Validate>(form: &F) -> AppResult<()> {
    form.validate().map_err(AppError::Validation)
}

// ============ 로그인 ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

impl Validate for LoginForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .text("username", &self.username, &[Rule::Required])
            .check("password", !self.password.is_empty(), "필수 입력 항목입니다")
            .finish()
    }
}

// ============ 환자 ============

/// 환자 등록/수정 폼
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientForm {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub gender: String,
    pub blood_group: Option<String>,
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    /// 수정 시에만 사용 (비어있으면 기존 상태 유지, 신규 등록은 항상 Active)
    pub status: Option<String>,
}

impl Validate for PatientForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut v = Validator::new();
        v.text("first_name", &self.first_name, NAME)
            .text("last_name", &self.last_name, NAME)
            .text(
                "date_of_birth",
                &self.date_of_birth,
                &[Rule::Required, Rule::Pattern(is_date, "YYYY-MM-DD 형식이어야 합니다")],
            )
            .text("gender", &self.gender, &[Rule::Required, Rule::OneOf(Gender::TAGS)])
            .optional_text("blood_group", self.blood_group.as_deref(), &[Rule::OneOf(BLOOD_GROUPS)])
            .text("phone", &self.phone, &[Rule::Required, Rule::Phone])
            .optional_text("email", self.email.as_deref(), &[Rule::Email, Rule::MaxLen(100)])
            .optional_text("address", self.address.as_deref(), &[Rule::MaxLen(200)])
            .optional_text(
                "emergency_contact_name",
                self.emergency_contact_name.as_deref(),
                &[Rule::MaxLen(100)],
            )
            .optional_text(
                "emergency_contact_phone",
                self.emergency_contact_phone.as_deref(),
                &[Rule::Phone],
            )
            .optional_text("status", self.status.as_deref(), &[Rule::OneOf(PatientStatus::TAGS)]);

        if let Ok(dob) = NaiveDate::parse_from_str(self.date_of_birth.trim(), "%Y-%m-%d") {
            let today = today();
            let earliest = today.with_year(today.year() - 150).unwrap_or(NaiveDate::MIN);
            v.not_in_future("date_of_birth", dob, today)
                .not_before("date_of_birth", dob, earliest);
        }
        v.finish()
    }
}

impl PatientForm {
    /// 신규 환자 생성 (환자 코드는 저장소에서 발급)
    pub fn into_patient(&self, patient_code: String) -> AppResult<Patient> {
        let now = Utc::now();
        let mut patient = Patient {
            id: new_id(),
            patient_code,
            first_name: String::new(),
            last_name: String::new(),
            date_of_birth: NaiveDate::MIN,
            gender: Gender::Other,
            blood_group: None,
            phone: String::new(),
            email: None,
            address: None,
            emergency_contact_name: None,
            emergency_contact_phone: None,
            status: PatientStatus::Active,
            visit_count: 0,
            last_visit_at: None,
            created_at: now,
            updated_at: now,
        };
        self.apply(&mut patient)?;
        patient.status = PatientStatus::Active;
        Ok(patient)
    }

    /// 기존 환자에 수정 내용 반영
    pub fn apply(&self, patient: &mut Patient) -> AppResult<()> {
        patient.first_name = self.first_name.trim().to_string();
        patient.last_name = self.last_name.trim().to_string();
        patient.date_of_birth = parse_date(&self.date_of_birth)?;
        patient.gender = Gender::parse(self.gender.trim())?;
        patient.blood_group = clean(&self.blood_group);
        patient.phone = self.phone.trim().to_string();
        patient.email = clean(&self.email);
        patient.address = clean(&self.address);
        patient.emergency_contact_name = clean(&self.emergency_contact_name);
        patient.emergency_contact_phone = clean(&self.emergency_contact_phone);
        if let Some(status) = clean(&self.status) {
            patient.status = PatientStatus::parse(&status)?;
        }
        patient.updated_at = Utc::now();
        Ok(())
    }
}

/// 병력 폼
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedicalHistoryForm {
    pub allergies: Option<String>,
    pub chronic_conditions: Option<String>,
    pub past_surgeries: Option<String>,
    pub family_history: Option<String>,
    pub current_medications: Option<String>,
    pub smoking: String,
    pub alcohol: String,
    pub notes: Option<String>,
}

impl Validate for MedicalHistoryForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let long = &[Rule::MaxLen(2000)];
        Validator::new()
            .optional_text("allergies", self.allergies.as_deref(), long)
            .optional_text("chronic_conditions", self.chronic_conditions.as_deref(), long)
            .optional_text("past_surgeries", self.past_surgeries.as_deref(), long)
            .optional_text("family_history", self.family_history.as_deref(), long)
            .optional_text("current_medications", self.current_medications.as_deref(), long)
            .text("smoking", &self.smoking, &[Rule::Required, Rule::OneOf(SmokingStatus::TAGS)])
            .text("alcohol", &self.alcohol, &[Rule::Required, Rule::OneOf(AlcoholUse::TAGS)])
            .optional_text("notes", self.notes.as_deref(), long)
            .finish()
    }
}

impl MedicalHistoryForm {
    pub fn into_history(&self, patient_id: &str) -> AppResult<MedicalHistory> {
        Ok(MedicalHistory {
            patient_id: patient_id.to_string(),
            allergies: clean(&self.allergies),
            chronic_conditions: clean(&self.chronic_conditions),
            past_surgeries: clean(&self.past_surgeries),
            family_history: clean(&self.family_history),
            current_medications: clean(&self.current_medications),
            smoking: SmokingStatus::parse(self.smoking.trim())?,
            alcohol: AlcoholUse::parse(self.alcohol.trim())?,
            notes: clean(&self.notes),
            updated_at: Utc::now(),
        })
    }
}

// ============ 예약 ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppointmentForm {
    pub patient_id: String,
    pub doctor_id: String,
    pub scheduled_at: String, // RFC 3339
    pub duration_minutes: i64,
    pub appointment_type: String,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

impl Validate for AppointmentForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .text("patient_id", &self.patient_id, &[Rule::Required])
            .text("doctor_id", &self.doctor_id, &[Rule::Required])
            .text(
                "scheduled_at",
                &self.scheduled_at,
                &[Rule::Required, Rule::Pattern(is_datetime, "RFC 3339 일시 형식이어야 합니다")],
            )
            .range("duration_minutes", self.duration_minutes, 5, 480)
            .text(
                "appointment_type",
                &self.appointment_type,
                &[Rule::Required, Rule::OneOf(AppointmentType::TAGS)],
            )
            .optional_text("reason", self.reason.as_deref(), &[Rule::MaxLen(500)])
            .optional_text("notes", self.notes.as_deref(), &[Rule::MaxLen(2000)])
            .finish()
    }
}

impl AppointmentForm {
    pub fn into_appointment(&self) -> AppResult<Appointment> {
        let now = Utc::now();
        let mut appt = Appointment {
            id: new_id(),
            patient_id: String::new(),
            doctor_id: String::new(),
            scheduled_at: now,
            duration_minutes: 0,
            appointment_type: AppointmentType::Consultation,
            status: AppointmentStatus::Scheduled,
            reason: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        self.apply(&mut appt)?;
        Ok(appt)
    }

    pub fn apply(&self, appt: &mut Appointment) -> AppResult<()> {
        appt.patient_id = self.patient_id.trim().to_string();
        appt.doctor_id = self.doctor_id.trim().to_string();
        appt.scheduled_at = parse_datetime(&self.scheduled_at)?;
        appt.duration_minutes = self.duration_minutes;
        appt.appointment_type = AppointmentType::parse(self.appointment_type.trim())?;
        appt.reason = clean(&self.reason);
        appt.notes = clean(&self.notes);
        appt.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentStatusForm {
    pub status: String,
}

impl Validate for AppointmentStatusForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .text("status", &self.status, &[Rule::Required, Rule::OneOf(AppointmentStatus::TAGS)])
            .finish()
    }
}

// ============ 진료 기록 ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsultationForm {
    /// 비어있으면 작성자(로그인 사용자)
    pub doctor_id: Option<String>,
    pub appointment_id: Option<String>,
    pub consultation_date: String,
    pub chief_complaint: String,
    pub symptoms: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_plan: Option<String>,
    #[serde(default)]
    pub vitals: Vitals,
    pub follow_up_date: Option<String>,
    pub notes: Option<String>,
}

impl Validate for ConsultationForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let long = &[Rule::MaxLen(2000)];
        let date_rule = Rule::Pattern(is_date, "YYYY-MM-DD 형식이어야 합니다");
        let mut v = Validator::new();
        v.text("consultation_date", &self.consultation_date, &[Rule::Required, date_rule])
            .text("chief_complaint", &self.chief_complaint, &[Rule::Required, Rule::MaxLen(500)])
            .optional_text("symptoms", self.symptoms.as_deref(), long)
            .optional_text("diagnosis", self.diagnosis.as_deref(), long)
            .optional_text("treatment_plan", self.treatment_plan.as_deref(), long)
            .optional_text("follow_up_date", self.follow_up_date.as_deref(), &[date_rule])
            .optional_text("notes", self.notes.as_deref(), long)
            .optional_text(
                "vitals.blood_pressure",
                self.vitals.blood_pressure.as_deref(),
                &[Rule::Pattern(is_blood_pressure, "120/80 형식이어야 합니다")],
            );

        if let Some(pulse) = self.vitals.pulse {
            v.range("vitals.pulse", pulse, 20, 250);
        }
        if let Some(t) = self.vitals.temperature {
            v.check("vitals.temperature", (30.0..=45.0).contains(&t), "30.0 이상 45.0 이하의 값이어야 합니다");
        }
        if let Some(w) = self.vitals.weight {
            v.check("vitals.weight", w > 0.0 && w <= 500.0, "0 초과 500 이하의 값이어야 합니다");
        }
        if let Some(h) = self.vitals.height {
            v.check("vitals.height", h > 0.0 && h <= 300.0, "0 초과 300 이하의 값이어야 합니다");
        }

        if let (Ok(visit), Some(Ok(follow))) = (
            NaiveDate::parse_from_str(self.consultation_date.trim(), "%Y-%m-%d"),
            self.follow_up_date
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")),
        ) {
            v.not_before("follow_up_date", follow, visit);
        }
        v.finish()
    }
}

impl ConsultationForm {
    pub fn into_consultation(&self, patient_id: &str, author_id: &str) -> AppResult<Consultation> {
        let now = Utc::now();
        let mut c = Consultation {
            id: new_id(),
            patient_id: patient_id.to_string(),
            doctor_id: author_id.to_string(),
            appointment_id: None,
            consultation_date: now.date_naive(),
            chief_complaint: String::new(),
            symptoms: None,
            diagnosis: None,
            treatment_plan: None,
            vitals: Vitals::default(),
            follow_up_date: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        self.apply(&mut c)?;
        Ok(c)
    }

    pub fn apply(&self, c: &mut Consultation) -> AppResult<()> {
        if let Some(doctor) = clean(&self.doctor_id) {
            c.doctor_id = doctor;
        }
        c.appointment_id = clean(&self.appointment_id);
        c.consultation_date = parse_date(&self.consultation_date)?;
        c.chief_complaint = self.chief_complaint.trim().to_string();
        c.symptoms = clean(&self.symptoms);
        c.diagnosis = clean(&self.diagnosis);
        c.treatment_plan = clean(&self.treatment_plan);
        c.vitals = self.vitals.clone();
        c.follow_up_date = parse_opt_date(&self.follow_up_date)?;
        c.notes = clean(&self.notes);
        c.updated_at = Utc::now();
        Ok(())
    }
}

// ============ 처방 ============

fn validate_medication(item: &MedicationItem) -> Result<(), ValidationErrors> {
    Validator::new()
        .text("name", &item.name, &[Rule::Required, Rule::MaxLen(100)])
        .text("dosage", &item.dosage, &[Rule::Required, Rule::MaxLen(50)])
        .text("frequency", &item.frequency, &[Rule::Required, Rule::MaxLen(50)])
        .range("duration_days", item.duration_days, 1, 365)
        .optional_text("instructions", item.instructions.as_deref(), &[Rule::MaxLen(500)])
        .finish()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrescriptionForm {
    pub doctor_id: Option<String>,
    pub consultation_id: Option<String>,
    pub prescribed_on: String,
    pub medications: Vec<MedicationItem>,
    /// 비어있으면 active
    pub status: Option<String>,
    pub notes: Option<String>,
}

impl Validate for PrescriptionForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut v = Validator::new();
        v.text(
            "prescribed_on",
            &self.prescribed_on,
            &[Rule::Required, Rule::Pattern(is_date, "YYYY-MM-DD 형식이어야 합니다")],
        )
        .not_empty("medications", &self.medications)
        .optional_text("status", self.status.as_deref(), &[Rule::OneOf(PrescriptionStatus::TAGS)])
        .optional_text("notes", self.notes.as_deref(), &[Rule::MaxLen(2000)]);

        for (i, item) in self.medications.iter().enumerate() {
            v.nested("medications", i, validate_medication(item));
        }
        v.finish()
    }
}

impl PrescriptionForm {
    pub fn into_prescription(&self, patient_id: &str, author_id: &str) -> AppResult<Prescription> {
        let now = Utc::now();
        let mut p = Prescription {
            id: new_id(),
            patient_id: patient_id.to_string(),
            doctor_id: author_id.to_string(),
            consultation_id: None,
            prescribed_on: now.date_naive(),
            medications: Vec::new(),
            status: PrescriptionStatus::Active,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        self.apply(&mut p)?;
        Ok(p)
    }

    pub fn apply(&self, p: &mut Prescription) -> AppResult<()> {
        if let Some(doctor) = clean(&self.doctor_id) {
            p.doctor_id = doctor;
        }
        p.consultation_id = clean(&self.consultation_id);
        p.prescribed_on = parse_date(&self.prescribed_on)?;
        p.medications = self.medications.clone();
        if let Some(status) = clean(&self.status) {
            p.status = PrescriptionStatus::parse(&status)?;
        }
        p.notes = clean(&self.notes);
        p.updated_at = Utc::now();
        Ok(())
    }
}

// ============ 검사 결과 ============

fn validate_lab_result(item: &LabResultItem) -> Result<(), ValidationErrors> {
    Validator::new()
        .text("parameter", &item.parameter, &[Rule::Required, Rule::MaxLen(100)])
        .text("value", &item.value, &[Rule::Required, Rule::MaxLen(100)])
        .optional_text("unit", item.unit.as_deref(), &[Rule::MaxLen(20)])
        .optional_text("reference_range", item.reference_range.as_deref(), &[Rule::MaxLen(50)])
        .finish()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabReportForm {
    pub test_name: String,
    pub test_category: String,
    pub sample_type: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub results: Vec<LabResultItem>,
    pub remarks: Option<String>,
}

impl Validate for LabReportForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut v = Validator::new();
        v.text("test_name", &self.test_name, &[Rule::Required, Rule::MaxLen(100)])
            .text("test_category", &self.test_category, &[Rule::Required, Rule::MaxLen(50)])
            .optional_text("sample_type", self.sample_type.as_deref(), &[Rule::MaxLen(50)])
            .optional_text("status", self.status.as_deref(), &[Rule::OneOf(LabStatus::TAGS)])
            .optional_text("remarks", self.remarks.as_deref(), &[Rule::MaxLen(2000)]);

        // 완료 처리에는 결과가 필요
        if self.status.as_deref().map(str::trim) == Some(LabStatus::Completed.as_str()) {
            v.not_empty("results", &self.results);
        }
        for (i, item) in self.results.iter().enumerate() {
            v.nested("results", i, validate_lab_result(item));
        }
        v.finish()
    }
}

impl LabReportForm {
    pub fn into_report(&self, patient_id: &str, ordered_by: &str) -> AppResult<LabReport> {
        let now = Utc::now();
        let mut r = LabReport {
            id: new_id(),
            patient_id: patient_id.to_string(),
            ordered_by: ordered_by.to_string(),
            test_name: String::new(),
            test_category: String::new(),
            sample_type: None,
            status: LabStatus::Pending,
            results: Vec::new(),
            remarks: None,
            ordered_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.apply(&mut r)?;
        Ok(r)
    }

    pub fn apply(&self, r: &mut LabReport) -> AppResult<()> {
        r.test_name = self.test_name.trim().to_string();
        r.test_category = self.test_category.trim().to_string();
        r.sample_type = clean(&self.sample_type);
        r.results = self.results.clone();
        r.remarks = clean(&self.remarks);
        if let Some(status) = clean(&self.status) {
            r.set_status(LabStatus::parse(&status)?);
        }
        r.updated_at = Utc::now();
        Ok(())
    }
}

// ============ 수납 ============

fn validate_invoice_item(item: &InvoiceItem) -> Result<(), ValidationErrors> {
    Validator::new()
        .text("description", &item.description, &[Rule::Required, Rule::MaxLen(200)])
        .range("quantity", item.quantity, 1, MAX_ITEM_QUANTITY)
        .range("unit_price_cents", item.unit_price_cents, 0, MAX_UNIT_PRICE_CENTS)
        .finish()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceForm {
    pub patient_id: String,
    pub items: Vec<InvoiceItem>,
    #[serde(default)]
    pub discount_cents: i64,
    #[serde(default)]
    pub tax_rate_bp: i64,
    pub due_date: Option<String>,
    pub notes: Option<String>,
}

impl Validate for InvoiceForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut v = Validator::new();
        v.text("patient_id", &self.patient_id, &[Rule::Required])
            .not_empty("items", &self.items)
            .min("discount_cents", self.discount_cents, 0)
            .range("tax_rate_bp", self.tax_rate_bp, 0, 10_000)
            .optional_text(
                "due_date",
                self.due_date.as_deref(),
                &[Rule::Pattern(is_date, "YYYY-MM-DD 형식이어야 합니다")],
            )
            .optional_text("notes", self.notes.as_deref(), &[Rule::MaxLen(2000)]);

        for (i, item) in self.items.iter().enumerate() {
            v.nested("items", i, validate_invoice_item(item));
        }
        match checked_subtotal(&self.items).filter(|t| *t <= MAX_SUBTOTAL_CENTS) {
            Some(subtotal) => {
                v.check("discount_cents", self.discount_cents <= subtotal, "할인 금액이 합계를 초과합니다");
            }
            None => {
                v.check("items", false, "청구 금액 합계가 허용 범위를 초과합니다");
            }
        }
        v.finish()
    }
}

impl InvoiceForm {
    pub fn into_invoice(&self, invoice_number: String) -> AppResult<Invoice> {
        let now = Utc::now();
        let mut inv = Invoice {
            id: new_id(),
            invoice_number,
            patient_id: String::new(),
            items: Vec::new(),
            discount_cents: 0,
            tax_rate_bp: 0,
            amount_paid_cents: 0,
            status: InvoiceStatus::Unpaid,
            due_date: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        self.apply(&mut inv)?;
        Ok(inv)
    }

    /// 수정 시 기존 납부액보다 총액이 작아지면 거부
    pub fn apply(&self, inv: &mut Invoice) -> AppResult<()> {
        let (_, _, total) = compute_totals(&self.items, self.discount_cents, self.tax_rate_bp);
        if total < inv.amount_paid_cents {
            return Err(AppError::BadRequest(
                "총액이 이미 납부된 금액보다 작을 수 없습니다".to_string(),
            ));
        }
        inv.patient_id = self.patient_id.trim().to_string();
        inv.items = self.items.clone();
        inv.discount_cents = self.discount_cents;
        inv.tax_rate_bp = self.tax_rate_bp;
        inv.due_date = parse_opt_date(&self.due_date)?;
        inv.notes = clean(&self.notes);
        inv.refresh_status();
        inv.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentForm {
    pub amount_cents: i64,
    pub method: String,
    pub reference: Option<String>,
}

impl Validate for PaymentForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .min("amount_cents", self.amount_cents, 1)
            .text("method", &self.method, &[Rule::Required, Rule::OneOf(PaymentMethod::TAGS)])
            .optional_text("reference", self.reference.as_deref(), &[Rule::MaxLen(100)])
            .finish()
    }
}

impl PaymentForm {
    pub fn into_payment(&self, invoice_id: &str, received_by: &str) -> AppResult<Payment> {
        Ok(Payment {
            id: new_id(),
            invoice_id: invoice_id.to_string(),
            amount_cents: self.amount_cents,
            method: PaymentMethod::parse(self.method.trim())?,
            reference: clean(&self.reference),
            received_by: received_by.to_string(),
            paid_at: Utc::now(),
        })
    }
}

// ============ 사용자 ============

const ROLE_TAGS: &[&str] = &[
    "super_admin",
    "admin",
    "doctor",
    "nurse",
    "receptionist",
    "pharmacist",
    "lab_technician",
    "patient",
];

/// 사용자 생성 폼
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserForm {
    pub username: String,
    pub full_name: String,
    pub email: Option<String>,
    pub password: String,
    pub role: String,
    pub patient_id: Option<String>,
}

impl Validate for UserForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .text(
                "username",
                &self.username,
                &[
                    Rule::Required,
                    Rule::MinLen(3),
                    Rule::MaxLen(32),
                    Rule::Pattern(is_username, "영문, 숫자, . _ - 만 사용할 수 있습니다"),
                ],
            )
            .text("full_name", &self.full_name, &[Rule::Required, Rule::MaxLen(100)])
            .optional_text("email", self.email.as_deref(), &[Rule::Email])
            .check(
                "password",
                is_strong_password(&self.password),
                "8자 이상, 영문자와 숫자를 포함해야 합니다",
            )
            .text("role", &self.role, &[Rule::Required, Rule::OneOf(ROLE_TAGS)])
            .check(
                "patient_id",
                self.role.trim() != "patient" || clean(&self.patient_id).is_some(),
                "환자 계정은 환자 기록과 연결되어야 합니다",
            )
            .finish()
    }
}

impl UserForm {
    pub fn role(&self) -> AppResult<Role> {
        self.role.trim().parse()
    }

    pub fn into_account(&self, password_hash: String) -> AppResult<UserAccount> {
        let role = self.role()?;
        let mut account = UserAccount::new(
            self.username.trim().to_string(),
            self.full_name.trim().to_string(),
            password_hash,
            role,
        );
        account.email = clean(&self.email);
        account.patient_id = if role == Role::Patient { clean(&self.patient_id) } else { None };
        Ok(account)
    }
}

/// 사용자 수정 폼 (비밀번호는 입력 시에만 변경)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdateForm {
    pub full_name: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub patient_id: Option<String>,
}

impl Validate for UserUpdateForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut v = Validator::new();
        v.text("full_name", &self.full_name, &[Rule::Required, Rule::MaxLen(100)])
            .optional_text("email", self.email.as_deref(), &[Rule::Email])
            .text("role", &self.role, &[Rule::Required, Rule::OneOf(ROLE_TAGS)])
            .check(
                "patient_id",
                self.role.trim() != "patient" || clean(&self.patient_id).is_some(),
                "환자 계정은 환자 기록과 연결되어야 합니다",
            );
        if let Some(pw) = self.password.as_deref().filter(|p| !p.is_empty()) {
            v.check("password", is_strong_password(pw), "8자 이상, 영문자와 숫자를 포함해야 합니다");
        }
        v.finish()
    }
}

impl UserUpdateForm {
    pub fn role(&self) -> AppResult<Role> {
        self.role.trim().parse()
    }

    pub fn new_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    pub fn apply(&self, account: &mut UserAccount) -> AppResult<()> {
        let role = self.role()?;
        account.full_name = self.full_name.trim().to_string();
        account.email = clean(&self.email);
        account.role = role;
        account.is_active = self.is_active;
        account.patient_id = if role == Role::Patient { clean(&self.patient_id) } else { None };
        account.updated_at = Utc::now();
        Ok(())
    }
}

// ============ 설정 ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClinicSettingsForm {
    pub clinic_name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub currency: String,
}

impl Validate for ClinicSettingsForm {
    fn validate(&self) -> Result<(), ValidationErrors> {
        Validator::new()
            .text("clinic_name", &self.clinic_name, &[Rule::Required, Rule::MaxLen(100)])
            .optional_text("address", self.address.as_deref(), &[Rule::MaxLen(200)])
            .optional_text("phone", self.phone.as_deref(), &[Rule::Phone])
            .optional_text("email", self.email.as_deref(), &[Rule::Email])
            .text(
                "currency",
                &self.currency,
                &[Rule::Required, Rule::Pattern(is_currency, "ISO 4217 통화 코드여야 합니다")],
            )
            .finish()
    }
}

impl ClinicSettingsForm {
    pub fn apply(&self, settings: &mut ClinicSettings) {
        settings.clinic_name = self.clinic_name.trim().to_string();
        settings.address = clean(&self.address);
        settings.phone = clean(&self.phone);
        settings.email = clean(&self.email);
        settings.currency = self.currency.trim().to_string();
        settings.updated_at = Utc::now();
    }
}

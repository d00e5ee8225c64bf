use crate::error::{AppError, AppResult};
use crate::models::*;
use crate::permissions::Role;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite 저장소
///
/// 연결 하나를 Mutex 로 감싸 여러 요청 핸들러에서 공유합니다.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// 파일 데이터베이스 열기 (테이블 생성 + 마이그레이션 포함)
    pub fn open(path: &Path) -> AppResult<Self> {
        log::info!("[DB] open: DB 경로 = {:?}", path);
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// 테스트용 메모리 데이터베이스
    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        create_tables(&conn)?;
        run_migrations(&conn)?;
        log::info!("[DB] 초기화 완료");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// DB 연결 가져오기
    fn get_conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Custom("Database lock error".to_string()))
    }

    /// 순번 발급 (PT-000001, INV-000001 등)
    pub fn next_code(&self, counter: &str, prefix: &str) -> AppResult<String> {
        let conn = self.get_conn()?;
        let value: i64 = conn.query_row(
            r#"INSERT INTO counters (name, value) VALUES (?1, 1)
               ON CONFLICT(name) DO UPDATE SET value = value + 1
               RETURNING value"#,
            [counter],
            |row| row.get(0),
        )?;
        Ok(format!("{}-{:06}", prefix, value))
    }
}

/// 테이블 생성
fn create_tables(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
        -- 의원 설정
        CREATE TABLE IF NOT EXISTS clinic_settings (
            id TEXT PRIMARY KEY,
            clinic_name TEXT NOT NULL,
            address TEXT,
            phone TEXT,
            email TEXT,
            currency TEXT NOT NULL DEFAULT 'USD',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- 순번
        CREATE TABLE IF NOT EXISTS counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        -- 환자 정보
        CREATE TABLE IF NOT EXISTS patients (
            id TEXT PRIMARY KEY,
            patient_code TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            date_of_birth TEXT NOT NULL,
            gender TEXT NOT NULL,
            blood_group TEXT,
            phone TEXT NOT NULL,
            email TEXT,
            address TEXT,
            emergency_contact_name TEXT,
            emergency_contact_phone TEXT,
            status TEXT NOT NULL DEFAULT 'Active',
            visit_count INTEGER NOT NULL DEFAULT 0,
            last_visit_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- 병력 (환자당 1건)
        CREATE TABLE IF NOT EXISTS medical_histories (
            patient_id TEXT PRIMARY KEY,
            allergies TEXT,
            chronic_conditions TEXT,
            past_surgeries TEXT,
            family_history TEXT,
            current_medications TEXT,
            smoking TEXT NOT NULL,
            alcohol TEXT NOT NULL,
            notes TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );

        -- 사용자 계정
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            email TEXT,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            patient_id TEXT,
            last_login_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );

        -- 예약
        CREATE TABLE IF NOT EXISTS appointments (
            id TEXT PRIMARY KEY,
            patient_id TEXT NOT NULL,
            doctor_id TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            appointment_type TEXT NOT NULL,
            status TEXT NOT NULL,
            reason TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );
        CREATE INDEX IF NOT EXISTS idx_appointments_patient ON appointments(patient_id);
        CREATE INDEX IF NOT EXISTS idx_appointments_doctor ON appointments(doctor_id, scheduled_at);

        -- 진료 기록
        CREATE TABLE IF NOT EXISTS consultations (
            id TEXT PRIMARY KEY,
            patient_id TEXT NOT NULL,
            doctor_id TEXT NOT NULL,
            appointment_id TEXT,
            consultation_date TEXT NOT NULL,
            chief_complaint TEXT NOT NULL,
            symptoms TEXT,
            diagnosis TEXT,
            treatment_plan TEXT,
            vitals TEXT NOT NULL,
            follow_up_date TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );
        CREATE INDEX IF NOT EXISTS idx_consultations_patient ON consultations(patient_id);

        -- 처방
        CREATE TABLE IF NOT EXISTS prescriptions (
            id TEXT PRIMARY KEY,
            patient_id TEXT NOT NULL,
            doctor_id TEXT NOT NULL,
            consultation_id TEXT,
            prescribed_on TEXT NOT NULL,
            medications TEXT NOT NULL,
            status TEXT NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );
        CREATE INDEX IF NOT EXISTS idx_prescriptions_patient ON prescriptions(patient_id);

        -- 검사 결과
        CREATE TABLE IF NOT EXISTS lab_reports (
            id TEXT PRIMARY KEY,
            patient_id TEXT NOT NULL,
            ordered_by TEXT NOT NULL,
            test_name TEXT NOT NULL,
            test_category TEXT NOT NULL,
            sample_type TEXT,
            status TEXT NOT NULL,
            results TEXT NOT NULL,
            remarks TEXT,
            ordered_at TEXT NOT NULL,
            completed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );
        CREATE INDEX IF NOT EXISTS idx_lab_reports_patient ON lab_reports(patient_id);

        -- 청구서
        CREATE TABLE IF NOT EXISTS invoices (
            id TEXT PRIMARY KEY,
            invoice_number TEXT NOT NULL UNIQUE,
            patient_id TEXT NOT NULL,
            items TEXT NOT NULL,
            discount_cents INTEGER NOT NULL DEFAULT 0,
            tax_rate_bp INTEGER NOT NULL DEFAULT 0,
            amount_paid_cents INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            due_date TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (patient_id) REFERENCES patients(id)
        );
        CREATE INDEX IF NOT EXISTS idx_invoices_patient ON invoices(patient_id);

        -- 수납 기록
        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            invoice_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            method TEXT NOT NULL,
            reference TEXT,
            received_by TEXT NOT NULL,
            paid_at TEXT NOT NULL,
            FOREIGN KEY (invoice_id) REFERENCES invoices(id)
        );
        "#,
    )?;
    Ok(())
}

/// 스키마 버전 (PRAGMA user_version)
const SCHEMA_VERSION: i64 = 1;

/// 스키마 버전 기록, 더 새로운 버전의 DB 는 열지 않음
fn run_migrations(conn: &Connection) -> AppResult<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(AppError::Custom(format!(
            "DB 스키마 버전({})이 지원 버전({})보다 높습니다",
            version, SCHEMA_VERSION
        )));
    }
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        log::info!("[DB] 스키마 버전 {} -> {}", version, SCHEMA_VERSION);
    }
    Ok(())
}

// ============ 행 변환 헬퍼 ============

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => ts(row, idx).map(Some),
        None => Ok(None),
    }
}

fn date(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error(idx, e))
}

fn opt_date(row: &Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => date(row, idx).map(Some),
        None => Ok(None),
    }
}

fn json<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn tag<T>(row: &Row, idx: usize, parse: fn(&str) -> AppResult<T>) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    parse(&s).map_err(|e| conversion_error(idx, e))
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> AppResult<Vec<T>> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

/// 변경된 행이 없으면 NotFound
fn expect_changed(changed: usize, what: &str, id: &str) -> AppResult<()> {
    if changed == 0 {
        Err(AppError::not_found(format!("{} {}", what, id)))
    } else {
        Ok(())
    }
}

// ============ 의원 설정 ============

impl Database {
    pub fn save_clinic_settings(&self, settings: &ClinicSettings) -> AppResult<()> {
        let conn = self.get_conn()?;

        // 설정은 항상 1건만 유지
        conn.execute("DELETE FROM clinic_settings", [])?;
        conn.execute(
            r#"INSERT INTO clinic_settings
               (id, clinic_name, address, phone, email, currency, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                settings.id,
                settings.clinic_name,
                settings.address,
                settings.phone,
                settings.email,
                settings.currency,
                settings.created_at.to_rfc3339(),
                settings.updated_at.to_rfc3339(),
            ],
        )?;
        log::info!("의원 설정 저장: {}", settings.clinic_name);
        Ok(())
    }

    pub fn get_clinic_settings(&self) -> AppResult<Option<ClinicSettings>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                "SELECT id, clinic_name, address, phone, email, currency, created_at, updated_at
                 FROM clinic_settings LIMIT 1",
                [],
                |row| {
                    Ok(ClinicSettings {
                        id: row.get(0)?,
                        clinic_name: row.get(1)?,
                        address: row.get(2)?,
                        phone: row.get(3)?,
                        email: row.get(4)?,
                        currency: row.get(5)?,
                        created_at: ts(row, 6)?,
                        updated_at: ts(row, 7)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }
}

// ============ 환자 관리 ============

const PATIENT_COLUMNS: &str = "id, patient_code, first_name, last_name, date_of_birth, gender, blood_group, \
     phone, email, address, emergency_contact_name, emergency_contact_phone, status, visit_count, \
     last_visit_at, created_at, updated_at";

fn map_patient_row(row: &Row) -> rusqlite::Result<Patient> {
    Ok(Patient {
        id: row.get(0)?,
        patient_code: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        date_of_birth: date(row, 4)?,
        gender: tag(row, 5, Gender::parse)?,
        blood_group: row.get(6)?,
        phone: row.get(7)?,
        email: row.get(8)?,
        address: row.get(9)?,
        emergency_contact_name: row.get(10)?,
        emergency_contact_phone: row.get(11)?,
        status: tag(row, 12, PatientStatus::parse)?,
        visit_count: row.get(13)?,
        last_visit_at: opt_ts(row, 14)?,
        created_at: ts(row, 15)?,
        updated_at: ts(row, 16)?,
    })
}

impl Database {
    pub fn create_patient(&self, patient: &Patient) -> AppResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO patients ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                PATIENT_COLUMNS
            ),
            params![
                patient.id,
                patient.patient_code,
                patient.first_name,
                patient.last_name,
                fmt_date(patient.date_of_birth),
                patient.gender.as_str(),
                patient.blood_group,
                patient.phone,
                patient.email,
                patient.address,
                patient.emergency_contact_name,
                patient.emergency_contact_phone,
                patient.status.as_str(),
                patient.visit_count,
                patient.last_visit_at.map(|d| d.to_rfc3339()),
                patient.created_at.to_rfc3339(),
                patient.updated_at.to_rfc3339(),
            ],
        )?;
        log::info!("환자 등록됨: {}", patient.patient_code);
        Ok(())
    }

    pub fn get_patient(&self, id: &str) -> AppResult<Option<Patient>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM patients WHERE id = ?1", PATIENT_COLUMNS),
                [id],
                map_patient_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_patient_by_code(&self, code: &str) -> AppResult<Option<Patient>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM patients WHERE patient_code = ?1", PATIENT_COLUMNS),
                [code],
                map_patient_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_patients(&self) -> AppResult<Vec<Patient>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM patients ORDER BY created_at DESC",
            PATIENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_patient_row)?;
        let patients = collect(rows)?;
        log::debug!("[DB] list_patients: 결과 {}명", patients.len());
        Ok(patients)
    }

    pub fn update_patient(&self, patient: &Patient) -> AppResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            r#"UPDATE patients SET first_name = ?2, last_name = ?3, date_of_birth = ?4, gender = ?5,
               blood_group = ?6, phone = ?7, email = ?8, address = ?9, emergency_contact_name = ?10,
               emergency_contact_phone = ?11, status = ?12, updated_at = ?13 WHERE id = ?1"#,
            params![
                patient.id,
                patient.first_name,
                patient.last_name,
                fmt_date(patient.date_of_birth),
                patient.gender.as_str(),
                patient.blood_group,
                patient.phone,
                patient.email,
                patient.address,
                patient.emergency_contact_name,
                patient.emergency_contact_phone,
                patient.status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        expect_changed(changed, "patient", &patient.id)
    }

    /// 환자 상태 변경 (삭제 = Inactive)
    pub fn set_patient_status(&self, id: &str, status: PatientStatus) -> AppResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE patients SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        expect_changed(changed, "patient", id)?;
        log::info!("환자 상태 변경: {} -> {}", id, status);
        Ok(())
    }

    pub fn count_patients(&self, status: PatientStatus) -> AppResult<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM patients WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?)
    }

    // ============ 병력 ============

    pub fn get_medical_history(&self, patient_id: &str) -> AppResult<Option<MedicalHistory>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                r#"SELECT patient_id, allergies, chronic_conditions, past_surgeries, family_history,
                   current_medications, smoking, alcohol, notes, updated_at
                   FROM medical_histories WHERE patient_id = ?1"#,
                [patient_id],
                |row| {
                    Ok(MedicalHistory {
                        patient_id: row.get(0)?,
                        allergies: row.get(1)?,
                        chronic_conditions: row.get(2)?,
                        past_surgeries: row.get(3)?,
                        family_history: row.get(4)?,
                        current_medications: row.get(5)?,
                        smoking: tag(row, 6, SmokingStatus::parse)?,
                        alcohol: tag(row, 7, AlcoholUse::parse)?,
                        notes: row.get(8)?,
                        updated_at: ts(row, 9)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    pub fn save_medical_history(&self, history: &MedicalHistory) -> AppResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"INSERT INTO medical_histories
               (patient_id, allergies, chronic_conditions, past_surgeries, family_history,
                current_medications, smoking, alcohol, notes, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
               ON CONFLICT(patient_id) DO UPDATE SET
                 allergies = excluded.allergies,
                 chronic_conditions = excluded.chronic_conditions,
                 past_surgeries = excluded.past_surgeries,
                 family_history = excluded.family_history,
                 current_medications = excluded.current_medications,
                 smoking = excluded.smoking,
                 alcohol = excluded.alcohol,
                 notes = excluded.notes,
                 updated_at = excluded.updated_at"#,
            params![
                history.patient_id,
                history.allergies,
                history.chronic_conditions,
                history.past_surgeries,
                history.family_history,
                history.current_medications,
                history.smoking.as_str(),
                history.alcohol.as_str(),
                history.notes,
                history.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

// ============ 예약 관리 ============

const APPOINTMENT_COLUMNS: &str = "id, patient_id, doctor_id, scheduled_at, duration_minutes, \
     appointment_type, status, reason, notes, created_at, updated_at";

fn map_appointment_row(row: &Row) -> rusqlite::Result<Appointment> {
    Ok(Appointment {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        doctor_id: row.get(2)?,
        scheduled_at: ts(row, 3)?,
        duration_minutes: row.get(4)?,
        appointment_type: tag(row, 5, AppointmentType::parse)?,
        status: tag(row, 6, AppointmentStatus::parse)?,
        reason: row.get(7)?,
        notes: row.get(8)?,
        created_at: ts(row, 9)?,
        updated_at: ts(row, 10)?,
    })
}

/// 예약 조회 조건
#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter<'a> {
    pub patient_id: Option<&'a str>,
    pub doctor_id: Option<&'a str>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

fn query_appointments(conn: &Connection, filter: &AppointmentFilter) -> AppResult<Vec<Appointment>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM appointments
         WHERE (?1 IS NULL OR patient_id = ?1) AND (?2 IS NULL OR doctor_id = ?2)
         ORDER BY scheduled_at",
        APPOINTMENT_COLUMNS
    ))?;
    let rows = stmt.query_map(params![filter.patient_id, filter.doctor_id], map_appointment_row)?;
    let appointments = collect(rows)?;

    // RFC 3339 문자열은 오프셋이 섞일 수 있어 기간 조건은 여기서 비교
    Ok(appointments
        .into_iter()
        .filter(|a| filter.from.map_or(true, |from| a.scheduled_at >= from))
        .filter(|a| filter.to.map_or(true, |to| a.scheduled_at < to))
        .collect())
}

fn query_overlapping(
    conn: &Connection,
    doctor_id: &str,
    start: DateTime<Utc>,
    duration_minutes: i64,
    exclude_id: Option<&str>,
) -> AppResult<Vec<Appointment>> {
    let filter = AppointmentFilter {
        doctor_id: Some(doctor_id),
        ..Default::default()
    };
    Ok(query_appointments(conn, &filter)?
        .into_iter()
        .filter(|a| !a.status.is_terminal())
        .filter(|a| Some(a.id.as_str()) != exclude_id)
        .filter(|a| a.overlaps(start, duration_minutes))
        .collect())
}

/// 같은 의사의 겹치는 예약이 있으면 Conflict
fn ensure_no_overlap(conn: &Connection, appt: &Appointment) -> AppResult<()> {
    if appt.status.is_terminal() {
        return Ok(());
    }
    let clashes = query_overlapping(
        conn,
        &appt.doctor_id,
        appt.scheduled_at,
        appt.duration_minutes,
        Some(&appt.id),
    )?;
    match clashes.first() {
        Some(other) => Err(AppError::Conflict(format!(
            "같은 시간대에 다른 예약이 있습니다 ({})",
            other.scheduled_at.to_rfc3339()
        ))),
        None => Ok(()),
    }
}

impl Database {
    /// 겹침 검사와 저장을 한 트랜잭션에서 수행
    pub fn create_appointment(&self, appt: &Appointment) -> AppResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        ensure_no_overlap(&tx, appt)?;
        tx.execute(
            &format!(
                "INSERT INTO appointments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                APPOINTMENT_COLUMNS
            ),
            params![
                appt.id,
                appt.patient_id,
                appt.doctor_id,
                appt.scheduled_at.to_rfc3339(),
                appt.duration_minutes,
                appt.appointment_type.as_str(),
                appt.status.as_str(),
                appt.reason,
                appt.notes,
                appt.created_at.to_rfc3339(),
                appt.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_appointment(&self, id: &str) -> AppResult<Option<Appointment>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM appointments WHERE id = ?1", APPOINTMENT_COLUMNS),
                [id],
                map_appointment_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_appointments(&self, filter: &AppointmentFilter) -> AppResult<Vec<Appointment>> {
        let conn = self.get_conn()?;
        query_appointments(&conn, filter)
    }

    /// 같은 의사의 진행 중 예약 중 시간이 겹치는 예약
    pub fn find_overlapping_appointments(
        &self,
        doctor_id: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        exclude_id: Option<&str>,
    ) -> AppResult<Vec<Appointment>> {
        let conn = self.get_conn()?;
        query_overlapping(&conn, doctor_id, start, duration_minutes, exclude_id)
    }

    /// 겹침 검사와 수정을 한 트랜잭션에서 수행 (종료된 예약은 수정되지 않음)
    pub fn update_appointment(&self, appt: &Appointment) -> AppResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        ensure_no_overlap(&tx, appt)?;
        let changed = tx.execute(
            r#"UPDATE appointments SET patient_id = ?2, doctor_id = ?3, scheduled_at = ?4,
               duration_minutes = ?5, appointment_type = ?6, reason = ?7, notes = ?8,
               updated_at = ?9 WHERE id = ?1 AND status IN ('scheduled', 'confirmed')"#,
            params![
                appt.id,
                appt.patient_id,
                appt.doctor_id,
                appt.scheduled_at.to_rfc3339(),
                appt.duration_minutes,
                appt.appointment_type.as_str(),
                appt.reason,
                appt.notes,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(appointment_state_error(&tx, &appt.id));
        }
        tx.commit()?;
        Ok(())
    }

    /// 예약 상태 저장, 완료 시 환자 내원 횟수 증가 (한 트랜잭션)
    ///
    /// 저장된 상태가 `from` 과 다르면 다른 요청이 먼저 바꾼 것으로 보고 Conflict
    pub fn save_appointment_status(&self, appt: &Appointment, from: AppointmentStatus) -> AppResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let changed = tx.execute(
            "UPDATE appointments SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
            params![appt.id, appt.status.as_str(), now, from.as_str()],
        )?;
        if changed == 0 {
            return Err(appointment_state_error(&tx, &appt.id));
        }

        if appt.status == AppointmentStatus::Completed {
            tx.execute(
                r#"UPDATE patients SET visit_count = visit_count + 1, last_visit_at = ?2, updated_at = ?3
                   WHERE id = ?1"#,
                params![appt.patient_id, appt.scheduled_at.to_rfc3339(), now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_appointment(&self, id: &str) -> AppResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute("DELETE FROM appointments WHERE id = ?1", [id])?;
        expect_changed(changed, "appointment", id)
    }
}

/// 조건부 갱신이 0건일 때: 예약이 없으면 NotFound, 있으면 상태가 바뀐 것
fn appointment_state_error(conn: &Connection, id: &str) -> AppError {
    let status: rusqlite::Result<Option<String>> = conn
        .query_row("SELECT status FROM appointments WHERE id = ?1", [id], |row| row.get(0))
        .optional();
    match status {
        Ok(Some(status)) => AppError::Conflict(format!(
            "appointment {} changed concurrently (now {})",
            id, status
        )),
        Ok(None) => AppError::not_found(format!("appointment {}", id)),
        Err(e) => AppError::Database(e),
    }
}

// ============ 진료 기록 ============

const CONSULTATION_COLUMNS: &str = "id, patient_id, doctor_id, appointment_id, consultation_date, \
     chief_complaint, symptoms, diagnosis, treatment_plan, vitals, follow_up_date, notes, created_at, updated_at";

fn map_consultation_row(row: &Row) -> rusqlite::Result<Consultation> {
    Ok(Consultation {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        doctor_id: row.get(2)?,
        appointment_id: row.get(3)?,
        consultation_date: date(row, 4)?,
        chief_complaint: row.get(5)?,
        symptoms: row.get(6)?,
        diagnosis: row.get(7)?,
        treatment_plan: row.get(8)?,
        vitals: json(row, 9)?,
        follow_up_date: opt_date(row, 10)?,
        notes: row.get(11)?,
        created_at: ts(row, 12)?,
        updated_at: ts(row, 13)?,
    })
}

impl Database {
    pub fn create_consultation(&self, c: &Consultation) -> AppResult<()> {
        let conn = self.get_conn()?;
        let vitals_json = serde_json::to_string(&c.vitals)?;
        conn.execute(
            &format!(
                "INSERT INTO consultations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                CONSULTATION_COLUMNS
            ),
            params![
                c.id,
                c.patient_id,
                c.doctor_id,
                c.appointment_id,
                fmt_date(c.consultation_date),
                c.chief_complaint,
                c.symptoms,
                c.diagnosis,
                c.treatment_plan,
                vitals_json,
                c.follow_up_date.map(fmt_date),
                c.notes,
                c.created_at.to_rfc3339(),
                c.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_consultation(&self, id: &str) -> AppResult<Option<Consultation>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM consultations WHERE id = ?1", CONSULTATION_COLUMNS),
                [id],
                map_consultation_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_consultations_by_patient(&self, patient_id: &str) -> AppResult<Vec<Consultation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM consultations WHERE patient_id = ?1 ORDER BY consultation_date DESC",
            CONSULTATION_COLUMNS
        ))?;
        let rows = stmt.query_map([patient_id], map_consultation_row)?;
        collect(rows)
    }

    pub fn update_consultation(&self, c: &Consultation) -> AppResult<()> {
        let conn = self.get_conn()?;
        let vitals_json = serde_json::to_string(&c.vitals)?;
        let changed = conn.execute(
            r#"UPDATE consultations SET doctor_id = ?2, appointment_id = ?3, consultation_date = ?4,
               chief_complaint = ?5, symptoms = ?6, diagnosis = ?7, treatment_plan = ?8, vitals = ?9,
               follow_up_date = ?10, notes = ?11, updated_at = ?12 WHERE id = ?1"#,
            params![
                c.id,
                c.doctor_id,
                c.appointment_id,
                fmt_date(c.consultation_date),
                c.chief_complaint,
                c.symptoms,
                c.diagnosis,
                c.treatment_plan,
                vitals_json,
                c.follow_up_date.map(fmt_date),
                c.notes,
                Utc::now().to_rfc3339(),
            ],
        )?;
        expect_changed(changed, "consultation", &c.id)
    }

    pub fn delete_consultation(&self, id: &str) -> AppResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute("DELETE FROM consultations WHERE id = ?1", [id])?;
        expect_changed(changed, "consultation", id)
    }
}

// ============ 처방 관리 ============

const PRESCRIPTION_COLUMNS: &str = "id, patient_id, doctor_id, consultation_id, prescribed_on, \
     medications, status, notes, created_at, updated_at";

fn map_prescription_row(row: &Row) -> rusqlite::Result<Prescription> {
    Ok(Prescription {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        doctor_id: row.get(2)?,
        consultation_id: row.get(3)?,
        prescribed_on: date(row, 4)?,
        medications: json(row, 5)?,
        status: tag(row, 6, PrescriptionStatus::parse)?,
        notes: row.get(7)?,
        created_at: ts(row, 8)?,
        updated_at: ts(row, 9)?,
    })
}

impl Database {
    pub fn create_prescription(&self, p: &Prescription) -> AppResult<()> {
        let conn = self.get_conn()?;
        let medications_json = serde_json::to_string(&p.medications)?;
        conn.execute(
            &format!(
                "INSERT INTO prescriptions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                PRESCRIPTION_COLUMNS
            ),
            params![
                p.id,
                p.patient_id,
                p.doctor_id,
                p.consultation_id,
                fmt_date(p.prescribed_on),
                medications_json,
                p.status.as_str(),
                p.notes,
                p.created_at.to_rfc3339(),
                p.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_prescription(&self, id: &str) -> AppResult<Option<Prescription>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM prescriptions WHERE id = ?1", PRESCRIPTION_COLUMNS),
                [id],
                map_prescription_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_prescriptions_by_patient(&self, patient_id: &str) -> AppResult<Vec<Prescription>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM prescriptions WHERE patient_id = ?1 ORDER BY prescribed_on DESC",
            PRESCRIPTION_COLUMNS
        ))?;
        let rows = stmt.query_map([patient_id], map_prescription_row)?;
        collect(rows)
    }

    pub fn update_prescription(&self, p: &Prescription) -> AppResult<()> {
        let conn = self.get_conn()?;
        let medications_json = serde_json::to_string(&p.medications)?;
        let changed = conn.execute(
            r#"UPDATE prescriptions SET doctor_id = ?2, consultation_id = ?3, prescribed_on = ?4,
               medications = ?5, status = ?6, notes = ?7, updated_at = ?8 WHERE id = ?1"#,
            params![
                p.id,
                p.doctor_id,
                p.consultation_id,
                fmt_date(p.prescribed_on),
                medications_json,
                p.status.as_str(),
                p.notes,
                Utc::now().to_rfc3339(),
            ],
        )?;
        expect_changed(changed, "prescription", &p.id)
    }

    pub fn delete_prescription(&self, id: &str) -> AppResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute("DELETE FROM prescriptions WHERE id = ?1", [id])?;
        expect_changed(changed, "prescription", id)
    }

    pub fn count_prescriptions(&self, status: PrescriptionStatus, patient_id: Option<&str>) -> AppResult<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM prescriptions WHERE status = ?1 AND (?2 IS NULL OR patient_id = ?2)",
            params![status.as_str(), patient_id],
            |row| row.get(0),
        )?)
    }
}

// ============ 검사 결과 ============

const LAB_REPORT_COLUMNS: &str = "id, patient_id, ordered_by, test_name, test_category, sample_type, \
     status, results, remarks, ordered_at, completed_at, created_at, updated_at";

fn map_lab_report_row(row: &Row) -> rusqlite::Result<LabReport> {
    Ok(LabReport {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        ordered_by: row.get(2)?,
        test_name: row.get(3)?,
        test_category: row.get(4)?,
        sample_type: row.get(5)?,
        status: tag(row, 6, LabStatus::parse)?,
        results: json(row, 7)?,
        remarks: row.get(8)?,
        ordered_at: ts(row, 9)?,
        completed_at: opt_ts(row, 10)?,
        created_at: ts(row, 11)?,
        updated_at: ts(row, 12)?,
    })
}

impl Database {
    pub fn create_lab_report(&self, r: &LabReport) -> AppResult<()> {
        let conn = self.get_conn()?;
        let results_json = serde_json::to_string(&r.results)?;
        conn.execute(
            &format!(
                "INSERT INTO lab_reports ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                LAB_REPORT_COLUMNS
            ),
            params![
                r.id,
                r.patient_id,
                r.ordered_by,
                r.test_name,
                r.test_category,
                r.sample_type,
                r.status.as_str(),
                results_json,
                r.remarks,
                r.ordered_at.to_rfc3339(),
                r.completed_at.map(|d| d.to_rfc3339()),
                r.created_at.to_rfc3339(),
                r.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_lab_report(&self, id: &str) -> AppResult<Option<LabReport>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM lab_reports WHERE id = ?1", LAB_REPORT_COLUMNS),
                [id],
                map_lab_report_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_lab_reports_by_patient(&self, patient_id: &str) -> AppResult<Vec<LabReport>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM lab_reports WHERE patient_id = ?1 ORDER BY ordered_at DESC",
            LAB_REPORT_COLUMNS
        ))?;
        let rows = stmt.query_map([patient_id], map_lab_report_row)?;
        collect(rows)
    }

    pub fn update_lab_report(&self, r: &LabReport) -> AppResult<()> {
        let conn = self.get_conn()?;
        let results_json = serde_json::to_string(&r.results)?;
        let changed = conn.execute(
            r#"UPDATE lab_reports SET test_name = ?2, test_category = ?3, sample_type = ?4, status = ?5,
               results = ?6, remarks = ?7, completed_at = ?8, updated_at = ?9 WHERE id = ?1"#,
            params![
                r.id,
                r.test_name,
                r.test_category,
                r.sample_type,
                r.status.as_str(),
                results_json,
                r.remarks,
                r.completed_at.map(|d| d.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        expect_changed(changed, "lab report", &r.id)
    }

    pub fn delete_lab_report(&self, id: &str) -> AppResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute("DELETE FROM lab_reports WHERE id = ?1", [id])?;
        expect_changed(changed, "lab report", id)
    }

    /// 대기/진행 중 검사 건수
    pub fn count_open_lab_reports(&self, patient_id: Option<&str>) -> AppResult<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM lab_reports
             WHERE status IN ('pending', 'in_progress') AND (?1 IS NULL OR patient_id = ?1)",
            params![patient_id],
            |row| row.get(0),
        )?)
    }
}

// ============ 수납 ============

const INVOICE_COLUMNS: &str = "id, invoice_number, patient_id, items, discount_cents, tax_rate_bp, \
     amount_paid_cents, status, due_date, notes, created_at, updated_at";

fn map_invoice_row(row: &Row) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        id: row.get(0)?,
        invoice_number: row.get(1)?,
        patient_id: row.get(2)?,
        items: json(row, 3)?,
        discount_cents: row.get(4)?,
        tax_rate_bp: row.get(5)?,
        amount_paid_cents: row.get(6)?,
        status: tag(row, 7, InvoiceStatus::parse)?,
        due_date: opt_date(row, 8)?,
        notes: row.get(9)?,
        created_at: ts(row, 10)?,
        updated_at: ts(row, 11)?,
    })
}

fn map_payment_row(row: &Row) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        invoice_id: row.get(1)?,
        amount_cents: row.get(2)?,
        method: tag(row, 3, PaymentMethod::parse)?,
        reference: row.get(4)?,
        received_by: row.get(5)?,
        paid_at: ts(row, 6)?,
    })
}

impl Database {
    pub fn create_invoice(&self, inv: &Invoice) -> AppResult<()> {
        let conn = self.get_conn()?;
        let items_json = serde_json::to_string(&inv.items)?;
        conn.execute(
            &format!(
                "INSERT INTO invoices ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                INVOICE_COLUMNS
            ),
            params![
                inv.id,
                inv.invoice_number,
                inv.patient_id,
                items_json,
                inv.discount_cents,
                inv.tax_rate_bp,
                inv.amount_paid_cents,
                inv.status.as_str(),
                inv.due_date.map(fmt_date),
                inv.notes,
                inv.created_at.to_rfc3339(),
                inv.updated_at.to_rfc3339(),
            ],
        )?;
        log::info!("청구서 발행: {}", inv.invoice_number);
        Ok(())
    }

    pub fn get_invoice(&self, id: &str) -> AppResult<Option<Invoice>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM invoices WHERE id = ?1", INVOICE_COLUMNS),
                [id],
                map_invoice_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_invoices(&self, patient_id: Option<&str>) -> AppResult<Vec<Invoice>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM invoices WHERE (?1 IS NULL OR patient_id = ?1) ORDER BY created_at DESC",
            INVOICE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![patient_id], map_invoice_row)?;
        collect(rows)
    }

    /// 청구서 수정/취소
    ///
    /// 납부액은 `record_payment` 만 바꾸므로, 읽은 뒤 수납이 들어왔거나 이미 종결된 청구서면 Conflict
    pub fn update_invoice(&self, inv: &Invoice) -> AppResult<()> {
        let conn = self.get_conn()?;
        let items_json = serde_json::to_string(&inv.items)?;
        let changed = conn.execute(
            r#"UPDATE invoices SET patient_id = ?2, items = ?3, discount_cents = ?4, tax_rate_bp = ?5,
               status = ?7, due_date = ?8, notes = ?9, updated_at = ?10
               WHERE id = ?1 AND amount_paid_cents = ?6 AND status IN ('unpaid', 'partially_paid')"#,
            params![
                inv.id,
                inv.patient_id,
                items_json,
                inv.discount_cents,
                inv.tax_rate_bp,
                inv.amount_paid_cents,
                inv.status.as_str(),
                inv.due_date.map(fmt_date),
                inv.notes,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            let exists = conn
                .query_row("SELECT 1 FROM invoices WHERE id = ?1", [&inv.id], |_| Ok(()))
                .optional()?
                .is_some();
            return Err(if exists {
                AppError::Conflict(format!("invoice {} was modified concurrently", inv.invoice_number))
            } else {
                AppError::not_found(format!("invoice {}", inv.id))
            });
        }
        Ok(())
    }

    /// 수납 기록 저장 + 청구서 납부액/상태 갱신 (한 트랜잭션)
    ///
    /// 잔액 검사는 트랜잭션 안에서 다시 읽은 청구서 기준으로 수행
    pub fn record_payment(&self, payment: &Payment) -> AppResult<Invoice> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let mut inv = tx
            .query_row(
                &format!("SELECT {} FROM invoices WHERE id = ?1", INVOICE_COLUMNS),
                [&payment.invoice_id],
                map_invoice_row,
            )
            .optional()?
            .ok_or_else(|| AppError::not_found(format!("invoice {}", payment.invoice_id)))?;
        let paid_before = inv.amount_paid_cents;
        inv.apply_payment(payment.amount_cents)?;

        let changed = tx.execute(
            r#"UPDATE invoices SET amount_paid_cents = ?2, status = ?3, updated_at = ?4
               WHERE id = ?1 AND amount_paid_cents = ?5"#,
            params![
                inv.id,
                inv.amount_paid_cents,
                inv.status.as_str(),
                inv.updated_at.to_rfc3339(),
                paid_before,
            ],
        )?;
        if changed != 1 {
            return Err(AppError::Conflict(format!(
                "invoice {} was modified concurrently",
                inv.invoice_number
            )));
        }
        tx.execute(
            r#"INSERT INTO payments (id, invoice_id, amount_cents, method, reference, received_by, paid_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                payment.id,
                payment.invoice_id,
                payment.amount_cents,
                payment.method.as_str(),
                payment.reference,
                payment.received_by,
                payment.paid_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        log::info!(
            "수납 처리: {} {} ({})",
            inv.invoice_number,
            payment.amount_cents,
            payment.method
        );
        Ok(inv)
    }

    pub fn get_payments_by_invoice(&self, invoice_id: &str) -> AppResult<Vec<Payment>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, invoice_id, amount_cents, method, reference, received_by, paid_at
             FROM payments WHERE invoice_id = ?1 ORDER BY paid_at",
        )?;
        let rows = stmt.query_map([invoice_id], map_payment_row)?;
        collect(rows)
    }
}

// ============ 사용자 계정 ============

const USER_COLUMNS: &str = "id, username, full_name, email, password_hash, role, is_active, patient_id, \
     last_login_at, created_at, updated_at";

fn map_user_row(row: &Row) -> rusqlite::Result<UserAccount> {
    Ok(UserAccount {
        id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        email: row.get(3)?,
        password_hash: row.get(4)?,
        role: tag(row, 5, |s| s.parse::<Role>())?,
        is_active: row.get(6)?,
        patient_id: row.get(7)?,
        last_login_at: opt_ts(row, 8)?,
        created_at: ts(row, 9)?,
        updated_at: ts(row, 10)?,
    })
}

impl Database {
    pub fn create_user(&self, account: &UserAccount) -> AppResult<()> {
        let conn = self.get_conn()?;
        let result = conn.execute(
            &format!(
                "INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                USER_COLUMNS
            ),
            params![
                account.id,
                account.username,
                account.full_name,
                account.email,
                account.password_hash,
                account.role.as_str(),
                account.is_active,
                account.patient_id,
                account.last_login_at.map(|d| d.to_rfc3339()),
                account.created_at.to_rfc3339(),
                account.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {
                log::info!("사용자 계정 생성됨: {} ({})", account.username, account.role);
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(AppError::Conflict(format!(
                    "이미 사용 중인 아이디입니다: {}",
                    account.username
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_user(&self, id: &str) -> AppResult<Option<UserAccount>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                [id],
                map_user_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_user_by_username(&self, username: &str) -> AppResult<Option<UserAccount>> {
        let conn = self.get_conn()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                [username],
                map_user_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_users(&self) -> AppResult<Vec<UserInfo>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users ORDER BY created_at DESC",
            USER_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_user_row)?;
        Ok(collect(rows)?.into_iter().map(UserInfo::from).collect())
    }

    pub fn update_user(&self, account: &UserAccount) -> AppResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            r#"UPDATE users SET full_name = ?2, email = ?3, password_hash = ?4, role = ?5,
               is_active = ?6, patient_id = ?7, updated_at = ?8 WHERE id = ?1"#,
            params![
                account.id,
                account.full_name,
                account.email,
                account.password_hash,
                account.role.as_str(),
                account.is_active,
                account.patient_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        expect_changed(changed, "user", &account.id)?;
        log::info!("사용자 계정 수정됨: {}", account.username);
        Ok(())
    }

    pub fn delete_user(&self, id: &str) -> AppResult<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
        expect_changed(changed, "user", id)?;
        log::info!("사용자 계정 삭제됨: {}", id);
        Ok(())
    }

    /// 로그인 시간 업데이트
    pub fn update_last_login(&self, id: &str) -> AppResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE users SET last_login_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn count_users(&self, active_only: bool) -> AppResult<i64> {
        let conn = self.get_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM users WHERE (?1 = 0 OR is_active = 1)",
            params![active_only],
            |row| row.get(0),
        )?)
    }

    // ============ 데이터 내보내기 ============

    /// 환자 1명의 전체 기록
    pub fn export_patient_data(&self, patient_id: &str) -> AppResult<PatientExport> {
        let patient = self
            .get_patient(patient_id)?
            .ok_or_else(|| AppError::not_found(format!("patient {}", patient_id)))?;
        let medical_history = self
            .get_medical_history(patient_id)?
            .unwrap_or_else(|| MedicalHistory::empty(patient_id));
        let appointments = self.list_appointments(&AppointmentFilter {
            patient_id: Some(patient_id),
            ..Default::default()
        })?;

        Ok(PatientExport {
            patient,
            medical_history,
            appointments,
            consultations: self.get_consultations_by_patient(patient_id)?,
            prescriptions: self.get_prescriptions_by_patient(patient_id)?,
            lab_reports: self.get_lab_reports_by_patient(patient_id)?,
            invoices: self.list_invoices(Some(patient_id))?,
            exported_at: Utc::now(),
        })
    }
}

// ============ 대시보드 집계 ============

/// 대시보드 카드 집계값 (patient_id 가 있으면 해당 환자 기준)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardCounts {
    pub active_patients: i64,
    pub todays_appointments: i64,
    pub upcoming_appointments: i64,
    pub pending_lab_reports: i64,
    pub active_prescriptions: i64,
    pub unpaid_invoices: i64,
    pub outstanding_cents: i64,
    pub active_users: i64,
}

impl Database {
    pub fn dashboard_counts(&self, patient_id: Option<&str>, now: DateTime<Utc>) -> AppResult<DashboardCounts> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .unwrap_or(now);
        let day_end = day_start + chrono::Duration::days(1);

        let appointments = self.list_appointments(&AppointmentFilter {
            patient_id,
            ..Default::default()
        })?;
        let todays_appointments = appointments
            .iter()
            .filter(|a| a.status != AppointmentStatus::Cancelled)
            .filter(|a| a.scheduled_at >= day_start && a.scheduled_at < day_end)
            .count() as i64;
        let upcoming_appointments = appointments
            .iter()
            .filter(|a| !a.status.is_terminal() && a.scheduled_at >= now)
            .count() as i64;

        let open_invoices: Vec<Invoice> = self
            .list_invoices(patient_id)?
            .into_iter()
            .filter(|inv| inv.is_editable())
            .collect();

        let active_patients = match patient_id {
            Some(_) => 1,
            None => self.count_patients(PatientStatus::Active)?,
        };

        Ok(DashboardCounts {
            active_patients,
            todays_appointments,
            upcoming_appointments,
            pending_lab_reports: self.count_open_lab_reports(patient_id)?,
            active_prescriptions: self.count_prescriptions(PrescriptionStatus::Active, patient_id)?,
            unpaid_invoices: open_invoices.len() as i64,
            outstanding_cents: open_invoices.iter().map(Invoice::balance_cents).sum(),
            active_users: self.count_users(true)?,
        })
    }

    /// 사용자가 한 명도 없으면 최고 관리자 계정 생성
    pub fn ensure_bootstrap_admin(&self, username: &str, password: &str) -> AppResult<bool> {
        if self.count_users(false)? > 0 {
            return Ok(false);
        }
        let hash = crate::auth::hash_password(password)?;
        let account = UserAccount::new(
            username.to_string(),
            "System Administrator".to_string(),
            hash,
            Role::SuperAdmin,
        );
        self.create_user(&account)?;
        log::warn!("초기 관리자 계정 생성: {} (비밀번호를 변경하세요)", username);
        Ok(true)
    }

    /// 활성 계정이 주어진 비밀번호를 그대로 쓰고 있는지 (기본 비밀번호 경고용)
    pub fn password_still_matches(&self, username: &str, password: &str) -> AppResult<bool> {
        Ok(self
            .get_user_by_username(username)?
            .map(|u| u.is_active && crate::auth::verify_password(password, &u.password_hash))
            .unwrap_or(false))
    }
}

//! 목록 검색/정렬/페이지 처리
//!
//! 이미 메모리에 올라온 레코드 목록에 대해 검색어, 상태 필터, 정렬, 페이지 나누기를 적용합니다.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::models::*;

pub const DEFAULT_PER_PAGE: usize = 10;
pub const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// 목록 조회 쿼리 파라미터
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListParams {
    pub search: Option<String>,
    pub status: Option<String>,
    pub sort_by: Option<String>,
    pub order: Option<SortOrder>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl ListParams {
    pub fn page(&self) -> usize {
        self.page.unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> usize {
        self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE)
    }
}

/// 페이지 단위 결과
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            total_pages: self.total_pages,
        }
    }
}

/// 정렬 키 (서로 다른 종류끼리는 비교하지 않음)
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum SortKey {
    Text(String),
    Int(i64),
    Date(NaiveDate),
    Time(DateTime<Utc>),
    None,
}

impl SortKey {
    fn text(s: &str) -> Self {
        SortKey::Text(s.to_lowercase())
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            // 값이 없는 항목은 항상 뒤로
            (SortKey::None, SortKey::None) => Ordering::Equal,
            (SortKey::None, _) => Ordering::Greater,
            (_, SortKey::None) => Ordering::Less,
            _ => self.partial_cmp(other).unwrap_or(Ordering::Equal),
        }
    }
}

/// 목록 처리 대상 레코드
pub trait Listable {
    /// 검색 대상 텍스트 필드
    fn search_fields(&self) -> Vec<&str>;

    fn status_key(&self) -> Option<&str> {
        None
    }

    /// 필드명에 해당하는 정렬 키, 알 수 없는 필드면 None
    fn sort_key(&self, field: &str) -> Option<SortKey>;

    /// 정렬 필드가 없을 때의 기본 정렬 (필드명, 방향)
    fn default_sort() -> (&'static str, SortOrder);

    fn matches_search(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.search_fields()
            .iter()
            .any(|f| f.to_lowercase().contains(&needle))
    }
}

/// 검색 -> 상태 필터 -> 정렬 -> 페이지 순으로 적용
pub fn apply<T: Listable>(items: Vec<T>, params: &ListParams) -> Page<T> {
    let search = params
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let status = params
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("all"));

    let mut filtered: Vec<T> = items
        .into_iter()
        .filter(|item| search.map_or(true, |s| item.matches_search(s)))
        .filter(|item| {
            status.map_or(true, |s| {
                item.status_key()
                    .map(|k| k.eq_ignore_ascii_case(s))
                    .unwrap_or(false)
            })
        })
        .collect();

    let (default_field, default_order) = T::default_sort();
    let requested = params.sort_by.as_deref().map(str::trim).filter(|f| !f.is_empty());
    let (field, order) = match requested {
        // 알 수 없는 필드는 기본 정렬로 대체
        Some(f) if filtered.first().map_or(true, |i| i.sort_key(f).is_some()) => {
            (f, params.order.unwrap_or(SortOrder::Asc))
        }
        _ => (default_field, params.order.unwrap_or(default_order)),
    };

    // 안정 정렬 (같은 키는 원래 순서 유지)
    filtered.sort_by(|a, b| {
        let ka = a.sort_key(field).unwrap_or(SortKey::None);
        let kb = b.sort_key(field).unwrap_or(SortKey::None);
        match (&ka, &kb, order) {
            (SortKey::None, _, _) | (_, SortKey::None, _) => ka.compare(&kb),
            (_, _, SortOrder::Asc) => ka.compare(&kb),
            (_, _, SortOrder::Desc) => kb.compare(&ka),
        }
    });

    let total = filtered.len();
    let page = params.page();
    let per_page = params.per_page();
    let total_pages = total.div_ceil(per_page);
    let items = filtered
        .into_iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .collect();

    Page {
        items,
        total,
        page,
        per_page,
        total_pages,
    }
}

fn opt_text(s: &Option<String>) -> SortKey {
    s.as_deref().map(SortKey::text).unwrap_or(SortKey::None)
}

// ============ 레코드별 구현 ============

impl Listable for Patient {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![
            self.patient_code.as_str(),
            self.first_name.as_str(),
            self.last_name.as_str(),
            self.phone.as_str(),
        ];
        if let Some(email) = &self.email {
            fields.push(email);
        }
        fields
    }

    fn status_key(&self) -> Option<&str> {
        Some(self.status.as_str())
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        Some(match field {
            "patient_code" => SortKey::text(&self.patient_code),
            "name" => SortKey::text(&format!("{} {}", self.last_name, self.first_name)),
            "first_name" => SortKey::text(&self.first_name),
            "last_name" => SortKey::text(&self.last_name),
            "date_of_birth" => SortKey::Date(self.date_of_birth),
            "visit_count" => SortKey::Int(self.visit_count),
            "last_visit_at" => self.last_visit_at.map(SortKey::Time).unwrap_or(SortKey::None),
            "created_at" => SortKey::Time(self.created_at),
            _ => return None,
        })
    }

    fn default_sort() -> (&'static str, SortOrder) {
        ("created_at", SortOrder::Desc)
    }
}

impl Listable for Appointment {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![
            self.appointment_type.as_str(),
            self.patient_id.as_str(),
            self.doctor_id.as_str(),
        ];
        fields.extend(self.reason.as_deref());
        fields.extend(self.notes.as_deref());
        fields
    }

    fn status_key(&self) -> Option<&str> {
        Some(self.status.as_str())
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        Some(match field {
            "scheduled_at" => SortKey::Time(self.scheduled_at),
            "duration_minutes" => SortKey::Int(self.duration_minutes),
            "status" => SortKey::text(self.status.as_str()),
            "appointment_type" => SortKey::text(self.appointment_type.as_str()),
            "created_at" => SortKey::Time(self.created_at),
            _ => return None,
        })
    }

    fn default_sort() -> (&'static str, SortOrder) {
        ("scheduled_at", SortOrder::Asc)
    }
}

impl Listable for Consultation {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.chief_complaint.as_str()];
        for f in [&self.diagnosis, &self.symptoms].into_iter().flatten() {
            fields.push(f);
        }
        fields
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        Some(match field {
            "consultation_date" => SortKey::Date(self.consultation_date),
            "diagnosis" => opt_text(&self.diagnosis),
            "created_at" => SortKey::Time(self.created_at),
            _ => return None,
        })
    }

    fn default_sort() -> (&'static str, SortOrder) {
        ("consultation_date", SortOrder::Desc)
    }
}

impl Listable for Prescription {
    fn search_fields(&self) -> Vec<&str> {
        self.medications.iter().map(|m| m.name.as_str()).collect()
    }

    fn status_key(&self) -> Option<&str> {
        Some(self.status.as_str())
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        Some(match field {
            "prescribed_on" => SortKey::Date(self.prescribed_on),
            "status" => SortKey::text(self.status.as_str()),
            "created_at" => SortKey::Time(self.created_at),
            _ => return None,
        })
    }

    fn default_sort() -> (&'static str, SortOrder) {
        ("prescribed_on", SortOrder::Desc)
    }
}

impl Listable for LabReport {
    fn search_fields(&self) -> Vec<&str> {
        vec![self.test_name.as_str(), self.test_category.as_str()]
    }

    fn status_key(&self) -> Option<&str> {
        Some(self.status.as_str())
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        Some(match field {
            "test_name" => SortKey::text(&self.test_name),
            "ordered_at" => SortKey::Time(self.ordered_at),
            "completed_at" => self.completed_at.map(SortKey::Time).unwrap_or(SortKey::None),
            "status" => SortKey::text(self.status.as_str()),
            _ => return None,
        })
    }

    fn default_sort() -> (&'static str, SortOrder) {
        ("ordered_at", SortOrder::Desc)
    }
}

impl Listable for Invoice {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.invoice_number.as_str()];
        fields.extend(self.items.iter().map(|i| i.description.as_str()));
        fields
    }

    fn status_key(&self) -> Option<&str> {
        Some(self.status.as_str())
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        Some(match field {
            "invoice_number" => SortKey::text(&self.invoice_number),
            "total" => SortKey::Int(self.totals().total_cents),
            "balance" => SortKey::Int(self.balance_cents()),
            "due_date" => self.due_date.map(SortKey::Date).unwrap_or(SortKey::None),
            "created_at" => SortKey::Time(self.created_at),
            _ => return None,
        })
    }

    fn default_sort() -> (&'static str, SortOrder) {
        ("created_at", SortOrder::Desc)
    }
}

impl Listable for UserInfo {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.username.as_str(), self.full_name.as_str()];
        if let Some(email) = &self.email {
            fields.push(email);
        }
        fields
    }

    /// 사용자 목록은 역할로 필터링
    fn status_key(&self) -> Option<&str> {
        Some(self.role.as_str())
    }

    fn sort_key(&self, field: &str) -> Option<SortKey> {
        Some(match field {
            "username" => SortKey::text(&self.username),
            "full_name" => SortKey::text(&self.full_name),
            "role" => SortKey::text(self.role.as_str()),
            "last_login_at" => self.last_login_at.map(SortKey::Time).unwrap_or(SortKey::None),
            "created_at" => SortKey::Time(self.created_at),
            _ => return None,
        })
    }

    fn default_sort() -> (&'static str, SortOrder) {
        ("username", SortOrder::Asc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Row {
        name: &'static str,
        status: &'static str,
        score: Option<i64>,
    }

    impl Listable for Row {
        fn search_fields(&self) -> Vec<&str> {
            vec![self.name]
        }

        fn status_key(&self) -> Option<&str> {
            Some(self.status)
        }

        fn sort_key(&self, field: &str) -> Option<SortKey> {
            match field {
                "name" => Some(SortKey::text(self.name)),
                "score" => Some(self.score.map(SortKey::Int).unwrap_or(SortKey::None)),
                _ => None,
            }
        }

        fn default_sort() -> (&'static str, SortOrder) {
            ("name", SortOrder::Asc)
        }
    }

    fn rows() -> Vec<Row> {
        vec![
            Row { name: "Charlie", status: "Active", score: Some(3) },
            Row { name: "alice", status: "Inactive", score: None },
            Row { name: "Bob", status: "Active", score: Some(7) },
            Row { name: "Alicia", status: "Active", score: Some(5) },
        ]
    }

    fn names(page: &Page<Row>) -> Vec<&'static str> {
        page.items.iter().map(|r| r.name).collect()
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let params = ListParams {
            search: Some("ALI".to_string()),
            ..Default::default()
        };
        let page = apply(rows(), &params);
        assert_eq!(names(&page), vec!["alice", "Alicia"]);
        assert_eq!(page.total, 2);
    }

    #[test]
    fn test_status_filter_and_all() {
        let params = ListParams {
            status: Some("active".to_string()),
            ..Default::default()
        };
        assert_eq!(apply(rows(), &params).total, 3);

        let params = ListParams {
            status: Some("all".to_string()),
            ..Default::default()
        };
        assert_eq!(apply(rows(), &params).total, 4);
    }

    #[test]
    fn test_sort_desc_with_missing_values_last() {
        let params = ListParams {
            sort_by: Some("score".to_string()),
            order: Some(SortOrder::Desc),
            ..Default::default()
        };
        assert_eq!(names(&apply(rows(), &params)), vec!["Bob", "Alicia", "Charlie", "alice"]);

        let params = ListParams {
            sort_by: Some("score".to_string()),
            order: Some(SortOrder::Asc),
            ..Default::default()
        };
        assert_eq!(names(&apply(rows(), &params)), vec!["Charlie", "Alicia", "Bob", "alice"]);
    }

    #[test]
    fn test_unknown_sort_field_falls_back() {
        let params = ListParams {
            sort_by: Some("nope".to_string()),
            ..Default::default()
        };
        assert_eq!(names(&apply(rows(), &params)), vec!["alice", "Alicia", "Bob", "Charlie"]);
    }

    #[test]
    fn test_pagination_bounds() {
        let params = ListParams {
            page: Some(2),
            per_page: Some(3),
            ..Default::default()
        };
        let page = apply(rows(), &params);
        assert_eq!(names(&page), vec!["Charlie"]);
        assert_eq!(page.total_pages, 2);

        let params = ListParams {
            page: Some(9),
            per_page: Some(3),
            ..Default::default()
        };
        let page = apply(rows(), &params);
        assert!(page.items.is_empty());
        assert_eq!(page.total, 4);

        let params = ListParams {
            page: Some(0),
            per_page: Some(0),
            ..Default::default()
        };
        let page = apply(rows(), &params);
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, 1);
        assert_eq!(page.total_pages, 4);

        let params = ListParams {
            per_page: Some(1_000),
            ..Default::default()
        };
        assert_eq!(apply(rows(), &params).per_page, MAX_PER_PAGE);
    }

    #[test]
    fn test_appointment_search_covers_notes_and_people() {
        let now = Utc::now();
        let appt = |doctor: &str, notes: Option<&str>| Appointment {
            id: new_id(),
            patient_id: "patient-aa".to_string(),
            doctor_id: doctor.to_string(),
            scheduled_at: now,
            duration_minutes: 30,
            appointment_type: AppointmentType::FollowUp,
            status: AppointmentStatus::Scheduled,
            reason: None,
            notes: notes.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        let items = vec![appt("doctor-x", Some("Bring MRI films")), appt("doctor-y", None)];

        let search = |needle: &str| ListParams {
            search: Some(needle.to_string()),
            ..Default::default()
        };
        assert_eq!(apply(items.clone(), &search("mri")).total, 1);
        assert_eq!(apply(items.clone(), &search("doctor-y")).total, 1);
        assert_eq!(apply(items, &search("patient-aa")).total, 2);
    }

    #[test]
    fn test_empty_input() {
        let page = apply(Vec::<Row>::new(), &ListParams::default());
        assert_eq!(page.total, 0);
        assert_eq!(page.total_pages, 0);
        assert_eq!(page.page, 1);
    }
}

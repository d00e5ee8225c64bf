//! 선언적 입력값 검증
//!
//! 폼마다 필드별 규칙 목록을 선언하고, 모든 오류를 한 번에 모아서 돌려줍니다.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 필드명 -> 오류 메시지 목록
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    pub fn has(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn messages(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// 문자열 필드 규칙
#[derive(Clone, Copy)]
pub enum Rule<'a> {
    Required,
    MinLen(usize),
    MaxLen(usize),
    Email,
    Phone,
    OneOf(&'a [&'a str]),
    /// 사용자 정의 검사 (검사 함수, 실패 메시지)
    Pattern(fn(&str) -> bool, &'a str),
}

/// 폼 검증 트레이트
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationErrors>;
}

#[derive(Debug, Default)]
pub struct Validator {
    errors: ValidationErrors,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 필수/선택 여부와 관계없이 값이 있는 문자열 필드 검사
    pub fn text(&mut self, field: &str, value: &str, rules: &[Rule]) -> &mut Self {
        let trimmed = value.trim();

        for rule in rules {
            match rule {
                Rule::Required => {
                    if trimmed.is_empty() {
                        self.errors.add(field, "필수 입력 항목입니다");
                        // 비어있으면 나머지 규칙은 의미 없음
                        return self;
                    }
                }
                Rule::MinLen(min) => {
                    if trimmed.chars().count() < *min {
                        self.errors.add(field, format!("최소 {}자 이상이어야 합니다", min));
                    }
                }
                Rule::MaxLen(max) => {
                    if trimmed.chars().count() > *max {
                        self.errors.add(field, format!("최대 {}자까지 입력할 수 있습니다", max));
                    }
                }
                Rule::Email => {
                    if !is_valid_email(trimmed) {
                        self.errors.add(field, "올바른 이메일 형식이 아닙니다");
                    }
                }
                Rule::Phone => {
                    if !is_valid_phone(trimmed) {
                        self.errors.add(field, "올바른 전화번호 형식이 아닙니다");
                    }
                }
                Rule::OneOf(options) => {
                    if !options.contains(&trimmed) {
                        self.errors
                            .add(field, format!("다음 중 하나여야 합니다: {}", options.join(", ")));
                    }
                }
                Rule::Pattern(check, message) => {
                    if !check(trimmed) {
                        self.errors.add(field, *message);
                    }
                }
            }
        }
        self
    }

    /// 선택 입력 필드: 값이 없거나 공백이면 검사하지 않음
    pub fn optional_text(&mut self, field: &str, value: Option<&str>, rules: &[Rule]) -> &mut Self {
        match value {
            Some(v) if !v.trim().is_empty() => self.text(field, v, rules),
            _ => self,
        }
    }

    pub fn range(&mut self, field: &str, value: i64, min: i64, max: i64) -> &mut Self {
        if value < min || value > max {
            self.errors
                .add(field, format!("{} 이상 {} 이하의 값이어야 합니다", min, max));
        }
        self
    }

    pub fn min(&mut self, field: &str, value: i64, min: i64) -> &mut Self {
        if value < min {
            self.errors.add(field, format!("{} 이상의 값이어야 합니다", min));
        }
        self
    }

    pub fn not_in_future(&mut self, field: &str, date: NaiveDate, today: NaiveDate) -> &mut Self {
        if date > today {
            self.errors.add(field, "미래 날짜는 입력할 수 없습니다");
        }
        self
    }

    pub fn not_before(&mut self, field: &str, date: NaiveDate, earliest: NaiveDate) -> &mut Self {
        if date < earliest {
            self.errors.add(field, format!("{} 이후 날짜여야 합니다", earliest));
        }
        self
    }

    pub fn not_empty<T>(&mut self, field: &str, items: &[T]) -> &mut Self {
        if items.is_empty() {
            self.errors.add(field, "최소 1개 이상 입력해야 합니다");
        }
        self
    }

    /// 임의 조건 검사
    pub fn check(&mut self, field: &str, ok: bool, message: &str) -> &mut Self {
        if !ok {
            self.errors.add(field, message);
        }
        self
    }

    /// 중첩 항목 오류를 `items[0].name` 형태로 병합
    pub fn nested(&mut self, prefix: &str, index: usize, result: Result<(), ValidationErrors>) -> &mut Self {
        if let Err(inner) = result {
            for (field, messages) in inner.0 {
                let key = format!("{}[{}].{}", prefix, index, field);
                for m in messages {
                    self.errors.add(&key, m);
                }
            }
        }
        self
    }

    pub fn finish(&mut self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }
}

pub fn is_valid_email(value: &str) -> bool {
    if value.contains(char::is_whitespace) {
        return false;
    }
    let mut parts = value.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| !label.is_empty())
}

pub fn is_valid_phone(value: &str) -> bool {
    let allowed = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' '));
    let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
    allowed && (7..=15).contains(&digits)
}

/// 비밀번호: 8자 이상, 영문자와 숫자 포함
pub fn is_strong_password(value: &str) -> bool {
    value.chars().count() >= 8
        && value.chars().any(|c| c.is_ascii_alphabetic())
        && value.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_short_circuits_field() {
        let result = Validator::new()
            .text("name", "   ", &[Rule::Required, Rule::MinLen(2)])
            .finish();
        let errors = result.unwrap_err();
        assert_eq!(errors.messages("name").len(), 1);
    }

    #[test]
    fn test_collects_all_fields() {
        let errors = Validator::new()
            .text("email", "not-an-email", &[Rule::Required, Rule::Email])
            .text("phone", "12", &[Rule::Phone])
            .text("gender", "x", &[Rule::OneOf(&["male", "female", "other"])])
            .finish()
            .unwrap_err();
        assert!(errors.has("email"));
        assert!(errors.has("phone"));
        assert!(errors.has("gender"));
    }

    #[test]
    fn test_optional_text_skips_blank() {
        assert!(Validator::new()
            .optional_text("email", None, &[Rule::Email])
            .optional_text("email", Some(" "), &[Rule::Email])
            .finish()
            .is_ok());
    }

    #[test]
    fn test_email_and_phone_formats() {
        assert!(is_valid_email("kim@clinic.co.kr"));
        assert!(!is_valid_email("kim@clinic"));
        assert!(!is_valid_email("a@b@c.com"));
        assert!(!is_valid_email("@clinic.com"));
        assert!(!is_valid_email("kim@.com"));

        assert!(is_valid_phone("+82 (10) 1234-5678"));
        assert!(is_valid_phone("0212345678"));
        assert!(!is_valid_phone("123456"));
        assert!(!is_valid_phone("010-abcd-5678"));
    }

    #[test]
    fn test_password_strength() {
        assert!(is_strong_password("clinic2024"));
        assert!(!is_strong_password("short1"));
        assert!(!is_strong_password("onlyletters"));
        assert!(!is_strong_password("12345678"));
    }

    #[test]
    fn test_dates_and_nested() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let tomorrow = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        let mut item = Validator::new();
        item.text("name", "", &[Rule::Required]);

        let errors = Validator::new()
            .not_in_future("date_of_birth", tomorrow, today)
            .nested("medications", 0, item.finish())
            .finish()
            .unwrap_err();
        assert!(errors.has("date_of_birth"));
        assert!(errors.has("medications[0].name"));
    }
}

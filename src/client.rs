//! REST API 클라이언트
//!
//! 대시보드 화면이 사용하는 요청들을 타입으로 감싼 reqwest 클라이언트입니다.
//! 요청마다 한 번만 보내며 재시도나 캐시는 하지 않습니다.

use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::dashboard::DashboardSummary;
use crate::error::{AppError, AppResult};
use crate::forms::*;
use crate::listing::{ListParams, Page};
use crate::models::*;
use crate::web_api::{ApiResponse, LoginResponse, MeResponse, PermissionsResponse};

pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> AppResult<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// 이미 발급받은 토큰 사용
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/api{}", self.base_url, path);
        let req = self.http.request(method, url);
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    /// 응답 본문 텍스트 (실패 응답은 AppError::Api 로 변환)
    async fn read(req: RequestBuilder) -> AppResult<String> {
        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiResponse<serde_json::Value>>(&text)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(text);
            log::debug!("API 요청 실패 ({}): {}", status, message);
            return Err(AppError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(text)
    }

    async fn send<T: DeserializeOwned>(req: RequestBuilder) -> AppResult<T> {
        let text = Self::read(req).await?;
        let envelope: ApiResponse<T> = serde_json::from_str(&text)?;
        envelope
            .data
            .ok_or_else(|| AppError::Custom("Empty API response".to_string()))
    }

    /// data 가 없는 응답 (삭제, 로그아웃)
    async fn send_empty(req: RequestBuilder) -> AppResult<()> {
        Self::read(req).await.map(|_| ())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        Self::send(self.request(Method::GET, path)).await
    }

    async fn list<T: DeserializeOwned>(&self, path: &str, params: &ListParams) -> AppResult<Page<T>> {
        Self::send(self.request(Method::GET, path).query(params)).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> AppResult<T> {
        Self::send(self.request(Method::POST, path).json(body)).await
    }

    async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> AppResult<T> {
        Self::send(self.request(Method::PUT, path).json(body)).await
    }

    async fn delete(&self, path: &str) -> AppResult<()> {
        Self::send_empty(self.request(Method::DELETE, path)).await
    }

    // ============ 인증 ============

    /// 로그인 후 토큰 저장
    pub async fn login(&mut self, username: &str, password: &str) -> AppResult<LoginResponse> {
        let form = LoginForm {
            username: username.to_string(),
            password: password.to_string(),
        };
        let response: LoginResponse = self.post("/auth/login", &form).await?;
        self.token = Some(response.token.clone());
        Ok(response)
    }

    pub async fn logout(&mut self) -> AppResult<()> {
        Self::send_empty(self.request(Method::POST, "/auth/logout")).await?;
        self.token = None;
        Ok(())
    }

    pub async fn me(&self) -> AppResult<MeResponse> {
        self.get("/auth/me").await
    }

    pub async fn permissions(&self) -> AppResult<PermissionsResponse> {
        self.get("/permissions").await
    }

    pub async fn dashboard(&self) -> AppResult<DashboardSummary> {
        self.get("/dashboard").await
    }

    // ============ 환자 ============

    pub async fn list_patients(&self, params: &ListParams) -> AppResult<Page<Patient>> {
        self.list("/patients", params).await
    }

    pub async fn create_patient(&self, form: &PatientForm) -> AppResult<Patient> {
        self.post("/patients", form).await
    }

    pub async fn get_patient(&self, id: &str) -> AppResult<Patient> {
        self.get(&format!("/patients/{}", id)).await
    }

    pub async fn update_patient(&self, id: &str, form: &PatientForm) -> AppResult<Patient> {
        self.put(&format!("/patients/{}", id), form).await
    }

    /// 소프트 삭제된 환자 반환
    pub async fn deactivate_patient(&self, id: &str) -> AppResult<Patient> {
        Self::send(self.request(Method::DELETE, &format!("/patients/{}", id))).await
    }

    pub async fn get_medical_history(&self, patient_id: &str) -> AppResult<MedicalHistory> {
        self.get(&format!("/patients/{}/history", patient_id)).await
    }

    pub async fn save_medical_history(
        &self,
        patient_id: &str,
        form: &MedicalHistoryForm,
    ) -> AppResult<MedicalHistory> {
        self.put(&format!("/patients/{}/history", patient_id), form).await
    }

    pub async fn export_patient(&self, patient_id: &str) -> AppResult<PatientExport> {
        self.get(&format!("/patients/{}/export", patient_id)).await
    }

    // ============ 예약 ============

    pub async fn list_appointments(&self, params: &ListParams) -> AppResult<Page<Appointment>> {
        self.list("/appointments", params).await
    }

    pub async fn create_appointment(&self, form: &AppointmentForm) -> AppResult<Appointment> {
        self.post("/appointments", form).await
    }

    pub async fn update_appointment(&self, id: &str, form: &AppointmentForm) -> AppResult<Appointment> {
        self.put(&format!("/appointments/{}", id), form).await
    }

    pub async fn set_appointment_status(&self, id: &str, status: AppointmentStatus) -> AppResult<Appointment> {
        let form = AppointmentStatusForm {
            status: status.as_str().to_string(),
        };
        self.post(&format!("/appointments/{}/status", id), &form).await
    }

    pub async fn delete_appointment(&self, id: &str) -> AppResult<()> {
        self.delete(&format!("/appointments/{}", id)).await
    }

    // ============ 진료/처방/검사 ============

    pub async fn list_consultations(&self, patient_id: &str, params: &ListParams) -> AppResult<Page<Consultation>> {
        self.list(&format!("/patients/{}/consultations", patient_id), params).await
    }

    pub async fn create_consultation(&self, patient_id: &str, form: &ConsultationForm) -> AppResult<Consultation> {
        self.post(&format!("/patients/{}/consultations", patient_id), form).await
    }

    pub async fn update_consultation(&self, id: &str, form: &ConsultationForm) -> AppResult<Consultation> {
        self.put(&format!("/consultations/{}", id), form).await
    }

    pub async fn delete_consultation(&self, id: &str) -> AppResult<()> {
        self.delete(&format!("/consultations/{}", id)).await
    }

    pub async fn list_prescriptions(&self, patient_id: &str, params: &ListParams) -> AppResult<Page<Prescription>> {
        self.list(&format!("/patients/{}/prescriptions", patient_id), params).await
    }

    pub async fn create_prescription(&self, patient_id: &str, form: &PrescriptionForm) -> AppResult<Prescription> {
        self.post(&format!("/patients/{}/prescriptions", patient_id), form).await
    }

    pub async fn update_prescription(&self, id: &str, form: &PrescriptionForm) -> AppResult<Prescription> {
        self.put(&format!("/prescriptions/{}", id), form).await
    }

    pub async fn delete_prescription(&self, id: &str) -> AppResult<()> {
        self.delete(&format!("/prescriptions/{}", id)).await
    }

    pub async fn list_lab_reports(&self, patient_id: &str, params: &ListParams) -> AppResult<Page<LabReport>> {
        self.list(&format!("/patients/{}/lab-reports", patient_id), params).await
    }

    pub async fn create_lab_report(&self, patient_id: &str, form: &LabReportForm) -> AppResult<LabReport> {
        self.post(&format!("/patients/{}/lab-reports", patient_id), form).await
    }

    pub async fn update_lab_report(&self, id: &str, form: &LabReportForm) -> AppResult<LabReport> {
        self.put(&format!("/lab-reports/{}", id), form).await
    }

    pub async fn delete_lab_report(&self, id: &str) -> AppResult<()> {
        self.delete(&format!("/lab-reports/{}", id)).await
    }

    // ============ 수납 ============

    pub async fn list_invoices(&self, params: &ListParams) -> AppResult<Page<InvoiceDetail>> {
        self.list("/invoices", params).await
    }

    pub async fn create_invoice(&self, form: &InvoiceForm) -> AppResult<InvoiceDetail> {
        self.post("/invoices", form).await
    }

    pub async fn get_invoice(&self, id: &str) -> AppResult<InvoiceDetail> {
        self.get(&format!("/invoices/{}", id)).await
    }

    pub async fn cancel_invoice(&self, id: &str) -> AppResult<InvoiceDetail> {
        Self::send(self.request(Method::DELETE, &format!("/invoices/{}", id))).await
    }

    pub async fn record_payment(&self, invoice_id: &str, form: &PaymentForm) -> AppResult<InvoiceDetail> {
        self.post(&format!("/invoices/{}/payments", invoice_id), form).await
    }

    // ============ 사용자/설정 ============

    pub async fn list_users(&self, params: &ListParams) -> AppResult<Page<UserInfo>> {
        self.list("/users", params).await
    }

    pub async fn create_user(&self, form: &UserForm) -> AppResult<UserInfo> {
        self.post("/users", form).await
    }

    pub async fn update_user(&self, id: &str, form: &UserUpdateForm) -> AppResult<UserInfo> {
        self.put(&format!("/users/{}", id), form).await
    }

    pub async fn delete_user(&self, id: &str) -> AppResult<()> {
        self.delete(&format!("/users/{}", id)).await
    }

    pub async fn get_settings(&self) -> AppResult<ClinicSettings> {
        self.get("/settings").await
    }

    pub async fn save_settings(&self, form: &ClinicSettingsForm) -> AppResult<ClinicSettings> {
        self.put("/settings", form).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{create_router, serve};
    use crate::web_api::tests::test_state;

    /// 임시 포트로 서버 실행 (종료 송신기 반환)
    async fn spawn_server() -> (String, tokio::sync::oneshot::Sender<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let app = create_router(test_state(), true);

        tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            serve(listener, app, shutdown).await.unwrap();
        });
        (format!("http://{}", addr), tx)
    }

    #[tokio::test]
    async fn test_client_against_live_server() {
        let (base_url, shutdown) = spawn_server().await;
        let mut client = ApiClient::new(&base_url).unwrap();

        let err = client.me().await.unwrap_err();
        assert!(matches!(err, AppError::Api { status: 401, .. }));

        let login = client.login("admin", "changeme123").await.unwrap();
        assert_eq!(login.user.username, "admin");
        assert!(client.token().is_some());

        let form = PatientForm {
            first_name: "Sora".to_string(),
            last_name: "Choi".to_string(),
            date_of_birth: "1978-11-02".to_string(),
            gender: "female".to_string(),
            phone: "+82 10 5555 1234".to_string(),
            ..Default::default()
        };
        let patient = client.create_patient(&form).await.unwrap();
        assert_eq!(patient.patient_code, "PT-000001");

        let page = client
            .list_patients(&ListParams {
                search: Some("sora".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let summary = client.dashboard().await.unwrap();
        assert_eq!(summary.cards.active_patients, Some(1));

        // 검증 실패는 422 + 메시지
        let bad = PatientForm::default();
        match client.create_patient(&bad).await {
            Err(AppError::Api { status, .. }) => assert_eq!(status, 422),
            other => panic!("unexpected: {:?}", other.map(|p| p.id)),
        }

        let patient = client.deactivate_patient(&patient.id).await.unwrap();
        assert_eq!(patient.status, PatientStatus::Inactive);

        client.logout().await.unwrap();
        assert!(client.token().is_none());
        assert!(client.dashboard().await.is_err());

        let _ = shutdown.send(());
    }
}

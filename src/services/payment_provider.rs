//! PIX payment provider client.
//!
//! The provider is reached through [`PaymentProvider`]. Production uses
//! [`HttpPixProvider`]; [`GuardedProvider`] wraps any implementation with a
//! deadline and a circuit breaker so a struggling provider fails fast.

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerError},
    config::AppConfig,
    entities::PaymentStatus,
    errors::ServiceError,
};
use async_trait::async_trait;
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, instrument, warn};

/// Payment created at the provider, with the PIX copy-and-paste code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixPayment {
    pub id: String,
    pub qr_code: String,
    pub qr_code_base64: Option<String>,
}

/// Status as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalPaymentStatus {
    Approved,
    Other(String),
}

impl ExternalPaymentStatus {
    pub fn from_provider(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("approved") {
            Self::Approved
        } else {
            Self::Other(raw.trim().to_string())
        }
    }

    /// Only `approved` means anything locally; every other value leaves the
    /// payment pending.
    pub fn into_payment_status(self) -> PaymentStatus {
        match self {
            Self::Approved => PaymentStatus::Approved,
            Self::Other(_) => PaymentStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Approved => "approved",
            Self::Other(raw) => raw,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_payment(
        &self,
        amount: Decimal,
        description: String,
    ) -> Result<PixPayment, ServiceError>;

    async fn get_payment_status(
        &self,
        payment_id: String,
    ) -> Result<ExternalPaymentStatus, ServiceError>;
}

#[derive(Debug, Serialize)]
struct CreatePaymentBody<'a> {
    transaction_amount: Decimal,
    description: &'a str,
    payment_method_id: &'static str,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    qr_code: Option<String>,
    qr_code_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PointOfInteraction {
    transaction_data: Option<TransactionData>,
}

#[derive(Debug, Deserialize)]
struct PaymentResource {
    id: serde_json::Value,
    status: Option<String>,
    point_of_interaction: Option<PointOfInteraction>,
}

impl PaymentResource {
    /// Providers send the id either as a number or a string.
    fn id_string(&self) -> Option<String> {
        match &self.id {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// REST client for a Mercado Pago style PIX API.
#[derive(Debug, Clone)]
pub struct HttpPixProvider {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpPixProvider {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            timeout,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        Self::new(
            config.payment_provider_url.clone(),
            config.payment_provider_token.clone(),
            Duration::from_secs(config.payment_provider_timeout_secs),
        )
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::ProviderTimeout(self.timeout.as_secs())
        } else {
            ServiceError::ProviderUnavailable(err.to_string())
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<PaymentResource, ServiceError> {
        let response = request
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Payment provider returned an error");
            return Err(ServiceError::ProviderUnavailable(format!(
                "provider responded with {}",
                status
            )));
        }

        response
            .json::<PaymentResource>()
            .await
            .map_err(|e| self.map_transport_error(e))
    }
}

#[async_trait]
impl PaymentProvider for HttpPixProvider {
    #[instrument(skip(self))]
    async fn create_payment(
        &self,
        amount: Decimal,
        description: String,
    ) -> Result<PixPayment, ServiceError> {
        let body = CreatePaymentBody {
            transaction_amount: amount,
            description: &description,
            payment_method_id: "pix",
        };
        let resource = self
            .send(self.request(reqwest::Method::POST, "/v1/payments").json(&body))
            .await?;

        let id = resource.id_string().ok_or_else(|| {
            ServiceError::ProviderUnavailable("provider response has no payment id".to_string())
        })?;
        let data = resource
            .point_of_interaction
            .and_then(|p| p.transaction_data);
        let qr_code = data
            .as_ref()
            .and_then(|d| d.qr_code.clone())
            .ok_or_else(|| {
                ServiceError::ProviderUnavailable("provider response has no PIX code".to_string())
            })?;

        debug!(payment_id = %id, "PIX payment created");
        Ok(PixPayment {
            id,
            qr_code,
            qr_code_base64: data.and_then(|d| d.qr_code_base64),
        })
    }

    #[instrument(skip(self))]
    async fn get_payment_status(
        &self,
        payment_id: String,
    ) -> Result<ExternalPaymentStatus, ServiceError> {
        let resource = self
            .send(self.request(reqwest::Method::GET, &format!("/v1/payments/{}", payment_id)))
            .await?;
        let status = resource.status.ok_or_else(|| {
            ServiceError::ProviderUnavailable("provider response has no status".to_string())
        })?;
        Ok(ExternalPaymentStatus::from_provider(&status))
    }
}

/// Bounds every call by `timeout` and routes it through a circuit breaker.
#[derive(Clone)]
pub struct GuardedProvider {
    inner: Arc<dyn PaymentProvider>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl GuardedProvider {
    pub fn new(inner: Arc<dyn PaymentProvider>, breaker: CircuitBreaker, timeout: Duration) -> Self {
        Self {
            inner,
            breaker,
            timeout,
        }
    }

    pub fn from_config(inner: Arc<dyn PaymentProvider>, config: &AppConfig) -> Self {
        Self::new(
            inner,
            CircuitBreaker::new(
                "payment_provider",
                config.circuit_breaker_failure_threshold,
                Duration::from_secs(config.circuit_breaker_timeout_secs),
            ),
            Duration::from_secs(config.payment_provider_timeout_secs),
        )
    }

    async fn guarded<T, F>(&self, op: &'static str, fut: F) -> Result<T, ServiceError>
    where
        F: std::future::Future<Output = Result<T, ServiceError>>,
    {
        let start = Instant::now();
        let timeout = self.timeout;
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(inner) => inner,
                    Err(_) => Err(ServiceError::ProviderTimeout(timeout.as_secs())),
                }
            })
            .await;
        histogram!("provider_call_duration_seconds", start.elapsed(), "op" => op);

        let result = match result {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::CircuitOpen) => Err(ServiceError::ProviderUnavailable(
                "payment provider circuit is open".to_string(),
            )),
            Err(CircuitBreakerError::Inner(e)) => Err(e),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ServiceError::ProviderTimeout(_)) => "timeout",
            Err(_) => "error",
        };
        counter!("provider_calls_total", 1, "op" => op, "result" => outcome);
        if let Err(e) = &result {
            error!(op, error = %e, "Payment provider call failed");
        }
        result
    }
}

#[async_trait]
impl PaymentProvider for GuardedProvider {
    async fn create_payment(
        &self,
        amount: Decimal,
        description: String,
    ) -> Result<PixPayment, ServiceError> {
        self.guarded(
            "create_payment",
            self.inner.create_payment(amount, description),
        )
        .await
    }

    async fn get_payment_status(
        &self,
        payment_id: String,
    ) -> Result<ExternalPaymentStatus, ServiceError> {
        self.guarded("get_payment_status", self.inner.get_payment_status(payment_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn guarded(mock: MockPaymentProvider, threshold: u32, timeout: Duration) -> GuardedProvider {
        GuardedProvider::new(
            Arc::new(mock),
            CircuitBreaker::new("test_provider", threshold, Duration::from_secs(60)),
            timeout,
        )
    }

    #[test]
    fn only_approved_maps_to_approved() {
        assert_eq!(
            ExternalPaymentStatus::from_provider("approved").into_payment_status(),
            PaymentStatus::Approved
        );
        for raw in ["pending", "in_process", "rejected", "cancelled", ""] {
            assert_eq!(
                ExternalPaymentStatus::from_provider(raw).into_payment_status(),
                PaymentStatus::Pending,
                "{raw}"
            );
        }
    }

    #[tokio::test]
    async fn passes_through_successful_calls() {
        let mut mock = MockPaymentProvider::new();
        mock.expect_create_payment()
            .withf(|amount, description| *amount == dec!(25.50) && description.contains("Pedido"))
            .times(1)
            .returning(|_, _| {
                Ok(PixPayment {
                    id: "pay-1".into(),
                    qr_code: "000201...".into(),
                    qr_code_base64: None,
                })
            });

        let provider = guarded(mock, 3, Duration::from_secs(1));
        let payment = provider
            .create_payment(dec!(25.50), "Pedido 1".into())
            .await
            .unwrap();
        assert_eq!(payment.id, "pay-1");
    }

    #[tokio::test]
    async fn opens_circuit_after_repeated_failures() {
        let mut mock = MockPaymentProvider::new();
        mock.expect_get_payment_status()
            .times(2)
            .returning(|_| Err(ServiceError::ProviderUnavailable("down".into())));

        let provider = guarded(mock, 2, Duration::from_secs(1));
        for _ in 0..2 {
            assert_matches!(
                provider.get_payment_status("p".into()).await,
                Err(ServiceError::ProviderUnavailable(_))
            );
        }

        // Third call is rejected without reaching the mock.
        assert_matches!(
            provider.get_payment_status("p".into()).await,
            Err(ServiceError::ProviderUnavailable(msg)) if msg.contains("circuit")
        );
    }

    struct SlowProvider;

    #[async_trait]
    impl PaymentProvider for SlowProvider {
        async fn create_payment(&self, _: Decimal, _: String) -> Result<PixPayment, ServiceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ServiceError::InternalError("unreachable".into()))
        }

        async fn get_payment_status(&self, _: String) -> Result<ExternalPaymentStatus, ServiceError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ExternalPaymentStatus::Approved)
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let provider = GuardedProvider::new(
            Arc::new(SlowProvider),
            CircuitBreaker::new("slow", 5, Duration::from_secs(60)),
            Duration::from_millis(50),
        );
        assert_matches!(
            provider.get_payment_status("p".into()).await,
            Err(ServiceError::ProviderTimeout(_))
        );
    }
}

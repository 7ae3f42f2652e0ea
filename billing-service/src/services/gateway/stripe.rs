//! Stripe payment processor client.
//!
//! Talks to Stripe's form-encoded REST API for customers, setup intents, off-session
//! payment intents and refunds.

use super::{
    CardDetails, ChargeOutcome, ChargeRequest, ChargeStatus, GatewayError, PaymentGateway, Refund,
    SetupIntent,
};
use crate::config::StripeConfig;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::Duration;

/// Stripe client for interacting with the Stripe API.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeSetupIntent {
    id: String,
    customer: Option<String>,
    client_secret: Option<String>,
    status: String,
    /// Either an id or, when expanded, the payment method object.
    payment_method: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentMethod {
    id: String,
    card: Option<StripeCard>,
}

#[derive(Debug, Deserialize)]
struct StripeCard {
    brand: Option<String>,
    last4: Option<String>,
    exp_month: Option<i32>,
    exp_year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
}

/// Stripe API error response.
#[derive(Debug, Deserialize)]
struct StripeError {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    code: Option<String>,
    message: Option<String>,
    payment_intent: Option<StripePaymentIntent>,
}

impl From<StripeSetupIntent> for SetupIntent {
    fn from(intent: StripeSetupIntent) -> Self {
        let (payment_method_id, card) = match intent.payment_method {
            Some(serde_json::Value::String(id)) => (Some(id), None),
            Some(value @ serde_json::Value::Object(_)) => {
                match serde_json::from_value::<StripePaymentMethod>(value) {
                    Ok(pm) => (
                        Some(pm.id),
                        pm.card.map(|c| CardDetails {
                            brand: c.brand,
                            last_four: c.last4,
                            exp_month: c.exp_month,
                            exp_year: c.exp_year,
                        }),
                    ),
                    Err(_) => (None, None),
                }
            }
            _ => (None, None),
        };

        SetupIntent {
            id: intent.id,
            customer_id: intent.customer,
            client_secret: intent.client_secret,
            status: intent.status,
            payment_method_id,
            card,
        }
    }
}

impl StripeGateway {
    /// Create a new Stripe client.
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Check if Stripe is configured (secret key is set).
    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }
        Ok(builder.bearer_auth(self.config.secret_key.expose_secret()))
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        builder: RequestBuilder,
        operation: &str,
    ) -> Result<T, GatewayError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, operation = operation, "Stripe response");

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| {
                GatewayError::Request(format!("Invalid Stripe {} response: {}", operation, e))
            })
        } else {
            Err(api_error(status, &body, operation))
        }
    }
}

fn api_error(status: StatusCode, body: &str, operation: &str) -> GatewayError {
    let message = serde_json::from_str::<StripeError>(body)
        .ok()
        .and_then(|e| e.error.message.or(e.error.code))
        .unwrap_or_else(|| body.to_string());
    tracing::error!(status = %status, operation = operation, error = %message, "Stripe request failed");
    GatewayError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, email: &str, name: Option<&str>) -> Result<String, GatewayError> {
        let mut form = vec![("email", email.to_string())];
        if let Some(name) = name {
            form.push(("name", name.to_string()));
        }

        let request = self.authorized(self.client.post(self.url("customers")))?.form(&form);
        let customer: StripeCustomer = self.send(request, "create_customer").await?;

        tracing::info!(customer_id = %customer.id, "Stripe customer created");
        Ok(customer.id)
    }

    async fn create_setup_intent(&self, customer_id: &str) -> Result<SetupIntent, GatewayError> {
        let form = [
            ("customer", customer_id),
            ("payment_method_types[]", "card"),
            ("usage", "off_session"),
        ];

        let request = self
            .authorized(self.client.post(self.url("setup_intents")))?
            .form(&form);
        let intent: StripeSetupIntent = self.send(request, "create_setup_intent").await?;

        Ok(intent.into())
    }

    async fn retrieve_setup_intent(
        &self,
        setup_intent_id: &str,
    ) -> Result<SetupIntent, GatewayError> {
        let request = self
            .authorized(
                self.client
                    .get(self.url(&format!("setup_intents/{}", setup_intent_id))),
            )?
            .query(&[("expand[]", "payment_method")]);
        let intent: StripeSetupIntent = self.send(request, "retrieve_setup_intent").await?;

        Ok(intent.into())
    }

    async fn charge_off_session(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeOutcome, GatewayError> {
        let mut form = vec![
            ("amount", request.amount_minor_units.to_string()),
            ("currency", request.currency.to_lowercase()),
            ("customer", request.customer_id.clone()),
            ("payment_method", request.payment_method_id.clone()),
            ("off_session", "true".to_string()),
            ("confirm", "true".to_string()),
        ];
        if let Some(description) = &request.description {
            form.push(("description", description.clone()));
        }

        let mut builder = self
            .authorized(self.client.post(self.url("payment_intents")))?
            .form(&form);
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let intent: StripePaymentIntent = serde_json::from_str(&body).map_err(|e| {
                GatewayError::Request(format!("Invalid Stripe payment intent response: {}", e))
            })?;
            tracing::info!(
                payment_intent_id = %intent.id,
                status = %intent.status,
                amount = request.amount_minor_units,
                "Stripe payment intent confirmed"
            );
            return Ok(ChargeOutcome {
                status: ChargeStatus::parse(&intent.status),
                charge_id: Some(intent.id),
            });
        }

        // Card declines and authentication demands come back as 402 with the intent attached.
        if status == StatusCode::PAYMENT_REQUIRED {
            if let Ok(StripeError {
                error:
                    StripeErrorDetail {
                        payment_intent: Some(intent),
                        code,
                        ..
                    },
            }) = serde_json::from_str::<StripeError>(&body)
            {
                tracing::warn!(
                    payment_intent_id = %intent.id,
                    status = %intent.status,
                    code = code.as_deref().unwrap_or("unknown"),
                    "Stripe off-session charge not completed"
                );
                let status = if code.as_deref() == Some("authentication_required") {
                    ChargeStatus::RequiresAction
                } else {
                    ChargeStatus::parse(&intent.status)
                };
                return Ok(ChargeOutcome {
                    status,
                    charge_id: Some(intent.id),
                });
            }
        }

        Err(api_error(status, &body, "charge_off_session"))
    }

    async fn refund_charge(
        &self,
        charge_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Refund, GatewayError> {
        let mut builder = self
            .authorized(self.client.post(self.url("refunds")))?
            .form(&[("payment_intent", charge_id)]);
        if let Some(key) = idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }

        let refund: StripeRefund = self.send(builder, "refund_charge").await?;
        tracing::info!(refund_id = %refund.id, payment_intent_id = %charge_id, "Stripe refund created");

        Ok(Refund {
            refund_id: refund.id,
            status: refund.status,
        })
    }
}

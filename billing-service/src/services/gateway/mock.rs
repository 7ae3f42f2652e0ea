use super::{
    CardDetails, ChargeOutcome, ChargeRequest, ChargeStatus, GatewayError, PaymentGateway, Refund,
    SetupIntent,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock payment gateway for testing and local runs.
///
/// Charges succeed unless a status has been scripted with `push_charge_status`.
/// Every charge and refund is recorded.
#[derive(Default)]
pub struct MockPaymentGateway {
    counter: AtomicU64,
    charge_statuses: Mutex<VecDeque<ChargeStatus>>,
    charges: Mutex<Vec<ChargeRequest>>,
    refunds: Mutex<Vec<String>>,
    setup_intents: Mutex<HashMap<String, SetupIntent>>,
    unavailable: Mutex<bool>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_mock_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Queue the status returned by the next charge.
    pub fn push_charge_status(&self, status: ChargeStatus) {
        lock(&self.charge_statuses).push_back(status);
    }

    /// Make every call fail as if the processor were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        *lock(&self.unavailable) = unavailable;
    }

    /// Mark a setup intent as confirmed by the customer with the given card.
    pub fn complete_setup_intent(&self, setup_intent_id: &str, payment_method_id: &str, card: CardDetails) {
        let mut intents = lock(&self.setup_intents);
        let intent = intents
            .entry(setup_intent_id.to_string())
            .or_insert_with(|| SetupIntent {
                id: setup_intent_id.to_string(),
                customer_id: None,
                client_secret: Some(format!("{}_secret", setup_intent_id)),
                status: "requires_payment_method".to_string(),
                payment_method_id: None,
                card: None,
            });
        intent.status = "succeeded".to_string();
        intent.payment_method_id = Some(payment_method_id.to_string());
        intent.card = Some(card);
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        lock(&self.charges).clone()
    }

    pub fn refunds(&self) -> Vec<String> {
        lock(&self.refunds).clone()
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if *lock(&self.unavailable) {
            return Err(GatewayError::Request("mock gateway unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_customer(&self, email: &str, _name: Option<&str>) -> Result<String, GatewayError> {
        self.check_available()?;
        let id = self.next_id("cus");
        tracing::info!(email = %email, customer_id = %id, "[MOCK] Customer would be created");
        Ok(id)
    }

    async fn create_setup_intent(&self, customer_id: &str) -> Result<SetupIntent, GatewayError> {
        self.check_available()?;
        let id = self.next_id("seti");
        let intent = SetupIntent {
            id: id.clone(),
            customer_id: Some(customer_id.to_string()),
            client_secret: Some(format!("{}_secret", id)),
            status: "requires_payment_method".to_string(),
            payment_method_id: None,
            card: None,
        };
        lock(&self.setup_intents).insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_setup_intent(
        &self,
        setup_intent_id: &str,
    ) -> Result<SetupIntent, GatewayError> {
        self.check_available()?;
        lock(&self.setup_intents)
            .get(setup_intent_id)
            .cloned()
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("No such setupintent: '{}'", setup_intent_id),
            })
    }

    async fn charge_off_session(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeOutcome, GatewayError> {
        self.check_available()?;
        lock(&self.charges).push(request.clone());
        let status = lock(&self.charge_statuses)
            .pop_front()
            .unwrap_or(ChargeStatus::Succeeded);
        tracing::info!(
            amount = request.amount_minor_units,
            status = %status.as_str(),
            "[MOCK] Off-session charge"
        );
        Ok(ChargeOutcome {
            status,
            charge_id: Some(self.next_id("pi")),
        })
    }

    async fn refund_charge(
        &self,
        charge_id: &str,
        _idempotency_key: Option<&str>,
    ) -> Result<Refund, GatewayError> {
        self.check_available()?;
        lock(&self.refunds).push(charge_id.to_string());
        Ok(Refund {
            refund_id: self.next_id("re"),
            status: "succeeded".to_string(),
        })
    }
}

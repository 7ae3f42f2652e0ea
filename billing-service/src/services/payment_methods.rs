//! Saved payment methods, mirrored from the payment processor.

use crate::error::BillingError;
use crate::models::{Customer, PaymentMethod, PaymentMethodType};
use crate::services::clock::Clock;
use crate::services::gateway::PaymentGateway;
use crate::services::store::BillingStore;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// What the client needs to collect card details against a setup intent.
#[derive(Debug, Clone, Serialize)]
pub struct SetupIntentResponse {
    pub setup_intent_id: String,
    pub client_secret: Option<String>,
}

pub struct PaymentMethodService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
}

impl PaymentMethodService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
        }
    }

    async fn require_customer(&self, user_id: Uuid) -> Result<Customer, BillingError> {
        self.store
            .get_customer(user_id)
            .await?
            .ok_or(BillingError::UserNotFound)
    }

    /// Create or refresh the billing customer mirrored from the user directory.
    ///
    /// Contact details are overwritten; an existing processor customer reference is kept.
    #[instrument(skip(self, email, full_name))]
    pub async fn sync_customer(
        &self,
        user_id: Uuid,
        email: &str,
        full_name: Option<&str>,
    ) -> Result<Customer, BillingError> {
        let customer = self
            .store
            .upsert_customer(&Customer {
                user_id,
                email: email.to_string(),
                full_name: full_name.map(str::to_string),
                external_customer_id: None,
                created_utc: self.clock.now(),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            has_processor_customer = customer.external_customer_id.is_some(),
            "Customer synced"
        );
        Ok(customer)
    }

    /// Processor customer id for the user, creating the customer on first use.
    #[instrument(skip(self))]
    pub async fn get_or_create_customer(&self, user_id: Uuid) -> Result<String, BillingError> {
        let customer = self.require_customer(user_id).await?;
        if let Some(existing) = customer.external_customer_id {
            return Ok(existing);
        }

        let customer_id = self
            .gateway
            .create_customer(&customer.email, customer.full_name.as_deref())
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;
        self.store
            .set_external_customer_id(user_id, &customer_id)
            .await?;

        tracing::info!(user_id = %user_id, customer_id = %customer_id, "Processor customer created");
        Ok(customer_id)
    }

    #[instrument(skip(self))]
    pub async fn create_setup_intent(
        &self,
        user_id: Uuid,
    ) -> Result<SetupIntentResponse, BillingError> {
        let customer_id = self.get_or_create_customer(user_id).await?;
        let intent = self
            .gateway
            .create_setup_intent(&customer_id)
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        Ok(SetupIntentResponse {
            setup_intent_id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    /// Save the method attached to a completed setup intent and make it the default.
    /// Confirming the same processor method twice returns the saved row.
    #[instrument(skip(self))]
    pub async fn confirm_payment_method(
        &self,
        user_id: Uuid,
        setup_intent_id: &str,
    ) -> Result<PaymentMethod, BillingError> {
        let customer = self.require_customer(user_id).await?;
        let intent = self
            .gateway
            .retrieve_setup_intent(setup_intent_id)
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        if intent.customer_id.is_none()
            || intent.customer_id != customer.external_customer_id
        {
            tracing::warn!(
                user_id = %user_id,
                setup_intent_id = %setup_intent_id,
                "Setup intent belongs to a different customer"
            );
            return Err(BillingError::Unauthorized);
        }

        if intent.status != "succeeded" {
            return Err(BillingError::InvalidTransition(format!(
                "Setup intent not succeeded (status: {})",
                intent.status
            )));
        }
        let external_id = intent.payment_method_id.ok_or_else(|| {
            BillingError::Validation("Setup intent has no payment method".to_string())
        })?;

        if let Some(existing) = self
            .store
            .find_payment_method_by_external_id(user_id, &external_id)
            .await?
        {
            return Ok(existing);
        }

        let card = intent.card.unwrap_or_default();
        let method = PaymentMethod {
            payment_method_id: Uuid::new_v4(),
            user_id,
            method_type: PaymentMethodType::Card.as_str().to_string(),
            is_default: true,
            card_brand: card.brand.map(|b| b.to_uppercase()),
            card_last_four: card.last_four,
            card_exp_month: card.exp_month,
            card_exp_year: card.exp_year,
            external_payment_method_id: Some(external_id.clone()),
            billing_email: Some(customer.email),
            created_utc: self.clock.now(),
        };

        match self.store.insert_payment_method(&method).await {
            Ok(saved) => {
                tracing::info!(
                    payment_method_id = %saved.payment_method_id,
                    "Payment method saved as default"
                );
                Ok(saved)
            }
            // A concurrent confirm of the same intent got there first.
            Err(AppError::Conflict(_)) => self
                .store
                .find_payment_method_by_external_id(user_id, &external_id)
                .await?
                .ok_or(BillingError::PaymentMethodNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Default first, then newest.
    #[instrument(skip(self))]
    pub async fn list_payment_methods(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<PaymentMethod>, BillingError> {
        Ok(self.store.list_payment_methods(user_id).await?)
    }

    #[instrument(skip(self))]
    pub async fn set_default_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<PaymentMethod, BillingError> {
        let method = self
            .store
            .set_default_payment_method(user_id, payment_method_id)
            .await?
            .ok_or(BillingError::PaymentMethodNotFound)?;
        tracing::info!(payment_method_id = %payment_method_id, "Default payment method changed");
        Ok(method)
    }

    /// Remove a saved method. The only method cannot be removed while a subscription is
    /// active; removing the default promotes the newest remaining method.
    #[instrument(skip(self))]
    pub async fn delete_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<(), BillingError> {
        let method = self
            .store
            .get_payment_method(payment_method_id)
            .await?
            .ok_or(BillingError::PaymentMethodNotFound)?;
        if method.user_id != user_id {
            return Err(BillingError::Unauthorized);
        }

        let methods = self.store.list_payment_methods(user_id).await?;
        if methods.len() <= 1
            && self
                .store
                .find_active_subscription(user_id)
                .await?
                .is_some()
        {
            return Err(BillingError::LastPaymentMethod);
        }

        if !self.store.delete_payment_method(payment_method_id).await? {
            return Err(BillingError::PaymentMethodNotFound);
        }
        tracing::info!(payment_method_id = %payment_method_id, "Payment method deleted");

        if method.is_default {
            let remaining = self.store.list_payment_methods(user_id).await?;
            if let Some(newest) = remaining.first() {
                self.store
                    .set_default_payment_method(user_id, newest.payment_method_id)
                    .await?;
                tracing::info!(
                    payment_method_id = %newest.payment_method_id,
                    "Promoted payment method to default"
                );
            }
        }

        Ok(())
    }
}

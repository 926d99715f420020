//! Event ingestion pipeline
//!
//! One call handles one event: policy lookup, idempotency key, duplicate
//! check, consent decision, privacy transform and the store insert. The
//! store insert is the authority on duplicates, so concurrent calls with the
//! same key store at most one event.

use std::sync::Arc;

use chrono::Utc;
use pulse_core::privacy::{build_user_identity, process_ip};
use pulse_core::revenue::parse_revenue_fields;
use pulse_core::{
    ConsentPolicyEngine, ConsentState, DeniedBehavior, EventPayload, EventTimestamp,
    PolicyAction, PolicyTemplate, PrivacyError, RequestContext, ResolvedSitePolicy, StoredEvent,
    TrafficFilter, UserInput, ValidationError,
};
use pulse_storage::{EventStore, InsertOutcome, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::PrivacyConfig;
use crate::policy_store::PolicyStore;

pub const REASON_IDEMPOTENCY_KEY_EXISTS: &str = "idempotency_key_exists";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("policy violation: {0}")]
    PolicyViolation(#[from] PrivacyError),

    #[error("failed to derive idempotency key: {0}")]
    IdempotencyKey(#[source] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Stored,
    Dropped,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionOutcome {
    pub status: IngestionStatus,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub policy_template: PolicyTemplate,
    pub denied_behavior: DeniedBehavior,
}

impl IngestionOutcome {
    fn new(
        status: IngestionStatus,
        idempotency_key: String,
        reason: Option<&'static str>,
        policy: &ResolvedSitePolicy,
    ) -> Self {
        Self {
            status,
            idempotency_key,
            reason,
            policy_template: policy.template,
            denied_behavior: policy.denied_behavior,
        }
    }
}

pub struct IngestionService {
    store: Arc<dyn EventStore>,
    policies: Arc<dyn PolicyStore>,
    engine: ConsentPolicyEngine,
    privacy: PrivacyConfig,
    traffic_filter: Option<TrafficFilter>,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn EventStore>,
        policies: Arc<dyn PolicyStore>,
        privacy: PrivacyConfig,
    ) -> Self {
        Self {
            store,
            policies,
            engine: ConsentPolicyEngine::new(),
            privacy,
            traffic_filter: None,
        }
    }

    /// Reject filtered traffic before any store access
    pub fn with_traffic_filter(mut self, filter: TrafficFilter) -> Self {
        self.traffic_filter = Some(filter);
        self
    }

    #[instrument(skip(self, payload, context), fields(site_id = %payload.site_id, event_name = %payload.event_name))]
    pub async fn ingest(
        &self,
        payload: &EventPayload,
        context: &RequestContext,
    ) -> Result<IngestionOutcome, IngestError> {
        let policy = self.policies.get_policy(&payload.site_id);
        let idempotency_key = resolve_idempotency_key(payload)?;

        if let Some(filter) = &self.traffic_filter {
            if let Err(rejection) = filter.evaluate(context) {
                debug!(reason = rejection.as_str(), "dropped filtered traffic");
                return Ok(IngestionOutcome::new(
                    IngestionStatus::Dropped,
                    idempotency_key,
                    Some(rejection.as_str()),
                    &policy,
                ));
            }
        }

        if self
            .store
            .is_duplicate(&payload.site_id, &idempotency_key)
            .await?
        {
            debug!(idempotency_key = %idempotency_key, "duplicate event");
            return Ok(IngestionOutcome::new(
                IngestionStatus::Duplicate,
                idempotency_key,
                Some(REASON_IDEMPOTENCY_KEY_EXISTS),
                &policy,
            ));
        }

        let decision = self.engine.evaluate(payload.consent_state, &policy);
        if decision.action == PolicyAction::Drop {
            debug!(reason = ?decision.reason, "dropped by consent policy");
            return Ok(IngestionOutcome::new(
                IngestionStatus::Dropped,
                idempotency_key,
                decision.reason,
                &policy,
            ));
        }

        let event = self.build_event(
            payload,
            context,
            &policy,
            idempotency_key.clone(),
            decision.minimal_payload,
        )?;

        if self.store.insert_event(event).await? == InsertOutcome::Duplicate {
            debug!(idempotency_key = %idempotency_key, "lost insert race");
            return Ok(IngestionOutcome::new(
                IngestionStatus::Duplicate,
                idempotency_key,
                Some(REASON_IDEMPOTENCY_KEY_EXISTS),
                &policy,
            ));
        }

        debug!(idempotency_key = %idempotency_key, "stored event");
        Ok(IngestionOutcome::new(
            IngestionStatus::Stored,
            idempotency_key,
            decision.reason,
            &policy,
        ))
    }

    fn build_event(
        &self,
        payload: &EventPayload,
        context: &RequestContext,
        policy: &ResolvedSitePolicy,
        idempotency_key: String,
        minimal_payload: bool,
    ) -> Result<StoredEvent, IngestError> {
        let event_ts = payload.ts.parse()?;
        let properties = if minimal_payload {
            Map::new()
        } else {
            payload.properties.clone()
        };

        let identity = build_user_identity(
            payload.user.as_ref(),
            &self.privacy.stable_id_salt,
            &payload.session_id,
        )?;
        let ip = process_ip(
            context.client_ip.as_deref(),
            policy.ip_storage_mode,
            &self.privacy.ip_hash_salt,
        );
        let revenue = parse_revenue_fields(&payload.event_name, &properties);

        Ok(StoredEvent {
            event_id: Uuid::now_v7(),
            site_id: payload.site_id.clone(),
            event_name: payload.event_name.clone(),
            event_ts,
            ingested_at: Utc::now(),
            properties,
            consent_state: payload.consent_state,
            policy_template: policy.template,
            denied_behavior: policy.denied_behavior,
            user_kind: identity.kind,
            user_id: identity.user_id,
            session_id: payload.session_id.clone(),
            stable_id_hash: identity.stable_id_hash,
            idempotency_key,
            user_agent: context.user_agent.clone(),
            asn: context.asn,
            ip_masked: ip.masked,
            ip_hash: ip.hashed,
            revenue_amount: revenue.amount,
            revenue_currency: revenue.currency,
            product: revenue.product,
            payment_provider: revenue.payment_provider,
        })
    }
}

/// Fields hashed into the fallback idempotency key, in this order
#[derive(Serialize)]
struct KeyBase<'a> {
    site_id: &'a str,
    session_id: &'a str,
    event_name: &'a str,
    ts: &'a EventTimestamp,
    properties: &'a Map<String, Value>,
    consent_state: ConsentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a UserInput>,
}

/// The caller's key when non-blank, otherwise a SHA-256 of the normalized payload
pub fn resolve_idempotency_key(payload: &EventPayload) -> Result<String, IngestError> {
    if let Some(key) = payload.idempotency_key.as_deref().map(str::trim) {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    let base = serde_json::to_vec(&KeyBase {
        site_id: &payload.site_id,
        session_id: &payload.session_id,
        event_name: &payload.event_name,
        ts: &payload.ts,
        properties: &payload.properties,
        consent_state: payload.consent_state,
        user: payload.user.as_ref(),
    })
    .map_err(IngestError::IdempotencyKey)?;

    Ok(hex::encode(Sha256::digest(&base)))
}

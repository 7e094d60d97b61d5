//! The metered request pipeline.
//!
//! admission → resolution → dispatch → metering → usage record → ledger (success only).
//! Everything after dispatch runs whether the provider call succeeded or not.

use crate::admission::{Admission, AdmissionController, AdmissionDecision, DenialReason, RateLimitInfo};
use crate::catalog::Capability;
use crate::config::LogVerbosity;
use crate::dispatch::{DispatchRequest, ProviderDispatcher};
use crate::error::GatewayError;
use crate::ledger::BillingLedgerUpdater;
use crate::logger;
use crate::metering::TokenUsage;
use crate::resolver::{ModelResolver, ResolveError};
use crate::store::{CallerDirectory, Plan, StoreError, UsageStore};
use crate::usage::{AttemptContext, ClientMeta, Endpoint, Outcome, UsageRecord};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// One authenticated gateway call.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub caller_id: String,
    pub request_id: String,
    pub client: ClientMeta,
    pub model: String,
    pub payload: DispatchRequest,
}

impl GatewayRequest {
    pub fn endpoint(&self) -> Endpoint {
        match self.payload {
            DispatchRequest::Chat { .. } => Endpoint::ChatCompletions,
            DispatchRequest::Embed { .. } => Endpoint::Embeddings,
        }
    }

    fn capability(&self) -> Capability {
        match self.payload {
            DispatchRequest::Chat { .. } => Capability::Chat,
            DispatchRequest::Embed { .. } => Capability::Embed,
        }
    }
}

/// Normalized provider body plus what was recorded for it.
#[derive(Debug, Clone)]
pub struct Completion {
    pub body: Value,
    pub usage: TokenUsage,
    pub record_id: String,
}

/// Result of one pass through the pipeline. Rate-limit telemetry is reported either way.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub rate_limit: Option<RateLimitInfo>,
    pub result: Result<Completion, GatewayError>,
}

pub struct Gateway {
    directory: Arc<dyn CallerDirectory>,
    admission: AdmissionController,
    resolver: ModelResolver,
    dispatcher: ProviderDispatcher,
    usage: Arc<dyn UsageStore>,
    ledger: BillingLedgerUpdater,
    verbosity: LogVerbosity,
}

impl Gateway {
    pub fn new(
        directory: Arc<dyn CallerDirectory>,
        admission: AdmissionController,
        resolver: ModelResolver,
        dispatcher: ProviderDispatcher,
        usage: Arc<dyn UsageStore>,
        ledger: BillingLedgerUpdater,
    ) -> Self {
        Self {
            directory,
            admission,
            resolver,
            dispatcher,
            usage,
            ledger,
            verbosity: LogVerbosity::default(),
        }
    }

    pub fn with_verbosity(mut self, verbosity: LogVerbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    /// Map an API key to a caller id.
    pub async fn authenticate(&self, api_key: &str) -> Result<String, GatewayError> {
        match self.directory.authenticate(api_key).await {
            Ok(Some(caller_id)) => Ok(caller_id),
            Ok(None) => Err(GatewayError::Unauthorized),
            Err(e) => {
                tracing::error!(error = %e, "API key lookup failed");
                Err(GatewayError::Internal)
            }
        }
    }

    pub async fn plan(&self, caller_id: &str) -> Result<Plan, GatewayError> {
        self.directory.get_plan(caller_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => GatewayError::Forbidden("No active plan for this API key".to_string()),
            other => {
                tracing::error!(caller_id, error = %other, "Plan lookup failed");
                GatewayError::Internal
            }
        })
    }

    pub async fn handle(&self, request: GatewayRequest) -> PipelineOutcome {
        let plan = match self.plan(&request.caller_id).await {
            Ok(plan) => plan,
            Err(e) => return PipelineOutcome { rate_limit: None, result: Err(e) },
        };

        let Admission { decision, rate_limit } = self.admission.check(&request.caller_id, &plan).await;
        match decision {
            AdmissionDecision::Allowed => {}
            AdmissionDecision::Degraded { cause } => {
                tracing::info!(
                    caller_id = %request.caller_id,
                    request_id = %request.request_id,
                    cause = %cause,
                    "Admitted in degraded mode"
                );
            }
            AdmissionDecision::Denied(reason) => {
                tracing::info!(
                    caller_id = %request.caller_id,
                    request_id = %request.request_id,
                    reason = ?reason,
                    "Request denied by admission control"
                );
                return PipelineOutcome {
                    rate_limit,
                    result: Err(denial_error(reason)),
                };
            }
        }

        let result = self.resolve_and_dispatch(&request, &plan).await;
        PipelineOutcome { rate_limit, result }
    }

    async fn resolve_and_dispatch(
        &self,
        request: &GatewayRequest,
        plan: &Plan,
    ) -> Result<Completion, GatewayError> {
        let descriptor = self
            .resolver
            .resolve(&request.model, &request.caller_id, plan.byom_enabled, request.capability())
            .await
            .map_err(|e| {
                tracing::info!(
                    caller_id = %request.caller_id,
                    request_id = %request.request_id,
                    model = %request.model,
                    reason = %e,
                    "Model resolution failed"
                );
                resolve_error(e)
            })?;

        let started = Instant::now();
        let dispatched = self
            .dispatcher
            .dispatch(&descriptor, &request.model, &request.caller_id, &request.payload)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let ctx = AttemptContext {
            caller_id: request.caller_id.clone(),
            request_id: request.request_id.clone(),
            endpoint: request.endpoint(),
            client: request.client.clone(),
        };
        let (tokens, outcome) = match &dispatched {
            Ok(d) => (d.usage, Outcome::Succeeded),
            Err(e) => {
                tracing::warn!(
                    caller_id = %request.caller_id,
                    request_id = %request.request_id,
                    model = %descriptor.id(),
                    kind = ?e.kind,
                    error = %e.message,
                    "Dispatch failed"
                );
                (TokenUsage::zero(), Outcome::Failed { error: e.message.clone() })
            }
        };
        let record = UsageRecord::meter(&ctx, &descriptor, tokens, latency_ms, outcome);

        if let Err(e) = self.usage.append(&record).await {
            tracing::error!(
                caller_id = %record.caller_id,
                request_id = %record.request_id,
                error = %e,
                "Failed to append usage record"
            );
            return Err(GatewayError::Internal);
        }

        if let Err(e) = self.ledger.apply(&record).await {
            tracing::error!(
                caller_id = %record.caller_id,
                request_id = %record.request_id,
                tokens = record.tokens.total(),
                error = %e,
                "Failed to apply usage to billing ledger"
            );
            return Err(GatewayError::Internal);
        }

        logger::log_usage(&record, self.verbosity);

        match dispatched {
            Ok(d) => Ok(Completion {
                body: d.body,
                usage: d.usage,
                record_id: record.id,
            }),
            Err(e) if e.is_timeout() => Err(GatewayError::UpstreamTimeout),
            Err(_) => Err(GatewayError::Upstream),
        }
    }
}

fn denial_error(reason: DenialReason) -> GatewayError {
    match reason {
        DenialReason::Throughput { limit, reset_at } => GatewayError::RateLimited { limit, reset_at },
        DenialReason::DailyQuota {
            limit,
            used,
            reset_at,
        } => GatewayError::DailyQuotaExceeded {
            limit,
            used,
            reset_at,
        },
        DenialReason::Allowance { allowance, used } => GatewayError::AllowanceExceeded { allowance, used },
    }
}

fn resolve_error(error: ResolveError) -> GatewayError {
    match error {
        ResolveError::NotFound(model) => GatewayError::ModelNotFound(model),
        ResolveError::CapabilityMismatch { model, capability } => GatewayError::CapabilityMismatch {
            model,
            capability: capability.to_string(),
        },
        ResolveError::Store(e) => {
            tracing::error!(error = %e, "Catalog lookup failed");
            GatewayError::Internal
        }
    }
}

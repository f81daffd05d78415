//! 5thIndustry integration. User tasks whose implementation names the
//! 5thIndustry app are not worked on in this engine at all; the work item is
//! an inspection order inside an inspection plan hosted by the external
//! application. The engine flags the order while the token sits on the task
//! and polls for its completion.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::FifthIndustryConfig;
use crate::engine::Engine;
use crate::model::{UserTaskRecord, UserTaskState};
use crate::runtime::Instance;

/// Implementation marker on user tasks handled through the 5thIndustry app.
pub const FIFTH_INDUSTRY_IMPLEMENTATION: &str = "5thIndustry";

/// Attribute stamped onto the task record so clients can deep link into the
/// inspection report.
pub const INSPECTION_ORDER_LINK_ATTR: &str = "_5thIndustryInspectionOrderLink";

#[derive(Debug, Error)]
pub enum FifthIndustryError {
    /// The linked inspection plan is gone or left its executing state. The
    /// owning instance cannot go on and is aborted.
    #[error("{0}")]
    PlanNotRunning(String),
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

/// Where a user task lives inside the 5thIndustry data model. Orders are
/// nested plan -> assembly group -> manufacturing step -> inspection order;
/// the ids come from `_5i-*` attributes on the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifthIndustryBinding {
    pub inspection_plan_id: String,
    pub assembly_group_id: String,
    pub manufacturing_step_id: String,
    pub inspection_order_id: String,
    /// Per-model API endpoint. The configured endpoint applies when absent.
    pub api_address: Option<String>,
    pub application_address: Option<String>,
}

impl FifthIndustryBinding {
    pub fn from_attrs(attrs: &HashMap<String, Value>) -> Option<Self> {
        let text = |key: &str| attrs.get(key).and_then(Value::as_str).map(str::to_string);
        Some(FifthIndustryBinding {
            inspection_plan_id: text("_5i-Inspection-Plan-ID")?,
            assembly_group_id: text("_5i-Assembly-Group-ID")?,
            manufacturing_step_id: text("_5i-Manufacturing-Step-ID")?,
            inspection_order_id: text("_5i-Inspection-Order-ID")?,
            api_address: text("_5i-API-Address"),
            application_address: text("_5i-Application-Address"),
        })
    }
}

/// What a successful order activation hands back.
#[derive(Debug, Clone, Default)]
pub struct PlanHandle {
    /// Deep link to the inspection report in the 5thIndustry app.
    pub report_link: Option<String>,
}

/// Client side of the 5thIndustry app, narrowed to what task handling needs.
#[async_trait]
pub trait FifthIndustryService: Send + Sync {
    /// Verifies the plan is executing and flags the inspection order as
    /// holding a token.
    async fn activate_order(
        &self,
        binding: &FifthIndustryBinding,
    ) -> Result<PlanHandle, FifthIndustryError>;

    /// `true` once every report of the inspection order is completed.
    async fn order_completed(
        &self,
        binding: &FifthIndustryBinding,
    ) -> Result<bool, FifthIndustryError>;

    /// Clears the token flag when the task closes or the instance goes away.
    async fn release_order(&self, binding: &FifthIndustryBinding)
        -> Result<(), FifthIndustryError>;
}

/// Drives one 5thIndustry user task in the background: activate the order
/// (retrying transient failures), register the task record, then poll until
/// the order is completed and complete the task with it. A plan that stopped
/// running aborts the whole instance.
pub fn spawn_user_task_flow(
    engine: Weak<Engine>,
    service: Arc<dyn FifthIndustryService>,
    instance: Arc<Instance>,
    record: UserTaskRecord,
    retry: Duration,
    poll: Duration,
) {
    tokio::spawn(async move {
        let Some(binding) = FifthIndustryBinding::from_attrs(&record.attrs) else {
            warn!(
                instance_id = %record.instance_id,
                user_task_id = %record.id,
                "5thIndustry task carries no inspection order binding, token stays parked"
            );
            return;
        };

        // --- order activation ---
        let handle = loop {
            if task_gone(&instance, &record.token_id).await {
                return;
            }
            match service.activate_order(&binding).await {
                Ok(handle) => break handle,
                Err(FifthIndustryError::PlanNotRunning(reason)) => {
                    abort_for_plan(&engine, &record.instance_id, &reason).await;
                    return;
                }
                Err(FifthIndustryError::Transient(cause)) => {
                    debug!(
                        instance_id = %record.instance_id,
                        user_task_id = %record.id,
                        error = %cause,
                        "inspection order activation failed, retrying"
                    );
                    tokio::time::sleep(retry).await;
                }
            }
        };

        let instance_id = record.instance_id.clone();
        let user_task_id = record.id.clone();
        let token_id = record.token_id.clone();
        {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            let mut record = record;
            record.state = UserTaskState::Active;
            if let Some(link) = &handle.report_link {
                record
                    .attrs
                    .insert(INSPECTION_ORDER_LINK_ATTR.to_string(), json!(link));
            }
            engine.register_user_task(record).await;
            if let Err(cause) = instance.begin_activity(&token_id) {
                warn!(instance_id = %instance_id, error = %cause, "token no longer accepts the task");
                return;
            }
            info!(
                instance_id = %instance_id,
                user_task_id = %user_task_id,
                "inspection order activated"
            );
        }

        // --- completion polling ---
        loop {
            if task_gone(&instance, &token_id).await {
                let _ = service.release_order(&binding).await;
                return;
            }
            match service.order_completed(&binding).await {
                Ok(true) => {
                    info!(
                        instance_id = %instance_id,
                        user_task_id = %user_task_id,
                        "inspection order completed"
                    );
                    if let Some(engine) = engine.upgrade() {
                        if let Err(cause) = engine
                            .complete_user_task(&instance_id, &user_task_id, HashMap::new())
                            .await
                        {
                            warn!(
                                instance_id = %instance_id,
                                error = %cause,
                                "completed inspection order did not close its task"
                            );
                        }
                    }
                    let _ = service.release_order(&binding).await;
                    return;
                }
                Ok(false) => {}
                Err(FifthIndustryError::PlanNotRunning(reason)) => {
                    abort_for_plan(&engine, &instance_id, &reason).await;
                    let _ = service.release_order(&binding).await;
                    return;
                }
                Err(FifthIndustryError::Transient(cause)) => {
                    debug!(instance_id = %instance_id, error = %cause, "inspection order poll failed");
                }
            }
            tokio::time::sleep(poll).await;
        }
    });
}

/// The task is gone once its instance halted or its token ended.
async fn task_gone(instance: &Arc<Instance>, token_id: &str) -> bool {
    if instance.is_halted().await {
        return true;
    }
    match instance.token(token_id).await {
        Some(token) => token.state.is_terminal(),
        None => true,
    }
}

async fn abort_for_plan(engine: &Weak<Engine>, instance_id: &str, reason: &str) {
    error!(
        instance_id = %instance_id,
        reason,
        "aborting instance, its 5thIndustry plan is not running"
    );
    let Some(engine) = engine.upgrade() else {
        return;
    };
    if let Err(cause) = engine.abort_instance(instance_id).await {
        warn!(instance_id = %instance_id, error = %cause, "instance did not abort");
    }
}

const GET_INSPECTION_PLAN_QUERY: &str = "
query getInspectionPlan($id: ID!, $type: entityType){
  getInspectionPlan(_id: $id, type: $type) {
    inspectionPlan {
      workStatus
      status
      assemblyGroup {
        _id
        manufacturingStep {
          _id
          inspectionOrders {
            _id
            inspectionReportID
            reportProgress {
              total
              completed
            }
          }
        }
      }
    }
  }
}";

const ATOMIC_INSPECTION_PLAN_MUTATION: &str = "
mutation atomicInspectionPlan($atomics: [inspectionPlanAtomic!]!, $type: entityType) {
  atomicInspectionPlan(atomics: $atomics, type: $type) {
    code
    success
    message
    __typename
  }
}";

/// GraphQL client for the hosted 5thIndustry app. The service account is
/// exchanged for a bearer token on demand; a request rejected as
/// unauthenticated refreshes the token and repeats once.
pub struct HttpFifthIndustry {
    client: reqwest::Client,
    config: FifthIndustryConfig,
    authorization: RwLock<Option<String>>,
}

impl HttpFifthIndustry {
    pub fn new(config: FifthIndustryConfig) -> Self {
        HttpFifthIndustry {
            client: reqwest::Client::new(),
            config,
            authorization: RwLock::new(None),
        }
    }

    fn api_address<'a>(&'a self, binding: &'a FifthIndustryBinding) -> Result<&'a str> {
        if let Some(address) = binding.api_address.as_deref() {
            return Ok(address);
        }
        if !self.config.api_url.is_empty() {
            return Ok(&self.config.api_url);
        }
        Err(anyhow!("no 5thIndustry API address configured"))
    }

    async fn refresh_authorization(&self) -> Result<String> {
        let client_id = self
            .config
            .client_id
            .as_deref()
            .ok_or_else(|| anyhow!("no 5thIndustry service account configured"))?;
        let auth_url = self
            .config
            .auth_url
            .as_deref()
            .ok_or_else(|| anyhow!("no 5thIndustry auth endpoint configured"))?;
        let response = self
            .client
            .post(auth_url)
            .basic_auth(client_id, self.config.client_secret.as_deref())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("scope", "profit-gateway/inspectionPlans.all"),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        let token_type = body["token_type"].as_str().unwrap_or("Bearer");
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("auth response carried no access token"))?;
        let authorization = format!("{token_type} {access_token}");
        *self.authorization.write().await = Some(authorization.clone());
        Ok(authorization)
    }

    async fn post_graphql(&self, address: &str, payload: &Value) -> Result<Value> {
        let authorization = {
            let held = self.authorization.read().await;
            held.clone()
        };
        let authorization = match authorization {
            Some(authorization) => authorization,
            None => self.refresh_authorization().await?,
        };
        let body = self.send(address, payload, &authorization).await?;
        if unauthenticated(&body) {
            let authorization = self.refresh_authorization().await?;
            let body = self.send(address, payload, &authorization).await?;
            return require_clean(body);
        }
        require_clean(body)
    }

    async fn send(&self, address: &str, payload: &Value, authorization: &str) -> Result<Value> {
        let response = self
            .client
            .post(address)
            .header("authorization", authorization)
            .json(payload)
            .send()
            .await?;
        Ok(response.json().await?)
    }

    async fn inspection_order(
        &self,
        binding: &FifthIndustryBinding,
    ) -> Result<Value, FifthIndustryError> {
        let address = self.api_address(binding)?;
        let body = self
            .post_graphql(
                address,
                &json!({
                    "query": GET_INSPECTION_PLAN_QUERY,
                    "variables": { "id": binding.inspection_plan_id, "type": "entity" },
                }),
            )
            .await?;
        let plan = &body["data"]["getInspectionPlan"];
        if plan.is_null() {
            return Err(FifthIndustryError::PlanNotRunning(
                "inspection plan linked to the process does not exist anymore".to_string(),
            ));
        }
        let plan = &plan["inspectionPlan"];
        if plan["status"] != "released" || plan["workStatus"] == "open" {
            return Err(FifthIndustryError::PlanNotRunning(
                "inspection plan linked to the process is not in an executing state anymore"
                    .to_string(),
            ));
        }
        let order = plan["assemblyGroup"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|group| group["_id"] == binding.assembly_group_id.as_str())
            .flat_map(|group| group["manufacturingStep"].as_array().into_iter().flatten())
            .filter(|step| step["_id"] == binding.manufacturing_step_id.as_str())
            .flat_map(|step| step["inspectionOrders"].as_array().into_iter().flatten())
            .find(|order| order["_id"] == binding.inspection_order_id.as_str());
        order.cloned().ok_or_else(|| {
            anyhow!(
                "inspection order {} is missing from its plan",
                binding.inspection_order_id
            )
            .into()
        })
    }

    /// Sets the order attribute marking whether a token sits on the linked
    /// task. The misspelled field name is what the app's schema defines.
    async fn set_order_token_flag(&self, binding: &FifthIndustryBinding, held: bool) -> Result<()> {
        let address = self.api_address(binding)?;
        self.post_graphql(
            address,
            &json!({
                "operationName": "atomicInspectionPlan",
                "query": ATOMIC_INSPECTION_PLAN_MUTATION,
                "variables": {
                    "type": "entity",
                    "atomics": [{
                        "inspectionPlanId": binding.inspection_plan_id,
                        "operation": "update",
                        "childrenIds": {
                            "assemblyGroupId": binding.assembly_group_id,
                            "manufacturingStepId": binding.manufacturing_step_id,
                            "inspectionOrderId": binding.inspection_order_id,
                        },
                        "path": "assemblyGroup.$[assemblyGroupId].manufacturingStep.$[manufacturingStepId].inspectionOrders.$[inspectionOrderId]",
                        "values": { "hasBpnmToken": held },
                    }],
                },
            }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FifthIndustryService for HttpFifthIndustry {
    async fn activate_order(
        &self,
        binding: &FifthIndustryBinding,
    ) -> Result<PlanHandle, FifthIndustryError> {
        let order = self.inspection_order(binding).await?;
        let report_link = match (
            order["inspectionReportID"].as_str(),
            binding
                .application_address
                .as_deref()
                .or(self.config.app_url.as_deref()),
        ) {
            (Some(report), Some(app)) => Some(format!(
                "{app}/protocols/{}/{report}",
                binding.inspection_plan_id
            )),
            _ => None,
        };
        self.set_order_token_flag(binding, true)
            .await
            .map_err(FifthIndustryError::Transient)?;
        Ok(PlanHandle { report_link })
    }

    async fn order_completed(
        &self,
        binding: &FifthIndustryBinding,
    ) -> Result<bool, FifthIndustryError> {
        let order = self.inspection_order(binding).await?;
        let progress = &order["reportProgress"];
        Ok(!progress["total"].is_null() && progress["completed"] == progress["total"])
    }

    async fn release_order(
        &self,
        binding: &FifthIndustryBinding,
    ) -> Result<(), FifthIndustryError> {
        self.set_order_token_flag(binding, false)
            .await
            .map_err(FifthIndustryError::Transient)
    }
}

fn unauthenticated(body: &Value) -> bool {
    body["errors"]
        .as_array()
        .map(|errors| {
            errors
                .iter()
                .any(|e| e["extensions"]["code"] == "UNAUTHENTICATED")
        })
        .unwrap_or(false)
}

fn require_clean(body: Value) -> Result<Value> {
    if let Some(errors) = body["errors"].as_array() {
        if !errors.is_empty() {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e["message"].as_str())
                .collect();
            return Err(anyhow!(
                "5thIndustry request returned: {}",
                messages.join("; ")
            ));
        }
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_needs_the_full_order_path() {
        let mut attrs = HashMap::new();
        attrs.insert("_5i-Inspection-Plan-ID".to_string(), json!("plan-1"));
        attrs.insert("_5i-Assembly-Group-ID".to_string(), json!("group-1"));
        attrs.insert("_5i-Manufacturing-Step-ID".to_string(), json!("step-1"));
        assert!(FifthIndustryBinding::from_attrs(&attrs).is_none());

        attrs.insert("_5i-Inspection-Order-ID".to_string(), json!("order-1"));
        let binding = FifthIndustryBinding::from_attrs(&attrs).unwrap();
        assert_eq!(binding.inspection_plan_id, "plan-1");
        assert_eq!(binding.inspection_order_id, "order-1");
        assert_eq!(binding.api_address, None);
    }

    #[test]
    fn unauthenticated_is_detected_in_error_extensions() {
        let body = json!({
            "errors": [{ "message": "nope", "extensions": { "code": "UNAUTHENTICATED" } }]
        });
        assert!(unauthenticated(&body));
        assert!(require_clean(body).is_err());
        assert!(require_clean(json!({ "data": {} })).is_ok());
    }
}

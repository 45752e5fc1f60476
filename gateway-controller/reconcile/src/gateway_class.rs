use crate::Context;
use kube::runtime::reflector::ObjectRef;
use oke_gateway_controller_core::{Outcome, Reconciler, Request, RequestContext};
use oke_gateway_controller_k8s_api::conditions::{self, reasons};
use oke_gateway_controller_k8s_status::{conditions::is_true, Conditioned, NewCondition};
use tracing::{debug, info};

/// Accepts GatewayClasses that name this controller.
#[derive(Clone, Debug)]
pub struct GatewayClassReconciler {
    cx: Context,
}

impl GatewayClassReconciler {
    pub fn new(cx: Context) -> Self {
        Self { cx }
    }
}

#[async_trait::async_trait]
impl Reconciler for GatewayClassReconciler {
    async fn reconcile(&self, _: RequestContext, req: Request) -> anyhow::Result<Outcome> {
        let Some(class) = self.cx.gateway_classes.get(&ObjectRef::new(&req.name)) else {
            debug!(class = %req, "GatewayClass removed");
            return Ok(Outcome::done());
        };

        if class.spec.controller_name != *self.cx.controller_name {
            debug!(
                class = %req,
                controller = %class.spec.controller_name,
                "GatewayClass is managed by another controller"
            );
            return Ok(Outcome::done());
        }

        let generation = class.metadata.generation;
        if is_true(class.conditions(), conditions::ACCEPTED, generation) {
            debug!(class = %req, ?generation, "GatewayClass already accepted");
            return Ok(Outcome::done());
        }

        let accepted = NewCondition::new(
            conditions::ACCEPTED,
            true,
            reasons::ACCEPTED,
            format!("GatewayClass accepted by {}", self.cx.controller_name),
        )
        .with_generation(generation);
        self.cx.status.set_condition(&*class, accepted).await?;
        info!(class = %req, "GatewayClass accepted");
        Ok(Outcome::done())
    }
}

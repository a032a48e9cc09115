//! Ready-made forwarding filters for relays

use std::collections::HashSet;
use std::sync::Arc;

use nn_core::{Filter, FilterContext, FilterDecision, NodeBuilder, RequestFilter, Verdict};
use tracing::debug;

use crate::ocpp::v21::{Component, GetVariables, GetVariablesRequest, SetVariables, SetVariablesRequest};

/// Rejects OCPP 2.1 device-model requests that touch a blocked component
///
/// A request naming at least one blocked component is rejected as a whole
/// with every variable reported `Rejected`. Component names compare exactly.
#[derive(Debug, Clone, Default)]
pub struct ComponentBlocklist {
    components: HashSet<String>,
}

impl ComponentBlocklist {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    pub fn block(mut self, component: impl Into<String>) -> Self {
        self.components.insert(component.into());
        self
    }

    pub fn is_blocked(&self, component: &Component) -> bool {
        self.components.contains(&component.name)
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Register for both GetVariables and SetVariables
    pub fn install(self, builder: NodeBuilder) -> NodeBuilder {
        builder
            .filter_with::<GetVariables>(self.clone())
            .filter_with::<SetVariables>(self)
    }

    fn check<'a>(
        &self,
        ctx: &FilterContext<'_>,
        mut components: impl Iterator<Item = &'a Component>,
    ) -> Option<String> {
        let blocked = components.find(|component| self.is_blocked(component))?;
        debug!(
            "{}: {} {} touches blocked component {}",
            ctx.node_id,
            ctx.request.action(),
            ctx.request.request_id(),
            blocked.name
        );
        Some(format!("component {} is blocked by {}", blocked.name, ctx.node_id))
    }
}

impl Filter<GetVariables> for ComponentBlocklist {
    fn filter(&self, ctx: &FilterContext<'_>, request: &GetVariablesRequest) -> Option<FilterDecision<GetVariables>> {
        let reason = self.check(ctx, request.get_variable_data.iter().map(|data| &data.component))?;
        Some(FilterDecision::reject(request, reason))
    }
}

impl Filter<SetVariables> for ComponentBlocklist {
    fn filter(&self, ctx: &FilterContext<'_>, request: &SetVariablesRequest) -> Option<FilterDecision<SetVariables>> {
        let reason = self.check(ctx, request.set_variable_data.iter().map(|data| &data.component))?;
        Some(FilterDecision::reject(request, reason))
    }
}

/// Rejects every action not on the list; allowed actions fall through to
/// later filters and the default policy
#[derive(Debug, Clone, Default)]
pub struct ActionAllowList {
    actions: HashSet<String>,
}

impl ActionAllowList {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, action: &str) -> bool {
        self.actions.contains(action)
    }

    /// Register for every action of the builder's catalog
    pub fn install(self, builder: NodeBuilder) -> NodeBuilder {
        let actions = builder.catalog().actions();
        let filter: Arc<dyn RequestFilter> = Arc::new(self);
        actions
            .into_iter()
            .fold(builder, |builder, action| builder.request_filter(action, filter.clone()))
    }
}

impl RequestFilter for ActionAllowList {
    fn filter(&self, ctx: &FilterContext<'_>) -> Option<Verdict> {
        let action = ctx.request.action();
        if self.allows(action) {
            return None;
        }
        debug!("{}: {} is not on the allow list", ctx.node_id, action);
        Some(Verdict::Reject {
            payload: None,
            reason: format!("{} is not relayed by {}", action, ctx.node_id),
        })
    }
}

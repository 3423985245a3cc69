use std::fmt;

use serde::{Deserialize, Serialize};

use super::JsonObject;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Capabilities a client may support. Known capabilities are defined here, in this
/// schema, but this is not a closed set: any client can define its own,
/// additional capabilities.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<JsonObject>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<JsonObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

impl ServerCapabilities {
    pub fn builder() -> ServerCapabilitiesBuilder {
        ServerCapabilitiesBuilder::default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct ServerCapabilitiesBuilder {
    inner: ServerCapabilities,
}

impl ServerCapabilitiesBuilder {
    pub fn enable_logging(mut self) -> Self {
        self.inner.logging = Some(JsonObject::default());
        self
    }
    pub fn enable_completions(mut self) -> Self {
        self.inner.completions = Some(JsonObject::default());
        self
    }
    pub fn enable_prompts(mut self) -> Self {
        self.inner.prompts = Some(PromptsCapability::default());
        self
    }
    pub fn enable_prompts_list_changed(mut self) -> Self {
        self.inner.prompts.get_or_insert_with(Default::default).list_changed = Some(true);
        self
    }
    pub fn enable_resources(mut self) -> Self {
        self.inner.resources = Some(ResourcesCapability::default());
        self
    }
    pub fn enable_resources_subscribe(mut self) -> Self {
        self.inner.resources.get_or_insert_with(Default::default).subscribe = Some(true);
        self
    }
    pub fn enable_resources_list_changed(mut self) -> Self {
        self.inner
            .resources
            .get_or_insert_with(Default::default)
            .list_changed = Some(true);
        self
    }
    pub fn enable_tools(mut self) -> Self {
        self.inner.tools = Some(ToolsCapability::default());
        self
    }
    pub fn enable_tools_list_changed(mut self) -> Self {
        self.inner.tools.get_or_insert_with(Default::default).list_changed = Some(true);
        self
    }
    pub fn build(self) -> ServerCapabilities {
        self.inner
    }
}

/// Features negotiated for one session, fixed once the handshake completes.
///
/// The client side contributes sampling, elicitation and roots; the server side
/// contributes subscriptions and completions.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const EMPTY: Self = Self(0);
    pub const SAMPLING: Self = Self(1);
    pub const ELICITATION: Self = Self(1 << 1);
    pub const ROOTS: Self = Self(1 << 2);
    pub const SUBSCRIPTIONS: Self = Self(1 << 3);
    pub const COMPLETIONS: Self = Self(1 << 4);

    const NAMES: [(Self, &'static str); 5] = [
        (Self::SAMPLING, "sampling"),
        (Self::ELICITATION, "elicitation"),
        (Self::ROOTS, "roots"),
        (Self::SUBSCRIPTIONS, "subscriptions"),
        (Self::COMPLETIONS, "completions"),
    ];

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn from_client(capabilities: &ClientCapabilities) -> Self {
        let mut set = Self::EMPTY;
        if capabilities.sampling.is_some() {
            set = set.union(Self::SAMPLING);
        }
        if capabilities.elicitation.is_some() {
            set = set.union(Self::ELICITATION);
        }
        if capabilities.roots.is_some() {
            set = set.union(Self::ROOTS);
        }
        set
    }

    pub fn from_server(capabilities: &ServerCapabilities) -> Self {
        let mut set = Self::EMPTY;
        if capabilities
            .resources
            .as_ref()
            .is_some_and(|r| r.subscribe == Some(true))
        {
            set = set.union(Self::SUBSCRIPTIONS);
        }
        if capabilities.completions.is_some() {
            set = set.union(Self::COMPLETIONS);
        }
        set
    }

    /// Names of the features in this set, in a stable order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .into_iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(_, name)| name)
    }
}

impl std::ops::BitOr for CapabilitySet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

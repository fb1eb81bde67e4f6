use crate::core::{GridError, Result};
use tracing::warn;

/// Shape of a subscription, carried as the `view` option of the request URI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionView {
    /// One key's value
    Key,
    /// Whole-map change events
    #[default]
    Entry,
    /// Topic messages
    Topic,
    /// Scalar value reference
    Reference,
}

impl SubscriptionView {
    fn as_str(self) -> &'static str {
        match self {
            SubscriptionView::Key => "key",
            SubscriptionView::Entry => "entry",
            SubscriptionView::Topic => "topic",
            SubscriptionView::Reference => "reference",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "key" => Ok(SubscriptionView::Key),
            "entry" => Ok(SubscriptionView::Entry),
            "topic" => Ok(SubscriptionView::Topic),
            "reference" => Ok(SubscriptionView::Reference),
            other => Err(GridError::InvalidRequest(format!(
                "unknown subscription view: {}",
                other
            ))),
        }
    }
}

/// Immutable description of a subscription request
///
/// Built once per call and never mutated after use; governs both local
/// dispatch and the canonical URI sent to a remote server. Option absence
/// means the type default applies (`bootstrap` defaults to true,
/// `throttlePeriodMs` to 0).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestContext {
    csp: String,
    view: SubscriptionView,
    key: Option<String>,
    bootstrap: Option<bool>,
    throttle_period_ms: u64,
    key_type: Option<String>,
    value_type: Option<String>,
    message_type: Option<String>,
    element_type: Option<String>,
    topic_type: Option<String>,
    cluster_name: Option<String>,
}

impl RequestContext {
    pub fn new(csp: impl Into<String>) -> Self {
        Self {
            csp: csp.into(),
            ..Default::default()
        }
    }

    pub fn with_view(mut self, view: SubscriptionView) -> Self {
        self.view = view;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn with_throttle_period_ms(mut self, period: u64) -> Self {
        self.throttle_period_ms = period;
        self
    }

    pub fn with_key_type(mut self, name: impl Into<String>) -> Self {
        self.key_type = Some(name.into());
        self
    }

    pub fn with_value_type(mut self, name: impl Into<String>) -> Self {
        self.value_type = Some(name.into());
        self
    }

    pub fn with_message_type(mut self, name: impl Into<String>) -> Self {
        self.message_type = Some(name.into());
        self
    }

    pub fn with_element_type(mut self, name: impl Into<String>) -> Self {
        self.element_type = Some(name.into());
        self
    }

    pub fn with_topic_type(mut self, name: impl Into<String>) -> Self {
        self.topic_type = Some(name.into());
        self
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    /// Logical resource path this request addresses
    pub fn csp(&self) -> &str {
        &self.csp
    }

    pub fn view(&self) -> SubscriptionView {
        self.view
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Bootstrap defaults to true when the option is absent
    pub fn bootstrap(&self) -> bool {
        self.bootstrap.unwrap_or(true)
    }

    pub fn throttle_period_ms(&self) -> u64 {
        self.throttle_period_ms
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    /// Canonical request URI: path plus recognized query options
    ///
    /// Only explicitly set options are appended; absence means default.
    pub fn to_uri(&self) -> String {
        let mut options: Vec<String> = vec![format!("view={}", self.view.as_str())];

        if let Some(key) = &self.key {
            options.push(format!("key={}", key));
        }
        if let Some(bootstrap) = self.bootstrap {
            options.push(format!("bootstrap={}", bootstrap));
        }
        if self.throttle_period_ms > 0 {
            options.push(format!("throttlePeriodMs={}", self.throttle_period_ms));
        }
        if let Some(name) = &self.key_type {
            options.push(format!("keyType={}", name));
        }
        if let Some(name) = &self.value_type {
            options.push(format!("valueType={}", name));
        }
        if let Some(name) = &self.message_type {
            options.push(format!("messageType={}", name));
        }
        if let Some(name) = &self.element_type {
            options.push(format!("elementType={}", name));
        }
        if let Some(name) = &self.topic_type {
            options.push(format!("topicType={}", name));
        }
        if let Some(name) = &self.cluster_name {
            options.push(format!("clusterName={}", name));
        }

        format!("{}?{}", self.csp, options.join("&"))
    }

    /// Parse a request URI back into a context
    ///
    /// Unrecognized options are logged and skipped; a frame is never
    /// rejected for carrying an option this node does not know.
    pub fn parse(uri: &str) -> Result<Self> {
        let (csp, query) = match uri.split_once('?') {
            Some((csp, query)) => (csp, query),
            None => (uri, ""),
        };

        if csp.is_empty() {
            return Err(GridError::InvalidRequest("empty resource path".to_string()));
        }

        let mut context = RequestContext::new(csp);

        for option in query.split('&').filter(|o| !o.is_empty()) {
            let Some((name, value)) = option.split_once('=') else {
                warn!("skipping malformed uri option: {}", option);
                continue;
            };

            match name {
                "view" => context.view = SubscriptionView::parse(value)?,
                "key" => context.key = Some(value.to_string()),
                "bootstrap" => {
                    context.bootstrap = Some(value.parse().map_err(|_| {
                        GridError::InvalidRequest(format!("invalid bootstrap value: {}", value))
                    })?)
                }
                "throttlePeriodMs" => {
                    context.throttle_period_ms = value.parse().map_err(|_| {
                        GridError::InvalidRequest(format!(
                            "invalid throttlePeriodMs value: {}",
                            value
                        ))
                    })?
                }
                "keyType" => context.key_type = Some(value.to_string()),
                "valueType" => context.value_type = Some(value.to_string()),
                "messageType" => context.message_type = Some(value.to_string()),
                "elementType" => context.element_type = Some(value.to_string()),
                "topicType" => context.topic_type = Some(value.to_string()),
                "clusterName" => context.cluster_name = Some(value.to_string()),
                other => warn!("skipping unrecognized uri option: {}", other),
            }
        }

        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let context = RequestContext::new("/maps/prices");

        assert!(context.bootstrap());
        assert_eq!(context.throttle_period_ms(), 0);
        assert_eq!(context.view(), SubscriptionView::Entry);
    }

    #[test]
    fn test_uri_round_trip() {
        let context = RequestContext::new("/maps/prices")
            .with_view(SubscriptionView::Key)
            .with_key("hello")
            .with_bootstrap(false)
            .with_throttle_period_ms(250)
            .with_message_type("string");

        let uri = context.to_uri();
        assert_eq!(
            uri,
            "/maps/prices?view=key&key=hello&bootstrap=false&throttlePeriodMs=250&messageType=string"
        );

        let parsed = RequestContext::parse(&uri).unwrap();
        assert_eq!(parsed, context);
    }

    #[test]
    fn test_absent_options_mean_defaults() {
        let parsed = RequestContext::parse("/maps/prices?view=entry").unwrap();
        assert!(parsed.bootstrap());
        assert_eq!(parsed.throttle_period_ms(), 0);
    }

    #[test]
    fn test_unrecognized_option_is_skipped() {
        let parsed = RequestContext::parse("/maps/prices?view=key&key=k&fetch=eager").unwrap();
        assert_eq!(parsed.key(), Some("k"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RequestContext::parse("/maps/prices?bootstrap=maybe").is_err());
        assert!(RequestContext::parse("/maps/prices?view=column").is_err());
        assert!(RequestContext::parse("?view=key").is_err());
    }
}

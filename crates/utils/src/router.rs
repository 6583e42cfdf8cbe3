use std::{collections::HashMap, sync::Arc};

use mailshield_protect::MessageProtector;
use tracing::{debug, info, warn};

use crate::{
    apply_transformers,
    handler::{HandlerResult, MessageHandler},
    transformer::MessageTransformer,
    Config, ConfigError, DiscardHandler, EmailMessage, HandlerConfig, IncomingMessage,
    ProtectionTransformer, ReceivedTransformer, RelayHandler, RelaySecurity, TransformerConfig,
};

/// The type of match for a routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchType {
    /// Matches an exact email address (e.g. "admin@example.com").
    ExactAddress,
    /// Matches all users at a domain (e.g. "example.com").
    Domain,
    /// Matches all subdomains (e.g. "*.example.com").
    WildcardDomain,
}

/// A single routing rule that maps a pattern to a handler.
pub struct RoutingRule {
    pub match_type: MatchType,
    pub pattern: String,
    pub handler: Arc<dyn MessageHandler>,
    pub transformers: Vec<Box<dyn MessageTransformer>>,
}

impl RoutingRule {
    /// Tests if this rule matches the given recipient address.
    pub fn matches(&self, address: &str) -> bool {
        let domain = address.rsplit('@').next().unwrap_or_default();
        match self.match_type {
            MatchType::ExactAddress => address.eq_ignore_ascii_case(&self.pattern),
            MatchType::Domain => domain.eq_ignore_ascii_case(&self.pattern),
            MatchType::WildcardDomain => {
                let wildcard = self.pattern.strip_prefix("*.").unwrap_or(&self.pattern);
                // the domain itself or any subdomain
                domain.eq_ignore_ascii_case(wildcard)
                    || domain
                        .to_ascii_lowercase()
                        .ends_with(&format!(".{}", wildcard.to_ascii_lowercase()))
            }
        }
    }
}

/// Routes messages to handlers based on their first recipient.
///
/// Rules are evaluated in specificity order: exact address > domain > wildcard domain.
/// If no rule matches, the default handler is used. The whole envelope is
/// handed to the selected handler.
pub struct MessageRouter {
    rules: Vec<RoutingRule>,
    default_handler: Arc<dyn MessageHandler>,
    default_transformers: Vec<Box<dyn MessageTransformer>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("rules", &self.rules.len())
            .field("default_handler", &self.default_handler.name())
            .finish()
    }
}

impl MessageRouter {
    /// Creates a new [`MessageRouter`], rules are sorted by specificity
    /// (exact > domain > wildcard).
    pub fn new(
        mut rules: Vec<RoutingRule>,
        default_handler: Arc<dyn MessageHandler>,
        default_transformers: Vec<Box<dyn MessageTransformer>>,
    ) -> Self {
        rules.sort_by_key(|r| match r.match_type {
            MatchType::ExactAddress => 0,
            MatchType::Domain => 1,
            MatchType::WildcardDomain => 2,
        });
        Self {
            rules,
            default_handler,
            default_transformers,
        }
    }

    fn resolve_rule(&self, recipient: &str) -> Option<&RoutingRule> {
        self.rules.iter().find(|rule| rule.matches(recipient))
    }

    /// Resolves which handler should process a message for the given recipient.
    pub fn resolve(&self, recipient: &str) -> &Arc<dyn MessageHandler> {
        self.resolve_rule(recipient)
            .map(|rule| &rule.handler)
            .unwrap_or(&self.default_handler)
    }

    /// Resolves the transformers for a given recipient, the rule-specific
    /// ones when the matching rule defines them.
    fn resolve_transformers(&self, recipient: &str) -> &[Box<dyn MessageTransformer>] {
        match self.resolve_rule(recipient) {
            Some(rule) if !rule.transformers.is_empty() => &rule.transformers,
            _ => &self.default_transformers,
        }
    }

    /// Runs the pipeline for a message, transformers first and then the
    /// handler selected by the first recipient.
    pub async fn route(&self, message: &mut EmailMessage) -> HandlerResult<()> {
        let recipient = message.first_rcpt().to_string();
        let transformers = self.resolve_transformers(&recipient);
        apply_transformers(transformers, message).await?;

        let handler = self.resolve(&recipient);
        debug!(
            message_id = %message.message_id,
            recipient = %recipient,
            handler = handler.name(),
            "Routing email"
        );
        handler.handle(message).await
    }

    /// Routes a message as received by the listener.
    pub async fn route_incoming(&self, incoming: &IncomingMessage) -> HandlerResult<String> {
        let mut message = incoming.to_email_message();
        self.route(&mut message).await?;
        Ok(message.message_id)
    }

    pub fn default_handler(&self) -> &Arc<dyn MessageHandler> {
        &self.default_handler
    }
}

/// Determines the match type from a routing rule configuration.
///
/// Returns [`ExactAddress`](MatchType::ExactAddress) if an address field is present,
/// [`WildcardDomain`](MatchType::WildcardDomain) if the domain starts with `*.`,
/// or [`Domain`](MatchType::Domain) otherwise.
pub fn determine_match_type(address: &Option<String>, domain: &Option<String>) -> MatchType {
    match (address, domain) {
        (Some(_), _) => MatchType::ExactAddress,
        (None, Some(d)) if d.starts_with("*.") => MatchType::WildcardDomain,
        _ => MatchType::Domain,
    }
}

/// Extracts the pattern string from a routing rule configuration.
pub fn extract_pattern(address: &Option<String>, domain: &Option<String>) -> String {
    address
        .as_ref()
        .or(domain.as_ref())
        .cloned()
        .unwrap_or_default()
}

/// Builds the router, its handlers and transformers from the configuration.
///
/// Without any configured handler, the default handler name is bound to a
/// plain relay towards `127.0.0.1:25`.
pub fn build_router(config: &Config) -> Result<MessageRouter, ConfigError> {
    let routing = &config.smtp.routing;
    let mut handler_configs = config.smtp.handlers.clone();
    if handler_configs.is_empty() {
        warn!(handler = %routing.default, "No handlers configured, relaying to 127.0.0.1:25");
        handler_configs.insert(
            routing.default.clone(),
            HandlerConfig::Relay {
                host: "127.0.0.1".to_string(),
                port: 25,
                security: RelaySecurity::None,
                username: None,
                password: None,
            },
        );
    }

    let mut handlers: HashMap<String, Arc<dyn MessageHandler>> = HashMap::new();
    for (name, handler_config) in &handler_configs {
        handlers.insert(name.clone(), build_handler(name, handler_config)?);
    }
    let lookup = |name: &str| {
        handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::Invalid(format!("unknown handler: {name}")))
    };

    let mut factory = TransformerFactory::new(config);
    let default_transformers = factory.build_all(&routing.transformers)?;

    let mut rules = Vec::with_capacity(routing.rules.len());
    for rule in &routing.rules {
        rules.push(RoutingRule {
            match_type: determine_match_type(&rule.address, &rule.domain),
            pattern: extract_pattern(&rule.address, &rule.domain),
            handler: lookup(&rule.handler)?,
            transformers: match &rule.transformers {
                Some(transformers) => factory.build_all(transformers)?,
                None => Vec::new(),
            },
        });
    }

    info!(
        rules = rules.len(),
        handlers = handlers.len(),
        default = %routing.default,
        "Router initialized"
    );
    Ok(MessageRouter::new(
        rules,
        lookup(&routing.default)?,
        default_transformers,
    ))
}

fn build_handler(
    name: &str,
    config: &HandlerConfig,
) -> Result<Arc<dyn MessageHandler>, ConfigError> {
    Ok(match config {
        HandlerConfig::Relay {
            host,
            port,
            security,
            username,
            password,
        } => {
            let credentials = username
                .clone()
                .map(|username| (username, password.clone().unwrap_or_default()));
            let handler = RelayHandler::new(host, *port, *security, credentials)
                .map_err(|e| ConfigError::Invalid(format!("handler {name}: {e}")))?;
            Arc::new(handler)
        }
        HandlerConfig::Discard => Arc::new(DiscardHandler),
    })
}

/// Creates transformers, sharing one protector between every protection step.
struct TransformerFactory<'a> {
    config: &'a Config,
    protector: Option<Arc<MessageProtector>>,
}

impl<'a> TransformerFactory<'a> {
    fn new(config: &'a Config) -> Self {
        Self {
            config,
            protector: None,
        }
    }

    fn build_all(
        &mut self,
        configs: &[TransformerConfig],
    ) -> Result<Vec<Box<dyn MessageTransformer>>, ConfigError> {
        configs.iter().map(|config| self.build(config)).collect()
    }

    fn build(
        &mut self,
        config: &TransformerConfig,
    ) -> Result<Box<dyn MessageTransformer>, ConfigError> {
        Ok(match config {
            TransformerConfig::Received => Box::new(ReceivedTransformer::new(
                self.config.smtp.hostname.clone(),
            )),
            TransformerConfig::Protection => {
                let protector = match &self.protector {
                    Some(protector) => protector.clone(),
                    None => {
                        let protector = Arc::new(self.config.protection.build_protector()?);
                        self.protector = Some(protector.clone());
                        protector
                    }
                };
                Box::new(ProtectionTransformer::new(protector))
            }
        })
    }
}

//! Condition evaluation.
//!
//! Conditions are declared in zone definitions as a type tag plus parameters.
//! At load time the [`ConditionRegistry`] resolves each tag to a factory and
//! builds a [`ConditionCheck`]; evaluation never looks at tags again.
//!
//! Evaluation fails closed: a check that returns an error counts as "not
//! satisfied" and is logged, it never aborts processing of other triggers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::builtins;
use crate::error::ConfigError;
use crate::ledger::OccurrenceLedger;
use crate::types::{BeaconId, BeaconSnapshot, EventType};
use crate::zone::ConditionDefinition;

/// Malformed condition parameters, reported at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    /// A required parameter is absent.
    #[error("missing parameter '{0}'")]
    Missing(String),

    /// A parameter is present but unusable.
    #[error("invalid parameter '{name}': {message}")]
    Invalid {
        /// Parameter name.
        name: String,
        /// What is wrong with it.
        message: String,
    },
}

impl ParameterError {
    /// Shorthand for [`ParameterError::Invalid`].
    pub fn invalid(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while evaluating a condition. Never escapes the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// An expression could not be evaluated.
    #[error("expression '{expression}' could not be evaluated: {message}")]
    Expression {
        /// The expression text.
        expression: String,
        /// Evaluator message.
        message: String,
    },

    /// The check needs beacon state the engine does not have.
    #[error("no runtime state for beacon {0}")]
    MissingState(BeaconId),

    /// Any other evaluation failure.
    #[error("{0}")]
    Other(String),
}

/// Everything a condition may look at besides the ledger.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    /// Event being processed.
    pub event: EventType,
    /// Beacon the event is about.
    pub beacon: BeaconId,
    /// Identifier of the trigger whose conditions are evaluated.
    pub trigger: &'a str,
    /// Runtime state of the beacon, if known.
    pub snapshot: Option<&'a BeaconSnapshot>,
    /// Evaluation time.
    pub now: DateTime<Utc>,
}

/// A compiled, typed predicate.
pub trait ConditionCheck: fmt::Debug + Send + Sync {
    /// Type tag the check was built from.
    fn tag(&self) -> &str;

    /// Evaluate the predicate. Must not mutate anything.
    ///
    /// # Errors
    ///
    /// Returns a [`ConditionError`] when the predicate cannot be decided; the
    /// evaluator treats that as "not satisfied".
    fn check(&self, ctx: &ConditionContext<'_>, ledger: &OccurrenceLedger) -> Result<bool, ConditionError>;

    /// Whether a successful counted validation records an occurrence.
    fn counts_occurrence(&self) -> bool {
        false
    }

    /// Event types this condition restricts its trigger to, if any.
    fn applicable_events(&self) -> Option<&[EventType]> {
        None
    }
}

/// Pluggable evaluator for free-form `expression` conditions.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against the context.
    ///
    /// # Errors
    ///
    /// Returns [`ConditionError::Expression`] for anything it cannot evaluate.
    fn evaluate(&self, expression: &str, ctx: &ConditionContext<'_>) -> Result<bool, ConditionError>;
}

/// Builds a check from its declaration.
pub type ConditionFactory =
    Arc<dyn Fn(&ConditionDefinition) -> Result<Box<dyn ConditionCheck>, ParameterError> + Send + Sync>;

/// Maps condition type tags to factories.
#[derive(Clone)]
pub struct ConditionRegistry {
    factories: HashMap<String, ConditionFactory>,
}

impl ConditionRegistry {
    /// A registry with no types registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with every built-in type; `expression` conditions use `expressions`.
    #[must_use]
    pub fn with_builtins(expressions: Arc<dyn ExpressionEvaluator>) -> Self {
        let mut registry = Self::empty();
        builtins::register_all(&mut registry, expressions);
        registry
    }

    /// Register (or replace) the factory for `tag`.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&ConditionDefinition) -> Result<Box<dyn ConditionCheck>, ParameterError> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Arc::new(factory));
    }

    /// Returns `true` if `tag` has a factory.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Registered tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Resolve a declaration to a check.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownConditionType`] for an unregistered tag and
    /// [`ConfigError::InvalidCondition`] when the factory rejects the parameters.
    pub fn compile(
        &self,
        trigger: &str,
        definition: &ConditionDefinition,
    ) -> Result<Box<dyn ConditionCheck>, ConfigError> {
        let factory = self
            .factories
            .get(&definition.kind)
            .ok_or_else(|| ConfigError::UnknownConditionType {
                trigger: trigger.to_string(),
                tag: definition.kind.clone(),
            })?;

        factory(definition).map_err(|source| ConfigError::InvalidCondition {
            trigger: trigger.to_string(),
            tag: definition.kind.clone(),
            source,
        })
    }
}

impl Default for ConditionRegistry {
    fn default() -> Self {
        Self::with_builtins(Arc::new(builtins::LiteralExpressionEvaluator))
    }
}

impl fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

/// Runs checks against the ledger, recording occurrences when asked to.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Validate a single condition.
    ///
    /// With `count_occurrence`, a successful validation records an occurrence
    /// only if the condition itself [counts occurrences](ConditionCheck::counts_occurrence),
    /// so it must be called at most once per real event. This differs from
    /// [`validate_all`](Self::validate_all), which records for the trigger as a
    /// whole whatever kinds of condition its list holds.
    pub fn validate(
        condition: &dyn ConditionCheck,
        ctx: &ConditionContext<'_>,
        ledger: &mut OccurrenceLedger,
        count_occurrence: bool,
    ) -> bool {
        let valid = Self::check(condition, ctx, ledger);
        if valid && count_occurrence && condition.counts_occurrence() {
            ledger.record_occurrence_at(ctx.beacon, ctx.trigger, ctx.now);
        }
        valid
    }

    /// Validate an ordered condition list conjunctively, stopping at the first
    /// failure.
    ///
    /// The whole list is checked before anything is recorded; with
    /// `count_occurrence` a fully valid list records exactly one occurrence,
    /// even when no condition in it counts occurrences. An empty list is valid.
    pub fn validate_all(
        conditions: &[Box<dyn ConditionCheck>],
        ctx: &ConditionContext<'_>,
        ledger: &mut OccurrenceLedger,
        count_occurrence: bool,
    ) -> bool {
        let valid = conditions
            .iter()
            .all(|condition| Self::check(condition.as_ref(), ctx, ledger));
        if valid && count_occurrence {
            ledger.record_occurrence_at(ctx.beacon, ctx.trigger, ctx.now);
        }
        valid
    }

    fn check(condition: &dyn ConditionCheck, ctx: &ConditionContext<'_>, ledger: &OccurrenceLedger) -> bool {
        match condition.check(ctx, ledger) {
            Ok(valid) => valid,
            Err(err) => {
                warn!(
                    beacon = %ctx.beacon,
                    trigger = %ctx.trigger,
                    condition = condition.tag(),
                    error = %err,
                    "condition evaluation failed, treating as not satisfied"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug)]
    struct Failing;

    impl ConditionCheck for Failing {
        fn tag(&self) -> &str {
            "failing"
        }

        fn check(&self, _: &ConditionContext<'_>, _: &OccurrenceLedger) -> Result<bool, ConditionError> {
            Err(ConditionError::Other("boom".to_string()))
        }
    }

    fn definition(kind: &str, parameters: serde_json::Value) -> ConditionDefinition {
        ConditionDefinition {
            kind: kind.to_string(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
            expression: None,
        }
    }

    fn ctx(trigger: &str) -> ConditionContext<'_> {
        ConditionContext {
            event: EventType::Enter,
            beacon: BeaconId::new(Uuid::nil(), 1, 1),
            trigger,
            snapshot: None,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_unknown_tag_is_config_error() {
        let registry = ConditionRegistry::default();
        let err = registry
            .compile("t1", &definition("teleport", json!({})))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownConditionType { ref tag, .. } if tag == "teleport"));
    }

    #[test]
    fn test_bad_parameters_are_config_error() {
        let registry = ConditionRegistry::default();
        let err = registry
            .compile("t1", &definition("max_occurrence", json!({"max": "lots"})))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCondition { .. }));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = ConditionRegistry::empty();
        assert!(!registry.contains("failing"));
        registry.register("failing", |_| Ok(Box::new(Failing)));
        assert!(registry.contains("failing"));
        assert_eq!(registry.tags(), vec!["failing"]);
    }

    #[test]
    fn test_evaluation_error_fails_closed() {
        let mut ledger = OccurrenceLedger::new();
        let checks: Vec<Box<dyn ConditionCheck>> = vec![Box::new(Failing)];
        assert!(!ConditionEvaluator::validate_all(&checks, &ctx("t1"), &mut ledger, true));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_non_counting_validation_is_idempotent() {
        let registry = ConditionRegistry::default();
        let check = registry
            .compile("t1", &definition("max_occurrence", json!({"max": 2})))
            .unwrap();
        let mut ledger = OccurrenceLedger::new();
        let context = ctx("t1");

        for _ in 0..10 {
            assert!(ConditionEvaluator::validate(check.as_ref(), &context, &mut ledger, false));
        }
        assert_eq!(ledger.occurrence_count(context.beacon, "t1"), 0);
    }

    #[test]
    fn test_counting_validation_records_until_limit() {
        let registry = ConditionRegistry::default();
        let check = registry
            .compile("t1", &definition("max_occurrence", json!({"max": 2})))
            .unwrap();
        let mut ledger = OccurrenceLedger::new();
        let context = ctx("t1");

        assert!(ConditionEvaluator::validate(check.as_ref(), &context, &mut ledger, true));
        assert!(ConditionEvaluator::validate(check.as_ref(), &context, &mut ledger, true));
        assert!(!ConditionEvaluator::validate(check.as_ref(), &context, &mut ledger, true));
        assert_eq!(ledger.occurrence_count(context.beacon, "t1"), 2);
    }

    #[test]
    fn test_failed_list_records_nothing() {
        let registry = ConditionRegistry::default();
        let checks = vec![
            registry
                .compile("t1", &definition("max_occurrence", json!({"max": 5})))
                .unwrap(),
            registry
                .compile("t1", &definition("event_type", json!({"events": ["leave"]})))
                .unwrap(),
        ];
        let mut ledger = OccurrenceLedger::new();
        assert!(!ConditionEvaluator::validate_all(&checks, &ctx("t1"), &mut ledger, true));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_single_check_and_list_count_differently() {
        let registry = ConditionRegistry::default();
        let event_check = registry
            .compile("t1", &definition("event_type", json!({"events": ["enter"]})))
            .unwrap();
        let mut ledger = OccurrenceLedger::new();
        let context = ctx("t1");

        assert!(ConditionEvaluator::validate(event_check.as_ref(), &context, &mut ledger, true));
        assert_eq!(ledger.occurrence_count(context.beacon, "t1"), 0);

        let checks = vec![event_check];
        assert!(ConditionEvaluator::validate_all(&checks, &context, &mut ledger, true));
        assert_eq!(ledger.occurrence_count(context.beacon, "t1"), 1);
    }
}

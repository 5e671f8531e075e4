//! Built-in condition types.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde_json::Value;

use crate::condition::{
    ConditionCheck, ConditionContext, ConditionError, ConditionRegistry, ExpressionEvaluator, ParameterError,
};
use crate::ledger::OccurrenceLedger;
use crate::types::{EventType, Proximity};
use crate::zone::ConditionDefinition;

/// Tag of the event-type restriction.
pub const EVENT_TYPE: &str = "event_type";
/// Tag of the occurrence limit.
pub const MAX_OCCURRENCE: &str = "max_occurrence";
/// Alternative tag of the occurrence limit.
pub const OCCURRENCE: &str = "occurrence";
/// Tag of the minimum-gap condition.
pub const COOLDOWN: &str = "cooldown";
/// Tag of the daily/weekly window condition.
pub const TIME_WINDOW: &str = "time_window";
/// Tag of the proximity-tier condition.
pub const PROXIMITY: &str = "proximity";
/// Tag of the minimum-stay condition.
pub const STAYS: &str = "stays";
/// Tag of the free-form expression condition.
pub const EXPRESSION: &str = "expression";

pub(crate) fn register_all(registry: &mut ConditionRegistry, expressions: Arc<dyn ExpressionEvaluator>) {
    registry.register(EVENT_TYPE, |def| Ok(Box::new(EventTypeCheck::from_definition(def)?)));
    registry.register(MAX_OCCURRENCE, |def| Ok(Box::new(MaxOccurrence::from_definition(def)?)));
    registry.register(OCCURRENCE, |def| Ok(Box::new(MaxOccurrence::from_definition(def)?)));
    registry.register(COOLDOWN, |def| Ok(Box::new(Cooldown::from_definition(def)?)));
    registry.register(TIME_WINDOW, |def| Ok(Box::new(TimeWindow::from_definition(def)?)));
    registry.register(PROXIMITY, |def| Ok(Box::new(ProximityLimit::from_definition(def)?)));
    registry.register(STAYS, |def| Ok(Box::new(MinimumStay::from_definition(def)?)));
    registry.register(EXPRESSION, move |def| {
        Ok(Box::new(Expression::from_definition(def, Arc::clone(&expressions))?))
    });
}

fn param<'a>(def: &'a ConditionDefinition, name: &str) -> Result<&'a Value, ParameterError> {
    def.parameters
        .get(name)
        .ok_or_else(|| ParameterError::Missing(name.to_string()))
}

// Numbers may arrive as JSON numbers or numeric strings.
fn u64_param(def: &ConditionDefinition, name: &str) -> Result<u64, ParameterError> {
    match param(def, name)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ParameterError::invalid(name, "expected a non-negative integer")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ParameterError::invalid(name, format!("'{s}' is not a non-negative integer"))),
        _ => Err(ParameterError::invalid(name, "expected a non-negative integer")),
    }
}

fn str_param<'a>(def: &'a ConditionDefinition, name: &str) -> Result<&'a str, ParameterError> {
    param(def, name)?
        .as_str()
        .ok_or_else(|| ParameterError::invalid(name, "expected a string"))
}

fn str_list_param<'a>(def: &'a ConditionDefinition, name: &str) -> Result<Vec<&'a str>, ParameterError> {
    match param(def, name)? {
        Value::String(s) => Ok(vec![s.as_str()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| ParameterError::invalid(name, "expected a list of strings"))
            })
            .collect(),
        _ => Err(ParameterError::invalid(name, "expected a string or a list of strings")),
    }
}

/// Restricts a trigger to the listed event types.
#[derive(Debug, Clone)]
pub struct EventTypeCheck {
    events: Vec<EventType>,
}

impl EventTypeCheck {
    fn from_definition(def: &ConditionDefinition) -> Result<Self, ParameterError> {
        let events = str_list_param(def, "events")?
            .into_iter()
            .map(|s| EventType::from_str(s).map_err(|e| ParameterError::invalid("events", e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        if events.is_empty() {
            return Err(ParameterError::invalid("events", "at least one event type is required"));
        }
        Ok(Self { events })
    }
}

impl ConditionCheck for EventTypeCheck {
    fn tag(&self) -> &str {
        EVENT_TYPE
    }

    fn check(&self, ctx: &ConditionContext<'_>, _: &OccurrenceLedger) -> Result<bool, ConditionError> {
        Ok(self.events.contains(&ctx.event))
    }

    fn applicable_events(&self) -> Option<&[EventType]> {
        Some(&self.events)
    }
}

/// Valid while the trigger has fired fewer than `max` times for the beacon.
#[derive(Debug, Clone, Copy)]
pub struct MaxOccurrence {
    max: u64,
}

impl MaxOccurrence {
    fn from_definition(def: &ConditionDefinition) -> Result<Self, ParameterError> {
        Ok(Self {
            max: u64_param(def, "max")?,
        })
    }
}

impl ConditionCheck for MaxOccurrence {
    fn tag(&self) -> &str {
        MAX_OCCURRENCE
    }

    fn check(&self, ctx: &ConditionContext<'_>, ledger: &OccurrenceLedger) -> Result<bool, ConditionError> {
        Ok(ledger.occurrence_count(ctx.beacon, ctx.trigger) < self.max)
    }

    fn counts_occurrence(&self) -> bool {
        true
    }
}

/// Valid when the previous occurrence is at least `period` old.
#[derive(Debug, Clone, Copy)]
pub struct Cooldown {
    period: chrono::Duration,
}

impl Cooldown {
    fn from_definition(def: &ConditionDefinition) -> Result<Self, ParameterError> {
        let seconds = u64_param(def, "seconds")?;
        let seconds = i64::try_from(seconds).map_err(|_| ParameterError::invalid("seconds", "value too large"))?;
        let period = chrono::Duration::try_seconds(seconds)
            .ok_or_else(|| ParameterError::invalid("seconds", "value too large"))?;
        Ok(Self { period })
    }
}

impl ConditionCheck for Cooldown {
    fn tag(&self) -> &str {
        COOLDOWN
    }

    fn check(&self, ctx: &ConditionContext<'_>, ledger: &OccurrenceLedger) -> Result<bool, ConditionError> {
        Ok(ledger
            .last_occurrence_time(ctx.beacon, ctx.trigger)
            .map_or(true, |last| ctx.now - last >= self.period))
    }
}

/// Valid inside a daily window, optionally limited to some weekdays.
///
/// A window whose end is before its start wraps past midnight; the part after
/// midnight belongs to the day the window opened. Equal start and end means
/// the whole day.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
    days: Option<Vec<Weekday>>,
    timezone: Tz,
}

impl TimeWindow {
    fn from_definition(def: &ConditionDefinition) -> Result<Self, ParameterError> {
        let time = |name: &str| {
            let raw = str_param(def, name)?;
            NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                .map_err(|_| ParameterError::invalid(name, format!("'{raw}' is not HH:MM")))
        };
        let start = time("start")?;
        let end = time("end")?;

        let days = if def.parameters.contains_key("days") {
            let days = str_list_param(def, "days")?
                .into_iter()
                .map(|s| {
                    Weekday::from_str(s.trim())
                        .map_err(|_| ParameterError::invalid("days", format!("'{s}' is not a weekday")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(days)
        } else {
            None
        };

        let timezone = match def.parameters.get("timezone") {
            None | Some(Value::Null) => Tz::UTC,
            Some(_) => {
                let raw = str_param(def, "timezone")?;
                Tz::from_str(raw).map_err(|e| ParameterError::invalid("timezone", e.to_string()))?
            }
        };

        Ok(Self {
            start,
            end,
            days,
            timezone,
        })
    }

    fn opened_on(&self, local: chrono::DateTime<Tz>) -> Option<Weekday> {
        let time = local.time();
        let today = local.weekday();
        if self.start == self.end {
            Some(today)
        } else if self.start < self.end {
            (self.start <= time && time < self.end).then_some(today)
        } else if time >= self.start {
            Some(today)
        } else if time < self.end {
            Some(today.pred())
        } else {
            None
        }
    }
}

impl ConditionCheck for TimeWindow {
    fn tag(&self) -> &str {
        TIME_WINDOW
    }

    fn check(&self, ctx: &ConditionContext<'_>, _: &OccurrenceLedger) -> Result<bool, ConditionError> {
        let local = ctx.now.with_timezone(&self.timezone);
        Ok(self
            .opened_on(local)
            .is_some_and(|day| self.days.as_ref().map_or(true, |days| days.contains(&day))))
    }
}

/// Valid when the beacon is at `max` or closer.
#[derive(Debug, Clone, Copy)]
pub struct ProximityLimit {
    max: Proximity,
}

impl ProximityLimit {
    fn from_definition(def: &ConditionDefinition) -> Result<Self, ParameterError> {
        let raw = str_param(def, "max")?;
        let max = Proximity::from_str(raw).map_err(|e| ParameterError::invalid("max", e.to_string()))?;
        if !max.is_known() {
            return Err(ParameterError::invalid("max", "limit must be immediate, near or far"));
        }
        Ok(Self { max })
    }
}

impl ConditionCheck for ProximityLimit {
    fn tag(&self) -> &str {
        PROXIMITY
    }

    fn check(&self, ctx: &ConditionContext<'_>, _: &OccurrenceLedger) -> Result<bool, ConditionError> {
        let snapshot = ctx.snapshot.ok_or(ConditionError::MissingState(ctx.beacon))?;
        Ok(snapshot.reading.proximity.within(self.max))
    }
}

/// Valid once the beacon has stayed for at least `min`.
#[derive(Debug, Clone, Copy)]
pub struct MinimumStay {
    min: Duration,
}

impl MinimumStay {
    fn from_definition(def: &ConditionDefinition) -> Result<Self, ParameterError> {
        Ok(Self {
            min: Duration::from_secs(u64_param(def, "min_seconds")?),
        })
    }
}

impl ConditionCheck for MinimumStay {
    fn tag(&self) -> &str {
        STAYS
    }

    fn check(&self, ctx: &ConditionContext<'_>, _: &OccurrenceLedger) -> Result<bool, ConditionError> {
        let snapshot = ctx.snapshot.ok_or(ConditionError::MissingState(ctx.beacon))?;
        Ok(snapshot
            .stays_duration(ctx.now)
            .is_some_and(|stayed| stayed >= self.min))
    }
}

/// Delegates to the configured [`ExpressionEvaluator`].
pub struct Expression {
    expression: String,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Expression {
    fn from_definition(
        def: &ConditionDefinition,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Result<Self, ParameterError> {
        let expression = match &def.expression {
            Some(expression) => expression.clone(),
            None => str_param(def, "expression")?.to_string(),
        };
        if expression.trim().is_empty() {
            return Err(ParameterError::invalid("expression", "must not be empty"));
        }
        Ok(Self { expression, evaluator })
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("expression", &self.expression)
            .finish_non_exhaustive()
    }
}

impl ConditionCheck for Expression {
    fn tag(&self) -> &str {
        EXPRESSION
    }

    fn check(&self, ctx: &ConditionContext<'_>, _: &OccurrenceLedger) -> Result<bool, ConditionError> {
        self.evaluator.evaluate(&self.expression, ctx)
    }
}

/// Evaluator that understands only the literals `true` and `false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralExpressionEvaluator;

impl ExpressionEvaluator for LiteralExpressionEvaluator {
    fn evaluate(&self, expression: &str, _: &ConditionContext<'_>) -> Result<bool, ConditionError> {
        match expression.trim() {
            "true" | "TRUE" | "YES" => Ok(true),
            "false" | "FALSE" | "NO" => Ok(false),
            other => Err(ConditionError::Expression {
                expression: other.to_string(),
                message: "only literal true/false is supported".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BeaconId, BeaconSnapshot, Reading};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn compile(kind: &str, parameters: serde_json::Value) -> Box<dyn ConditionCheck> {
        let def = ConditionDefinition {
            kind: kind.to_string(),
            parameters: parameters.as_object().cloned().unwrap_or_default(),
            expression: None,
        };
        ConditionRegistry::default().compile("t1", &def).unwrap()
    }

    fn ctx_at(now: DateTime<Utc>, snapshot: Option<&BeaconSnapshot>) -> ConditionContext<'_> {
        ConditionContext {
            event: EventType::Enter,
            beacon: BeaconId::new(Uuid::nil(), 1, 1),
            trigger: "t1",
            snapshot,
            now,
        }
    }

    fn snapshot(proximity: Proximity, entered_secs_ago: i64, now: DateTime<Utc>) -> BeaconSnapshot {
        BeaconSnapshot {
            reading: Reading {
                proximity,
                accuracy: 1.0,
                rssi: -60,
            },
            last_seen: now,
            entered_at: Some(now - chrono::Duration::seconds(entered_secs_ago)),
            present: true,
        }
    }

    #[test]
    fn test_event_type_applicability() {
        let check = compile(EVENT_TYPE, json!({"events": ["enter", "range"]}));
        assert_eq!(
            check.applicable_events(),
            Some(&[EventType::Enter, EventType::Range][..])
        );
        let single = compile(EVENT_TYPE, json!({"events": "leave"}));
        assert_eq!(single.applicable_events(), Some(&[EventType::Exit][..]));
    }

    #[test]
    fn test_occurrence_alias_and_string_numbers() {
        let check = compile(OCCURRENCE, json!({"max": "1"}));
        assert!(check.counts_occurrence());
        let mut ledger = OccurrenceLedger::new();
        let ctx = ctx_at(Utc::now(), None);
        assert!(check.check(&ctx, &ledger).unwrap());
        ledger.record_occurrence(ctx.beacon, "t1");
        assert!(!check.check(&ctx, &ledger).unwrap());
    }

    #[test]
    fn test_cooldown() {
        let check = compile(COOLDOWN, json!({"seconds": 60}));
        let mut ledger = OccurrenceLedger::new();
        let now = Utc::now();
        let ctx = ctx_at(now, None);
        assert!(check.check(&ctx, &ledger).unwrap());

        ledger.record_occurrence_at(ctx.beacon, "t1", now - chrono::Duration::seconds(30));
        assert!(!check.check(&ctx, &ledger).unwrap());

        let later = ctx_at(now + chrono::Duration::seconds(31), None);
        assert!(check.check(&later, &ledger).unwrap());
    }

    #[test]
    fn test_time_window_same_day() {
        let check = compile(TIME_WINDOW, json!({"start": "09:00", "end": "17:00"}));
        let ledger = OccurrenceLedger::new();
        let inside = Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2024, 5, 6, 18, 0, 0).unwrap();
        assert!(check.check(&ctx_at(inside, None), &ledger).unwrap());
        assert!(!check.check(&ctx_at(outside, None), &ledger).unwrap());
    }

    #[test]
    fn test_time_window_wraps_midnight_on_opening_day() {
        // Friday 22:00 to 02:00; 2024-05-11 is a Saturday.
        let check = compile(
            TIME_WINDOW,
            json!({"start": "22:00", "end": "02:00", "days": ["fri"]}),
        );
        let ledger = OccurrenceLedger::new();
        let friday_night = Utc.with_ymd_and_hms(2024, 5, 10, 23, 0, 0).unwrap();
        let saturday_early = Utc.with_ymd_and_hms(2024, 5, 11, 1, 0, 0).unwrap();
        let saturday_night = Utc.with_ymd_and_hms(2024, 5, 11, 23, 0, 0).unwrap();
        assert!(check.check(&ctx_at(friday_night, None), &ledger).unwrap());
        assert!(check.check(&ctx_at(saturday_early, None), &ledger).unwrap());
        assert!(!check.check(&ctx_at(saturday_night, None), &ledger).unwrap());
    }

    #[test]
    fn test_time_window_timezone() {
        let check = compile(
            TIME_WINDOW,
            json!({"start": "09:00", "end": "10:00", "timezone": "Europe/Warsaw"}),
        );
        let ledger = OccurrenceLedger::new();
        // 07:30 UTC is 09:30 in Warsaw during summer time.
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 7, 30, 0).unwrap();
        assert!(check.check(&ctx_at(now, None), &ledger).unwrap());
    }

    #[test]
    fn test_time_window_rejects_bad_input() {
        let registry = ConditionRegistry::default();
        for params in [
            json!({"start": "9am", "end": "10:00"}),
            json!({"start": "09:00", "end": "10:00", "days": ["someday"]}),
            json!({"start": "09:00", "end": "10:00", "timezone": "Mars/Olympus"}),
        ] {
            let def = ConditionDefinition {
                kind: TIME_WINDOW.to_string(),
                parameters: params.as_object().cloned().unwrap_or_default(),
                expression: None,
            };
            assert!(registry.compile("t1", &def).is_err(), "{params}");
        }
    }

    #[test]
    fn test_proximity_and_stays() {
        let now = Utc::now();
        let ledger = OccurrenceLedger::new();
        let near = compile(PROXIMITY, json!({"max": "near"}));
        let stays = compile(STAYS, json!({"min_seconds": 60}));

        let close = snapshot(Proximity::Immediate, 120, now);
        let far = snapshot(Proximity::Far, 10, now);

        assert!(near.check(&ctx_at(now, Some(&close)), &ledger).unwrap());
        assert!(!near.check(&ctx_at(now, Some(&far)), &ledger).unwrap());
        assert!(stays.check(&ctx_at(now, Some(&close)), &ledger).unwrap());
        assert!(!stays.check(&ctx_at(now, Some(&far)), &ledger).unwrap());

        let missing = near.check(&ctx_at(now, None), &ledger);
        assert!(matches!(missing, Err(ConditionError::MissingState(_))));
    }

    #[test]
    fn test_literal_expressions() {
        let ledger = OccurrenceLedger::new();
        let ctx = ctx_at(Utc::now(), None);
        assert!(compile(EXPRESSION, json!({"expression": "true"}))
            .check(&ctx, &ledger)
            .unwrap());
        assert!(!compile(EXPRESSION, json!({"expression": "false"}))
            .check(&ctx, &ledger)
            .unwrap());
        let err = compile(EXPRESSION, json!({"expression": "rssi > -70"})).check(&ctx, &ledger);
        assert!(matches!(err, Err(ConditionError::Expression { .. })));
    }
}

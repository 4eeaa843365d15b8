//! Cron scheduler trigger.
//!
//! Each poll emits one item per cron tick that elapsed since the stored
//! cursor (unix seconds of the last emitted tick). The first poll after
//! activation only sets the cursor.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use cron::Schedule;
use serde_json::{Value, json};

use crate::connector::{
    App, AppMeta, ArgumentDef, ConnectorCtx, OperationMeta, PollResult, PollingTrigger,
    TriggerDef, TriggerItem,
};
use crate::types::ConnectorError;

/// Most ticks one poll emits; older ones are skipped after a long outage.
pub const MAX_TICKS_PER_POLL: usize = 100;

pub struct SchedulerApp;

#[async_trait]
impl App for SchedulerApp {
    fn meta(&self) -> AppMeta {
        AppMeta {
            icon_url: Some("{BASE_URL}/apps/scheduler/assets/favicon.svg".into()),
            primary_color: Some("0059F7".into()),
            ..AppMeta::new("scheduler", "Scheduler")
        }
    }

    fn triggers(&self) -> Vec<TriggerDef> {
        vec![TriggerDef::Polling(Arc::new(EveryCronTick))]
    }
}

pub struct EveryCronTick;

/// Parse a cron expression. Five-field expressions (`min hour day month
/// weekday`) are widened to the seconds-and-year form the `cron` crate reads.
pub fn parse_schedule(expression: &str) -> Result<Schedule, ConnectorError> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression} *")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| {
        ConnectorError::semantic_with(
            format!("invalid cron expression: {e}"),
            json!({ "expression": expression }),
        )
    })
}

/// Ticks in `(since, now]`, oldest first, keeping the newest `limit`.
///
/// Walks backwards from `now`, so the work is bounded by `limit` however
/// far behind the cursor is.
pub fn due_ticks(
    schedule: &Schedule,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    // `rev` yields ticks at least one second before its start.
    let start = now + Duration::seconds(1);
    let mut ticks: Vec<DateTime<Utc>> = schedule
        .after(&start)
        .rev()
        .skip_while(|t| *t > now)
        .take_while(|t| *t > since)
        .take(limit)
        .collect();
    ticks.reverse();
    ticks
}

fn tick_payload(tick: DateTime<Utc>) -> Value {
    json!({
        "fired_at": tick.to_rfc3339(),
        "timestamp": tick.timestamp(),
    })
}

impl EveryCronTick {
    fn poll_at(
        &self,
        ctx: &ConnectorCtx,
        now: DateTime<Utc>,
    ) -> Result<PollResult, ConnectorError> {
        let schedule = parse_schedule(ctx.required_str("cron")?)?;

        let since = match ctx.cursor().and_then(|c| c.parse::<i64>().ok()) {
            Some(secs) => Utc.timestamp_opt(secs, 0).single(),
            None => None,
        };
        let Some(since) = since else {
            // First poll: start counting from now.
            return Ok(PollResult {
                items: Vec::new(),
                next_cursor: Some(now.timestamp().to_string()),
            });
        };

        let ticks = due_ticks(&schedule, since, now, MAX_TICKS_PER_POLL);
        let next_cursor = ticks.last().map(|t| t.timestamp().to_string());
        let items = ticks
            .into_iter()
            .map(|tick| {
                TriggerItem::with_key(
                    tick_payload(tick),
                    format!("schedule:{}:{}", ctx.flow_id(), tick.timestamp()),
                )
            })
            .collect();
        Ok(PollResult { items, next_cursor })
    }
}

#[async_trait]
impl PollingTrigger for EveryCronTick {
    fn meta(&self) -> OperationMeta {
        OperationMeta::new(
            "every_cron_tick",
            "Every cron tick",
            "Triggers on every tick of a cron expression.",
        )
        .argument(ArgumentDef::required("cron", "Cron expression"))
    }

    async fn run(&self, ctx: &ConnectorCtx) -> Result<PollResult, ConnectorError> {
        self.poll_at(ctx, Utc::now())
    }

    /// The next upcoming tick.
    async fn test_run(&self, ctx: &ConnectorCtx) -> Result<Option<Value>, ConnectorError> {
        let schedule = parse_schedule(ctx.required_str("cron")?)?;
        Ok(schedule.upcoming(Utc).next().map(tick_payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn ctx(cron: &str, cursor: Option<&str>) -> ConnectorCtx {
        ConnectorCtx::builder("flow-1", "step-1")
            .parameters(json!({ "cron": cron }))
            .cursor(cursor.map(str::to_string))
            .build()
    }

    #[test]
    fn five_field_expressions_are_accepted() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 */5 * * * *").is_ok());
        let err = parse_schedule("every tuesday").unwrap_err();
        assert!(matches!(err, ConnectorError::Semantic { .. }));
    }

    #[test]
    fn ticks_between_cursor_and_now() {
        let schedule = parse_schedule("* * * * *").unwrap();
        // 00:00:30 to 00:03:10 covers the 00:01, 00:02 and 00:03 ticks.
        let ticks = due_ticks(&schedule, at(30), at(190), 10);
        assert_eq!(ticks, vec![at(60), at(120), at(180)]);
        let capped = due_ticks(&schedule, at(30), at(190), 2);
        assert_eq!(capped, vec![at(120), at(180)]);
        assert!(due_ticks(&schedule, at(180), at(190), 10).is_empty());
        // A tick landing exactly on `now` is due.
        assert_eq!(due_ticks(&schedule, at(100), at(180), 10), vec![at(120), at(180)]);
    }

    #[test]
    fn long_backlog_keeps_only_the_newest_ticks() {
        let every_second = parse_schedule("* * * * * *").unwrap();
        let thirty_days = 30 * 24 * 3_600;
        let ticks = due_ticks(&every_second, at(0), at(thirty_days), 3);
        assert_eq!(
            ticks,
            vec![at(thirty_days - 2), at(thirty_days - 1), at(thirty_days)]
        );
    }

    #[test]
    fn first_poll_only_sets_the_cursor() {
        let result = EveryCronTick
            .poll_at(&ctx("* * * * *", None), at(1_000))
            .unwrap();
        assert!(result.items.is_empty());
        assert_eq!(result.next_cursor.as_deref(), Some("1000"));
    }

    #[test]
    fn due_ticks_become_keyed_items() {
        let result = EveryCronTick
            .poll_at(&ctx("* * * * *", Some("30")), at(130))
            .unwrap();
        assert_eq!(result.items.len(), 2);
        assert_eq!(
            result.items[0].dedupe_key.as_deref(),
            Some("schedule:flow-1:60")
        );
        assert_eq!(result.items[1].payload["timestamp"], 120);
        assert_eq!(result.next_cursor.as_deref(), Some("120"));

        let idle = EveryCronTick
            .poll_at(&ctx("* * * * *", Some("120")), at(130))
            .unwrap();
        assert!(idle.items.is_empty());
        assert_eq!(idle.next_cursor, None);
    }

    #[tokio::test]
    async fn sample_is_the_next_tick() {
        let sample = EveryCronTick
            .test_run(&ctx("0 0 * * *", None))
            .await
            .unwrap()
            .unwrap();
        assert!(sample["timestamp"].as_i64().unwrap() > Utc::now().timestamp());
    }
}

//! JSON feed poller.
//!
//! Fetches a JSON array (or an object with an `items` array), newest item
//! first, and emits the items newer than the cursor. The cursor is the id
//! of the newest item already seen. The first poll only records it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::common::id_string;
use crate::connector::{
    App, AppMeta, ArgumentDef, ConnectorCtx, OperationMeta, PollResult, PollingTrigger,
    TriggerDef, TriggerItem,
};
use crate::types::ConnectorError;

const DEFAULT_ID_FIELD: &str = "id";

pub struct JsonFeedApp;

#[async_trait]
impl App for JsonFeedApp {
    fn meta(&self) -> AppMeta {
        AppMeta {
            icon_url: Some("{BASE_URL}/apps/json-feed/assets/favicon.svg".into()),
            ..AppMeta::new("json-feed", "JSON Feed")
        }
    }

    fn triggers(&self) -> Vec<TriggerDef> {
        vec![TriggerDef::Polling(Arc::new(NewFeedItems))]
    }
}

pub struct NewFeedItems;

impl NewFeedItems {
    async fn fetch(&self, ctx: &ConnectorCtx) -> Result<Vec<Value>, ConnectorError> {
        let url = ctx.required_str("url")?;
        let response = ctx.http().get(url).await?;
        match response.body {
            Value::Array(items) => Ok(items),
            Value::Object(mut obj) => match obj.remove("items") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(ConnectorError::semantic("feed object has no items array")),
            },
            _ => Err(ConnectorError::semantic("feed is not a JSON array")),
        }
    }
}

fn id_field(ctx: &ConnectorCtx) -> &str {
    ctx.parameters()
        .get("id_field")
        .and_then(Value::as_str)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_ID_FIELD)
}

/// Items newer than `cursor`, oldest first, with the next cursor.
pub fn new_items(feed: Vec<Value>, id_field: &str, cursor: Option<&str>) -> PollResult {
    let newest = feed.first().and_then(|item| item.get(id_field)).and_then(id_string);
    let Some(cursor) = cursor else {
        return PollResult {
            items: Vec::new(),
            next_cursor: newest,
        };
    };

    let mut items: Vec<TriggerItem> = feed
        .into_iter()
        .filter_map(|item| {
            let id = item.get(id_field).and_then(id_string)?;
            Some((id, item))
        })
        .take_while(|(id, _)| id != cursor)
        .map(|(id, item)| TriggerItem::with_key(item, id))
        .collect();
    items.reverse();

    let next_cursor = if items.is_empty() { None } else { newest };
    PollResult { items, next_cursor }
}

#[async_trait]
impl PollingTrigger for NewFeedItems {
    fn meta(&self) -> OperationMeta {
        OperationMeta::new(
            "new_items",
            "New items",
            "Triggers when new items appear in a JSON feed.",
        )
        .argument(ArgumentDef::required("url", "Feed URL"))
        .argument(ArgumentDef::optional("id_field", "Id field"))
    }

    async fn run(&self, ctx: &ConnectorCtx) -> Result<PollResult, ConnectorError> {
        let feed = self.fetch(ctx).await?;
        Ok(new_items(feed, id_field(ctx), ctx.cursor()))
    }

    /// The newest item of the feed.
    async fn test_run(&self, ctx: &ConnectorCtx) -> Result<Option<Value>, ConnectorError> {
        Ok(self.fetch(ctx).await?.into_iter().next())
    }
}

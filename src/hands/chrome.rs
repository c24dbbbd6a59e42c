use std::sync::Arc;

use async_trait::async_trait;
use headless_chrome::Tab;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::scripts::{CAPTURE_JS, HELPERS_JS, call, ready_check};
use crate::dom::{Document, DocumentSpec, Rect};
use crate::page::{DomEvent, NodeAddress, Page, PageError};

/// A Chrome tab driven through the DevTools protocol. headless_chrome is synchronous, so
/// every call runs on the blocking pool.
#[derive(Clone)]
pub struct ChromePage {
    tab: Arc<Tab>,
}

/// What the in-page helpers answer.
#[derive(Debug, Deserialize)]
struct HelperReply {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    gone: bool,
    #[serde(default)]
    error: Option<String>,
}

impl HelperReply {
    fn into_value(self, target: Option<&NodeAddress>) -> Result<Value, PageError> {
        if self.ok {
            return Ok(self.value);
        }
        match target {
            Some(target) if self.gone => Err(PageError::NodeGone(target.clone())),
            _ => Err(PageError::Script(
                self.error.unwrap_or_else(|| "helper failed".to_string()),
            )),
        }
    }
}

impl ChromePage {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self { tab }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PageError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| PageError::Unavailable(e.to_string()))?
            .map_err(|e| PageError::Script(format!("{e:#}")))
    }

    async fn evaluate(&self, script: String) -> Result<Value, PageError> {
        self.blocking(move |tab| Ok(tab.evaluate(&script, false)?.value.unwrap_or(Value::Null)))
            .await
    }

    /// Evaluate a script that returns a JSON string and decode it.
    async fn evaluate_json<T: for<'de> Deserialize<'de>>(&self, script: String) -> Result<T, PageError> {
        match self.evaluate(script).await? {
            Value::String(raw) => serde_json::from_str(&raw).map_err(|e| PageError::Script(e.to_string())),
            other => Err(PageError::Script(format!("expected a JSON string, got {other}"))),
        }
    }

    async fn helper(&self, method: &str, target: &NodeAddress, args: &[Value]) -> Result<Value, PageError> {
        let mut all = vec![json!(target.to_string())];
        all.extend_from_slice(args);
        let reply: HelperReply = self.evaluate_json(call(method, &all)).await?;
        reply.into_value(Some(target))
    }
}

#[async_trait]
impl Page for ChromePage {
    async fn capture(&self) -> Result<Document, PageError> {
        let spec: DocumentSpec = self.evaluate_json(CAPTURE_JS.to_string()).await?;
        Ok(Document::from(spec))
    }

    async fn url(&self) -> Result<String, PageError> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn scroll_into_view(&self, target: &NodeAddress) -> Result<Rect, PageError> {
        let value = self.helper("scrollIntoView", target, &[]).await?;
        serde_json::from_value(value).map_err(|e| PageError::Script(e.to_string()))
    }

    async fn dispatch(&self, target: &NodeAddress, event: DomEvent) -> Result<(), PageError> {
        let key = match &event {
            DomEvent::KeyDown(c) | DomEvent::KeyUp(c) => json!(c.to_string()),
            _ => Value::Null,
        };
        self.helper("dispatch", target, &[json!(event.name()), key]).await?;
        Ok(())
    }

    async fn set_value(&self, target: &NodeAddress, value: &str) -> Result<(), PageError> {
        self.helper("setValue", target, &[json!(value)]).await?;
        Ok(())
    }

    async fn value(&self, target: &NodeAddress) -> Result<String, PageError> {
        match self.helper("value", target, &[]).await? {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Ok(other.to_string()),
        }
    }

    async fn scroll_by(&self, target: &NodeAddress, amount: i64) -> Result<(), PageError> {
        self.helper("scrollBy", target, &[json!(amount)]).await?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        let owned = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&owned)?.wait_until_navigated()?;
            Ok(())
        })
        .await
        .map_err(|e| PageError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn is_ready(&self) -> bool {
        matches!(self.evaluate(ready_check()).await, Ok(Value::Bool(true)))
    }

    async fn install(&self) -> Result<(), PageError> {
        debug!("installing page helpers");
        self.evaluate(HELPERS_JS.to_string()).await?;
        Ok(())
    }

    async fn show_cursor(&self, at: Option<(f64, f64)>) -> Result<(), PageError> {
        let point = at.map_or(Value::Null, |(x, y)| json!([x, y]));
        let reply: HelperReply = self.evaluate_json(call("cursor", &[point])).await?;
        reply.into_value(None).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(raw: Value) -> HelperReply {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_helper_replies() {
        let target = NodeAddress::parse("/html/body/button");
        assert_eq!(
            reply(json!({"ok": true, "value": {"x": 1.0}})).into_value(Some(&target)),
            Ok(json!({"x": 1.0}))
        );
        assert_eq!(
            reply(json!({"ok": false, "gone": true})).into_value(Some(&target)),
            Err(PageError::NodeGone(target.clone()))
        );
        assert!(matches!(
            reply(json!({"ok": false, "error": "boom"})).into_value(Some(&target)),
            Err(PageError::Script(msg)) if msg == "boom"
        ));
        assert!(matches!(
            reply(json!({"ok": false, "gone": true})).into_value(None),
            Err(PageError::Script(_))
        ));
    }
}

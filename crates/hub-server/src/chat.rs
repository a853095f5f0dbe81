//! Reference chat hub: broadcast, a dad joke, and a countdown stream.

use std::time::Duration;

use serde_json::{Value, json};

use chathub_protocol::ChatMessage;
use chathub_protocol::constants::{
    EVENT_NEW_MESSAGE, METHOD_BROADCAST, METHOD_COUNT_DOWN, METHOD_DAD_JOKE,
};

use crate::hub::{Hub, HubContext, HubFuture, HubMethods, StreamWriter};

const DAD_JOKE: &str = "How do celebrities stay cool? They have many fans";

/// Tunables for [`ChatHub`].
#[derive(Debug, Clone)]
pub struct ChatHubConfig {
    /// Pause between two `CountDown` items.
    pub countdown_interval: Duration,
    /// Largest accepted `CountDown` start value.
    pub max_countdown: i64,
}

impl Default for ChatHubConfig {
    fn default() -> Self {
        Self {
            countdown_interval: Duration::from_secs(2),
            max_countdown: 10_000,
        }
    }
}

/// The chat hub.
pub struct ChatHub {
    config: ChatHubConfig,
    methods: HubMethods,
}

impl ChatHub {
    pub fn new(config: ChatHubConfig) -> Self {
        Self {
            config,
            methods: HubMethods::new()
                .unary(METHOD_BROADCAST, 1)
                .unary(METHOD_DAD_JOKE, 0)
                .stream(METHOD_COUNT_DOWN, 1),
        }
    }

    fn broadcast(&self, ctx: &HubContext, args: Vec<Value>) -> Result<Option<Value>, String> {
        let payload = args.into_iter().next().unwrap_or(Value::Null);
        let msg: ChatMessage = serde_json::from_value(payload.clone())
            .map_err(|e| format!("Broadcast expects a message {{name, text}}: {e}"))?;
        let delivered = ctx.clients().all().send(EVENT_NEW_MESSAGE, vec![payload]);
        tracing::debug!(session = %ctx.session_id(), from = %msg.name, delivered, "broadcast");
        Ok(None)
    }

    async fn count_down(&self, args: Vec<Value>, writer: StreamWriter) -> Result<(), String> {
        let count = args
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| "CountDown expects an integer count".to_string())?;
        if !(0..=self.config.max_countdown).contains(&count) {
            return Err(format!(
                "count must be between 0 and {}",
                self.config.max_countdown
            ));
        }

        for n in (0..=count).rev() {
            if writer.emit(n).await.is_err() {
                // Cancelled or session gone; the completion still goes out.
                return Ok(());
            }
            if n == 0 {
                break;
            }
            tokio::select! {
                _ = writer.cancelled() => {
                    tracing::debug!(id = %writer.invocation_id(), remaining = n, "countdown cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.countdown_interval) => {}
            }
        }
        Ok(())
    }
}

impl Default for ChatHub {
    fn default() -> Self {
        Self::new(ChatHubConfig::default())
    }
}

impl Hub for ChatHub {
    fn methods(&self) -> &HubMethods {
        &self.methods
    }

    fn invoke<'a>(
        &'a self,
        ctx: HubContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> HubFuture<'a, Result<Option<Value>, String>> {
        Box::pin(async move {
            match method {
                METHOD_BROADCAST => self.broadcast(&ctx, args),
                METHOD_DAD_JOKE => Ok(Some(json!(DAD_JOKE))),
                other => Err(format!("Unknown hub method '{other}'")),
            }
        })
    }

    fn stream<'a>(
        &'a self,
        _ctx: HubContext,
        method: &'a str,
        args: Vec<Value>,
        writer: StreamWriter,
    ) -> HubFuture<'a, Result<(), String>> {
        Box::pin(async move {
            match method {
                METHOD_COUNT_DOWN => self.count_down(args, writer).await,
                other => Err(format!("Unknown hub method '{other}'")),
            }
        })
    }

    fn on_connected(&self, ctx: HubContext) -> HubFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(session = %ctx.session_id(), "chat client joined");
        })
    }

    fn on_disconnected(&self, ctx: HubContext) -> HubFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(session = %ctx.session_id(), "chat client left");
        })
    }
}

//! Telegram delivery channel, built behind the `notifier-telegram` feature
//! so a deployment without a bot token can still build and run against
//! `NullNotifier`.

#![cfg(feature = "notifier-telegram")]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId};
use tokio::sync::Mutex;

use crate::models::{Signal, Tracking};
use crate::notifier::Notifier;

/// One send lock per chat id so alerts for the same chat are delivered in
/// the order they were produced, without serializing unrelated chats.
pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> anyhow::Result<Self> {
        let chat_id: i64 = chat_id.parse()?;
        Ok(Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn chat_lock(&self) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(self.chat_id.0)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn format_alert(signal: &Signal) -> String {
        format!(
            "{} spread opened: {} vs {}\nraw {:.3}% / executable {:.3}%\nsuggested position ${:.0} (cap ${:.0})",
            signal.base_symbol,
            signal.low_venue,
            signal.high_venue,
            signal.spread_pct,
            signal.executable_spread_pct,
            signal.suggested_position_usd,
            signal.max_entry_usd
        )
    }

    fn format_update(signal: &Signal, tracking: &Tracking) -> String {
        format!(
            "{} {} vs {}: {:?} (latest spread {:.3}%)",
            signal.base_symbol, signal.low_venue, signal.high_venue, tracking.outcome, tracking.latest_spread_pct
        )
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_alert(&self, signal: &Signal) -> anyhow::Result<String> {
        let lock = self.chat_lock().await;
        let _guard = lock.lock().await;

        let sent = self
            .bot
            .send_message(self.chat_id, Self::format_alert(signal))
            .await?;
        Ok(sent.id.0.to_string())
    }

    async fn edit(&self, message_id: &str, signal: &Signal, tracking: &Tracking) -> anyhow::Result<()> {
        let lock = self.chat_lock().await;
        let _guard = lock.lock().await;

        let id: i32 = message_id.parse()?;
        self.bot
            .edit_message_text(self.chat_id, MessageId(id), Self::format_update(signal, tracking))
            .await?;
        Ok(())
    }

    async fn remove_markup(&self, message_id: &str) -> anyhow::Result<()> {
        let lock = self.chat_lock().await;
        let _guard = lock.lock().await;

        let id: i32 = message_id.parse()?;
        self.bot
            .edit_message_reply_markup(self.chat_id, MessageId(id))
            .await?;
        Ok(())
    }
}

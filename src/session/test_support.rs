//! Fakes shared by the session, reconnect and metadata tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, MessageId};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::audio::StreamSink;
use crate::error::SinkError;
use crate::ui::{Notifier, NowPlayingView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectScript {
    Ok,
    Fail,
    /// Nunca termina; solo sale por cancelación.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Connect(GuildId, ChannelId),
    Play(GuildId, String),
    Stop(GuildId),
    Disconnect(GuildId),
}

/// Sink con guion: cada `connect` consume el siguiente paso (Ok por defecto).
#[derive(Default)]
pub struct FakeSink {
    script: Mutex<VecDeque<ConnectScript>>,
    calls: Mutex<Vec<SinkCall>>,
    connected: Mutex<HashSet<GuildId>>,
    playing: Mutex<HashSet<GuildId>>,
    hanging: Mutex<HashSet<GuildId>>,
    fail_play: AtomicBool,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, steps: impl IntoIterator<Item = ConnectScript>) {
        self.script.lock().extend(steps);
    }

    /// Todo `connect` de este servidor se cuelga, sin importar el guion.
    pub fn hang_on(&self, guild_id: GuildId) {
        self.hanging.lock().insert(guild_id);
    }

    pub fn fail_next_play(&self) {
        self.fail_play.store(true, Ordering::SeqCst);
    }

    /// Simula una conexión perdida sin evento (p. ej. durante un corte del gateway).
    pub fn drop_connection(&self, guild_id: GuildId) {
        self.connected.lock().remove(&guild_id);
    }

    /// Simula un stream que se apagó sin perder la conexión.
    pub fn drop_stream(&self, guild_id: GuildId) {
        self.playing.lock().remove(&guild_id);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }

    pub fn connects(&self, guild_id: GuildId) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, SinkCall::Connect(g, _) if *g == guild_id))
            .count()
    }

    fn record(&self, call: SinkCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl StreamSink for FakeSink {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), SinkError> {
        self.record(SinkCall::Connect(guild_id, channel_id));
        let step = if self.hanging.lock().contains(&guild_id) {
            ConnectScript::Hang
        } else {
            self.script.lock().pop_front().unwrap_or(ConnectScript::Ok)
        };

        tokio::time::sleep(Duration::from_millis(1)).await;

        match step {
            ConnectScript::Ok => {
                self.connected.lock().insert(guild_id);
                Ok(())
            }
            ConnectScript::Fail => Err(SinkError::Join("fallo de prueba".to_string())),
            ConnectScript::Hang => std::future::pending().await,
        }
    }

    async fn play(&self, guild_id: GuildId, url: &str) -> Result<(), SinkError> {
        self.record(SinkCall::Play(guild_id, url.to_string()));
        if self.fail_play.swap(false, Ordering::SeqCst) {
            return Err(SinkError::Playback("stream caído".to_string()));
        }
        if !self.connected.lock().contains(&guild_id) {
            return Err(SinkError::NotConnected);
        }
        self.playing.lock().insert(guild_id);
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> Result<(), SinkError> {
        self.record(SinkCall::Stop(guild_id));
        self.playing.lock().remove(&guild_id);
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> Result<(), SinkError> {
        self.record(SinkCall::Disconnect(guild_id));
        self.connected.lock().remove(&guild_id);
        self.playing.lock().remove(&guild_id);
        Ok(())
    }

    async fn is_connected(&self, guild_id: GuildId) -> bool {
        self.connected.lock().contains(&guild_id)
    }

    async fn is_playing(&self, guild_id: GuildId) -> bool {
        self.playing.lock().contains(&guild_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoticeCall {
    Posted(ChannelId, MessageId),
    Updated(MessageId, Option<String>),
    Cleared(MessageId),
    Notice(ChannelId, String),
}

/// Notifier que solo anota lo que le piden.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NoticeCall>>,
    next_message: AtomicU64,
    fail_updates: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            next_message: AtomicU64::new(1000),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<NoticeCall> {
        self.calls.lock().clone()
    }

    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    pub fn last_posted(&self) -> Option<MessageId> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            NoticeCall::Posted(_, id) => Some(*id),
            _ => None,
        })
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn post_now_playing(
        &self,
        channel_id: ChannelId,
        _view: &NowPlayingView,
    ) -> Result<MessageId> {
        let id = MessageId::new(self.next_message.fetch_add(1, Ordering::SeqCst));
        self.calls.lock().push(NoticeCall::Posted(channel_id, id));
        Ok(id)
    }

    async fn update_now_playing(
        &self,
        _channel_id: ChannelId,
        message_id: MessageId,
        view: &NowPlayingView,
    ) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(anyhow!("mensaje borrado"));
        }
        self.calls
            .lock()
            .push(NoticeCall::Updated(message_id, view.title.clone()));
        Ok(())
    }

    async fn clear_now_playing(&self, _channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        self.calls.lock().push(NoticeCall::Cleared(message_id));
        Ok(())
    }

    async fn notice(&self, channel_id: ChannelId, text: &str) -> Result<()> {
        self.calls
            .lock()
            .push(NoticeCall::Notice(channel_id, text.to_string()));
        Ok(())
    }
}

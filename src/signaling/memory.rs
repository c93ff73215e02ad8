//! In-Process Realtime-Backend
//!
//! Ein `MemoryHub` verhält sich wie ein gehosteter Realtime-Dienst, läuft
//! aber komplett im Speicher: Broadcasts gehen an alle anderen Mitglieder
//! eines Topics, Presence-Änderungen an alle. Wird für den Loopback-Modus
//! und in Tests verwendet.

use super::realtime::{
    ChannelEvent, ChannelStatus, JoinOptions, RealtimeBackend, RealtimeChannel, Subscription,
};
use super::SignalingError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Wie der Hub auf neue Beitritte reagiert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinBehavior {
    /// Sofort `Subscribed`
    Accept,
    /// Nie antworten (simuliert einen hängenden Dienst)
    Silent,
    /// Mit `ChannelError` ablehnen
    Reject(String),
}

struct Member {
    id: u64,
    key: String,
    broadcast_self: bool,
    meta: Option<Value>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

struct HubState {
    topics: HashMap<String, Vec<Member>>,
    next_id: u64,
    join_behavior: JoinBehavior,
    /// Anzahl der nächsten Beitritte, die abgelehnt werden
    failing_joins: u32,
    /// Sender unbeantworteter Beitritte (JoinBehavior::Silent)
    unanswered: Vec<mpsc::UnboundedSender<ChannelEvent>>,
}

/// In-Memory Realtime-Dienst
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                topics: HashMap::new(),
                next_id: 1,
                join_behavior: JoinBehavior::Accept,
                failing_joins: 0,
                unanswered: Vec::new(),
            })),
        }
    }

    pub fn set_join_behavior(&self, behavior: JoinBehavior) {
        self.state.lock().join_behavior = behavior;
    }

    /// Lehnt die nächsten `count` Beitritte mit `ChannelError` ab
    pub fn fail_next_joins(&self, count: u32) {
        self.state.lock().failing_joins = count;
    }

    /// Anzahl der Mitglieder eines Topics
    pub fn member_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Trennt alle Mitglieder eines Topics, als wäre der Dienst weggebrochen
    pub fn drop_connections(&self, topic: &str) {
        let members = self.state.lock().topics.remove(topic).unwrap_or_default();
        for member in members {
            let _ = member.tx.send(ChannelEvent::Status(ChannelStatus::ChannelError(
                "connection lost".to_string(),
            )));
        }
    }

    fn remove_member(&self, topic: &str, member_id: u64) {
        let mut state = self.state.lock();
        let Some(members) = state.topics.get_mut(topic) else {
            return;
        };
        let Some(pos) = members.iter().position(|m| m.id == member_id) else {
            return;
        };
        let member = members.remove(pos);
        if member.meta.is_some() {
            notify_leave(members, &member.key);
        }
        if members.is_empty() {
            state.topics.remove(topic);
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

fn notify_leave(members: &[Member], key: &str) {
    for member in members {
        let _ = member.tx.send(ChannelEvent::PresenceLeave {
            key: key.to_string(),
            metas: Vec::new(),
        });
    }
}

#[async_trait]
impl RealtimeBackend for MemoryHub {
    async fn join(&self, options: JoinOptions) -> Result<Subscription, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        let status = if state.failing_joins > 0 {
            state.failing_joins -= 1;
            Some(ChannelStatus::ChannelError("join rejected".to_string()))
        } else {
            match &state.join_behavior {
                JoinBehavior::Accept => Some(ChannelStatus::Subscribed),
                JoinBehavior::Silent => None,
                JoinBehavior::Reject(reason) => Some(ChannelStatus::ChannelError(reason.clone())),
            }
        };

        let member_id = state.next_id;
        state.next_id += 1;

        if let Some(status) = status {
            let subscribed = status == ChannelStatus::Subscribed;
            let _ = tx.send(ChannelEvent::Status(status));

            if subscribed {
                let members = state.topics.entry(options.topic.clone()).or_default();
                // Bestehende Presence nachliefern, wie ein initiales presence_state
                for member in members.iter() {
                    if let Some(meta) = &member.meta {
                        let _ = tx.send(ChannelEvent::PresenceJoin {
                            key: member.key.clone(),
                            metas: vec![meta.clone()],
                        });
                    }
                }
                members.push(Member {
                    id: member_id,
                    key: options.presence_key.clone(),
                    broadcast_self: options.broadcast_self,
                    meta: None,
                    tx,
                });
            }
        } else {
            state.unanswered.push(tx);
        }

        tracing::debug!(
            "MemoryHub: member {} joining {} as {}",
            member_id,
            options.topic,
            options.presence_key
        );

        Ok(Subscription {
            channel: Arc::new(MemoryChannel {
                hub: self.clone(),
                topic: options.topic,
                member_id,
            }),
            events: rx,
        })
    }
}

/// Channel-Handle eines Hub-Mitglieds
struct MemoryChannel {
    hub: MemoryHub,
    topic: String,
    member_id: u64,
}

impl MemoryChannel {
    fn with_members<R>(
        &self,
        f: impl FnOnce(&mut Vec<Member>, usize) -> R,
    ) -> Result<R, SignalingError> {
        let mut state = self.hub.state.lock();
        let members = state
            .topics
            .get_mut(&self.topic)
            .ok_or(SignalingError::NotConnected)?;
        let pos = members
            .iter()
            .position(|m| m.id == self.member_id)
            .ok_or(SignalingError::NotConnected)?;
        Ok(f(members, pos))
    }
}

#[async_trait]
impl RealtimeChannel for MemoryChannel {
    async fn broadcast(&self, event: &str, payload: Value) -> Result<(), SignalingError> {
        self.with_members(|members, pos| {
            for (i, member) in members.iter().enumerate() {
                if i == pos && !member.broadcast_self {
                    continue;
                }
                let _ = member.tx.send(ChannelEvent::Broadcast {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        })
    }

    async fn track(&self, meta: Value) -> Result<(), SignalingError> {
        self.with_members(|members, pos| {
            members[pos].meta = Some(meta.clone());
            let key = members[pos].key.clone();
            for member in members.iter() {
                let _ = member.tx.send(ChannelEvent::PresenceJoin {
                    key: key.clone(),
                    metas: vec![meta.clone()],
                });
            }
        })
    }

    async fn untrack(&self) -> Result<(), SignalingError> {
        self.with_members(|members, pos| {
            if members[pos].meta.take().is_some() {
                let key = members[pos].key.clone();
                let others: Vec<&Member> = members
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != pos)
                    .map(|(_, m)| m)
                    .collect();
                for member in others {
                    let _ = member.tx.send(ChannelEvent::PresenceLeave {
                        key: key.clone(),
                        metas: Vec::new(),
                    });
                }
            }
        })
    }

    fn presence_state(&self) -> HashMap<String, Vec<Value>> {
        let state = self.hub.state.lock();
        state
            .topics
            .get(&self.topic)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|m| m.meta.as_ref().map(|meta| (m.key.clone(), vec![meta.clone()])))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn unsubscribe(&self) -> Result<(), SignalingError> {
        self.hub.remove_member(&self.topic, self.member_id);
        Ok(())
    }
}

//! A live session: its history plus the users currently connected to it

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use easel_common::protocol::{HistoryNotice, SessionDescription};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::history::{HistoryError, HistoryHandle, HistoryMessage, SessionFlags, SessionHistory};

/// Bytes of randomness in an invite secret
const INVITE_SECRET_BYTES: usize = 12;

/// Capacity of the per-session event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A user connected to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: u8,
    pub name: String,
    pub auth_id: Option<String>,
    pub ip: Option<IpAddr>,
    /// Highest history index sent to this user, -1 if none yet
    pub delivered: i64,
}

/// Who wants to join
#[derive(Debug, Clone)]
pub struct JoiningUser {
    pub name: String,
    pub auth_id: Option<String>,
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone)]
struct Invite {
    created_by: String,
    /// 0 means unlimited
    max_uses: u32,
    uses: u32,
}

/// Result of checking an invite secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteCheck {
    Ok,
    NotFound,
    LimitReached,
}

#[derive(Debug, Error)]
pub enum SessionJoinError {
    #[error("session is full")]
    Full,
    #[error("invite not found")]
    InviteNotFound,
    #[error("invite has been used up")]
    InviteLimitReached,
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Something the connections of a session must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Kicked { user_id: u8, by: String, banned: bool },
}

#[derive(Debug, Default)]
struct LiveState {
    users: BTreeMap<u8, Participant>,
    invites: HashMap<String, Invite>,
    closed: bool,
    /// Operator asked to reset the history, until the reset happens
    autoreset_claimed_by: Option<u8>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    alias: Option<String>,
    history: HistoryHandle,
    live: Arc<Mutex<LiveState>>,
    events: broadcast::Sender<SessionEvent>,
}

fn lock(live: &Mutex<LiveState>) -> MutexGuard<'_, LiveState> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(history: SessionHistory) -> Self {
        let id = history.id().to_string();
        let alias = history.metadata().alias.clone();
        Self {
            id,
            alias,
            history: HistoryHandle::new(history),
            live: Arc::new(Mutex::new(LiveState::default())),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Does `id_or_alias` name this session?
    pub fn matches(&self, id_or_alias: &str) -> bool {
        self.id == id_or_alias || self.alias.as_deref() == Some(id_or_alias)
    }

    pub fn history(&self) -> &HistoryHandle {
        &self.history
    }

    pub fn user_count(&self) -> usize {
        lock(&self.live).users.len()
    }

    pub fn participants(&self) -> Vec<Participant> {
        lock(&self.live).users.values().cloned().collect()
    }

    pub fn participant(&self, user_id: u8) -> Option<Participant> {
        lock(&self.live).users.get(&user_id).cloned()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.live).closed
    }

    /// Closed sessions only accept users holding an invite
    pub fn set_closed(&self, closed: bool) {
        lock(&self.live).closed = closed;
    }

    // ========================================================================
    // Invites
    // ========================================================================

    /// Create an invite usable `max_uses` times (0 for unlimited)
    pub fn create_invite(&self, created_by: &str, max_uses: u32) -> String {
        let secret = hex::encode(rand::random::<[u8; INVITE_SECRET_BYTES]>());
        lock(&self.live).invites.insert(
            secret.clone(),
            Invite {
                created_by: created_by.to_string(),
                max_uses,
                uses: 0,
            },
        );
        debug!(session = %self.id, created_by, max_uses, "invite created");
        secret
    }

    pub fn remove_invite(&self, secret: &str) -> bool {
        lock(&self.live).invites.remove(secret).is_some()
    }

    /// Who created the invite, if it exists
    pub fn invite_creator(&self, secret: &str) -> Option<String> {
        lock(&self.live)
            .invites
            .get(secret)
            .map(|invite| invite.created_by.clone())
    }

    pub fn check_invite(&self, secret: &str) -> InviteCheck {
        match lock(&self.live).invites.get(secret) {
            None => InviteCheck::NotFound,
            Some(invite) if invite.max_uses > 0 && invite.uses >= invite.max_uses => {
                InviteCheck::LimitReached
            }
            Some(_) => InviteCheck::Ok,
        }
    }

    // ========================================================================
    // Participants
    // ========================================================================

    /// Add a user, returning their user id
    ///
    /// A returning user gets their previous id back if nobody holds it.
    /// When `invite` is given, one use of it is consumed.
    pub async fn join(
        &self,
        user: JoiningUser,
        invite: Option<&str>,
    ) -> Result<u8, SessionJoinError> {
        let live = self.live.clone();
        let invite = invite.map(str::to_string);
        let id = self
            .history
            .write(move |h| -> Result<u8, SessionJoinError> {
                let max_users = usize::from(h.metadata().max_users);
                {
                    let state = lock(&live);
                    if state.users.len() >= max_users {
                        return Err(SessionJoinError::Full);
                    }
                    if let Some(secret) = &invite {
                        match state.invites.get(secret) {
                            None => return Err(SessionJoinError::InviteNotFound),
                            Some(i) if i.max_uses > 0 && i.uses >= i.max_uses => {
                                return Err(SessionJoinError::InviteLimitReached);
                            }
                            Some(_) => {}
                        }
                    }
                }

                let id = h
                    .next_user_id(&user.name, |id| lock(&live).users.contains_key(&id))
                    .ok_or(SessionJoinError::Full)?;
                h.join_user(id, &user.name)?;
                append_notice(
                    h,
                    &HistoryNotice::Join {
                        user_id: id,
                        name: user.name.clone(),
                    },
                )?;

                let mut state = lock(&live);
                if let Some(secret) = &invite
                    && let Some(i) = state.invites.get_mut(secret)
                {
                    i.uses += 1;
                }
                state.users.insert(
                    id,
                    Participant {
                        id,
                        name: user.name,
                        auth_id: user.auth_id,
                        ip: user.ip,
                        delivered: -1,
                    },
                );
                Ok(id)
            })
            .await??;
        Ok(id)
    }

    /// Remove a user, returning how many remain
    pub async fn leave(&self, user_id: u8) -> usize {
        let remaining = {
            let mut state = lock(&self.live);
            state.users.remove(&user_id);
            if state.autoreset_claimed_by == Some(user_id) {
                state.autoreset_claimed_by = None;
            }
            state.users.len()
        };
        let notice = HistoryNotice::Leave { user_id };
        match self.history.write(move |h| append_notice(h, &notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => {
                warn!(session = %self.id, user_id, "could not record leave: {e}");
            }
        }
        remaining
    }

    /// Tell the user's connection to close
    ///
    /// Returns false if no such user is in the session.
    pub fn kick(&self, user_id: u8, by: &str, banned: bool) -> bool {
        if !lock(&self.live).users.contains_key(&user_id) {
            return false;
        }
        // Nobody listening means the connection is already going away
        let _ = self.events.send(SessionEvent::Kicked {
            user_id,
            by: by.to_string(),
            banned,
        });
        true
    }

    /// Pick `user_id` as the operator asked to reset the history
    ///
    /// Only the first caller gets true until [`Session::autoreset_done`].
    pub fn claim_autoreset(&self, user_id: u8) -> bool {
        let mut state = lock(&self.live);
        if state.autoreset_claimed_by.is_some() {
            return false;
        }
        state.autoreset_claimed_by = Some(user_id);
        true
    }

    pub fn autoreset_done(&self) {
        lock(&self.live).autoreset_claimed_by = None;
    }

    /// Record that `user_id` has been sent everything up to `index`
    ///
    /// Once every participant is past a block, its cached copy is dropped.
    pub async fn mark_delivered(&self, user_id: u8, index: i64) -> Result<(), HistoryError> {
        let lowest = {
            let mut state = lock(&self.live);
            if let Some(user) = state.users.get_mut(&user_id) {
                user.delivered = user.delivered.max(index);
            }
            state.users.values().map(|u| u.delivered).min()
        };
        match lowest {
            Some(lowest) if lowest >= 0 => self.history.cleanup_batches(lowest).await,
            _ => Ok(()),
        }
    }

    /// Public listing of this session
    pub async fn description(&self) -> Result<SessionDescription, HistoryError> {
        let users = self.user_count() as u32;
        let closed = self.is_closed();
        self.history
            .read(move |h| {
                let meta = h.metadata();
                SessionDescription {
                    id: meta.id.clone(),
                    alias: meta.alias.clone(),
                    title: meta.title.clone(),
                    founder: meta.founder.clone(),
                    protocol: meta.protocol.clone(),
                    users,
                    max_users: meta.max_users,
                    has_password: meta.password_hash.is_some(),
                    closed,
                    persistent: meta.flags.contains(SessionFlags::PERSISTENT),
                    nsfm: meta.flags.contains(SessionFlags::NSFM),
                    auth_only: meta.flags.contains(SessionFlags::AUTH_ONLY),
                    started_at: meta.started_at.timestamp(),
                }
            })
            .await
    }
}

/// Record a join or leave, using the emergency space if needed
fn append_notice(history: &mut SessionHistory, notice: &HistoryNotice) -> Result<(), HistoryError> {
    let record = match notice.encode() {
        Ok(record) => record,
        Err(e) => {
            warn!(session = %history.id(), "could not encode notice: {e}");
            return Ok(());
        }
    };
    if !history.add_emergency_message(HistoryMessage::from(record))? {
        warn!(session = %history.id(), "no room left for {notice:?}");
    }
    Ok(())
}

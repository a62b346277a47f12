//! Voice call state machine.
//!
//! `initiated -> ongoing -> {completed | missed | declined}`. Terminal states
//! are sinks: every mutating operation on a terminal call fails with
//! [`ChatError::CallEnded`]. All methods take the current time explicitly.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::room::RoomId;

pub type CallId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ongoing,
    Completed,
    Missed,
    Declined,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Missed | CallStatus::Declined)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ongoing => "ongoing",
            CallStatus::Completed => "completed",
            CallStatus::Missed => "missed",
            CallStatus::Declined => "declined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initiated" => Some(CallStatus::Initiated),
            "ongoing" => Some(CallStatus::Ongoing),
            "completed" => Some(CallStatus::Completed),
            "missed" => Some(CallStatus::Missed),
            "declined" => Some(CallStatus::Declined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCall {
    pub room_id: RoomId,
    pub initiator: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceCall {
    pub id: CallId,
    pub room_id: RoomId,
    pub initiator: String,
    /// Members currently in the call. The initiator is in here from the start.
    pub participants: BTreeSet<String>,
    /// Members who turned the call down before joining.
    pub declined: BTreeSet<String>,
    pub status: CallStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub newly_joined: bool,
    pub status_changed: bool,
}

impl VoiceCall {
    pub fn new(id: CallId, call: NewCall) -> Self {
        VoiceCall {
            id,
            room_id: call.room_id,
            participants: [call.initiator.clone()].into_iter().collect(),
            initiator: call.initiator,
            declined: BTreeSet::new(),
            status: CallStatus::Initiated,
            start_time: call.start_time,
            end_time: None,
        }
    }

    /// Call length, defined only once the call has completed.
    pub fn duration(&self) -> Option<TimeDelta> {
        match (self.status, self.end_time) {
            (CallStatus::Completed, Some(end)) => Some(end - self.start_time),
            _ => None,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.status.is_terminal() {
            Err(ChatError::CallEnded)
        } else {
            Ok(())
        }
    }

    fn finish(&mut self, status: CallStatus, now: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(now);
    }

    pub fn join(&mut self, user: &str) -> Result<JoinOutcome> {
        self.ensure_live()?;
        let newly_joined = self.participants.insert(user.to_string());
        self.declined.remove(user);
        let status_changed = self.status == CallStatus::Initiated && user != self.initiator;
        if status_changed {
            self.status = CallStatus::Ongoing;
        }
        Ok(JoinOutcome {
            newly_joined,
            status_changed,
        })
    }

    /// Explicit hang-up by the initiator or any participant.
    pub fn end(&mut self, user: &str, now: DateTime<Utc>) -> Result<()> {
        self.ensure_live()?;
        if user != self.initiator && !self.participants.contains(user) {
            return Err(ChatError::NotMember);
        }
        self.finish(CallStatus::Completed, now);
        Ok(())
    }

    /// A participant drops out. The call completes once at most one person is
    /// left in an ongoing call, or nobody is left at all.
    pub fn leave(&mut self, user: &str, now: DateTime<Utc>) -> Result<bool> {
        self.ensure_live()?;
        if !self.participants.remove(user) {
            return Err(ChatError::NotMember);
        }
        let drained = self.participants.is_empty()
            || (self.status == CallStatus::Ongoing && self.participants.len() <= 1);
        if drained {
            self.finish(CallStatus::Completed, now);
        }
        Ok(drained)
    }

    /// A contacted member turns the call down.
    ///
    /// `room_members` is the full membership of the call's room. Once no
    /// member is left undecided and at most one person is still in the call,
    /// the call ends: `completed` when the decliner was the only other member
    /// (a direct call), `declined` when a whole group said no. Declining after
    /// joining is treated as leaving. Returns whether the status changed.
    pub fn decline(&mut self, user: &str, room_members: &BTreeSet<String>, now: DateTime<Utc>) -> Result<bool> {
        self.ensure_live()?;
        if self.participants.contains(user) {
            return self.leave(user, now);
        }
        self.declined.insert(user.to_string());

        let undecided = room_members
            .iter()
            .filter(|m| **m != self.initiator)
            .filter(|m| !self.participants.contains(*m) && !self.declined.contains(*m))
            .count();
        if undecided > 0 || self.participants.len() > 1 {
            return Ok(false);
        }

        let non_initiators = room_members.iter().filter(|m| **m != self.initiator).count();
        if non_initiators <= 1 {
            self.finish(CallStatus::Completed, now);
        } else {
            self.finish(CallStatus::Declined, now);
        }
        Ok(true)
    }

    /// Ring timeout: an unanswered call becomes `missed`.
    pub fn miss(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != CallStatus::Initiated {
            return false;
        }
        self.finish(CallStatus::Missed, now);
        true
    }
}

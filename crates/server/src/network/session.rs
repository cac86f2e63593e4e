//! USB/IP session state machine
//!
//! One [`Session`] per TCP connection. It answers the operation stage
//! (device list, import), then correlates CMD_SUBMIT / CMD_UNLINK with the
//! completions reported by the attached device.
//!
//! ```text
//! Negotiating ──OP_REQ_IMPORT ok──> Attached ──error / peer close──> Closed
//!      │  ▲                                                           ▲
//!      └──┘ OP_REQ_DEVLIST, failed import                              │
//!      └──────────────────── unexpected message ───────────────────────┘
//! ```

use crate::device::{Attachment, DeviceProvider};
use common::errno;
use common::{CompletionSender, SessionId, UnlinkOutcome, UrbCompletion, UrbRequest};
use protocol::{
    CmdSubmit, CmdUnlink, Direction, Message, OP_STATUS_OK, RepDevlist, RepImport, RetSubmit,
    RetUnlink, XferHeader,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Completed seq_nums remembered for unlink resolution
const RECENT_COMPLETIONS: usize = 256;

/// Protocol stage of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Operation stage: device list and import requests
    Negotiating,
    /// Transfer stage: URB submit and unlink
    Attached,
    /// Terminal
    Closed,
}

/// Protocol violations; the connection is closed
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unexpected {message} during {stage} stage")]
    UnexpectedMessage {
        stage: &'static str,
        message: &'static str,
    },

    /// CMD_SUBMIT reusing the seq_num of a URB still in flight
    #[error("Duplicate in-flight seq_num {0}")]
    DuplicateSeqNum(u32),

    #[error("Session closed")]
    Closed,
}

/// A submission awaiting its RET_SUBMIT
#[derive(Debug, Clone)]
struct PendingUrb {
    device_id: u32,
    direction: Direction,
    endpoint: u32,
    expected_length: u32,
    submitted_at: Instant,
    /// CMD_UNLINK headers answered right after this URB's RET_SUBMIT
    unlinks: Vec<XferHeader>,
}

impl PendingUrb {
    fn header(&self, seq_num: u32) -> XferHeader {
        XferHeader::new(seq_num, self.device_id, self.direction, self.endpoint)
    }
}

/// Bounded memory of recently answered seq_nums
#[derive(Debug, Default)]
struct RecentCompletions {
    ring: VecDeque<u32>,
}

impl RecentCompletions {
    fn record(&mut self, seq_num: u32) {
        if self.ring.len() == RECENT_COMPLETIONS {
            self.ring.pop_front();
        }
        self.ring.push_back(seq_num);
    }

    fn contains(&self, seq_num: u32) -> bool {
        self.ring.contains(&seq_num)
    }
}

/// Per-connection protocol state
pub struct Session {
    id: SessionId,
    provider: Arc<DeviceProvider>,
    completions: CompletionSender,
    max_transfer_buffer: u32,
    state: SessionState,
    attachment: Option<Attachment>,
    pending: HashMap<u32, PendingUrb>,
    recent: RecentCompletions,
}

impl Session {
    /// New session in the Negotiating state
    ///
    /// Device completions are reported through `completions`, whose session
    /// id becomes this session's id.
    pub fn new(
        provider: Arc<DeviceProvider>,
        completions: CompletionSender,
        max_transfer_buffer: u32,
    ) -> Self {
        Self {
            id: completions.session(),
            provider,
            completions,
            max_transfer_buffer,
            state: SessionState::Negotiating,
            attachment: None,
            pending: HashMap::new(),
            recent: RecentCompletions::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Bus id of the imported device
    pub fn attached_bus_id(&self) -> Option<&str> {
        self.attachment.as_ref().map(Attachment::bus_id)
    }

    /// Number of submissions awaiting a RET_SUBMIT
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Handle one decoded message from the client
    ///
    /// Returns the immediate reply, if any. RET_SUBMITs for accepted
    /// submissions come later through [`Session::handle_completion`]. An
    /// error closes the session.
    pub fn handle_message(&mut self, message: Message) -> Result<Option<Message>, SessionError> {
        debug!("{}: received {}", self.id, message.name());

        let result = match (self.state, message) {
            (SessionState::Closed, _) => return Err(SessionError::Closed),
            (SessionState::Negotiating, Message::ReqDevlist(_)) => Ok(Some(self.devlist())),
            (SessionState::Negotiating, Message::ReqImport(req)) => Ok(Some(self.import(&req.bus_id))),
            (SessionState::Attached, Message::CmdSubmit(cmd)) => self.submit(cmd),
            (SessionState::Attached, Message::CmdUnlink(cmd)) => Ok(self.unlink(cmd)),
            (state, message) => Err(SessionError::UnexpectedMessage {
                stage: match state {
                    SessionState::Negotiating => "negotiation",
                    _ => "transfer",
                },
                message: message.name(),
            }),
        };

        if let Err(e) = &result {
            warn!("{}: {}", self.id, e);
            self.close();
        }
        result
    }

    fn devlist(&self) -> Message {
        let device = self.provider.exported();
        debug!(
            "{}: listing {}",
            self.id,
            device
                .as_ref()
                .map_or("no devices", |d| d.descriptor.bus_id.as_str())
        );
        Message::RepDevlist(RepDevlist {
            status: OP_STATUS_OK,
            device,
        })
    }

    fn import(&mut self, bus_id: &str) -> Message {
        match self.provider.attach(bus_id) {
            Ok(attachment) => {
                let descriptor = attachment.device().descriptor().clone();
                info!("{}: imported device {}", self.id, bus_id);
                self.attachment = Some(attachment);
                self.state = SessionState::Attached;
                Message::RepImport(RepImport::ok(descriptor))
            }
            Err(e) => {
                warn!("{}: import refused: {}", self.id, e);
                Message::RepImport(RepImport::error())
            }
        }
    }

    fn submit(&mut self, cmd: CmdSubmit) -> Result<Option<Message>, SessionError> {
        let seq_num = cmd.header.seq_num;
        if self.pending.contains_key(&seq_num) {
            return Err(SessionError::DuplicateSeqNum(seq_num));
        }

        if cmd.transfer_buffer_length > self.max_transfer_buffer {
            warn!(
                "{}: URB {} buffer of {} bytes exceeds {}",
                self.id, seq_num, cmd.transfer_buffer_length, self.max_transfer_buffer
            );
            self.recent.record(seq_num);
            return Ok(Some(Message::RetSubmit(RetSubmit::failed(
                cmd.header,
                errno::status(errno::EMSGSIZE),
            ))));
        }

        let Some(attachment) = self.attachment.as_ref() else {
            return Err(SessionError::Closed);
        };

        let header = cmd.header;
        let pending = PendingUrb {
            device_id: header.device_id,
            direction: header.direction,
            endpoint: header.endpoint,
            expected_length: cmd.transfer_buffer_length,
            submitted_at: Instant::now(),
            unlinks: Vec::new(),
        };
        trace!(
            "{}: CMD_SUBMIT {} ep={} dir={:?} len={}",
            self.id, seq_num, header.endpoint, header.direction, cmd.transfer_buffer_length
        );

        // registered first: the completion may be queued before submit_urb returns
        self.pending.insert(seq_num, pending);
        match attachment
            .device()
            .submit_urb(UrbRequest::from(cmd), self.completions.clone())
        {
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("{}: URB {} refused by device: {}", self.id, seq_num, e);
                self.pending.remove(&seq_num);
                self.recent.record(seq_num);
                Ok(Some(Message::RetSubmit(RetSubmit::failed(
                    header,
                    e.urb_status(),
                ))))
            }
        }
    }

    /// Resolve a CMD_UNLINK
    ///
    /// The RET_UNLINK for a URB whose completion is still on its way is
    /// deferred until that URB's RET_SUBMIT has been queued, so the client
    /// never sees the unlink answered before the submission.
    fn unlink(&mut self, cmd: CmdUnlink) -> Option<Message> {
        let target = cmd.unlink_seqnum;
        let outcome = match &self.attachment {
            Some(attachment) => attachment.device().unlink_urb(self.id, target),
            None => UnlinkOutcome::NotFound,
        };

        // running, or its completion is queued but not yet delivered
        if outcome != UnlinkOutcome::Cancelled
            && let Some(pending) = self.pending.get_mut(&target)
        {
            debug!(
                "{}: CMD_UNLINK {} waits for the RET_SUBMIT of URB {}",
                self.id, cmd.header.seq_num, target
            );
            pending.unlinks.push(cmd.header);
            return None;
        }

        let resolved = if outcome == UnlinkOutcome::Cancelled {
            self.pending.remove(&target);
            UnlinkOutcome::Cancelled
        } else if self.recent.contains(target) {
            UnlinkOutcome::AlreadyCompleted
        } else {
            UnlinkOutcome::NotFound
        };

        debug!(
            "{}: CMD_UNLINK {} for URB {}: {:?}",
            self.id, cmd.header.seq_num, target, resolved
        );
        Some(ret_unlink(cmd.header, resolved))
    }

    /// Turn a device completion into the matching RET_SUBMIT, followed by
    /// the RET_UNLINKs that waited for it
    ///
    /// Returns nothing for completions of cancelled or unknown URBs and for
    /// closed sessions.
    pub fn handle_completion(&mut self, completion: UrbCompletion) -> Vec<Message> {
        if self.is_closed() {
            debug!(
                "{}: discarding completion of URB {} after close",
                self.id, completion.seq_num
            );
            return Vec::new();
        }

        let seq_num = completion.seq_num;
        let Some(pending) = self.pending.remove(&seq_num) else {
            debug!("{}: no pending URB {}, completion dropped", self.id, seq_num);
            return Vec::new();
        };
        self.recent.record(seq_num);

        trace!(
            "{}: URB {} completed in {:?} with status {}",
            self.id,
            seq_num,
            pending.submitted_at.elapsed(),
            completion.status
        );

        let mut data = completion.data;
        if pending.direction == Direction::In {
            data.truncate(pending.expected_length as usize);
        }
        let mut ret = RetSubmit::completed(
            pending.header(seq_num),
            completion.status,
            completion.actual_length.min(pending.expected_length),
            data,
        );
        ret.start_frame = completion.start_frame;
        ret.error_count = completion.error_count;

        let mut replies = Vec::with_capacity(1 + pending.unlinks.len());
        replies.push(Message::RetSubmit(ret));
        replies.extend(
            pending
                .unlinks
                .into_iter()
                .map(|header| ret_unlink(header, UnlinkOutcome::AlreadyCompleted)),
        );
        replies
    }

    /// Unlink outstanding URBs and release the device
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }

        if let Some(attachment) = self.attachment.take() {
            for seq_num in self.pending.keys() {
                let outcome = attachment.device().unlink_urb(self.id, *seq_num);
                trace!("{}: unlink of URB {} on close: {:?}", self.id, seq_num, outcome);
            }
            info!(
                "{}: released device {} ({} URBs outstanding)",
                self.id,
                attachment.bus_id(),
                self.pending.len()
            );
        }
        self.pending.clear();
        self.state = SessionState::Closed;
    }
}

fn ret_unlink(header: XferHeader, outcome: UnlinkOutcome) -> Message {
    Message::RetUnlink(RetUnlink {
        header,
        status: outcome.ret_unlink_status(),
    })
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

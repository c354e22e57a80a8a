//! Per-partner communication endpoints.
//!
//! A [`Proxy`] is one half of the channel between two mesh bases. It owns
//! the send-token sequence towards its partner, the queue of messages not
//! yet handed to transport, the retained batch of sent-but-unacknowledged
//! messages for redelivery, and the duplicate filter on the receive side.
//! Transport itself lives outside this crate; callers drain outgoing
//! messages and feed incoming ones.

use std::{collections::VecDeque, str::FromStr, sync::Arc};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::{
    error::ProtocolViolation,
    keys::{MeshBaseIdentifier, Timestamps},
    message::XprisoMessage,
};

/// How hard this proxy works to keep its replicas current.
///
/// Interpreted by schedulers outside this crate; the proxy only records
/// and transports it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display,
)]
pub enum CoherenceSpecification {
    /// Replicate once, never refresh.
    #[display("one-time-only")]
    OneTimeOnly,
    /// Refresh opportunistically.
    #[display("best-effort")]
    BestEffort,
    /// Block reads until the replica is known current.
    #[display("must-be-current")]
    MustBeCurrent,
}

impl FromStr for CoherenceSpecification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one-time-only" => Ok(CoherenceSpecification::OneTimeOnly),
            "best-effort" => Ok(CoherenceSpecification::BestEffort),
            "must-be-current" => Ok(CoherenceSpecification::MustBeCurrent),
            other => Err(format!("unknown coherence specification: {other}")),
        }
    }
}

impl Default for CoherenceSpecification {
    fn default() -> Self {
        CoherenceSpecification::BestEffort
    }
}

#[derive(Debug)]
struct ProxyState {
    local: MeshBaseIdentifier,
    partner: MeshBaseIdentifier,
    coherence: CoherenceSpecification,
    timestamps: Timestamps,
    /// Token of the last message actually sent; 0 = nothing sent yet.
    last_sent_token: u64,
    /// Token of the last message accepted from the partner.
    last_received_token: u64,
    /// Composed but not yet handed to transport.
    pending: VecDeque<XprisoMessage>,
    /// Sent but not yet acknowledged by the partner, oldest first.
    last_sent: Vec<XprisoMessage>,
    /// Set when an incoming ripple conflicted with local structure; the
    /// affected replicas need resynchronization.
    drifted: bool,
}

/// Cheaply cloneable handle on the channel state towards one partner.
#[derive(Debug, Clone)]
pub struct Proxy(Arc<RwLock<ProxyState>>);

impl Proxy {
    pub fn new(
        local: MeshBaseIdentifier,
        partner: MeshBaseIdentifier,
        coherence: CoherenceSpecification,
    ) -> Self {
        Proxy(Arc::new(RwLock::new(ProxyState {
            local,
            partner,
            coherence,
            timestamps: Timestamps::now(),
            last_sent_token: 0,
            last_received_token: 0,
            pending: VecDeque::new(),
            last_sent: Vec::new(),
            drifted: false,
        })))
    }

    pub fn partner(&self) -> MeshBaseIdentifier {
        self.0.read().partner.clone()
    }

    pub fn coherence(&self) -> CoherenceSpecification {
        self.0.read().coherence
    }

    pub fn timestamps(&self) -> Timestamps {
        self.0.read().timestamps
    }

    /// Whether a structural conflict was observed on the ripple path since
    /// the last resynchronization.
    pub fn has_drifted(&self) -> bool {
        self.0.read().drifted
    }

    pub(crate) fn note_drift(&self) {
        self.0.write().drifted = true;
    }

    pub(crate) fn clear_drift(&self) {
        self.0.write().drifted = false;
    }

    /// Queues `message` for transmission to the partner.
    ///
    /// The endpoints must match this channel exactly; a mismatch is a bug
    /// in the caller, not something to repair silently.
    pub fn enqueue_for_send(&self, message: XprisoMessage) -> Result<(), ProtocolViolation> {
        let mut state = self.0.write();
        if message.sender != state.local {
            return Err(ProtocolViolation::SenderMismatch {
                expected: state.local.clone(),
                actual: message.sender,
            });
        }
        if message.receiver != state.partner {
            return Err(ProtocolViolation::ReceiverMismatch {
                expected: state.partner.clone(),
                actual: message.receiver,
            });
        }
        if state.pending.contains(&message) {
            trace!(partner = %state.partner, "suppressing duplicate outgoing message");
            return Ok(());
        }
        trace!(partner = %state.partner, "queueing outgoing message");
        state.pending.push_back(message);
        Ok(())
    }

    /// Drains the pending queue, stamping each message with the next send
    /// token and piggybacking the current acknowledgment. The returned
    /// batch is also retained for redelivery until acknowledged.
    pub fn mark_sent(&self) -> Vec<XprisoMessage> {
        let mut state = self.0.write();
        let ack = (state.last_received_token > 0).then_some(state.last_received_token);
        let mut out = Vec::with_capacity(state.pending.len());
        while let Some(mut msg) = state.pending.pop_front() {
            state.last_sent_token += 1;
            msg.token = Some(state.last_sent_token);
            msg.acknowledged_token = ack;
            state.last_sent.push(msg.clone());
            out.push(msg);
        }
        if !out.is_empty() {
            state.timestamps.updated = crate::keys::now_millis();
            debug!(
                partner = %state.partner,
                count = out.len(),
                up_to_token = state.last_sent_token,
                "sending messages"
            );
        }
        out
    }

    /// Copy of the retained unacknowledged batch, tokens intact, for
    /// redelivery after a suspected loss.
    pub fn resend_last(&self) -> Vec<XprisoMessage> {
        self.0.read().last_sent.clone()
    }

    /// Drops retained messages with token <= `token`.
    pub fn acknowledge(&self, token: u64) {
        let mut state = self.0.write();
        state
            .last_sent
            .retain(|m| m.token.map(|t| t > token).unwrap_or(true));
    }

    /// Accepts a batch of incoming messages.
    ///
    /// Returns the messages to process, in token order. Endpoint
    /// mismatches are logged and dropped; duplicates (token at or below
    /// the last accepted) are silently skipped; piggybacked
    /// acknowledgments prune the retained send batch.
    pub fn receive(&self, messages: Vec<XprisoMessage>) -> Vec<XprisoMessage> {
        let mut state = self.0.write();
        let mut accepted = Vec::new();
        for msg in messages {
            if msg.sender != state.partner {
                error!(
                    expected = %state.partner,
                    actual = %msg.sender,
                    "dropping message from wrong sender"
                );
                continue;
            }
            if msg.receiver != state.local {
                error!(
                    expected = %state.local,
                    actual = %msg.receiver,
                    "dropping message for wrong receiver"
                );
                continue;
            }
            let Some(token) = msg.token else {
                let cause = ProtocolViolation::MissingToken(msg.sender.clone());
                error!(partner = %state.partner, %cause, "dropping message");
                continue;
            };
            if let Err(cause) = msg.check() {
                error!(partner = %state.partner, %cause, "dropping inconsistent message");
                continue;
            }
            if let Some(ack) = msg.acknowledged_token {
                state
                    .last_sent
                    .retain(|m| m.token.map(|t| t > ack).unwrap_or(true));
            }
            if token <= state.last_received_token {
                warn!(
                    partner = %state.partner,
                    token,
                    last = state.last_received_token,
                    "skipping duplicate message"
                );
                continue;
            }
            state.last_received_token = token;
            accepted.push(msg);
        }
        if !accepted.is_empty() {
            state.timestamps.read = crate::keys::now_millis();
        }
        accepted
    }

    /// Snapshot of the durable channel state.
    pub fn to_externalized(&self) -> ExternalizedProxy {
        let state = self.0.read();
        ExternalizedProxy {
            local: state.local.clone(),
            partner: state.partner.clone(),
            coherence: state.coherence,
            timestamps: state.timestamps,
            last_sent_token: state.last_sent_token,
            last_received_token: state.last_received_token,
            pending: state.pending.iter().cloned().collect(),
            last_sent: state.last_sent.clone(),
        }
    }

    /// Restores a channel from its durable state, e.g. after a restart.
    pub fn from_externalized(ext: ExternalizedProxy) -> Self {
        Proxy(Arc::new(RwLock::new(ProxyState {
            local: ext.local,
            partner: ext.partner,
            coherence: ext.coherence,
            timestamps: ext.timestamps,
            last_sent_token: ext.last_sent_token,
            last_received_token: ext.last_received_token,
            pending: ext.pending.into(),
            last_sent: ext.last_sent,
            drifted: false,
        })))
    }
}

/// Serializable snapshot of a [`Proxy`].
///
/// Contains everything needed to resume the channel exactly where it was:
/// token counters, the unsent queue and the retained unacknowledged batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalizedProxy {
    pub local: MeshBaseIdentifier,
    pub partner: MeshBaseIdentifier,
    pub coherence: CoherenceSpecification,
    pub timestamps: Timestamps,
    pub last_sent_token: u64,
    pub last_received_token: u64,
    pub pending: Vec<XprisoMessage>,
    pub last_sent: Vec<XprisoMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> Proxy {
        Proxy::new("m1".into(), "m2".into(), CoherenceSpecification::default())
    }

    fn msg(sender: &str, receiver: &str) -> XprisoMessage {
        msg_for(sender, receiver, "obj")
    }

    fn msg_for(sender: &str, receiver: &str, object: &str) -> XprisoMessage {
        let mut m = XprisoMessage::new(sender.into(), receiver.into());
        m.requested_first_time.push(object.into());
        m
    }

    #[test]
    fn tokens_are_sequential() {
        let p = proxy();
        p.enqueue_for_send(msg_for("m1", "m2", "obj-1")).unwrap();
        p.enqueue_for_send(msg_for("m1", "m2", "obj-2")).unwrap();
        let sent = p.mark_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].token, Some(1));
        assert_eq!(sent[1].token, Some(2));
        // retained until acknowledged
        assert_eq!(p.resend_last().len(), 2);
        p.acknowledge(1);
        assert_eq!(p.resend_last().len(), 1);
        p.acknowledge(2);
        assert!(p.resend_last().is_empty());
    }

    #[test]
    fn duplicate_logical_message_suppressed() {
        let p = proxy();
        let m = msg("m1", "m2");
        p.enqueue_for_send(m.clone()).unwrap();
        p.enqueue_for_send(m).unwrap();
        assert_eq!(p.mark_sent().len(), 1);
    }

    #[test]
    fn endpoint_mismatch_rejected_on_send() {
        let p = proxy();
        let err = p.enqueue_for_send(msg("m3", "m2")).unwrap_err();
        assert!(matches!(err, ProtocolViolation::SenderMismatch { .. }));
        let err = p.enqueue_for_send(msg("m1", "m3")).unwrap_err();
        assert!(matches!(err, ProtocolViolation::ReceiverMismatch { .. }));
    }

    #[test]
    fn receive_filters_duplicates_and_strangers() {
        let p = proxy();

        let mut first = msg("m2", "m1");
        first.token = Some(1);
        let mut second = msg("m2", "m1");
        second.token = Some(2);
        let mut stranger = msg("m3", "m1");
        stranger.token = Some(9);

        let accepted = p.receive(vec![first.clone(), second.clone(), stranger]);
        assert_eq!(accepted.len(), 2);

        // redelivery of an already-processed token is dropped
        let accepted = p.receive(vec![second]);
        assert!(accepted.is_empty());

        // but a later token still gets through
        let mut third = msg("m2", "m1");
        third.token = Some(3);
        assert_eq!(p.receive(vec![third]).len(), 1);
    }

    #[test]
    fn piggybacked_ack_prunes_retained_batch() {
        let p = proxy();
        p.enqueue_for_send(msg("m1", "m2")).unwrap();
        p.mark_sent();
        assert_eq!(p.resend_last().len(), 1);

        let mut reply = msg("m2", "m1");
        reply.token = Some(1);
        reply.acknowledged_token = Some(1);
        p.receive(vec![reply]);
        assert!(p.resend_last().is_empty());
    }

    #[test]
    fn outgoing_acks_reflect_received_tokens() {
        let p = proxy();
        let mut incoming = msg("m2", "m1");
        incoming.token = Some(5);
        p.receive(vec![incoming]);

        p.enqueue_for_send(msg("m1", "m2")).unwrap();
        let sent = p.mark_sent();
        assert_eq!(sent[0].acknowledged_token, Some(5));
    }

    #[test]
    fn coherence_string_roundtrip() {
        for c in [
            CoherenceSpecification::OneTimeOnly,
            CoherenceSpecification::BestEffort,
            CoherenceSpecification::MustBeCurrent,
        ] {
            assert_eq!(c.to_string().parse::<CoherenceSpecification>().unwrap(), c);
        }
        assert!("sometimes".parse::<CoherenceSpecification>().is_err());
    }

    #[test]
    fn externalized_roundtrip_resumes_tokens() {
        let p = proxy();
        p.enqueue_for_send(msg("m1", "m2")).unwrap();
        p.mark_sent();
        p.enqueue_for_send(msg("m1", "m2")).unwrap();

        let ext = p.to_externalized();
        let restored = Proxy::from_externalized(ext.clone());
        assert_eq!(restored.to_externalized(), ext);

        // the restored proxy continues the token sequence
        let sent = restored.mark_sent();
        assert_eq!(sent[0].token, Some(2));
    }
}

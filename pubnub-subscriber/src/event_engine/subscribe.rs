//! Subscribe loop: handshake, long-poll receive, failure and recovery states.

use std::time::Duration;

use tracing::warn;

use crate::event_engine::{EffectFamily, EngineState, Machine, Transition};
use crate::protocol::Envelope;
use crate::retry::{ReceiveRecovery, RecoveryAction, RetryPolicy};
use crate::types::{Cursor, Error, Membership, Operation, Status, StatusCategory};

/// Why a handshake is being made; decides the status emitted on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeReason {
    Initial,
    Change,
    Recovery,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HandshakeContext {
    pub membership: Membership,
    /// Cursor to keep once the handshake succeeds.
    pub cursor: Option<Cursor>,
    pub attempts: u32,
    pub reason: HandshakeReason,
    /// Seeded by `Restore`/`Reconnect(cursor)`: a valid cursor skips the call.
    pub restored: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReceiveContext {
    pub membership: Membership,
    pub cursor: Cursor,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SubscribeState {
    Unsubscribed,
    Handshaking(HandshakeContext),
    HandshakeFailed {
        context: HandshakeContext,
        reason: Error,
        delay: Duration,
    },
    HandshakeStopped {
        context: HandshakeContext,
        reason: Option<Error>,
    },
    Receiving(ReceiveContext),
    ReceiveFailed {
        context: ReceiveContext,
        reason: Error,
        delay: Duration,
    },
    ReceiveStopped {
        context: ReceiveContext,
        reason: Option<Error>,
    },
}

impl EngineState for SubscribeState {
    fn name(&self) -> &'static str {
        match self {
            SubscribeState::Unsubscribed => "Unsubscribed",
            SubscribeState::Handshaking(_) => "Handshaking",
            SubscribeState::HandshakeFailed { .. } => "HandshakeFailed",
            SubscribeState::HandshakeStopped { .. } => "HandshakeStopped",
            SubscribeState::Receiving(_) => "Receiving",
            SubscribeState::ReceiveFailed { .. } => "ReceiveFailed",
            SubscribeState::ReceiveStopped { .. } => "ReceiveStopped",
        }
    }
}

impl SubscribeState {
    pub fn membership(&self) -> Option<&Membership> {
        match self {
            SubscribeState::Unsubscribed => None,
            SubscribeState::Handshaking(context)
            | SubscribeState::HandshakeFailed { context, .. }
            | SubscribeState::HandshakeStopped { context, .. } => Some(&context.membership),
            SubscribeState::Receiving(context)
            | SubscribeState::ReceiveFailed { context, .. }
            | SubscribeState::ReceiveStopped { context, .. } => Some(&context.membership),
        }
    }

    pub fn cursor(&self) -> Option<Cursor> {
        match self {
            SubscribeState::Unsubscribed => None,
            SubscribeState::Handshaking(context)
            | SubscribeState::HandshakeFailed { context, .. }
            | SubscribeState::HandshakeStopped { context, .. } => context.cursor,
            SubscribeState::Receiving(context)
            | SubscribeState::ReceiveFailed { context, .. }
            | SubscribeState::ReceiveStopped { context, .. } => Some(context.cursor),
        }
    }
}

#[derive(Debug)]
pub(crate) enum SubscribeEvent {
    SubscriptionChange { membership: Membership },
    Restore { membership: Membership, cursor: Cursor },
    HandshakeSuccess { cursor: Cursor },
    HandshakeFailure { error: Error },
    ReceiveSuccess { cursor: Cursor, messages: Vec<Envelope> },
    ReceiveFailure { error: Error },
    RetryTimerFired,
    Reconnect { cursor: Option<Cursor> },
    Disconnect,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SubscribeEffect {
    /// `cursor` is set only for a restored handshake that may skip the call.
    Handshake {
        membership: Membership,
        cursor: Option<Cursor>,
    },
    Receive {
        membership: Membership,
        cursor: Cursor,
    },
    Wait {
        delay: Duration,
    },
    EmitMessages {
        envelopes: Vec<Envelope>,
    },
    EmitStatus(Status),
    Leave {
        membership: Membership,
    },
    Cancel(EffectFamily),
}

type SubscribeTransition = Transition<SubscribeState, SubscribeEffect>;

#[derive(Debug, Clone)]
pub(crate) struct SubscribeMachine {
    pub retry: RetryPolicy,
    pub recovery: ReceiveRecovery,
    pub suppress_leave_events: bool,
    pub message_count_threshold: usize,
}

impl SubscribeMachine {
    fn leave(&self, membership: &Membership) -> Option<SubscribeEffect> {
        if self.suppress_leave_events {
            return None;
        }
        let membership = membership.without_presence();
        (!membership.is_empty()).then_some(SubscribeEffect::Leave { membership })
    }

    fn on_subscription_change(
        &self,
        state: &SubscribeState,
        membership: Membership,
    ) -> Option<SubscribeTransition> {
        let previous = state.membership();
        let mut effects = Vec::new();
        if let Some(previous) = previous {
            effects.extend(self.leave(&previous.difference(&membership)));
        }

        if membership.is_empty() {
            let previous = previous?;
            effects.push(SubscribeEffect::EmitStatus(
                Status::new(StatusCategory::Disconnected, Operation::Subscribe)
                    .with_membership(previous),
            ));
            return Some(Transition::with(SubscribeState::Unsubscribed, effects));
        }

        let reason = match state {
            SubscribeState::Unsubscribed => HandshakeReason::Initial,
            _ => HandshakeReason::Change,
        };
        let context = HandshakeContext {
            membership,
            cursor: state.cursor(),
            attempts: 0,
            reason,
            restored: false,
        };
        Some(Transition::with(SubscribeState::Handshaking(context), effects))
    }

    fn on_restore(
        &self,
        state: &SubscribeState,
        membership: Membership,
        cursor: Cursor,
    ) -> Option<SubscribeTransition> {
        let mut effects = Vec::new();
        if let Some(previous) = state.membership() {
            effects.extend(self.leave(&previous.difference(&membership)));
        }
        if membership.is_empty() {
            return None;
        }
        let reason = match state {
            SubscribeState::Unsubscribed => HandshakeReason::Initial,
            _ => HandshakeReason::Change,
        };
        let context = HandshakeContext {
            membership,
            cursor: Some(cursor),
            attempts: 0,
            reason,
            restored: cursor.is_valid(),
        };
        Some(Transition::with(SubscribeState::Handshaking(context), effects))
    }

    fn on_disconnect(&self, state: &SubscribeState) -> Option<SubscribeTransition> {
        let membership = state.membership()?;
        let mut effects: Vec<_> = self.leave(membership).into_iter().collect();
        let mut status = Status::new(StatusCategory::Disconnected, Operation::Subscribe)
            .with_membership(membership);
        if let Some(cursor) = state.cursor() {
            status = status.with_cursor(cursor);
        }
        effects.push(SubscribeEffect::EmitStatus(status));
        Some(Transition::with(SubscribeState::Unsubscribed, effects))
    }

    fn on_handshake_success(
        &self,
        context: &HandshakeContext,
        cursor: Cursor,
    ) -> SubscribeTransition {
        // Keep the stored timetoken (restore or change) with the fresh region.
        let cursor = match context.cursor {
            Some(previous) if previous.is_valid() => Cursor::new(previous.timetoken, cursor.region),
            _ => cursor,
        };
        let category = match context.reason {
            HandshakeReason::Initial => StatusCategory::Connected,
            HandshakeReason::Change => StatusCategory::SubscriptionChanged,
            HandshakeReason::Recovery => StatusCategory::Reconnected,
        };
        let status = Status::new(category, Operation::Subscribe)
            .with_membership(&context.membership)
            .with_cursor(cursor);
        Transition::with(
            SubscribeState::Receiving(ReceiveContext {
                membership: context.membership.clone(),
                cursor,
                attempts: 0,
            }),
            vec![SubscribeEffect::EmitStatus(status)],
        )
    }

    fn on_handshake_failure(&self, context: &HandshakeContext, error: Error) -> SubscribeTransition {
        let attempts = context.attempts + 1;
        let decision = self.retry.decide(Operation::Subscribe, attempts, &error);
        let context = HandshakeContext {
            attempts,
            ..context.clone()
        };
        if decision.retry {
            return Transition::to(SubscribeState::HandshakeFailed {
                context,
                reason: error,
                delay: decision.delay,
            });
        }

        let status = Status::failure(StatusCategory::ConnectionError, Operation::Subscribe, &error)
            .with_membership(&context.membership);
        Transition::with(
            SubscribeState::HandshakeStopped {
                context,
                reason: Some(error),
            },
            vec![SubscribeEffect::EmitStatus(status)],
        )
    }

    fn on_receive_success(
        &self,
        context: &ReceiveContext,
        cursor: Cursor,
        messages: Vec<Envelope>,
    ) -> SubscribeTransition {
        let cursor = if cursor.timetoken < context.cursor.timetoken {
            warn!(
                current = %context.cursor,
                received = %cursor,
                "ignoring regressing cursor"
            );
            context.cursor
        } else {
            cursor
        };

        let mut effects = Vec::new();
        if context.attempts > 0 {
            effects.push(SubscribeEffect::EmitStatus(
                Status::new(StatusCategory::Reconnected, Operation::Subscribe)
                    .with_membership(&context.membership)
                    .with_cursor(cursor),
            ));
        }
        if self.message_count_threshold > 0 && messages.len() >= self.message_count_threshold {
            effects.push(SubscribeEffect::EmitStatus(
                Status::new(StatusCategory::RequestMessageCountExceeded, Operation::Subscribe)
                    .with_membership(&context.membership)
                    .with_cursor(cursor),
            ));
        }
        if !messages.is_empty() {
            effects.push(SubscribeEffect::EmitMessages {
                envelopes: messages,
            });
        }

        Transition::with(
            SubscribeState::Receiving(ReceiveContext {
                membership: context.membership.clone(),
                cursor,
                attempts: 0,
            }),
            effects,
        )
    }

    fn on_receive_failure(&self, context: &ReceiveContext, error: Error) -> SubscribeTransition {
        let attempts = context.attempts + 1;
        let decision = self.retry.decide(Operation::Subscribe, attempts, &error);
        if decision.retry {
            return Transition::to(SubscribeState::ReceiveFailed {
                context: ReceiveContext {
                    attempts,
                    ..context.clone()
                },
                reason: error,
                delay: decision.delay,
            });
        }

        let status = Status::failure(
            StatusCategory::DisconnectedUnexpectedly,
            Operation::Subscribe,
            &error,
        )
        .with_membership(&context.membership)
        .with_cursor(context.cursor);

        match self.recovery.action_for(&error) {
            RecoveryAction::Rehandshake => Transition::with(
                SubscribeState::Handshaking(HandshakeContext {
                    membership: context.membership.clone(),
                    cursor: Some(context.cursor),
                    attempts: 0,
                    reason: HandshakeReason::Recovery,
                    restored: false,
                }),
                vec![SubscribeEffect::EmitStatus(status)],
            ),
            RecoveryAction::Stop => Transition::with(
                SubscribeState::ReceiveStopped {
                    context: ReceiveContext {
                        attempts: 0,
                        ..context.clone()
                    },
                    reason: Some(error),
                },
                vec![SubscribeEffect::EmitStatus(status)],
            ),
        }
    }

    fn on_reconnect(&self, state: &SubscribeState, cursor: Option<Cursor>) -> Option<SubscribeTransition> {
        let (membership, previous) = match state {
            SubscribeState::HandshakeFailed { context, .. }
            | SubscribeState::HandshakeStopped { context, .. } => {
                (context.membership.clone(), context.cursor)
            }
            SubscribeState::ReceiveFailed { context, .. }
            | SubscribeState::ReceiveStopped { context, .. } => {
                (context.membership.clone(), Some(context.cursor))
            }
            _ => return None,
        };
        let context = HandshakeContext {
            membership,
            cursor: cursor.or(previous),
            attempts: 0,
            reason: HandshakeReason::Recovery,
            restored: cursor.is_some_and(|c| c.is_valid()),
        };
        Some(Transition::to(SubscribeState::Handshaking(context)))
    }
}

impl Machine for SubscribeMachine {
    type State = SubscribeState;
    type Event = SubscribeEvent;
    type Effect = SubscribeEffect;

    fn transition(&self, state: &SubscribeState, event: SubscribeEvent) -> Option<SubscribeTransition> {
        use SubscribeEvent as E;
        use SubscribeState as S;

        match (state, event) {
            (_, E::SubscriptionChange { membership }) => {
                self.on_subscription_change(state, membership)
            }
            (_, E::Restore { membership, cursor }) => self.on_restore(state, membership, cursor),
            (_, E::Disconnect) => self.on_disconnect(state),
            (_, E::Reconnect { cursor }) => self.on_reconnect(state, cursor),

            (S::Handshaking(context), E::HandshakeSuccess { cursor }) => {
                Some(self.on_handshake_success(context, cursor))
            }
            (S::Handshaking(context), E::HandshakeFailure { error }) => {
                Some(self.on_handshake_failure(context, error))
            }
            (S::HandshakeFailed { context, .. }, E::RetryTimerFired) => {
                Some(Transition::to(S::Handshaking(context.clone())))
            }

            (S::Receiving(context), E::ReceiveSuccess { cursor, messages }) => {
                Some(self.on_receive_success(context, cursor, messages))
            }
            (S::Receiving(context), E::ReceiveFailure { error }) => {
                Some(self.on_receive_failure(context, error))
            }
            (S::ReceiveFailed { context, .. }, E::RetryTimerFired) => {
                Some(Transition::to(S::Receiving(context.clone())))
            }

            _ => None,
        }
    }

    fn enter(&self, state: &SubscribeState) -> Vec<SubscribeEffect> {
        match state {
            SubscribeState::Handshaking(context) => vec![SubscribeEffect::Handshake {
                membership: context.membership.clone(),
                cursor: context.cursor.filter(|_| context.restored),
            }],
            SubscribeState::Receiving(context) => vec![SubscribeEffect::Receive {
                membership: context.membership.clone(),
                cursor: context.cursor,
            }],
            SubscribeState::HandshakeFailed { delay, .. }
            | SubscribeState::ReceiveFailed { delay, .. } => {
                vec![SubscribeEffect::Wait { delay: *delay }]
            }
            _ => Vec::new(),
        }
    }

    fn exit(&self, state: &SubscribeState) -> Vec<SubscribeEffect> {
        match state {
            SubscribeState::Handshaking(_) | SubscribeState::Receiving(_) => {
                vec![SubscribeEffect::Cancel(EffectFamily::Subscribe)]
            }
            SubscribeState::HandshakeFailed { .. } | SubscribeState::ReceiveFailed { .. } => {
                vec![SubscribeEffect::Cancel(EffectFamily::SubscribeTimer)]
            }
            _ => Vec::new(),
        }
    }
}

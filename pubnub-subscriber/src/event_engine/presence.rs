//! Heartbeat loop. Mirrors subscribe membership through Joined/Left/LeftAll.

use std::time::Duration;

use crate::event_engine::{EffectFamily, EngineState, Machine, Transition};
use crate::retry::RetryPolicy;
use crate::types::{Error, Membership, Operation, Status, StatusCategory};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HeartbeatState {
    HeartbeatInactive,
    Heartbeating {
        membership: Membership,
        attempts: u32,
    },
    HeartbeatCooldown {
        membership: Membership,
    },
    HeartbeatFailed {
        membership: Membership,
        attempts: u32,
        reason: Error,
        /// `None` when the failure is not retried.
        retry_in: Option<Duration>,
    },
    HeartbeatStopped {
        membership: Membership,
    },
}

impl EngineState for HeartbeatState {
    fn name(&self) -> &'static str {
        match self {
            HeartbeatState::HeartbeatInactive => "HeartbeatInactive",
            HeartbeatState::Heartbeating { .. } => "Heartbeating",
            HeartbeatState::HeartbeatCooldown { .. } => "HeartbeatCooldown",
            HeartbeatState::HeartbeatFailed { .. } => "HeartbeatFailed",
            HeartbeatState::HeartbeatStopped { .. } => "HeartbeatStopped",
        }
    }
}

impl HeartbeatState {
    pub fn membership(&self) -> Option<&Membership> {
        match self {
            HeartbeatState::HeartbeatInactive => None,
            HeartbeatState::Heartbeating { membership, .. }
            | HeartbeatState::HeartbeatCooldown { membership }
            | HeartbeatState::HeartbeatFailed { membership, .. }
            | HeartbeatState::HeartbeatStopped { membership } => Some(membership),
        }
    }
}

#[derive(Debug)]
pub(crate) enum HeartbeatEvent {
    Joined { membership: Membership },
    Left { membership: Membership },
    LeftAll,
    HeartbeatSuccess,
    HeartbeatFailure { error: Error },
    TimerFired,
    Reconnect,
    Disconnect,
}

#[derive(Debug, PartialEq)]
pub(crate) enum HeartbeatEffect {
    Heartbeat { membership: Membership },
    Wait { delay: Duration },
    EmitStatus(Status),
    Cancel(EffectFamily),
}

type HeartbeatTransition = Transition<HeartbeatState, HeartbeatEffect>;

#[derive(Debug, Clone)]
pub(crate) struct HeartbeatMachine {
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub announce_success: bool,
    pub announce_failure: bool,
}

fn heartbeating(membership: Membership) -> HeartbeatState {
    if membership.is_empty() {
        HeartbeatState::HeartbeatInactive
    } else {
        HeartbeatState::Heartbeating {
            membership,
            attempts: 0,
        }
    }
}

impl HeartbeatMachine {
    fn on_joined(&self, state: &HeartbeatState, joined: Membership) -> Option<HeartbeatTransition> {
        match state {
            HeartbeatState::HeartbeatStopped { membership } => {
                Some(Transition::to(HeartbeatState::HeartbeatStopped {
                    membership: membership.union(&joined),
                }))
            }
            _ => {
                let current = state.membership().cloned().unwrap_or_default();
                let next = current.union(&joined);
                if next.is_empty() {
                    return None;
                }
                Some(Transition::to(heartbeating(next)))
            }
        }
    }

    fn on_left(&self, state: &HeartbeatState, left: Membership) -> Option<HeartbeatTransition> {
        let current = state.membership()?;
        let next = current.difference(&left);
        match state {
            HeartbeatState::HeartbeatStopped { .. } if !next.is_empty() => {
                Some(Transition::to(HeartbeatState::HeartbeatStopped { membership: next }))
            }
            _ => Some(Transition::to(heartbeating(next))),
        }
    }

    fn on_failure(&self, membership: &Membership, attempts: u32, error: Error) -> HeartbeatTransition {
        let attempts = attempts + 1;
        let decision = self.retry.decide(Operation::Heartbeat, attempts, &error);
        let mut effects = Vec::new();
        if self.announce_failure {
            effects.push(HeartbeatEffect::EmitStatus(
                Status::failure(error.category(), Operation::Heartbeat, &error)
                    .with_membership(membership),
            ));
        }
        Transition::with(
            HeartbeatState::HeartbeatFailed {
                membership: membership.clone(),
                attempts,
                reason: error,
                retry_in: decision.retry.then_some(decision.delay),
            },
            effects,
        )
    }
}

impl Machine for HeartbeatMachine {
    type State = HeartbeatState;
    type Event = HeartbeatEvent;
    type Effect = HeartbeatEffect;

    fn transition(&self, state: &HeartbeatState, event: HeartbeatEvent) -> Option<HeartbeatTransition> {
        use HeartbeatEvent as E;
        use HeartbeatState as S;

        match (state, event) {
            (_, E::Joined { membership }) => self.on_joined(state, membership),
            (_, E::Left { membership }) => self.on_left(state, membership),
            (S::HeartbeatInactive, E::LeftAll) => None,
            (_, E::LeftAll) => Some(Transition::to(S::HeartbeatInactive)),

            (S::Heartbeating { membership, .. }, E::HeartbeatSuccess) => {
                let mut effects = Vec::new();
                if self.announce_success {
                    effects.push(HeartbeatEffect::EmitStatus(
                        Status::new(StatusCategory::Acknowledgment, Operation::Heartbeat)
                            .with_membership(membership),
                    ));
                }
                Some(Transition::with(
                    S::HeartbeatCooldown {
                        membership: membership.clone(),
                    },
                    effects,
                ))
            }
            (S::Heartbeating { membership, attempts }, E::HeartbeatFailure { error }) => {
                Some(self.on_failure(membership, *attempts, error))
            }

            (S::HeartbeatCooldown { membership }, E::TimerFired) => {
                Some(Transition::to(heartbeating(membership.clone())))
            }
            (
                S::HeartbeatFailed {
                    membership,
                    attempts,
                    retry_in: Some(_),
                    ..
                },
                E::TimerFired,
            ) => Some(Transition::to(S::Heartbeating {
                membership: membership.clone(),
                attempts: *attempts,
            })),

            (S::HeartbeatFailed { membership, .. } | S::HeartbeatStopped { membership }, E::Reconnect) => {
                Some(Transition::to(heartbeating(membership.clone())))
            }

            (
                S::Heartbeating { membership, .. }
                | S::HeartbeatCooldown { membership }
                | S::HeartbeatFailed { membership, .. },
                E::Disconnect,
            ) => Some(Transition::to(S::HeartbeatStopped {
                membership: membership.clone(),
            })),

            _ => None,
        }
    }

    fn enter(&self, state: &HeartbeatState) -> Vec<HeartbeatEffect> {
        match state {
            HeartbeatState::Heartbeating { membership, .. } => vec![HeartbeatEffect::Heartbeat {
                membership: membership.clone(),
            }],
            HeartbeatState::HeartbeatCooldown { .. } => vec![HeartbeatEffect::Wait {
                delay: self.interval,
            }],
            HeartbeatState::HeartbeatFailed {
                retry_in: Some(delay),
                ..
            } => vec![HeartbeatEffect::Wait { delay: *delay }],
            _ => Vec::new(),
        }
    }

    fn exit(&self, state: &HeartbeatState) -> Vec<HeartbeatEffect> {
        match state {
            HeartbeatState::Heartbeating { .. } => vec![HeartbeatEffect::Cancel(EffectFamily::Heartbeat)],
            HeartbeatState::HeartbeatCooldown { .. } | HeartbeatState::HeartbeatFailed { .. } => {
                vec![HeartbeatEffect::Cancel(EffectFamily::HeartbeatTimer)]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_engine::EventEngine;
    use crate::retry::RetryConfiguration;

    fn engine(retry: RetryConfiguration) -> EventEngine<HeartbeatMachine> {
        EventEngine::new(
            "heartbeat",
            HeartbeatMachine {
                interval: Duration::from_secs(149),
                retry: RetryPolicy::new(retry),
                announce_success: false,
                announce_failure: true,
            },
            HeartbeatState::HeartbeatInactive,
        )
    }

    fn names(channels: &[&str]) -> Membership {
        Membership::new(channels.iter().copied(), Vec::<String>::new())
    }

    fn bad_request() -> Error {
        Error::Service {
            status: 400,
            message: "Bad Request".into(),
        }
    }

    #[test]
    fn joined_starts_heartbeating() {
        let mut engine = engine(RetryConfiguration::none());
        let effects = engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch1", "ch2"]),
        });
        assert_eq!(
            effects,
            vec![HeartbeatEffect::Heartbeat {
                membership: names(&["ch1", "ch2"])
            }]
        );
    }

    #[test]
    fn success_cools_down_then_beats_again() {
        let mut engine = engine(RetryConfiguration::none());
        engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch1"]),
        });
        let effects = engine.process(HeartbeatEvent::HeartbeatSuccess);
        assert_eq!(
            effects,
            vec![
                HeartbeatEffect::Cancel(EffectFamily::Heartbeat),
                HeartbeatEffect::Wait {
                    delay: Duration::from_secs(149)
                },
            ]
        );
        let effects = engine.process(HeartbeatEvent::TimerFired);
        assert_eq!(
            effects.last(),
            Some(&HeartbeatEffect::Heartbeat {
                membership: names(&["ch1"])
            })
        );
    }

    #[test]
    fn bad_request_fails_without_retry() {
        let mut engine = engine(RetryConfiguration::default());
        engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch1", "ch2"]),
        });
        let effects = engine.process(HeartbeatEvent::HeartbeatFailure {
            error: bad_request(),
        });

        let statuses: Vec<&Status> = effects
            .iter()
            .filter_map(|e| match e {
                HeartbeatEffect::EmitStatus(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 1);
        let status = statuses.first().unwrap();
        assert_eq!(status.category, StatusCategory::BadRequest);
        assert_eq!(status.operation, Operation::Heartbeat);
        assert_eq!(status.status_code, Some(400));
        assert!(status.error);

        assert!(!effects
            .iter()
            .any(|e| matches!(e, HeartbeatEffect::Wait { .. })));
        assert_eq!(engine.state().name(), "HeartbeatFailed");
        assert!(engine.process(HeartbeatEvent::TimerFired).is_empty());
    }

    #[test]
    fn retryable_failure_waits_then_beats() {
        let mut engine = engine(RetryConfiguration::linear(Duration::from_secs(2), 2));
        engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch1"]),
        });
        let effects = engine.process(HeartbeatEvent::HeartbeatFailure {
            error: Error::Timeout,
        });
        assert!(effects.contains(&HeartbeatEffect::Wait {
            delay: Duration::from_secs(2)
        }));
        engine.process(HeartbeatEvent::TimerFired);
        assert_eq!(engine.state().name(), "Heartbeating");
    }

    #[test]
    fn failure_status_suppressed_when_not_announced() {
        let mut engine = EventEngine::new(
            "heartbeat",
            HeartbeatMachine {
                interval: Duration::from_secs(10),
                retry: RetryPolicy::new(RetryConfiguration::none()),
                announce_success: true,
                announce_failure: false,
            },
            HeartbeatState::HeartbeatInactive,
        );
        engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch1"]),
        });
        let effects = engine.process(HeartbeatEvent::HeartbeatSuccess);
        assert!(effects
            .iter()
            .any(|e| matches!(e, HeartbeatEffect::EmitStatus(s) if s.category == StatusCategory::Acknowledgment)));
        engine.process(HeartbeatEvent::TimerFired);
        let effects = engine.process(HeartbeatEvent::HeartbeatFailure {
            error: Error::Timeout,
        });
        assert!(!effects
            .iter()
            .any(|e| matches!(e, HeartbeatEffect::EmitStatus(_))));
    }

    #[test]
    fn left_shrinks_and_left_all_deactivates() {
        let mut engine = engine(RetryConfiguration::none());
        engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch1", "ch2"]),
        });
        engine.process(HeartbeatEvent::HeartbeatSuccess);
        let effects = engine.process(HeartbeatEvent::Left {
            membership: names(&["ch2"]),
        });
        assert_eq!(
            effects.last(),
            Some(&HeartbeatEffect::Heartbeat {
                membership: names(&["ch1"])
            })
        );

        let effects = engine.process(HeartbeatEvent::LeftAll);
        assert_eq!(effects, vec![HeartbeatEffect::Cancel(EffectFamily::Heartbeat)]);
        assert_eq!(engine.state(), &HeartbeatState::HeartbeatInactive);
    }

    #[test]
    fn leaving_every_name_deactivates() {
        let mut engine = engine(RetryConfiguration::none());
        engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch1"]),
        });
        engine.process(HeartbeatEvent::Left {
            membership: names(&["ch1"]),
        });
        assert_eq!(engine.state(), &HeartbeatState::HeartbeatInactive);
    }

    #[test]
    fn disconnect_stops_and_reconnect_resumes() {
        let mut engine = engine(RetryConfiguration::none());
        engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch1"]),
        });
        engine.process(HeartbeatEvent::Disconnect);
        assert_eq!(engine.state().name(), "HeartbeatStopped");

        engine.process(HeartbeatEvent::Joined {
            membership: names(&["ch2"]),
        });
        assert_eq!(
            engine.state(),
            &HeartbeatState::HeartbeatStopped {
                membership: names(&["ch1", "ch2"])
            }
        );

        let effects = engine.process(HeartbeatEvent::Reconnect);
        assert_eq!(
            effects,
            vec![HeartbeatEffect::Heartbeat {
                membership: names(&["ch1", "ch2"])
            }]
        );
    }

    #[test]
    fn inactive_ignores_network_events() {
        let mut engine = engine(RetryConfiguration::none());
        assert!(engine.process(HeartbeatEvent::HeartbeatSuccess).is_empty());
        assert!(engine.process(HeartbeatEvent::TimerFired).is_empty());
        assert!(engine.process(HeartbeatEvent::Reconnect).is_empty());
        assert!(engine.process(HeartbeatEvent::LeftAll).is_empty());
        assert!(engine
            .process(HeartbeatEvent::Left {
                membership: names(&["ch1"])
            })
            .is_empty());
    }
}

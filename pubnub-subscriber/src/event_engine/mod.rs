//! Generic event engine: a pure state machine plus the effects it requests.
//!
//! A [`Machine`] maps `(state, event)` to an optional [`Transition`]. The
//! [`EventEngine`] applies it and returns the effects in order: exit effects
//! of the old state, the transition's own effects, then enter effects of the
//! new state. Events with no transition leave the state untouched and
//! produce nothing.

pub(crate) mod presence;
pub(crate) mod subscribe;

use std::fmt;

use tracing::{debug, trace};

/// Effect families whose in-flight work is tracked (and cancelled) as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum EffectFamily {
    Subscribe,
    SubscribeTimer,
    Heartbeat,
    HeartbeatTimer,
}

pub(crate) trait EngineState: Clone + fmt::Debug {
    fn name(&self) -> &'static str;
}

pub(crate) struct Transition<S, E> {
    pub state: S,
    pub effects: Vec<E>,
}

impl<S, E> Transition<S, E> {
    pub fn to(state: S) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    pub fn with(state: S, effects: Vec<E>) -> Self {
        Self { state, effects }
    }
}

pub(crate) trait Machine {
    type State: EngineState;
    type Event: fmt::Debug;
    type Effect: fmt::Debug;

    fn transition(
        &self,
        state: &Self::State,
        event: Self::Event,
    ) -> Option<Transition<Self::State, Self::Effect>>;

    fn enter(&self, state: &Self::State) -> Vec<Self::Effect>;

    fn exit(&self, state: &Self::State) -> Vec<Self::Effect>;
}

pub(crate) struct EventEngine<M: Machine> {
    machine: M,
    state: M::State,
    label: &'static str,
}

impl<M: Machine> EventEngine<M> {
    pub fn new(label: &'static str, machine: M, initial: M::State) -> Self {
        Self {
            machine,
            state: initial,
            label,
        }
    }

    pub fn state(&self) -> &M::State {
        &self.state
    }

    pub fn process(&mut self, event: M::Event) -> Vec<M::Effect> {
        trace!(engine = self.label, state = self.state.name(), ?event, "processing event");
        let Some(transition) = self.machine.transition(&self.state, event) else {
            debug!(
                engine = self.label,
                state = self.state.name(),
                "event ignored in current state"
            );
            return Vec::new();
        };

        let mut effects = self.machine.exit(&self.state);
        effects.extend(transition.effects);
        effects.extend(self.machine.enter(&transition.state));

        debug!(
            engine = self.label,
            from = self.state.name(),
            to = transition.state.name(),
            effects = effects.len(),
            "transition"
        );
        self.state = transition.state;
        effects
    }
}

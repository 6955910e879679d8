use std::{collections::HashMap, fmt::Debug, hash::Hash};

use log::{debug, info, trace, warn};

/// A finite, enumerable set of actions.
pub trait ActionSpace: Copy + Eq + Hash + Debug + 'static {
    /// Every action of the space, in a fixed order.
    const ALL: &'static [Self];
}

/// The environment-supplied consequences of acting, as seen by the agent.
///
/// The agent never owns an environment directly; it only asks its dynamics
/// which actions are possible, where an action leads and what a state is worth.
pub trait Dynamics<S, A> {
    /// Legal actions from `state`, in the order used for tie-breaking.
    fn possible_actions(&self, state: &S) -> Vec<A>;

    /// The state reached by taking `action` from `state`.
    ///
    /// Only ever called with an action returned by [`Dynamics::possible_actions`] for `state`.
    fn next_state(&self, state: &S, action: A) -> S;

    /// Reward for reaching `state`.
    fn reward(&self, state: &S) -> f64;
}

/// [`Dynamics`] assembled from three closures.
#[derive(Clone)]
pub struct FnDynamics<P, N, R> {
    possible_actions: P,
    next_state: N,
    reward: R,
}

impl<P, N, R> FnDynamics<P, N, R> {
    pub fn new(possible_actions: P, next_state: N, reward: R) -> Self {
        Self {
            possible_actions,
            next_state,
            reward,
        }
    }
}

impl<S, A, P, N, R> Dynamics<S, A> for FnDynamics<P, N, R>
where
    P: Fn(&S) -> Vec<A>,
    N: Fn(&S, A) -> S,
    R: Fn(&S) -> f64,
{
    fn possible_actions(&self, state: &S) -> Vec<A> {
        (self.possible_actions)(state)
    }

    fn next_state(&self, state: &S, action: A) -> S {
        (self.next_state)(state, action)
    }

    fn reward(&self, state: &S) -> f64 {
        (self.reward)(state)
    }
}

/// Scores a candidate action from its Q-value and visit frequency.
///
/// The recommended action is the one with the highest score.
pub trait Exploration {
    fn score(&self, q_value: f64, frequency: u32) -> f64;
}

impl<F> Exploration for F
where
    F: Fn(f64, u32) -> f64,
{
    fn score(&self, q_value: f64, frequency: u32) -> f64 {
        self(q_value, frequency)
    }
}

/// Scales the Q-value by how often the pair was taken; unvisited pairs score their raw Q-value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrequencyWeighted;

impl Exploration for FrequencyWeighted {
    fn score(&self, q_value: f64, frequency: u32) -> f64 {
        if frequency > 0 {
            q_value * frequency as f64
        } else {
            q_value
        }
    }
}

/// Pure exploitation: the score is the Q-value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greedy;

impl Exploration for Greedy {
    fn score(&self, q_value: f64, _frequency: u32) -> f64 {
        q_value
    }
}

/// Optimism in the face of uncertainty.
///
/// Pairs tried fewer than `visits` times score `reward`, the rest score their Q-value.
#[derive(Debug, Clone, Copy)]
pub struct Optimistic {
    pub reward: f64,
    pub visits: u32,
}

impl Exploration for Optimistic {
    fn score(&self, q_value: f64, frequency: u32) -> f64 {
        if frequency < self.visits {
            self.reward
        } else {
            q_value
        }
    }
}

/// Configuration for the [`QLearningAgent`]
///
/// Both rates are expected in `[0, 1]` and finite. This is not checked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentConfig {
    /// Learning rate (alpha).
    pub learning_rate: f64,
    /// Discount factor (gamma).
    pub discount_factor: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.2,
            discount_factor: 0.8,
        }
    }
}

/// Composite table key for a state-action pair.
///
/// Hashes the state's hash together with the action tag; equality on both parts
/// keeps hash-equal pairs apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateAction<S, A> {
    pub state: S,
    pub action: A,
}

impl<S, A> StateAction<S, A> {
    pub fn new(state: S, action: A) -> Self {
        Self { state, action }
    }
}

/// The step that led into the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S, A> {
    pub previous_state: S,
    /// The action that caused `previous_state -> current_state`.
    pub previous_action: A,
    /// The reward collected for `previous_state`.
    pub previous_reward: f64,
}

/// Full snapshot of the agent's learning state.
///
/// A context is never edited in place once published; every step builds a new one.
#[derive(Debug, Clone)]
pub struct LearningContext<S, A> {
    /// Steps taken in the current episode.
    pub step: u64,
    pub current_state: S,
    pub current_reward: f64,
    pub possible_actions: Vec<A>,
    /// `None` only when there are no possible actions.
    pub recommended_action: Option<A>,
    /// Present once at least one action has been taken this episode.
    pub previous: Option<Transition<S, A>>,
    pub q_values: HashMap<StateAction<S, A>, f64>,
    pub frequencies: HashMap<StateAction<S, A>, u32>,
}

impl<S, A> LearningContext<S, A>
where
    S: Clone + Eq + Hash,
    A: Copy + Eq + Hash,
{
    /// Learned utility of the pair, 0 if never updated.
    pub fn q_value(&self, state: &S, action: A) -> f64 {
        self.q_values
            .get(&StateAction::new(state.clone(), action))
            .copied()
            .unwrap_or(0.0)
    }

    /// Times the pair was taken, 0 if never.
    pub fn frequency(&self, state: &S, action: A) -> u32 {
        self.frequencies
            .get(&StateAction::new(state.clone(), action))
            .copied()
            .unwrap_or(0)
    }
}

impl<S, A> PartialEq for LearningContext<S, A>
where
    S: Eq + Hash,
    A: Eq + Hash,
{
    fn eq(&self, other: &Self) -> bool {
        self.step == other.step
            && self.current_state == other.current_state
            && self.current_reward == other.current_reward
            && self.possible_actions == other.possible_actions
            && self.recommended_action == other.recommended_action
            && self.previous == other.previous
            && self.q_values == other.q_values
            && self.frequencies == other.frequencies
    }
}

/// Per-action diagnostics for one state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionStats<A> {
    pub action: A,
    pub available: bool,
    pub recommended: bool,
    pub q_value: f64,
    pub frequency: u32,
    pub exploration: f64,
}

/// Outcome of [`QLearningAgent::run_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The predicate holds on the current state.
    Reached { steps: usize },
    /// The step budget ran out first.
    StepLimit { steps: usize },
    /// No action is available from the current state.
    Stuck { steps: usize },
}

/// A tabular Q-learning agent.
///
/// ### Generics
/// - `S` - The state type, used as part of the table keys, so it must be `Clone`, `Eq` and `Hash`
/// - `A` - The action type, a finite [`ActionSpace`]
/// - `D` - The [`Dynamics`] the agent learns over
/// - `X` - The [`Exploration`] function ranking candidate actions
///
/// The policy is deterministic: the recommended action maximises the exploration
/// score, and ties go to the action listed first by the dynamics.
///
/// The Q update scales its step by the post-increment visit count:
/// `Q += alpha * N * (r + gamma * max Q' - Q)`.
pub struct QLearningAgent<S, A, D, X> {
    config: AgentConfig,
    initial_state: S,
    dynamics: D,
    exploration: X,
    context: LearningContext<S, A>,
}

impl<S, A, D, X> QLearningAgent<S, A, D, X>
where
    S: Clone + Eq + Hash + Debug,
    A: ActionSpace,
    D: Dynamics<S, A>,
    X: Exploration,
{
    pub fn new(config: AgentConfig, initial_state: S, dynamics: D, exploration: X) -> Self {
        let context = LearningContext {
            step: 0,
            current_reward: dynamics.reward(&initial_state),
            possible_actions: dynamics.possible_actions(&initial_state),
            current_state: initial_state.clone(),
            recommended_action: None,
            previous: None,
            q_values: HashMap::new(),
            frequencies: HashMap::new(),
        };
        let mut agent = Self {
            config,
            initial_state,
            dynamics,
            exploration,
            context,
        };
        agent.context.recommended_action = agent.recommend(&agent.context);
        agent
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn initial_state(&self) -> &S {
        &self.initial_state
    }

    pub fn dynamics(&self) -> &D {
        &self.dynamics
    }

    pub fn exploration(&self) -> &X {
        &self.exploration
    }

    pub fn context(&self) -> &LearningContext<S, A> {
        &self.context
    }

    pub fn current_state(&self) -> &S {
        &self.context.current_state
    }

    pub fn possible_actions(&self) -> &[A] {
        &self.context.possible_actions
    }

    pub fn recommended_action(&self) -> Option<A> {
        self.context.recommended_action
    }

    /// Replaces the dynamics, e.g. after the environment changed.
    ///
    /// Learned tables and the current context are kept; the new dynamics apply
    /// from the next transition or reset.
    pub fn set_dynamics(&mut self, dynamics: D) {
        info!("Rebinding agent dynamics at step {}", self.context.step);
        self.dynamics = dynamics;
    }

    /// Picks the possible action with the highest exploration score.
    fn recommend(&self, context: &LearningContext<S, A>) -> Option<A> {
        let state = &context.current_state;
        let mut best = (*context.possible_actions.first()?, f64::NEG_INFINITY);
        for &action in &context.possible_actions {
            let score = self.exploration.score(
                context.q_value(state, action),
                context.frequency(state, action),
            );
            trace!("{state:?} {action:?} scores {score}");
            if score > best.1 {
                best = (action, score);
            }
        }
        Some(best.0)
    }

    /// Starts a new episode from the initial state.
    ///
    /// Q-values and frequencies carry over; only the trajectory is reset.
    pub fn reset_position(&mut self) {
        let mut context = LearningContext {
            step: 0,
            current_state: self.initial_state.clone(),
            current_reward: self.dynamics.reward(&self.initial_state),
            possible_actions: self.dynamics.possible_actions(&self.initial_state),
            recommended_action: None,
            previous: None,
            q_values: self.context.q_values.clone(),
            frequencies: self.context.frequencies.clone(),
        };
        context.recommended_action = self.recommend(&context);
        info!(
            "Episode reset to {:?} after {} steps",
            self.initial_state, self.context.step
        );
        self.context = context;
    }

    /// Takes an action and updates the learned tables.
    ///
    /// Returns `false`, leaving the context untouched, if the action is not
    /// possible from the current state.
    pub fn take_action(&mut self, action: A) -> bool {
        let current = &self.context;
        if !current.possible_actions.contains(&action) {
            debug!(
                "Rejected {action:?}: not possible from {:?}",
                current.current_state
            );
            return false;
        }
        let AgentConfig {
            learning_rate,
            discount_factor,
        } = self.config;

        let previous_state = current.current_state.clone();
        let current_state = self.dynamics.next_state(&previous_state, action);
        let current_reward = self.dynamics.reward(&current_state);
        let possible_actions = self.dynamics.possible_actions(&current_state);

        let key = StateAction::new(previous_state.clone(), action);
        let mut frequencies = current.frequencies.clone();
        let frequency = {
            let entry = frequencies.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        // A dead end contributes negative infinity, not zero.
        let next_best_q = possible_actions
            .iter()
            .map(|&next_action| current.q_value(&current_state, next_action))
            .fold(f64::NEG_INFINITY, f64::max);
        let previous_q = current.q_value(&previous_state, action);
        let updated_q = previous_q
            + learning_rate
                * frequency as f64
                * (current.current_reward + discount_factor * next_best_q - previous_q);
        let mut q_values = current.q_values.clone();
        q_values.insert(key, updated_q);

        debug!(
            "{previous_state:?} --{action:?}--> {current_state:?}: Q {previous_q} -> {updated_q} (N = {frequency})"
        );

        let mut next = LearningContext {
            step: current.step + 1,
            previous: Some(Transition {
                previous_state,
                previous_action: action,
                previous_reward: current.current_reward,
            }),
            current_state,
            current_reward,
            possible_actions,
            recommended_action: None,
            q_values,
            frequencies,
        };
        next.recommended_action = self.recommend(&next);
        self.context = next;
        true
    }

    /// Follows the recommended action until `done` holds on the current state.
    ///
    /// There is no terminal state, so `max_steps` bounds the run.
    pub fn run_until<F>(&mut self, mut done: F, max_steps: usize) -> RunOutcome
    where
        F: FnMut(&S) -> bool,
    {
        let mut steps = 0;
        while !done(&self.context.current_state) {
            if steps >= max_steps {
                warn!("Run stopped after {steps} steps without reaching its target");
                return RunOutcome::StepLimit { steps };
            }
            let Some(action) = self.context.recommended_action else {
                return RunOutcome::Stuck { steps };
            };
            self.take_action(action);
            steps += 1;
        }
        RunOutcome::Reached { steps }
    }

    /// Q-value, frequency and exploration score of every action from `state`.
    pub fn action_stats(&self, state: &S) -> Vec<ActionStats<A>> {
        let available = self.dynamics.possible_actions(state);
        let recommended = if *state == self.context.current_state {
            self.context.recommended_action
        } else {
            None
        };
        A::ALL
            .iter()
            .map(|&action| {
                let q_value = self.context.q_value(state, action);
                let frequency = self.context.frequency(state, action);
                ActionStats {
                    action,
                    available: available.contains(&action),
                    recommended: recommended == Some(action),
                    q_value,
                    frequency,
                    exploration: self.exploration.score(q_value, frequency),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A corridor of cells `0..len`; the agent may step left or right.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Step {
        Back,
        Forward,
    }

    impl ActionSpace for Step {
        const ALL: &'static [Self] = &[Step::Back, Step::Forward];
    }

    fn corridor(
        len: i64,
    ) -> FnDynamics<
        impl Fn(&i64) -> Vec<Step>,
        impl Fn(&i64, Step) -> i64,
        impl Fn(&i64) -> f64,
    > {
        FnDynamics::new(
            move |s: &i64| {
                let mut actions = Vec::new();
                if *s < len - 1 {
                    actions.push(Step::Forward);
                }
                if *s > 0 {
                    actions.push(Step::Back);
                }
                actions
            },
            |s: &i64, a: Step| match a {
                Step::Forward => s + 1,
                Step::Back => s - 1,
            },
            move |s: &i64| -((len - 1 - s) as f64),
        )
    }

    #[test]
    fn new_agent_starts_fresh() {
        let agent = QLearningAgent::new(AgentConfig::default(), 0_i64, corridor(4), Greedy);
        let ctx = agent.context();
        assert_eq!(ctx.step, 0);
        assert_eq!(ctx.current_state, 0);
        assert_eq!(ctx.current_reward, -3.0, "reward of the initial state");
        assert_eq!(ctx.possible_actions, vec![Step::Forward]);
        assert_eq!(ctx.recommended_action, Some(Step::Forward));
        assert!(ctx.previous.is_none());
        assert!(ctx.q_values.is_empty() && ctx.frequencies.is_empty());
    }

    #[test]
    fn illegal_action_is_rejected_without_change() {
        let mut agent = QLearningAgent::new(AgentConfig::default(), 0_i64, corridor(4), Greedy);
        let before = agent.context().clone();
        assert!(!agent.take_action(Step::Back));
        assert_eq!(agent.context(), &before);
    }

    #[test]
    fn update_scales_by_visit_count() {
        let config = AgentConfig {
            learning_rate: 0.5,
            discount_factor: 1.0,
        };
        let mut agent = QLearningAgent::new(config, 0_i64, corridor(3), Greedy);

        assert!(agent.take_action(Step::Forward));
        // 0 + 0.5 * 1 * (-2 + max(0, 0) - 0)
        assert_eq!(agent.context().q_value(&0, Step::Forward), -1.0);
        assert_eq!(agent.context().frequency(&0, Step::Forward), 1);
        let previous = agent.context().previous.clone().unwrap();
        assert_eq!(previous.previous_state, 0);
        assert_eq!(previous.previous_action, Step::Forward);
        assert_eq!(previous.previous_reward, -2.0);

        agent.reset_position();
        assert!(agent.take_action(Step::Forward));
        // -1 + 0.5 * 2 * (-2 + 0 - (-1))
        assert_eq!(agent.context().q_value(&0, Step::Forward), -2.0);
        assert_eq!(agent.context().frequency(&0, Step::Forward), 2);
    }

    #[test]
    fn dead_end_contributes_negative_infinity() {
        let dynamics = FnDynamics::new(
            |s: &i64| if *s == 0 { vec![Step::Forward] } else { vec![] },
            |s: &i64, _: Step| s + 1,
            |_: &i64| 0.0,
        );
        let mut agent = QLearningAgent::new(AgentConfig::default(), 0_i64, dynamics, Greedy);
        assert!(agent.take_action(Step::Forward));
        assert_eq!(
            agent.context().q_value(&0, Step::Forward),
            f64::NEG_INFINITY
        );
        assert_eq!(agent.recommended_action(), None);
        assert_eq!(
            agent.run_until(|_| false, 10),
            RunOutcome::Stuck { steps: 0 }
        );
    }

    #[test]
    fn ties_go_to_first_possible_action() {
        let agent = QLearningAgent::new(AgentConfig::default(), 1_i64, corridor(4), Greedy);
        assert_eq!(agent.possible_actions(), &[Step::Forward, Step::Back]);
        assert_eq!(agent.recommended_action(), Some(Step::Forward));

        let flat = FnDynamics::new(
            |_: &i64| vec![Step::Back, Step::Forward],
            |s: &i64, _: Step| *s,
            |_: &i64| 0.0,
        );
        let agent = QLearningAgent::new(AgentConfig::default(), 0_i64, flat, Greedy);
        assert_eq!(agent.recommended_action(), Some(Step::Back));
    }

    #[test]
    fn reset_keeps_tables() {
        let mut agent = QLearningAgent::new(AgentConfig::default(), 0_i64, corridor(5), Greedy);
        for _ in 0..3 {
            assert!(agent.take_action(Step::Forward));
        }
        let q_values = agent.context().q_values.clone();
        let frequencies = agent.context().frequencies.clone();

        agent.reset_position();
        let ctx = agent.context();
        assert_eq!(ctx.current_state, 0);
        assert_eq!(ctx.step, 0);
        assert!(ctx.previous.is_none());
        assert_eq!(ctx.q_values, q_values);
        assert_eq!(ctx.frequencies, frequencies);
    }

    #[test]
    fn run_until_respects_step_limit() {
        let mut agent = QLearningAgent::new(AgentConfig::default(), 0_i64, corridor(4), Greedy);
        assert_eq!(
            agent.run_until(|s| *s == 3, 100),
            RunOutcome::Reached { steps: 3 }
        );

        // Back and forth forever between two cells.
        let loop_dynamics = FnDynamics::new(
            |s: &i64| {
                if *s == 0 {
                    vec![Step::Forward]
                } else {
                    vec![Step::Back]
                }
            },
            |s: &i64, a: Step| if a == Step::Forward { s + 1 } else { s - 1 },
            |_: &i64| -1.0,
        );
        let mut agent = QLearningAgent::new(AgentConfig::default(), 0_i64, loop_dynamics, Greedy);
        assert_eq!(
            agent.run_until(|s| *s == 5, 20),
            RunOutcome::StepLimit { steps: 20 }
        );
        assert_eq!(agent.context().step, 20);
    }

    #[test]
    fn exploration_functions() {
        assert_eq!(FrequencyWeighted.score(-2.0, 0), -2.0);
        assert_eq!(FrequencyWeighted.score(-2.0, 3), -6.0);
        assert_eq!(Greedy.score(1.5, 9), 1.5);
        let optimistic = Optimistic {
            reward: 10.0,
            visits: 2,
        };
        assert_eq!(optimistic.score(-4.0, 1), 10.0);
        assert_eq!(optimistic.score(-4.0, 2), -4.0);
        let closure = |q: f64, n: u32| q + n as f64;
        assert_eq!(closure.score(1.0, 2), 3.0);
    }

    #[test]
    fn action_stats_cover_every_action() {
        let mut agent =
            QLearningAgent::new(AgentConfig::default(), 0_i64, corridor(4), FrequencyWeighted);
        assert!(agent.take_action(Step::Forward));

        let stats = agent.action_stats(&0);
        assert_eq!(stats.len(), 2);
        let back = stats[0];
        assert_eq!(back.action, Step::Back);
        assert!(!back.available);
        let forward = stats[1];
        assert!(forward.available);
        assert!(!forward.recommended, "0 is not the current state");
        assert_eq!(forward.frequency, 1);
        assert_eq!(forward.exploration, forward.q_value);

        let here = agent.action_stats(&1);
        assert!(here.iter().any(|s| s.recommended));
    }
}

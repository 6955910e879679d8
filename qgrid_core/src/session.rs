use std::rc::Rc;

use log::{info, warn};
use rand::Rng;

use crate::{
    Position,
    agent::{AgentConfig, Exploration, QLearningAgent, RunOutcome},
    environment::{Action, Environment, EnvironmentError, GridDynamics},
};

/// A Q-learning agent over board positions.
pub type GridAgent<X> = QLearningAgent<Position, Action, GridDynamics, X>;

/// Configuration for a [`TrainingSession`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub agent: AgentConfig,
    /// Upper bound on steps taken by [`TrainingSession::reach_goal`].
    pub max_steps_per_run: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            max_steps_per_run: 10_000,
        }
    }
}

/// The trajectory of one iteration and the reward collected along it.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub path: Vec<Position>,
    pub reward: f64,
}

impl Episode {
    fn starting_at(position: Position) -> Self {
        Self {
            path: vec![position],
            reward: 0.0,
        }
    }

    /// The moves between consecutive path positions. Teleports show as `None`.
    pub fn moves(&self) -> Vec<Option<Action>> {
        self.path
            .windows(2)
            .map(|pair| Action::between(pair[0], pair[1]))
            .collect()
    }
}

/// Drives a [`GridAgent`] over an environment, one step or iteration at a time,
/// and records the history of every iteration.
pub struct TrainingSession<X> {
    environment: Rc<Environment>,
    agent: GridAgent<X>,
    history: Vec<Episode>,
    iteration: usize,
    step: usize,
    max_steps_per_run: usize,
}

impl<X: Exploration> TrainingSession<X> {
    pub fn new(environment: Environment, config: SessionConfig, exploration: X) -> Self {
        let environment = Rc::new(environment);
        let start = environment.start();
        let agent = QLearningAgent::new(
            config.agent,
            start,
            GridDynamics::new(Rc::clone(&environment)),
            exploration,
        );
        Self {
            environment,
            agent,
            history: vec![Episode::starting_at(start)],
            iteration: 1,
            step: 0,
            max_steps_per_run: config.max_steps_per_run,
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn agent(&self) -> &GridAgent<X> {
        &self.agent
    }

    pub fn position(&self) -> Position {
        *self.agent.current_state()
    }

    /// The current iteration, starting at 1.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Steps taken in the current iteration.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn history(&self) -> &[Episode] {
        &self.history
    }

    /// History of a 1-based iteration.
    pub fn episode(&self, iteration: usize) -> Option<&Episode> {
        iteration
            .checked_sub(1)
            .and_then(|index| self.history.get(index))
    }

    pub fn at_goal(&self) -> bool {
        self.position() == self.environment.goal()
    }

    /// Takes the recommended action, collecting the reward of the state left behind.
    ///
    /// Returns `false` if there is no action to take.
    pub fn next_step(&mut self) -> bool {
        let Some(action) = self.agent.recommended_action() else {
            warn!("No action available from {}", self.position());
            return false;
        };
        let reward = self.agent.context().current_reward;
        if !self.agent.take_action(action) {
            return false;
        }
        let position = self.position();
        if let Some(episode) = self.history.last_mut() {
            episode.reward += reward;
            episode.path.push(position);
        }
        self.step += 1;
        true
    }

    /// Ends the current iteration and starts a new one from the start position.
    pub fn next_iteration(&mut self) {
        self.agent.reset_position();
        self.history
            .push(Episode::starting_at(*self.agent.initial_state()));
        self.iteration += 1;
        self.step = 0;
        info!("Starting iteration {}", self.iteration);
    }

    /// Steps until the goal is reached, capped by the configured step limit.
    pub fn reach_goal(&mut self) -> RunOutcome {
        let mut steps = 0;
        while !self.at_goal() {
            if steps >= self.max_steps_per_run {
                warn!(
                    "Goal not reached after {steps} steps in iteration {}",
                    self.iteration
                );
                return RunOutcome::StepLimit { steps };
            }
            if !self.next_step() {
                return RunOutcome::Stuck { steps };
            }
            steps += 1;
        }
        info!(
            "Reached goal in iteration {} after {} steps",
            self.iteration, self.step
        );
        RunOutcome::Reached { steps }
    }

    /// Replaces the environment and rebinds the agent to it. Learned tables are kept.
    pub fn set_environment(&mut self, environment: Environment) {
        self.environment = Rc::new(environment);
        self.agent
            .set_dynamics(GridDynamics::new(Rc::clone(&self.environment)));
    }

    /// Moves the goal to a random empty cell of the board's top-right corner.
    ///
    /// Returns `false` when no cell is eligible.
    pub fn relocate_goal<R>(&mut self, rng: &mut R) -> Result<bool, EnvironmentError>
    where
        R: Rng + ?Sized,
    {
        let region = self.environment.corner_region();
        match self.environment.relocate_goal(rng, region)? {
            Some(environment) => {
                self.set_environment(environment);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

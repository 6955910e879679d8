use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use log::{LevelFilter, error, info};
use qgrid_core::{
    Position,
    agent::{AgentConfig, Exploration, FrequencyWeighted, Greedy, Optimistic, RunOutcome},
    environment::{Action, Cell, Environment},
    session::{SessionConfig, TrainingSession},
};
use rand::{SeedableRng, rngs::StdRng};
use ratatui::{
    crossterm::{
        self,
        event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
        execute,
        terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
    },
    prelude::*,
    widgets::*,
};
use std::{
    io::{self, Stdout},
    path::PathBuf,
    time::{Duration, Instant},
};
use tui_logger::TuiLoggerWidget;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Map file to load, the built-in 8x8 board if omitted
    #[arg(short, long, value_name = "MAP_FILE")]
    map: Option<PathBuf>,

    /// Learning rate, expected in [0, 1]
    #[arg(long, default_value_t = AgentConfig::default().learning_rate)]
    alpha: f64,

    /// Discount factor, expected in [0, 1]
    #[arg(long, default_value_t = AgentConfig::default().discount_factor)]
    gamma: f64,

    /// Exploration function ranking candidate actions
    #[arg(short, long, value_enum, default_value_t = ExplorationKind::FrequencyWeighted)]
    exploration: ExplorationKind,

    /// Score given to untried actions by the optimistic exploration function
    #[arg(long, default_value_t = 0.0)]
    optimistic_reward: f64,

    /// Visits before the optimistic exploration function trusts a Q-value
    #[arg(long, default_value_t = 1)]
    optimistic_visits: u32,

    /// Step cap for running to the goal
    #[arg(long, default_value_t = SessionConfig::default().max_steps_per_run)]
    max_steps: usize,

    /// Seed for goal relocation
    #[arg(long)]
    seed: Option<u64>,

    /// Log level shown in the log pane
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ExplorationKind {
    FrequencyWeighted,
    Greedy,
    Optimistic,
}

/// Exploration function chosen on the command line.
#[derive(Debug, Clone, Copy)]
enum Policy {
    FrequencyWeighted(FrequencyWeighted),
    Greedy(Greedy),
    Optimistic(Optimistic),
}

impl Policy {
    fn from_args(args: &Args) -> Self {
        match args.exploration {
            ExplorationKind::FrequencyWeighted => Policy::FrequencyWeighted(FrequencyWeighted),
            ExplorationKind::Greedy => Policy::Greedy(Greedy),
            ExplorationKind::Optimistic => Policy::Optimistic(Optimistic {
                reward: args.optimistic_reward,
                visits: args.optimistic_visits,
            }),
        }
    }
}

impl Exploration for Policy {
    fn score(&self, q_value: f64, frequency: u32) -> f64 {
        match self {
            Policy::FrequencyWeighted(f) => f.score(q_value, frequency),
            Policy::Greedy(f) => f.score(q_value, frequency),
            Policy::Optimistic(f) => f.score(q_value, frequency),
        }
    }
}

struct App {
    /// The learning session being visualised.
    session: TrainingSession<Policy>,
    rng: StdRng,
    /// Step automatically on every tick.
    auto_play: bool,
    /// Iteration shown in the history pane, `None` to follow the current one.
    selected_iteration: Option<usize>,
    /// Flag to control the main loop.
    should_quit: bool,
}

impl App {
    fn new(args: &Args) -> Result<Self> {
        let environment = match &args.map {
            Some(path) => {
                let map = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read map file {}", path.display()))?;
                map.parse::<Environment>()
                    .with_context(|| format!("Failed to load map {}", path.display()))?
            }
            None => Environment::default_board()?,
        };
        let config = SessionConfig {
            agent: AgentConfig {
                learning_rate: args.alpha,
                discount_factor: args.gamma,
            },
            max_steps_per_run: args.max_steps,
        };
        let rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(App {
            session: TrainingSession::new(environment, config, Policy::from_args(args)),
            rng,
            auto_play: false,
            selected_iteration: None,
            should_quit: false,
        })
    }

    /// Handles one tick of the simulation.
    fn tick(&mut self) {
        if !self.auto_play {
            return;
        }
        if self.session.at_goal() {
            self.session.next_iteration();
        } else if !self.session.next_step() {
            self.auto_play = false;
        }
    }

    fn handle_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char(' ') | KeyCode::Char('s') => {
                self.session.next_step();
            }
            KeyCode::Char('i') => self.session.next_iteration(),
            KeyCode::Char('g') => match self.session.reach_goal() {
                RunOutcome::Reached { steps } => info!("Goal reached in {steps} steps"),
                RunOutcome::StepLimit { steps } => info!("Gave up after {steps} steps"),
                RunOutcome::Stuck { steps } => info!("Stuck after {steps} steps"),
            },
            KeyCode::Char('r') => match self.session.relocate_goal(&mut self.rng) {
                Ok(true) => info!("Goal moved to {}", self.session.environment().goal()),
                Ok(false) => info!("No free cell to move the goal to"),
                Err(err) => error!("Goal relocation failed: {err}"),
            },
            KeyCode::Char('a') => self.auto_play = !self.auto_play,
            KeyCode::Char('[') => {
                let current = self.shown_iteration();
                self.selected_iteration = Some(current.saturating_sub(1).max(1));
            }
            KeyCode::Char(']') => {
                let next = self.shown_iteration() + 1;
                self.selected_iteration = (next < self.session.iteration()).then_some(next);
            }
            _ => {}
        }
    }

    fn shown_iteration(&self) -> usize {
        self.selected_iteration
            .unwrap_or_else(|| self.session.iteration())
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    tui_logger::init_logger(LevelFilter::Trace)
        .map_err(|err| anyhow!("Failed to set up logging: {err:?}"))?;
    tui_logger::set_default_level(args.log_level);

    // Create the application state before touching the terminal so errors print normally
    let mut app = App::new(&args)?;

    // Set up the terminal
    let mut terminal = setup_terminal()?;

    // Run the main application loop
    let result = run_app(&mut terminal, &mut app);

    // Restore the terminal state
    restore_terminal(&mut terminal)?;

    result
}

/// Configures the terminal for TUI interaction.
fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    let mut stdout = io::stdout();
    enable_raw_mode()?;
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).map_err(Into::into)
}

/// Restores the terminal to its original state.
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

/// Runs the main loop of the TUI application.
fn run_app(terminal: &mut Terminal<CrosstermBackend<Stdout>>, app: &mut App) -> Result<()> {
    let tick_rate = Duration::from_millis(150);
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));

        if crossterm::event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key.code);
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            app.tick();
            last_tick = Instant::now();
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}

/// Renders the user interface.
fn ui(frame: &mut Frame, app: &App) {
    let main_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(60), // Board and agent panels
            Constraint::Min(6),         // Logs
            Constraint::Length(2),      // Help
        ])
        .split(frame.area());

    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(main_layout[0]);

    let panels = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(8),
            Constraint::Length(6),
            Constraint::Min(3),
        ])
        .split(top[1]);

    let shown = app.shown_iteration();
    let path = app
        .session
        .episode(shown)
        .map(|episode| episode.path.as_slice())
        .unwrap_or_default();

    render_board(frame, top[0], &app.session, path);
    render_status(frame, panels[0], app);
    render_action_stats(frame, panels[1], &app.session);
    render_history(frame, panels[2], &app.session, shown);

    let logs = TuiLoggerWidget::default()
        .block(Block::default().title("Log").borders(Borders::ALL))
        .style_error(Style::default().light_red())
        .style_warn(Style::default().light_yellow())
        .style_info(Style::default().cyan())
        .output_separator(' ')
        .output_target(false);
    frame.render_widget(logs, main_layout[1]);

    let help_text = Paragraph::new(
        "s/space: step  g: run to goal  i: next iteration  r: move goal  a: auto  [ ]: history  q: quit",
    )
    .alignment(Alignment::Center)
    .block(Block::default().borders(Borders::TOP));
    frame.render_widget(help_text, main_layout[2]);
}

fn cell_span(cell: Cell) -> Span<'static> {
    match cell {
        Cell::Empty => Span::raw(" . "),
        Cell::Start => Span::styled(" S ", Style::default().fg(Color::Blue).bold()),
        Cell::Goal => Span::styled(" G ", Style::default().fg(Color::Green).bold()),
        Cell::Wall => Span::styled("###", Style::default().fg(Color::DarkGray)),
        Cell::PowerPosition => Span::styled(" P ", Style::default().fg(Color::Yellow).bold()),
        Cell::GotoPowerPosition => Span::styled(" p ", Style::default().fg(Color::Yellow)),
        Cell::Restart => Span::styled(" R ", Style::default().fg(Color::Magenta)),
    }
}

/// Renders the board, the agent and the selected iteration's path.
fn render_board<X: Exploration>(
    frame: &mut Frame,
    area: Rect,
    session: &TrainingSession<X>,
    path: &[Position],
) {
    let environment = session.environment();
    let agent_position = session.position();

    let lines: Vec<Line> = environment
        .cells()
        .enumerate()
        .fold(Vec::new(), |mut rows: Vec<Vec<Span>>, (position, cell)| {
            if position.y == 0 {
                rows.push(Vec::new());
            }
            let span = if position == agent_position {
                Span::styled(" @ ", Style::default().fg(Color::Red).bold())
            } else {
                cell_span(*cell)
            };
            let span = if path.contains(&position) {
                span.bg(Color::Indexed(236))
            } else {
                span
            };
            if let Some(row) = rows.last_mut() {
                row.push(span);
            }
            rows
        })
        .into_iter()
        .map(Line::from)
        .collect();

    let board = Paragraph::new(lines)
        .block(Block::default().title("Board").borders(Borders::ALL))
        .alignment(Alignment::Center);
    frame.render_widget(board, area);
}

fn render_status(frame: &mut Frame, area: Rect, app: &App) {
    let session = &app.session;
    let context = session.agent().context();
    let recommended = context
        .recommended_action
        .map_or_else(|| "none".to_string(), |a| format!("{a:?}"));
    let previous = context.previous.as_ref().map_or_else(
        || "none".to_string(),
        |t| format!("{:?} from {}", t.previous_action, t.previous_state),
    );
    let lines = vec![
        Line::from(format!(
            "Iteration: {}  Step: {}  Auto: {}",
            session.iteration(),
            session.step(),
            if app.auto_play { "on" } else { "off" }
        )),
        Line::from(format!("Position: {}", context.current_state)),
        Line::from(format!("Reward: {}", context.current_reward)),
        Line::from(format!("Goal: {}", session.environment().goal())),
        Line::from(format!("Recommended: {recommended}")),
        Line::from(format!("Previous: {previous}")),
    ];
    let status = Paragraph::new(lines).block(Block::default().title("Agent").borders(Borders::ALL));
    frame.render_widget(status, area);
}

fn render_action_stats<X: Exploration>(
    frame: &mut Frame,
    area: Rect,
    session: &TrainingSession<X>,
) {
    let rows = session
        .agent()
        .action_stats(&session.position())
        .into_iter()
        .map(|stats| {
            let style = if stats.recommended {
                Style::default().fg(Color::Green).bold()
            } else if stats.available {
                Style::default()
            } else {
                Style::default().fg(Color::DarkGray)
            };
            let values = if stats.available {
                format!(
                    "Q {:>8.3}  N {:>4}  E {:>8.3}",
                    stats.q_value, stats.frequency, stats.exploration
                )
            } else {
                "unavailable".to_string()
            };
            ListItem::new(Line::styled(
                format!("{:<6}{values}", format!("{:?}", stats.action)),
                style,
            ))
        })
        .collect::<Vec<_>>();
    let list = List::new(rows).block(Block::default().title("Actions").borders(Borders::ALL));
    frame.render_widget(list, area);
}

fn render_history<X: Exploration>(
    frame: &mut Frame,
    area: Rect,
    session: &TrainingSession<X>,
    shown: usize,
) {
    let text = match session.episode(shown) {
        Some(episode) => {
            let moves: String = episode
                .moves()
                .into_iter()
                .map(|action| match action {
                    Some(Action::Up) => '↑',
                    Some(Action::Down) => '↓',
                    Some(Action::Left) => '←',
                    Some(Action::Right) => '→',
                    None => '*',
                })
                .collect();
            vec![
                Line::from(format!(
                    "Iteration {shown}/{}  Reward: {}  Steps: {}",
                    session.iteration(),
                    episode.reward,
                    episode.path.len() - 1
                )),
                Line::from(moves),
            ]
        }
        None => vec![Line::from("No history")],
    };
    let history = Paragraph::new(text)
        .wrap(Wrap { trim: true })
        .block(Block::default().title("History").borders(Borders::ALL));
    frame.render_widget(history, area);
}

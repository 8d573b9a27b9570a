use crossterm::{
    event::{
        self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::{debug, warn};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols::Marker,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Clear, Dataset, GraphType, Paragraph},
    Frame, Terminal,
};
use std::{
    io,
    sync::{Arc, PoisonError},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

use crate::app::catalog::{Preset, SourceOption};
use crate::app::{SelectOutcome, Visualizer};
use crate::audio::ContextState;
use crate::render::SeriesId;
use crate::ui::surface::TerminalChartSurface;
use crate::ui::widgets::Spectrogram;

/// What a key press asks the visualizer to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiAction {
    TogglePlay,
    ToggleListen,
    ResetPeaks,
    Select(SourceOption),
    PromptUrl,
    Disconnect,
    Quit,
}

pub fn action_for_key(key: KeyEvent) -> Option<UiAction> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c') => Some(UiAction::Quit),
            _ => None,
        };
    }
    match key.code {
        KeyCode::Char(' ') => Some(UiAction::TogglePlay),
        KeyCode::Char('l') => Some(UiAction::ToggleListen),
        KeyCode::Char('r') => Some(UiAction::ResetPeaks),
        KeyCode::Char('1') => Some(UiAction::Select(SourceOption::Preset(Preset::Truck))),
        KeyCode::Char('2') => Some(UiAction::Select(SourceOption::Preset(Preset::ToneSweep))),
        KeyCode::Char('3') => Some(UiAction::Select(SourceOption::Preset(Preset::Symphony))),
        KeyCode::Char('m') => Some(UiAction::Select(SourceOption::Microphone)),
        KeyCode::Char('u') => Some(UiAction::PromptUrl),
        KeyCode::Char('d') => Some(UiAction::Disconnect),
        KeyCode::Char('q') | KeyCode::Esc => Some(UiAction::Quit),
        _ => None,
    }
}

/// Represents UI notification state
#[derive(Debug, Clone)]
pub struct Notification {
    message: String,
    is_error: bool,
    start_time: Instant,
    duration: Duration,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message.into(), false)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message.into(), true)
    }

    fn new(message: String, is_error: bool) -> Self {
        Self {
            message,
            is_error,
            start_time: Instant::now(),
            duration: Duration::from_secs(if is_error { 5 } else { 2 }),
        }
    }

    fn expired(&self) -> bool {
        self.start_time.elapsed() >= self.duration
    }
}

/// Represents a text input popup
#[derive(Debug, Clone, Default)]
struct TextInput {
    prompt: String,
    input: String,
    cursor_position: usize,
}

/// Fixed axis ranges of the chart panes.
#[derive(Debug, Clone, Copy)]
pub struct ChartAxes {
    pub fft_size: usize,
    pub nyquist: f64,
    pub min_decibels: f64,
    pub max_decibels: f64,
    pub history_seconds: f64,
}

/// Snapshot of the facade shown in the status bar.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub state: ContextState,
    pub source: Option<String>,
    pub gain: f32,
    pub blocks: u64,
    pub dropped: u64,
    pub analysis_running: bool,
}

impl StatusView {
    pub fn of(visualizer: &Visualizer<TerminalChartSurface>) -> Self {
        Self {
            state: visualizer.state(),
            source: visualizer.current_source().map(|(label, _)| label),
            gain: visualizer.gain(),
            blocks: visualizer.blocks_processed(),
            dropped: visualizer.blocks_dropped(),
            analysis_running: visualizer.analysis_running(),
        }
    }

    fn line(&self) -> Line<'static> {
        let state_style = match self.state {
            ContextState::Running => Style::default().fg(Color::Green),
            ContextState::Suspended => Style::default().fg(Color::Yellow),
            ContextState::Closed => Style::default().fg(Color::Red),
        };
        let mut spans = vec![
            Span::styled(self.state.to_string(), state_style.add_modifier(Modifier::BOLD)),
            Span::raw(" | "),
            Span::raw(
                self.source
                    .clone()
                    .unwrap_or_else(|| "no source".to_string()),
            ),
            Span::raw(" | "),
            Span::raw(if self.gain > 0.0 { "listening" } else { "muted" }),
            Span::raw(format!(" | blocks {} dropped {}", self.blocks, self.dropped)),
        ];
        if self.state == ContextState::Suspended {
            spans.push(Span::styled(
                "  press space to start audio",
                Style::default().fg(Color::Yellow),
            ));
        }
        if !self.analysis_running {
            spans.push(Span::styled(
                "  analysis stopped",
                Style::default().fg(Color::Red),
            ));
        }
        Line::from(spans)
    }
}

const KEY_HELP: &str =
    "space play/pause  l listen  r reset peaks  1-3 presets  m mic  u url  d disconnect  q quit";

/// Main UI controller that manages terminal rendering
pub struct TerminalUI {
    terminal: Option<Terminal<CrosstermBackend<io::Stdout>>>,
    notification: Option<Notification>,
    text_input: Option<TextInput>,
}

impl TerminalUI {
    pub fn new() -> Self {
        Self {
            terminal: None,
            notification: None,
            text_input: None,
        }
    }

    pub fn initialize(&mut self) -> io::Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;

        let backend = CrosstermBackend::new(stdout);
        self.terminal = Some(Terminal::new(backend)?);
        Ok(())
    }

    pub fn shutdown(&mut self) -> io::Result<()> {
        if let Some(mut terminal) = self.terminal.take() {
            disable_raw_mode()?;
            execute!(
                terminal.backend_mut(),
                LeaveAlternateScreen,
                DisableMouseCapture
            )?;
            terminal.show_cursor()?;
        }
        Ok(())
    }

    pub fn show_notification(&mut self, notification: Notification) {
        self.notification = Some(notification);
    }

    fn update_notification(&mut self) {
        if self.notification.as_ref().map_or(false, Notification::expired) {
            self.notification = None;
        }
    }

    pub fn show_text_input_popup(&mut self, prompt: &str) {
        self.text_input = Some(TextInput {
            prompt: prompt.to_string(),
            ..TextInput::default()
        });
    }

    pub fn is_text_input_active(&self) -> bool {
        self.text_input.is_some()
    }

    /// Edits the open text input. Returns the entered text once Enter closes
    /// the popup; Esc closes it without a result.
    pub fn handle_text_input_key(&mut self, key: KeyCode) -> Option<String> {
        let text_input = self.text_input.as_mut()?;
        match key {
            KeyCode::Char(c) => {
                text_input.input.insert(text_input.cursor_position, c);
                text_input.cursor_position += c.len_utf8();
            }
            KeyCode::Backspace => {
                if let Some(c) = text_input.input[..text_input.cursor_position].chars().last() {
                    text_input.cursor_position -= c.len_utf8();
                    text_input.input.remove(text_input.cursor_position);
                }
            }
            KeyCode::Delete => {
                if text_input.cursor_position < text_input.input.len() {
                    text_input.input.remove(text_input.cursor_position);
                }
            }
            KeyCode::Left => {
                if let Some(c) = text_input.input[..text_input.cursor_position].chars().last() {
                    text_input.cursor_position -= c.len_utf8();
                }
            }
            KeyCode::Right => {
                if let Some(c) = text_input.input[text_input.cursor_position..].chars().next() {
                    text_input.cursor_position += c.len_utf8();
                }
            }
            KeyCode::Enter => {
                let submitted = std::mem::take(&mut text_input.input);
                self.text_input = None;
                return Some(submitted);
            }
            KeyCode::Esc => {
                self.text_input = None;
            }
            _ => {}
        }
        None
    }

    pub fn poll_events(&self, timeout: Duration) -> io::Result<Option<Event>> {
        if event::poll(timeout)? {
            return Ok(Some(event::read()?));
        }
        Ok(None)
    }

    pub fn render(
        &mut self,
        status: &StatusView,
        surface: &TerminalChartSurface,
        axes: &ChartAxes,
    ) -> io::Result<()> {
        self.update_notification();

        let notification = self.notification.clone();
        let text_input = self.text_input.clone();
        if let Some(terminal) = self.terminal.as_mut() {
            terminal.draw(|frame| {
                draw(frame, status, surface, axes);
                if let Some(notif) = &notification {
                    draw_notification(frame, notif);
                }
                if let Some(input) = &text_input {
                    draw_text_input(frame, input);
                }
            })?;
        }
        Ok(())
    }
}

impl Default for TerminalUI {
    fn default() -> Self {
        Self::new()
    }
}

fn line_dataset<'a>(name: &'a str, data: &'a [(f64, f64)], color: Color) -> Dataset<'a> {
    Dataset::default()
        .name(name)
        .marker(Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(data)
}

fn axis<'a>(title: &'a str, bounds: [f64; 2], unit: &str) -> Axis<'a> {
    Axis::default()
        .title(title)
        .style(Style::default().fg(Color::Gray))
        .bounds(bounds)
        .labels(vec![
            Span::raw(format!("{:.0}{}", bounds[0], unit)),
            Span::raw(format!("{:.0}{}", bounds[1], unit)),
        ])
}

fn draw(frame: &mut Frame, status: &StatusView, surface: &TerminalChartSurface, axes: &ChartAxes) {
    let area = frame.size();

    let vertical_split = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(8),    // Charts
            Constraint::Length(4), // Status bar
        ])
        .split(area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(vertical_split[0]);
    let halves = |row: Rect| {
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(row)
    };
    let top = halves(rows[0]);
    let bottom = halves(rows[1]);

    let waveform = Chart::new(vec![line_dataset(
        SeriesId::Waveform.title(),
        surface.series(SeriesId::Waveform),
        Color::Green,
    )])
    .block(
        Block::default()
            .title(SeriesId::Waveform.title())
            .borders(Borders::ALL),
    )
    .x_axis(axis("sample", [0.0, axes.fft_size as f64], ""))
    .y_axis(axis("", [-1.0, 1.0], ""));
    frame.render_widget(waveform, top[0]);

    let (start, end) = surface
        .history_bounds()
        .map(|(oldest, newest)| (newest - axes.history_seconds, newest.max(oldest + 1e-3)))
        .unwrap_or((0.0, axes.history_seconds));
    let history = Chart::new(vec![line_dataset(
        SeriesId::WaveformHistory.title(),
        surface.history(),
        Color::LightGreen,
    )])
    .block(
        Block::default()
            .title(SeriesId::WaveformHistory.title())
            .borders(Borders::ALL),
    )
    .x_axis(axis("time", [start.max(0.0), end], "s"))
    .y_axis(axis("", [-1.0, 1.0], ""));
    frame.render_widget(history, top[1]);

    let spectrum = Chart::new(vec![
        line_dataset(
            SeriesId::Spectrum.title(),
            surface.series(SeriesId::Spectrum),
            Color::Cyan,
        ),
        line_dataset(
            SeriesId::Decay.title(),
            surface.series(SeriesId::Decay),
            Color::Yellow,
        ),
        line_dataset(
            SeriesId::PeakHold.title(),
            surface.series(SeriesId::PeakHold),
            Color::Red,
        ),
    ])
    .block(
        Block::default()
            .title(SeriesId::Spectrum.title())
            .borders(Borders::ALL),
    )
    .x_axis(axis("frequency", [0.0, axes.nyquist], "Hz"))
    .y_axis(axis("", [axes.min_decibels, axes.max_decibels], "dB"));
    frame.render_widget(spectrum, bottom[0]);

    let spectrogram = Spectrogram::new(surface.grid()).block(
        Block::default()
            .title(SeriesId::Spectrogram.title())
            .borders(Borders::ALL),
    );
    frame.render_widget(spectrogram, bottom[1]);

    let status_bar = Paragraph::new(vec![
        status.line(),
        Line::styled(KEY_HELP, Style::default().fg(Color::DarkGray)),
    ])
    .block(Block::default().borders(Borders::ALL).title("Status"));
    frame.render_widget(status_bar, vertical_split[1]);
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect::new(
        area.x + (area.width - width) / 2,
        area.y + (area.height - height) / 2,
        width,
        height,
    )
}

fn draw_notification(frame: &mut Frame, notif: &Notification) {
    let area = centered(frame.size(), notif.message.len() as u16 + 4, 3);
    let color = if notif.is_error { Color::Red } else { Color::White };
    let widget = Paragraph::new(notif.message.as_str())
        .style(Style::default().fg(color))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .style(Style::default().bg(Color::DarkGray)),
        );
    frame.render_widget(Clear, area);
    frame.render_widget(widget, area);
}

fn draw_text_input(frame: &mut Frame, input: &TextInput) {
    let width = std::cmp::max(60, input.prompt.len() as u16 + 4);
    let area = centered(frame.size(), width, 4);
    let widget = Paragraph::new(vec![
        Line::raw(input.prompt.as_str()),
        Line::raw(input.input.as_str()),
    ])
    .style(Style::default().fg(Color::White))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("Open URL")
            .style(Style::default().bg(Color::Black)),
    );
    frame.render_widget(Clear, area);
    frame.render_widget(widget, area);

    let typed = input.input[..input.cursor_position].chars().count() as u16;
    frame.set_cursor(area.x + 1 + typed, area.y + 2);
}

fn spawn_select(
    visualizer: &Arc<Visualizer<TerminalChartSurface>>,
    option: SourceOption,
    notices: &mpsc::UnboundedSender<Notification>,
) {
    let visualizer = Arc::clone(visualizer);
    let notices = notices.clone();
    tokio::spawn(async move {
        let label = option.label();
        let notice = match visualizer.select(option).await {
            Ok(SelectOutcome::Connected) => Some(Notification::info(format!("Playing {}", label))),
            Ok(SelectOutcome::Superseded) => None,
            Err(e) => Some(Notification::error(e.to_string())),
        };
        if let Some(notice) = notice {
            let _ = notices.send(notice);
        }
    });
}

/// Runs the terminal front-end until the user quits. Source selections run
/// as background tasks; their outcome comes back as a notification.
pub async fn run_tui(
    visualizer: Arc<Visualizer<TerminalChartSurface>>,
    initial_source: Option<SourceOption>,
) -> io::Result<()> {
    let mut terminal_ui = TerminalUI::new();
    terminal_ui.initialize()?;

    let config = visualizer.config().clone();
    let axes = ChartAxes {
        fft_size: config.fft_size,
        nyquist: visualizer.sample_rate() as f64 / 2.0,
        min_decibels: config.min_decibels,
        max_decibels: config.max_decibels,
        history_seconds: config.history_seconds,
    };
    let mut render_loop = visualizer.render_loop();
    let tick_rate = render_loop.frame_interval();
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();

    if let Some(option) = initial_source {
        spawn_select(&visualizer, option, &notice_tx);
    }

    let mut last_tick = Instant::now();
    loop {
        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));

        if let Some(Event::Key(key)) = terminal_ui.poll_events(timeout)? {
            if key.kind != KeyEventKind::Press {
                continue;
            }

            if terminal_ui.is_text_input_active() {
                if let Some(url) = terminal_ui.handle_text_input_key(key.code) {
                    if let Ok(option) = url.parse::<SourceOption>() {
                        spawn_select(&visualizer, option, &notice_tx);
                    }
                }
                continue;
            }

            if let Some(action) = action_for_key(key) {
                debug!("UI action {:?}", action);
                let result = match action {
                    UiAction::Quit => break,
                    UiAction::TogglePlay => match visualizer.state() {
                        ContextState::Running => visualizer.pause(),
                        _ => visualizer.play(),
                    },
                    UiAction::ToggleListen => {
                        let gain = if visualizer.gain() > 0.0 { 0.0 } else { 1.0 };
                        visualizer.set_gain(gain)
                    }
                    UiAction::ResetPeaks => visualizer.reset_peaks(),
                    UiAction::Select(option) => {
                        spawn_select(&visualizer, option, &notice_tx);
                        Ok(())
                    }
                    UiAction::PromptUrl => {
                        terminal_ui.show_text_input_popup("URL or file path:");
                        Ok(())
                    }
                    UiAction::Disconnect => visualizer.set_source(None),
                };
                if let Err(e) = result {
                    warn!("{}", e);
                    terminal_ui.show_notification(Notification::error(e.to_string()));
                }
            }
        }

        while let Ok(notice) = notice_rx.try_recv() {
            terminal_ui.show_notification(notice);
        }

        if last_tick.elapsed() >= tick_rate {
            render_loop.tick();
            let status = StatusView::of(&visualizer);
            let surface = visualizer.surface();
            let surface = surface.lock().unwrap_or_else(PoisonError::into_inner);
            terminal_ui.render(&status, &surface, &axes)?;
            last_tick = Instant::now();
        }
    }

    terminal_ui.shutdown()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_key_bindings() {
        assert_eq!(action_for_key(press(KeyCode::Char(' '))), Some(UiAction::TogglePlay));
        assert_eq!(
            action_for_key(press(KeyCode::Char('2'))),
            Some(UiAction::Select(SourceOption::Preset(Preset::ToneSweep)))
        );
        assert_eq!(
            action_for_key(press(KeyCode::Char('m'))),
            Some(UiAction::Select(SourceOption::Microphone))
        );
        assert_eq!(
            action_for_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(UiAction::Quit)
        );
        assert_eq!(action_for_key(press(KeyCode::Char('x'))), None);
    }

    #[test]
    fn test_text_input_editing() {
        let mut ui = TerminalUI::new();
        ui.show_text_input_popup("URL");
        for c in "abd".chars() {
            assert_eq!(ui.handle_text_input_key(KeyCode::Char(c)), None);
        }
        ui.handle_text_input_key(KeyCode::Left);
        ui.handle_text_input_key(KeyCode::Char('c'));
        ui.handle_text_input_key(KeyCode::Right);
        ui.handle_text_input_key(KeyCode::Backspace);
        assert_eq!(
            ui.handle_text_input_key(KeyCode::Enter),
            Some("abc".to_string())
        );
        assert!(!ui.is_text_input_active());
    }

    #[test]
    fn test_escape_cancels_input() {
        let mut ui = TerminalUI::new();
        ui.show_text_input_popup("URL");
        ui.handle_text_input_key(KeyCode::Char('x'));
        assert_eq!(ui.handle_text_input_key(KeyCode::Esc), None);
        assert!(!ui.is_text_input_active());
    }

    #[test]
    fn test_status_line_shows_resume_hint() {
        let status = StatusView {
            state: ContextState::Suspended,
            source: None,
            gain: 0.0,
            blocks: 0,
            dropped: 0,
            analysis_running: true,
        };
        let text: String = status
            .line()
            .spans
            .iter()
            .map(|s| s.content.as_ref())
            .collect();
        assert!(text.contains("suspended"));
        assert!(text.contains("muted"));
        assert!(text.contains("press space"));
    }

    #[test]
    fn test_centered_clamps_to_area() {
        let area = Rect::new(0, 0, 10, 5);
        assert_eq!(centered(area, 40, 3), Rect::new(0, 1, 10, 3));
    }
}

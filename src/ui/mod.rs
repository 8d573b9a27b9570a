// Terminal front-end
// Chart surface, widgets and the event loop driving a visualizer

pub mod surface;
pub mod terminal_ui;
pub mod widgets;

pub use surface::TerminalChartSurface;
pub use terminal_ui::{action_for_key, run_tui, Notification, TerminalUI, UiAction};

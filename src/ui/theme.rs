//! Terminal styles, picked once per process

use owo_colors::Style;
use std::sync::OnceLock;

static THEME: OnceLock<Theme> = OnceLock::new();

/// Styles keyed by the role text plays in call-count output
#[derive(Debug, Clone)]
pub struct Theme {
    /// Banner and section titles
    pub title: Style,
    pub ok: Style,
    pub alert: Style,
    /// Status icons
    pub accent: Style,
    /// Labels in front of a value
    pub label: Style,
    /// Secondary text such as log sources and totals
    pub faint: Style,
    pub calls: Style,
    /// Names of exported functions
    pub exported: Style,
}

impl Theme {
    /// Colored when stdout is a terminal and `NO_COLOR` is unset
    pub fn detect() -> Self {
        let colored = console::Term::stdout().is_term() && std::env::var_os("NO_COLOR").is_none();
        Self::new(colored)
    }

    pub fn new(colored: bool) -> Self {
        let pick = |style: Style| if colored { style } else { Style::new() };
        Self {
            title: pick(Style::new().cyan().bold()),
            ok: pick(Style::new().green().bold()),
            alert: pick(Style::new().yellow().bold()),
            accent: pick(Style::new().magenta()),
            label: pick(Style::new().white().dimmed()),
            faint: pick(Style::new().bright_black()),
            calls: pick(Style::new().yellow()),
            exported: pick(Style::new().green()),
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}

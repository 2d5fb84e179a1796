use crate::ui::{theme, Icons};
use owo_colors::OwoColorize;

pub fn header(text: &str) {
    println!("{} {}", Icons::ROCKET, text.style(theme().title.clone()));
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().ok.clone()));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(theme().alert.clone()));
}

pub fn info(label: &str, value: &str) {
    println!(
        "{} {}: {}",
        Icons::INFO.style(theme().accent.clone()),
        label.style(theme().label.clone()),
        value
    );
}

pub fn section(icon: &str, title: &str) {
    println!();
    println!("{} {}", icon, title.style(theme().title.clone()));
}

/// A probe message, tagged with the function it came from
pub fn log_line(function: Option<&str>, message: &str) {
    let source = function.unwrap_or("?");
    println!(
        "{} {} {}",
        Icons::PROBE.style(theme().accent.clone()),
        source.style(theme().faint.clone()),
        message
    );
}

pub fn muted(text: &str) -> String {
    text.style(theme().faint.clone()).to_string()
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {} {}", label.style(theme().label.clone()), value);
}

// (c) 2024 Ross Younger
//! Console styling for help text and `--show-config` complaints
//!
//! Print styled text with anstream's `println!` / `eprintln!`, which strip the styling
//! when the output is not a terminal.

#[allow(clippy::enum_glob_use)]
use anstyle::AnsiColor::*;
use anstyle::{Color::Ansi, Style};
use clap::builder::styling::Styles;

/// Fatal problems
pub(crate) const ERROR: Style = Style::new().bold().fg_color(Some(Ansi(Red)));
/// Problems we can carry on past
pub(crate) const WARNING: Style = Style::new().bold().fg_color(Some(Ansi(Yellow)));

const HEADING: Style = Style::new().underline().fg_color(Some(Ansi(Yellow)));
const PLACEHOLDER: Style = Style::new().fg_color(Some(Ansi(Cyan)));

pub(crate) const CLAP_STYLES: Styles = Styles::styled()
    .usage(HEADING)
    .header(HEADING)
    .literal(Style::new().bold())
    .invalid(WARNING)
    .error(ERROR)
    .valid(PLACEHOLDER.bold().underline())
    .placeholder(PLACEHOLDER);

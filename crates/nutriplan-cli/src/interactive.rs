use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use nutriplan_api::Session;

use crate::render;

const PROMPT: &str = "np> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    List,
    Why(String),
    Explain(String),
    Nutrients,
    Markers,
    Budget,
    Stores,
    Help,
    Quit,
    Empty,
    /// Free text that matches no command; treated as a food lookup.
    Lookup(String),
}

#[must_use]
pub fn parse_command(line: &str) -> SessionCommand {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    match head.to_ascii_lowercase().as_str() {
        "" => SessionCommand::Empty,
        "list" | "ls" | "plan" => SessionCommand::List,
        "why" => SessionCommand::Why(rest.to_string()),
        "explain" => SessionCommand::Explain(rest.to_string()),
        "nutrients" | "priorities" | "needs" => SessionCommand::Nutrients,
        "markers" | "labs" => SessionCommand::Markers,
        "budget" => SessionCommand::Budget,
        "stores" => SessionCommand::Stores,
        "help" | "?" => SessionCommand::Help,
        "quit" | "exit" | "q" => SessionCommand::Quit,
        _ => SessionCommand::Lookup(line.to_string()),
    }
}

/// Text reply for one command, or `None` when the session should end.
#[must_use]
pub fn respond(session: &Session, command: &SessionCommand) -> Option<String> {
    let reply = match command {
        SessionCommand::Quit => return None,
        SessionCommand::Empty => String::new(),
        SessionCommand::Help => render::help(),
        SessionCommand::List => render::shopping_list(session.plan()),
        SessionCommand::Nutrients => render::needs(session.needs()),
        SessionCommand::Markers => render::markers(&session.markers()),
        SessionCommand::Budget => render::budget(session.budget_summary()),
        SessionCommand::Stores => render::stores(session.plan()),
        SessionCommand::Why(query) if query.is_empty() => "Usage: why <food>".to_string(),
        SessionCommand::Explain(query) if query.is_empty() => {
            "Usage: explain <nutrient>".to_string()
        }
        SessionCommand::Why(query) | SessionCommand::Lookup(query) => {
            match session.explain_food(query) {
                Ok(explanation) => render::food(&explanation),
                Err(err) => format!("{err}. Type `list` to see the shopping list."),
            }
        }
        SessionCommand::Explain(query) => match session.explain_nutrient(query) {
            Ok(explanation) => render::nutrient(&explanation),
            Err(err) => format!("{err}. Type `nutrients` to see current priorities."),
        },
    };
    Some(reply)
}

/// Drive a text session until `quit` or end of input.
///
/// # Errors
/// Returns an error when reading input or writing output fails.
pub fn run_interactive<R: BufRead, W: Write>(
    session: &Session,
    input: &mut R,
    output: &mut W,
) -> Result<()> {
    writeln!(output, "{}", render::banner(&session.summary()))?;

    let mut line = String::new();
    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        line.clear();
        let read = input.read_line(&mut line).context("failed to read session input")?;
        if read == 0 {
            writeln!(output)?;
            break;
        }

        let command = parse_command(&line);
        tracing::debug!(command = ?command, "session command");
        match respond(session, &command) {
            Some(reply) if reply.is_empty() => {}
            Some(reply) => writeln!(output, "{reply}")?,
            None => {
                writeln!(output, "Goodbye.")?;
                break;
            }
        }
    }
    Ok(())
}

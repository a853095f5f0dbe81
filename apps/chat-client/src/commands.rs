//! Input line parsing and event rendering.

use chathub_hub_connection::ConnectionEvent;

pub const HELP: &str = "\
commands:
  <text>          send a message to everyone
  /joke           ask the server for a joke
  /countdown <n>  stream a countdown from n
  /cancel         cancel the running countdown
  /quit           leave";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Joke,
    CountDown(i64),
    Cancel,
    Help,
    Quit,
}

/// Parses an input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let mut parts = rest.split_whitespace();
    let cmd = parts.next().unwrap_or_default();
    let command = match cmd {
        "joke" => Command::Joke,
        "cancel" => Command::Cancel,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "countdown" => {
            let n = parts
                .next()
                .ok_or("usage: /countdown <n>")?
                .parse::<i64>()
                .map_err(|e| format!("invalid count: {e}"))?;
            Command::CountDown(n)
        }
        other => return Err(format!("unknown command '/{other}', try /help")),
    };
    Ok(Some(command))
}

/// Text shown to the user for a connection event, if any.
pub fn describe(event: &ConnectionEvent) -> Option<String> {
    match event {
        ConnectionEvent::Connected => Some("connected".into()),
        ConnectionEvent::ConnectionFailed { error } => Some(format!("could not connect: {error}")),
        ConnectionEvent::Reconnecting {
            attempt,
            next_retry,
            error,
        } => Some(format!(
            "reconnecting\u{2026} (attempt {attempt} in {}s: {error})",
            next_retry.as_secs()
        )),
        ConnectionEvent::Reconnected => Some("reconnected".into()),
        ConnectionEvent::Closed { error: Some(error) } => {
            Some(format!("connection closed, please restart ({error})"))
        }
        ConnectionEvent::Closed { error: None } => Some("connection closed, please restart".into()),
        ConnectionEvent::StateChanged(_) => None,
    }
}

//! Console command parsing for the headless client

use shared::EntityId;
use thiserror::Error;

/// One line of player input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Look at an entity, or at nothing
    Focus(Option<EntityId>),
    /// Challenge or accept, depending on who is focused
    Interact,
    Attack(EntityId),
    Status,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("'{0}' needs an entity id")]
    MissingEntity(&'static str),
    #[error("'{0}' is not an entity id")]
    InvalidEntity(String),
}

fn entity_arg(arg: Option<&str>, command: &'static str) -> Result<EntityId, CommandError> {
    let arg = arg.ok_or(CommandError::MissingEntity(command))?;
    arg.parse()
        .map_err(|_| CommandError::InvalidEntity(arg.to_string()))
}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or(CommandError::Empty)?;

    match verb.to_ascii_lowercase().as_str() {
        "focus" | "f" => match words.next() {
            None => Ok(Command::Focus(None)),
            arg => entity_arg(arg, "focus").map(|entity| Command::Focus(Some(entity))),
        },
        "interact" | "i" => Ok(Command::Interact),
        "attack" | "a" => entity_arg(words.next(), "attack").map(Command::Attack),
        "status" | "s" => Ok(Command::Status),
        "quit" | "q" | "exit" => Ok(Command::Quit),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

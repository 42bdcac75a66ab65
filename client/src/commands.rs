//! Parsing of the line-oriented commands typed on stdin

use shared::TournamentId;
use std::str::FromStr;
use thiserror::Error;

/// One line of user input, parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateRoom { max_players: u32, score_limit: Option<u32> },
    JoinRoom { code: String },
    LeaveRoom,
    Ready,
    Config { score_limit: u32 },
    CreateTournament { name: String, capacity: u32 },
    JoinTournament { tournament_id: TournamentId },
    LeaveTournament,
    InviteBot,
    ListRooms,
    TournamentInfo { tournament_id: TournamentId },
    Resync,
    State,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("'{0}' is not a number")]
    NotANumber(String),
}

pub const HELP: &str = "commands: create <max> [score], join <code>, leave, ready, config <score>, \
tcreate <name> <capacity>, tjoin <id>, tleave, bot, rooms, tinfo <id>, resync, state, quit";

fn number<T: FromStr>(word: Option<&str>, usage: &'static str) -> Result<T, CommandError> {
    let word = word.ok_or(CommandError::Usage(usage))?;
    word.parse()
        .map_err(|_| CommandError::NotANumber(word.to_string()))
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let head = words.next().ok_or(CommandError::Empty)?;

        let command = match head.to_ascii_lowercase().as_str() {
            "create" => {
                let max_players = number(words.next(), "create <max> [score]")?;
                let score_limit = match words.next() {
                    Some(word) => Some(number(Some(word), "create <max> [score]")?),
                    None => None,
                };
                Command::CreateRoom {
                    max_players,
                    score_limit,
                }
            }
            "join" => Command::JoinRoom {
                code: words
                    .next()
                    .ok_or(CommandError::Usage("join <code>"))?
                    .to_ascii_uppercase(),
            },
            "leave" => Command::LeaveRoom,
            "ready" => Command::Ready,
            "config" => Command::Config {
                score_limit: number(words.next(), "config <score>")?,
            },
            "tcreate" => {
                let name = words
                    .next()
                    .ok_or(CommandError::Usage("tcreate <name> <capacity>"))?
                    .to_string();
                let capacity = number(words.next(), "tcreate <name> <capacity>")?;
                Command::CreateTournament { name, capacity }
            }
            "tjoin" => Command::JoinTournament {
                tournament_id: number(words.next(), "tjoin <id>")?,
            },
            "tleave" => Command::LeaveTournament,
            "bot" => Command::InviteBot,
            "rooms" => Command::ListRooms,
            "tinfo" => Command::TournamentInfo {
                tournament_id: number(words.next(), "tinfo <id>")?,
            },
            "resync" => Command::Resync,
            "state" => Command::State,
            "quit" | "exit" => Command::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_room_commands() {
        assert_eq!(
            "create 2".parse(),
            Ok(Command::CreateRoom {
                max_players: 2,
                score_limit: None
            })
        );
        assert_eq!(
            "create 4 7".parse(),
            Ok(Command::CreateRoom {
                max_players: 4,
                score_limit: Some(7)
            })
        );
        assert_eq!(
            "  join   abc123 ".parse(),
            Ok(Command::JoinRoom {
                code: "ABC123".to_string()
            })
        );
        assert_eq!("config 3".parse(), Ok(Command::Config { score_limit: 3 }));
        assert_eq!("READY".parse(), Ok(Command::Ready));
    }

    #[test]
    fn test_parse_tournament_commands() {
        assert_eq!(
            "tcreate cup 8".parse(),
            Ok(Command::CreateTournament {
                name: "cup".to_string(),
                capacity: 8
            })
        );
        assert_eq!(
            "tjoin 3".parse(),
            Ok(Command::JoinTournament { tournament_id: 3 })
        );
        assert_eq!(
            "tinfo 3".parse(),
            Ok(Command::TournamentInfo { tournament_id: 3 })
        );
        assert_eq!("bot".parse(), Ok(Command::InviteBot));
        assert_eq!("tleave".parse(), Ok(Command::LeaveTournament));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Command>(), Err(CommandError::Empty));
        assert_eq!(
            "dance".parse::<Command>(),
            Err(CommandError::Unknown("dance".to_string()))
        );
        assert_eq!(
            "join".parse::<Command>(),
            Err(CommandError::Usage("join <code>"))
        );
        assert_eq!(
            "create many".parse::<Command>(),
            Err(CommandError::NotANumber("many".to_string()))
        );
        assert_eq!(
            "tcreate cup".parse::<Command>(),
            Err(CommandError::Usage("tcreate <name> <capacity>"))
        );
    }
}

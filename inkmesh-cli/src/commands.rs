//! Stdin command parser for interactive sessions.

use inkmesh_core::{Color, Point, StrokeId};
use thiserror::Error;

pub const HELP: &str = "\
commands:
  line X0 Y0 X1 Y1 [COLOR] [WIDTH]   draw a straight stroke
  erase ID...                        erase strokes by id
  cursor X Y                         share pointer position
  clear                              clear the whole canvas
  peers                              list connected peers
  cursors                            last known pointers of peers
  strokes                            list strokes in the local replica
  stats                              node counters
  help                               this text
  quit                               leave the room";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Line {
        from: Point,
        to: Point,
        color: Option<Color>,
        width: Option<f64>,
    },
    Erase(Vec<StrokeId>),
    Cursor {
        x: f64,
        y: f64,
    },
    Clear,
    Peers,
    Cursors,
    Strokes,
    Stats,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("not a number: `{0}`")]
    InvalidNumber(String),
}

fn number(token: Option<&str>, name: &'static str) -> Result<f64, ParseError> {
    let token = token.ok_or(ParseError::MissingArgument(name))?;
    token
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber(token.to_string()))
}

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut tokens = line.split_whitespace();
    let Some(head) = tokens.next() else {
        return Err(ParseError::Empty);
    };

    match head.to_ascii_lowercase().as_str() {
        "line" | "l" => {
            let x0 = number(tokens.next(), "x0")?;
            let y0 = number(tokens.next(), "y0")?;
            let x1 = number(tokens.next(), "x1")?;
            let y1 = number(tokens.next(), "y1")?;
            let color = tokens.next().map(Color::new);
            let width = match tokens.next() {
                Some(token) => Some(number(Some(token), "width")?),
                None => None,
            };
            Ok(Command::Line {
                from: Point::new(x0, y0),
                to: Point::new(x1, y1),
                color,
                width,
            })
        }
        "erase" | "e" => {
            let ids: Vec<StrokeId> = tokens.map(StrokeId::from).collect();
            if ids.is_empty() {
                return Err(ParseError::MissingArgument("stroke id"));
            }
            Ok(Command::Erase(ids))
        }
        "cursor" | "c" => Ok(Command::Cursor {
            x: number(tokens.next(), "x")?,
            y: number(tokens.next(), "y")?,
        }),
        "clear" => Ok(Command::Clear),
        "peers" => Ok(Command::Peers),
        "cursors" => Ok(Command::Cursors),
        "strokes" => Ok(Command::Strokes),
        "stats" => Ok(Command::Stats),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

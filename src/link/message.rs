/// Wire line model for the linking protocol.
///
/// One line = optional `:source` token, a command, then parameters; the
/// final parameter may carry spaces when introduced by `:`. Lines are
/// CR-LF terminated on the wire, but parsing operates on the bare content.
use std::fmt;

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Originating server name or nick, without the leading `:`.
    pub prefix: Option<String>,
    /// Command token (e.g. `SERVER`, `FJOIN`, `SQUIT`).
    pub command: String,
    /// Parameters; the last one may have been a trailing param.
    pub params: Vec<String>,
}

/// Errors from parsing a protocol line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("source prefix with no command")]
    MissingCommand,
}

impl Message {
    /// Build an unprefixed message.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Message {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Build a message carrying a source prefix.
    pub fn with_source(
        source: impl Into<String>,
        command: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        Message {
            prefix: Some(source.into()),
            command: command.into(),
            params,
        }
    }

    /// Parse one line (without its `\r\n` terminator).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches(['\r', '\n']);
        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = if let Some(stripped) = input.strip_prefix(':') {
            match stripped.split_once(' ') {
                Some((p, rest)) => (Some(p.to_owned()), rest),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (None, input)
        };

        let (command, mut remaining) = match rest.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        while !remaining.is_empty() {
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match remaining.split_once(' ') {
                Some((param, rest)) => {
                    params.push(param.to_owned());
                    remaining = rest;
                }
                None => {
                    params.push(remaining.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Serialize to the wire form (without the `\r\n` terminator).
    ///
    /// The last parameter always gets a `:` introducer; that form is valid
    /// for every parameter and sidesteps ambiguity for values with spaces.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);
        if let Some((last, front)) = self.params.split_last() {
            for param in front {
                out.push(' ');
                out.push_str(param);
            }
            out.push_str(" :");
            out.push_str(last);
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

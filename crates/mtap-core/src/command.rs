//! Request lines and the fixed command set
//!
//! Grammar: `CMD [arg1] [arg2]\n`
//! - CMD is case-insensitive and normalized to uppercase
//! - tokens are separated by one or more whitespace characters
//! - arguments are positional

use std::fmt;

use crate::{ProtocolError, LINE_TERMINATOR};

/// The fixed dispatch vocabulary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandName {
    Ping,
    ReadTemp,
    SelfTest,
    SetTemp,
    SetFaultProfile,
}

impl CommandName {
    pub const ALL: [CommandName; 5] = [
        CommandName::Ping,
        CommandName::ReadTemp,
        CommandName::SelfTest,
        CommandName::SetTemp,
        CommandName::SetFaultProfile,
    ];

    /// Look up an uppercase command name
    pub fn from_name(name: &str) -> Option<Self> {
        CommandName::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::Ping => "PING",
            CommandName::ReadTemp => "READ_TEMP",
            CommandName::SelfTest => "SELF_TEST",
            CommandName::SetTemp => "SET_TEMP",
            CommandName::SetFaultProfile => "SET_FAULT_PROFILE",
        }
    }

    /// Positional argument names
    pub fn params(self) -> &'static [&'static str] {
        match self {
            CommandName::Ping | CommandName::ReadTemp | CommandName::SelfTest => &["sn"],
            CommandName::SetTemp => &["sn", "temp_c"],
            CommandName::SetFaultProfile => &["profile"],
        }
    }

    #[inline]
    pub fn arity(self) -> usize {
        self.params().len()
    }

    /// Whether the first argument names a device
    #[inline]
    pub fn is_sn_scoped(self) -> bool {
        !matches!(self, CommandName::SetFaultProfile)
    }

    /// Human readable arity message, e.g. `SET_TEMP requires 2 arguments: <sn> <temp_c>`
    pub fn usage(self) -> String {
        let params: Vec<String> = self.params().iter().map(|p| format!("<{}>", p)).collect();
        let noun = if self.arity() == 1 { "argument" } else { "arguments" };
        format!(
            "{} requires {} {}: {}",
            self.as_str(),
            self.arity(),
            noun,
            params.join(" ")
        )
    }

    /// Check the argument count for this command
    pub fn check_arity(self, args: &[String]) -> Result<(), ProtocolError> {
        if args.len() == self.arity() {
            Ok(())
        } else {
            Err(ProtocolError::BadArgs(format!(
                "{} (got {})",
                self.usage(),
                args.len()
            )))
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<String>,
}

impl Command {
    /// Build a command, normalizing the name to uppercase
    pub fn new<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command {
            name: name.trim().to_ascii_uppercase(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse one request line. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next()?;
        Some(Command::new(name, tokens))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Resolve against the fixed command set
    pub fn kind(&self) -> Option<CommandName> {
        CommandName::from_name(&self.name)
    }

    /// Serialize as a framed request line, terminator included
    pub fn to_line(&self) -> String {
        let mut line = self.to_string();
        line.push(LINE_TERMINATOR);
        line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

use crate::allocator::{Address, AllocationId, Placement};

use std::str::FromStr;
use thiserror::Error;

const INIT_USAGE: &str = "Usage: init memory <size> | init buddy <size>";
const SET_USAGE: &str = "Usage: set allocator <first_fit|best_fit|worst_fit>";
const MALLOC_USAGE: &str = "Usage: malloc <size>";
const FREE_USAGE: &str = "Usage: free <id>";
const TRANSLATE_USAGE: &str = "Usage: translate <address>";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Unknown allocator: {0}")]
    InvalidPolicy(String),
    #[error("{0}")]
    Usage(&'static str),
}

/// Which allocation discipline `init` activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    FreeList,
    Buddy,
}

/// One line of the simulator command language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `init memory <size>` or `init buddy <size>`.
    Init { kind: EngineKind, size: u64 },
    /// `set allocator <policy>`.
    SetAllocator(Placement),
    /// `malloc <size>`.
    Malloc(u64),
    /// `free <id>`.
    Free(AllocationId),
    Dump,
    Stats,
    /// Statistics of both cache levels.
    Cache,
    /// `translate <address>`: run an address through the page table.
    Translate(Address),
    /// Page table statistics.
    Vm,
    Exit,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(CommandError::InvalidCommand(String::new()));
        };

        let command = match name {
            "init" => {
                let kind = match words.next() {
                    Some("memory") => EngineKind::FreeList,
                    Some("buddy") => EngineKind::Buddy,
                    _ => return Err(CommandError::Usage(INIT_USAGE)),
                };
                let size = number(words.next(), INIT_USAGE)?;
                Command::Init { kind, size }
            }
            "set" => {
                if words.next() != Some("allocator") {
                    return Err(CommandError::Usage(SET_USAGE));
                }
                let placement = match words.next() {
                    Some("first_fit") => Placement::FirstFit,
                    Some("best_fit") => Placement::BestFit,
                    Some("worst_fit") => Placement::WorstFit,
                    Some(other) => return Err(CommandError::InvalidPolicy(other.to_string())),
                    None => return Err(CommandError::Usage(SET_USAGE)),
                };
                Command::SetAllocator(placement)
            }
            "malloc" => Command::Malloc(number(words.next(), MALLOC_USAGE)?),
            "free" => Command::Free(number(words.next(), FREE_USAGE)?),
            "translate" => Command::Translate(number(words.next(), TRANSLATE_USAGE)?),
            "dump" => Command::Dump,
            "stats" => Command::Stats,
            "cache" => Command::Cache,
            "vm" => Command::Vm,
            "exit" => Command::Exit,
            other => return Err(CommandError::InvalidCommand(other.to_string())),
        };

        Ok(command)
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal argument.
fn number(word: Option<&str>, usage: &'static str) -> Result<u64, CommandError> {
    let word = word.ok_or(CommandError::Usage(usage))?;
    let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => word.parse(),
    };
    parsed.map_err(|_| CommandError::Usage(usage))
}

//! Parsers for the textual output of the Slurm command line tools.
use std::fmt::{Debug, Formatter};

use nom::IResult;
use nom::bytes::complete::{is_not, tag};
use nom::error::{ErrorKind, ParseError};
use nom::sequence::delimited;

use crate::SlurmError;

pub mod dump;
pub mod scontrol;
pub mod table;

pub use dump::{dump_to_string, parse_dump, write_dump};
pub use table::parse_fixed_width;

pub struct ParserError<I> {
    input: I,
    kind: ErrorKind,
}

impl<I: Debug> Debug for ParserError<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parser error at '{:?}': expecting {:?}", self.input, self.kind)
    }
}

impl<I> ParseError<I> for ParserError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        ParserError { input, kind }
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

pub(crate) fn format_parse_error<I: Debug>(error: nom::Err<ParserError<I>>) -> SlurmError {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => SlurmError::Parse(format!("{e:?}")),
        _ => SlurmError::Parse(error.to_string()),
    }
}

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ParserError<&'a str>>;

/// Parses a single-quoted string, e.g. `'lab'`. The quotes are not part of the output.
pub fn p_quoted(input: &str) -> NomResult<&str> {
    delimited(tag("'"), is_not("'"), tag("'"))(input)
}

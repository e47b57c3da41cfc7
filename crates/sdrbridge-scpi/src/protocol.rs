//! SCPI line tokenizer.
//!
//! Control-plane traffic is newline-terminated ASCII. Each line has the
//! shape `[subject:]command[?] [arg[,arg...]]`:
//!
//! - `*IDN?` -- query, no subject
//! - `RXGAIN 20.5` -- command with one argument
//! - `C1:COUP DC1M` -- channel subject
//! - `TRIG:EDGE:DIR RISING` -- multi-level subject `TRIG:EDGE`
//!
//! The command is the text after the last `:` of the first token, and a
//! trailing `?` marks a query. Subjects and commands are case-insensitive
//! and are upper-cased here; arguments are passed through untouched.

use std::fmt;

/// The byte that terminates every control-plane line.
pub const TERMINATOR: u8 = b'\n';

/// One tokenized control-plane line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiLine {
    /// The trimmed original line, for logging.
    pub line: String,
    /// Everything before the last `:` of the header, if present.
    pub subject: Option<String>,
    /// The command mnemonic, without the `?`.
    pub command: String,
    /// Arguments, split on commas and whitespace.
    pub args: Vec<String>,
    /// Whether the header ended in `?`.
    pub query: bool,
}

impl ScpiLine {
    /// Whether this line has the given subject (case-insensitive).
    pub fn has_subject(&self, subject: &str) -> bool {
        self.subject
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(subject))
    }

    /// The first argument, if any.
    pub fn arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

impl fmt::Display for ScpiLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

/// Tokenize one control-plane line.
///
/// Returns `None` for blank lines (including a bare `\r`), which clients
/// sometimes send as keep-alives.
pub fn parse_line(raw: &str) -> Option<ScpiLine> {
    let line = raw.trim_end_matches(['\n', '\r']).trim();
    if line.is_empty() {
        return None;
    }

    let (header, rest) = match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim()),
        None => (line, ""),
    };

    let (header, query) = match header.strip_suffix('?') {
        Some(h) => (h, true),
        None => (header, false),
    };

    // A leading colon is the SCPI "root" marker and carries no meaning here.
    let header = header.trim_start_matches(':');

    let (subject, command) = match header.rfind(':') {
        Some(pos) if pos > 0 => (Some(header[..pos].to_ascii_uppercase()), &header[pos + 1..]),
        _ => (None, header.trim_start_matches(':')),
    };

    let args = rest
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect();

    Some(ScpiLine {
        line: line.to_string(),
        subject,
        command: command.to_ascii_uppercase(),
        args,
        query,
    })
}

/// Format a list reply the way bridge clients expect: every entry is
/// followed by a comma, including the last.
///
/// ```
/// use sdrbridge_scpi::protocol::format_list;
///
/// assert_eq!(format_list(&[10_000, 20_000]), "10000,20000,");
/// ```
pub fn format_list(values: &[u64]) -> String {
    let mut out = String::new();
    for v in values {
        out.push_str(&v.to_string());
        out.push(',');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("\r\n"), None);
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn parse_identity_query() {
        let l = parse_line("*IDN?\n").unwrap();
        assert_eq!(l.subject, None);
        assert_eq!(l.command, "*IDN");
        assert!(l.query);
        assert!(l.args.is_empty());
        assert_eq!(l.line, "*IDN?");
    }

    #[test]
    fn parse_command_with_argument() {
        let l = parse_line("RXGAIN 20.5\r\n").unwrap();
        assert_eq!(l.subject, None);
        assert_eq!(l.command, "RXGAIN");
        assert!(!l.query);
        assert_eq!(l.args, vec!["20.5"]);
        assert_eq!(l.arg(), Some("20.5"));
    }

    #[test]
    fn parse_channel_subject() {
        let l = parse_line("c1:coup DC1M").unwrap();
        assert_eq!(l.subject.as_deref(), Some("C1"));
        assert!(l.has_subject("c1"));
        assert_eq!(l.command, "COUP");
        // Arguments keep their case.
        assert_eq!(l.args, vec!["DC1M"]);
    }

    #[test]
    fn parse_nested_subject() {
        let l = parse_line("TRIG:EDGE:DIR RISING").unwrap();
        assert_eq!(l.subject.as_deref(), Some("TRIG:EDGE"));
        assert_eq!(l.command, "DIR");
        assert_eq!(l.args, vec!["RISING"]);
    }

    #[test]
    fn parse_subject_query() {
        let l = parse_line("SYST:ERR?").unwrap();
        assert!(l.has_subject("SYST"));
        assert_eq!(l.command, "ERR");
        assert!(l.query);
    }

    #[test]
    fn leading_colon_is_ignored() {
        let l = parse_line(":SYST:ERR?").unwrap();
        assert!(l.has_subject("SYST"));
        assert_eq!(l.command, "ERR");

        let l = parse_line(":START").unwrap();
        assert_eq!(l.subject, None);
        assert_eq!(l.command, "START");
    }

    #[test]
    fn arguments_split_on_commas_and_spaces() {
        let l = parse_line("FOO 1, 2,3  4").unwrap();
        assert_eq!(l.args, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn list_formatting() {
        assert_eq!(format_list(&[]), "");
        assert_eq!(format_list(&[1]), "1,");
        assert_eq!(format_list(&[500_000, 1_000_000]), "500000,1000000,");
    }
}

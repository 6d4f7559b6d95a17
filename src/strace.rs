//! A structured parser for single strace log lines, plus a lazy path extractor used on
//! the hot path of scanning a full log.

use std::fmt;

/// Error produced while parsing a single strace line. Always local to that line; the
/// caller logs and continues rather than aborting the whole log scan.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(String);

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One syscall argument: either a bare/quoted atom, or a bracketed list of arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Atom { value: String, quoted: bool },
    List(Vec<Arg>),
}

impl Arg {
    fn atom(value: impl Into<String>, quoted: bool) -> Self {
        Arg::Atom {
            value: value.into(),
            quoted,
        }
    }

    /// The textual value of an atom, or a bracketed rendering of a list.
    pub fn value(&self) -> String {
        match self {
            Arg::Atom { value, .. } => value.clone(),
            Arg::List(items) => {
                let rendered: Vec<String> = items.iter().map(Arg::value).collect();
                format!("[{}]", rendered.join(", "))
            }
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

const ESCAPES: &[(u8, char)] = &[
    (b'n', '\n'),
    (b't', '\t'),
    (b'b', '\u{8}'),
    (b'r', '\r'),
    (b'\\', '\\'),
    (b'"', '"'),
    (b'\'', '\''),
];

fn escape_for(c: char) -> Option<char> {
    ESCAPES
        .iter()
        .find(|(byte, _)| *byte as char == c)
        .map(|(_, out)| *out)
}

/// A cursor over a line's characters, used by both the structured parser and the
/// zero-allocation path extractor.
struct Cursor<'a> {
    chars: Vec<char>,
    offset: usize,
    text: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().collect(),
            offset: 0,
            text,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.offset).copied()
    }

    fn peek_n(&self, n: usize) -> String {
        self.chars
            .iter()
            .skip(self.offset)
            .take(n)
            .collect::<String>()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.offset += 1;
        }
        c
    }

    fn lstrip(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.offset += 1;
        }
    }

    fn expect(&mut self, any_of: &[char]) -> Result<char, ParseError> {
        match self.peek() {
            Some(c) if any_of.contains(&c) => {
                self.offset += 1;
                Ok(c)
            }
            found => Err(ParseError::new(format!(
                "expected one of {:?} but found {:?} at offset {} of {:?}",
                any_of, found, self.offset, self.text
            ))),
        }
    }

    fn at_end(&self) -> bool {
        self.offset >= self.chars.len()
    }
}

fn parse_escape(cur: &mut Cursor) -> Result<Arg, ParseError> {
    cur.expect(&['\\'])?;
    match cur.next() {
        Some(c) => match escape_for(c) {
            Some(decoded) => Ok(Arg::atom(decoded.to_string(), false)),
            None => {
                tracing::warn!(
                    "invalid escape \"\\{}\" in {:?} at offset {}",
                    c,
                    cur.text,
                    cur.offset - 1
                );
                Ok(Arg::atom(c.to_string(), false))
            }
        },
        None => Err(ParseError::new("unexpected end of string after backslash")),
    }
}

fn parse_quoted_string(cur: &mut Cursor) -> Result<Arg, ParseError> {
    let quote_char = cur.expect(&['"', '\''])?;
    let mut parsed = String::new();
    loop {
        match cur.next() {
            Some(c) if c == quote_char => break,
            None => {
                return Err(ParseError::new(format!(
                    "reached the end of the string {:?} while searching for {:?}",
                    cur.text, quote_char
                )))
            }
            Some('\\') => {
                cur.offset -= 1;
                let Arg::Atom { value, .. } = parse_escape(cur)? else {
                    unreachable!("parse_escape always returns an Atom")
                };
                parsed.push_str(&value);
            }
            Some(c) => parsed.push(c),
        }
    }
    Ok(Arg::atom(parsed, true))
}

fn parse_comment(cur: &mut Cursor) -> Result<Arg, ParseError> {
    cur.expect(&['/'])?;
    cur.expect(&['*'])?;
    while !cur.at_end() && cur.peek_n(2) != "*/" {
        cur.offset += 1;
    }
    cur.expect(&['*'])?;
    cur.expect(&['/'])?;
    Ok(Arg::atom("", false))
}

fn try_parse<T>(
    cur: &mut Cursor,
    prod: impl Fn(&mut Cursor) -> Result<T, ParseError>,
) -> Option<T> {
    let saved = cur.offset;
    match prod(cur) {
        Ok(value) => Some(value),
        Err(_) => {
            cur.offset = saved;
            None
        }
    }
}

fn parse_list(cur: &mut Cursor) -> Result<Arg, ParseError> {
    cur.expect(&['['])?;
    let mut first = true;
    let mut items = Vec::new();
    while cur.peek() != Some(']') {
        cur.lstrip();
        if first {
            first = false;
        } else if !cur.at_end() {
            if cur.peek_n(3) == "..." {
                cur.offset += 3;
                cur.lstrip();
                items.push(Arg::atom("...", false));
                break;
            }
            cur.expect(&[','])?;
            cur.lstrip();
        }
        items.push(parse_syscall_arg(cur)?);
    }
    cur.expect(&[']'])?;
    Ok(Arg::List(items))
}

fn parse_syscall_arg(cur: &mut Cursor) -> Result<Arg, ParseError> {
    cur.lstrip();
    if let Some(arg) = try_parse(cur, parse_quoted_string) {
        return Ok(arg);
    }
    if let Some(arg) = try_parse(cur, parse_list) {
        return Ok(arg);
    }
    let mut arg = String::new();
    loop {
        let _ = try_parse(cur, parse_comment);
        match cur.next() {
            None => break,
            Some(',') => {
                cur.offset -= 1;
                break;
            }
            Some(c @ ('\'' | '"')) => {
                return Err(ParseError::new(format!(
                    "unexpected quotation mark {:?} in {:?} at offset {}",
                    c,
                    cur.text,
                    cur.offset - 1
                )))
            }
            Some(c) => arg.push(c),
        }
    }
    Ok(Arg::atom(arg.trim_end().to_string(), false))
}

/// Parses a comma-separated argument list (the text between a syscall's parentheses).
pub fn parse_syscall_args(args: &str) -> Result<Vec<Arg>, ParseError> {
    let mut cur = Cursor::new(args);
    let mut first = true;
    let mut out = Vec::new();
    while !cur.at_end() {
        cur.lstrip();
        if first {
            first = false;
        } else if !cur.at_end() {
            cur.expect(&[','])?;
            cur.lstrip();
        }
        match try_parse(&mut cur, parse_syscall_arg) {
            Some(arg) => out.push(arg),
            None => break,
        }
    }
    Ok(out)
}

/// The parsed form of one strace log line: syscall name (`None` for ignored/exit lines),
/// the argument list, and the return value (`1` as a null marker for ignored lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StraceLine {
    pub syscall: Option<String>,
    pub args: Vec<Arg>,
    pub retval: i64,
}

fn strip_unfinished_marker(line: &str) -> String {
    line.replace("<unfinished ...>", ")")
}

/// `<... syscall resumed> rest` is rewritten to `syscall(rest` before the main grammar runs.
fn rewrite_resumed(line: &str) -> String {
    if let Some(resumed_at) = line.find("resumed>") {
        if let Some(marker_at) = line[..resumed_at].rfind("<...") {
            let between = line[marker_at + 4..resumed_at].trim();
            let syscall = between.split_whitespace().next().unwrap_or("");
            let remainder = &line[resumed_at + "resumed>".len()..];
            return format!("{}({}", syscall, remainder);
        }
    }
    line.to_string()
}

pub fn is_ignored_line(line: &str) -> bool {
    line.contains("+++ exited with") && line.contains("+++") || line.contains("--- SIGCHLD")
}

/// Parses one full strace log line into `(syscall, args, retval)`. Lines reporting
/// process exit or a delivered `SIGCHLD` parse to a null marker (`None`, empty args, 1)
/// rather than erroring.
pub fn parse_strace_log_line(line: &str) -> Result<StraceLine, ParseError> {
    let line = strip_unfinished_marker(line);
    let line = rewrite_resumed(&line);

    if let Some((syscall, args_text, retval)) = match_call(&line) {
        let args = parse_syscall_args(&args_text)?;
        Ok(StraceLine {
            syscall: Some(syscall),
            args,
            retval,
        })
    } else if is_ignored_line(&line) {
        Ok(StraceLine {
            syscall: None,
            args: Vec::new(),
            retval: 1,
        })
    } else {
        Err(ParseError::new(format!(
            "could not parse strace output: {:?}",
            line
        )))
    }
}

/// Matches `[pid] syscall(args) = retval [remainder]`, returning `(syscall, args, retval)`.
/// A hand-written scan rather than a regex crate, since the grammar is a single balanced
/// pair of outer parentheses followed by `= <int>`.
fn match_call(line: &str) -> Option<(String, String, i64)> {
    let trimmed = line.trim_start();
    // skip an optional leading "[pid] " numeric prefix
    let after_pid = {
        let mut rest = trimmed;
        if let Some(first_ws) = rest.find(char::is_whitespace) {
            let (maybe_pid, remainder) = rest.split_at(first_ws);
            if maybe_pid.chars().all(|c| c.is_ascii_digit()) && !maybe_pid.is_empty() {
                rest = remainder.trim_start();
            }
        }
        rest
    };
    let open_paren = after_pid.find('(')?;
    let syscall = after_pid[..open_paren].trim();
    if syscall.is_empty() {
        return None;
    }
    let close_paren = after_pid.rfind(')')?;
    if close_paren <= open_paren {
        return None;
    }
    let args_text = &after_pid[open_paren + 1..close_paren];
    let after_close = after_pid[close_paren + 1..].trim_start();
    let after_eq = after_close.strip_prefix('=')?.trim_start();
    let retval_text: String = after_eq
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    let retval: i64 = retval_text.parse().ok()?;
    Some((syscall.to_string(), args_text.to_string(), retval))
}

/// Scans a raw line left-to-right for quoted strings without building an AST, yielding
/// each decoded string that looks like an absolute path, in order. This is the hot path
/// used on every log line while collecting accessed paths.
pub fn lazy_parse_paths(line: &str) -> Vec<String> {
    let mut cur = Cursor::new(line);
    let mut out = Vec::new();
    while !cur.at_end() {
        match try_parse(&mut cur, parse_quoted_string) {
            Some(Arg::Atom { value, .. }) if value.starts_with('/') => out.push(value),
            Some(_) => {}
            None => {
                cur.offset += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_call() {
        let parsed = parse_strace_log_line(r#"openat(AT_FDCWD, "/usr/bin/gcc", O_RDONLY) = 3"#)
            .unwrap();
        assert_eq!(parsed.syscall.as_deref(), Some("openat"));
        assert_eq!(parsed.retval, 3);
        assert_eq!(parsed.args.len(), 3);
        assert_eq!(parsed.args[1].value(), "/usr/bin/gcc");
    }

    #[test]
    fn parses_pid_prefixed_call() {
        let parsed = parse_strace_log_line(r#"12345 stat("/bin/true", {st_mode=S_IFREG}) = 0"#)
            .unwrap();
        assert_eq!(parsed.syscall.as_deref(), Some("stat"));
        assert_eq!(parsed.retval, 0);
    }

    #[test]
    fn exit_and_sigchld_lines_are_null_markers() {
        let exited = parse_strace_log_line("+++ exited with 0 +++").unwrap();
        assert_eq!(exited.syscall, None);
        assert_eq!(exited.retval, 1);

        let sig = parse_strace_log_line("--- SIGCHLD {si_signo=SIGCHLD} ---").unwrap();
        assert_eq!(sig.syscall, None);
    }

    #[test]
    fn resumed_lines_are_rewritten() {
        let parsed =
            parse_strace_log_line(r#"<... read resumed>"/etc/passwd", 128) = 42"#).unwrap();
        assert_eq!(parsed.syscall.as_deref(), Some("read"));
        assert_eq!(parsed.retval, 42);
    }

    #[test]
    fn unparseable_line_is_a_local_error() {
        assert!(parse_strace_log_line("this is not a syscall line").is_err());
    }

    #[test]
    fn escape_table_decodes_known_sequences() {
        let parsed = parse_strace_log_line(r#"write(1, "a\nb\tc", 5) = 5"#).unwrap();
        assert_eq!(parsed.args[1].value(), "a\nb\tc");
    }

    #[test]
    fn unknown_escape_emits_literal_character() {
        let args = parse_syscall_args(r#""a\qb""#).unwrap();
        assert_eq!(args[0].value(), "aqb");
    }

    #[test]
    fn lazy_path_extractor_skips_non_slash_prefixed_strings() {
        let paths = lazy_parse_paths(r#"openat(AT_FDCWD, "/usr/bin/gcc", "relative", O_RDONLY) = 3"#);
        assert_eq!(paths, vec!["/usr/bin/gcc".to_string()]);
    }

    #[test]
    fn list_arg_parses_bracketed_items() {
        let args = parse_syscall_args(r#"[1, 2, "x"]"#).unwrap();
        assert_eq!(args.len(), 1);
        match &args[0] {
            Arg::List(items) => assert_eq!(items.len(), 3),
            other => panic!("expected a list, got {other:?}"),
        }
    }

    #[test]
    fn truncation_marker_is_preserved() {
        let args = parse_syscall_args(r#"[1, 2, ...]"#).unwrap();
        match &args[0] {
            Arg::List(items) => assert_eq!(items.last().unwrap().value(), "..."),
            other => panic!("expected a list, got {other:?}"),
        }
    }
}

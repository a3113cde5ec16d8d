/*!
Migration file parser

Turns a migration file's bytes into the ordered list of (up, down) sections
it declares, failing loudly on malformed structure. This module knows
nothing about filesystems, drivers, or the ledger -- it only understands the
directive grammar described below.

A directive occupies a whole line matching: optional leading horizontal
whitespace, `--`, optional whitespace, `migrate:<direction>` where
`<direction>` is `up` or `down`, optional whitespace, then zero or more
space-separated `key:value` option tokens, end of line. Directives are
case-sensitive and matching is anchored to line start (with only horizontal
whitespace tolerated before `--`) so the parser is never fooled by the
token appearing inside a block comment or string literal.
*/
use regex::Regex;

use crate::errors::*;

lazy_static! {
    static ref DIRECTIVE_RE: Regex =
        Regex::new(r"(?m)^[ \t]*--[ \t]*migrate:(?P<direction>up|down)(?P<opts>(?:[ \t]+[A-Za-z_][A-Za-z0-9_]*:\S+)*)[ \t]*$").unwrap();
    static ref OPTION_RE: Regex = Regex::new(r"([A-Za-z_][A-Za-z0-9_]*):(\S+)").unwrap();
}

/// Recognized per-section options. Unknown keys are rejected at parse time
/// (forward-compatible: a future option key must be added here explicitly).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionOptions {
    /// When `false`, the section's body runs outside any transaction and
    /// the ledger write for the file trails it as a separate statement.
    /// Defaults to `true`.
    pub transaction: bool,
}

impl Default for SectionOptions {
    fn default() -> Self {
        Self { transaction: true }
    }
}

impl SectionOptions {
    fn from_tokens(tokens: &str) -> Result<Self> {
        let mut opts = Self::default();
        for caps in OPTION_RE.captures_iter(tokens) {
            let key = &caps[1];
            let value = &caps[2];
            match key {
                "transaction" => {
                    opts.transaction = match value {
                        "true" => true,
                        "false" => false,
                        other => bail_fmt!(
                            ErrorKind::Parse,
                            "bad_option_value: `transaction` must be `true` or `false`, got `{}`",
                            other
                        ),
                    };
                }
                other => bail_fmt!(ErrorKind::Parse, "unknown_option: `{}`", other),
            }
        }
        Ok(opts)
    }
}

/// One up/down pair within a migration file, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub up_body: String,
    pub up_options: SectionOptions,
    pub down_body: String,
    pub down_options: SectionOptions,
}

/// A migration file parsed into its ordered sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMigration {
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone)]
enum Event<'a> {
    Up(SectionOptions, usize),
    Down(SectionOptions, usize),
    Text(&'a str),
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.is_empty() || trimmed.starts_with("--")
}

/// Parse a migration file's raw contents into its ordered sections.
pub fn parse(contents: &str) -> Result<ParsedMigration> {
    if contents.trim().is_empty() {
        bail_fmt!(ErrorKind::Parse, "empty_file: migration file has no content");
    }

    let mut events = Vec::new();
    let mut offset = 0usize;
    for line in contents.split_inclusive('\n') {
        let trimmed_line = line.trim_end_matches('\n').trim_end_matches('\r');
        if let Some(caps) = DIRECTIVE_RE.captures(trimmed_line) {
            let opts = SectionOptions::from_tokens(caps.name("opts").map(|m| m.as_str()).unwrap_or(""))?;
            match &caps["direction"] {
                "up" => events.push(Event::Up(opts, offset)),
                "down" => events.push(Event::Down(opts, offset)),
                _ => unreachable!(),
            }
        } else {
            events.push(Event::Text(trimmed_line));
        }
        offset += line.len();
    }

    // reject non-comment text before the first up directive
    let first_up = events.iter().position(|e| matches!(e, Event::Up(_, _)));
    let first_up = match first_up {
        Some(i) => i,
        None => bail_fmt!(ErrorKind::Parse, "missing_down_for_up: no `-- migrate:up` directive found"),
    };
    for e in &events[..first_up] {
        if let Event::Text(line) = e {
            if !is_blank_or_comment(line) {
                bail_fmt!(
                    ErrorKind::Parse,
                    "leading_sql_before_up: non-comment content before first `-- migrate:up`: {:?}",
                    line
                );
            }
        }
    }

    let mut sections = Vec::new();
    let mut i = first_up;
    let mut up_count = 0;
    let mut down_count = 0;
    while i < events.len() {
        let (up_opts, up_start) = match &events[i] {
            Event::Up(opts, start) => (opts.clone(), *start),
            Event::Text(_) => {
                i += 1;
                continue;
            }
            Event::Down(_, _) => {
                bail_fmt!(ErrorKind::Parse, "unexpected_direction: `down` directive without preceding `up`");
            }
        };
        up_count += 1;
        i += 1;

        let body_start = i;
        let mut down_opts = None;
        let mut down_start_body = 0usize;
        let mut down_event_idx = None;
        while i < events.len() {
            match &events[i] {
                Event::Down(opts, _) => {
                    down_opts = Some(opts.clone());
                    down_event_idx = Some(i);
                    down_start_body = i + 1;
                    down_count += 1;
                    break;
                }
                Event::Up(_, _) => {
                    bail_fmt!(
                        ErrorKind::Parse,
                        "missing_down_for_up: a second `up` directive was found before a matching `down`"
                    );
                }
                Event::Text(_) => i += 1,
            }
        }
        let down_event_idx = match down_event_idx {
            Some(idx) => idx,
            None => bail_fmt!(ErrorKind::Parse, "missing_down_for_up: no matching `down` directive"),
        };

        let up_body = join_text(&events[body_start..down_event_idx]);

        i = down_start_body;
        let down_body_end = events[i..]
            .iter()
            .position(|e| matches!(e, Event::Up(_, _)) || matches!(e, Event::Down(_, _)))
            .map(|off| i + off)
            .unwrap_or(events.len());
        let down_body = join_text(&events[i..down_body_end]);
        i = down_body_end;

        let _ = up_start;
        sections.push(Section {
            up_body,
            up_options: up_opts,
            down_body,
            down_options: down_opts.unwrap(),
        });
    }

    if sections.is_empty() {
        bail_fmt!(ErrorKind::Parse, "missing_down_for_up: no complete up/down pair found");
    }
    if up_count != down_count {
        bail_fmt!(
            ErrorKind::Parse,
            "missing_down_for_up: {} up directive(s) but {} down directive(s)",
            up_count,
            down_count
        );
    }

    Ok(ParsedMigration { sections })
}

fn join_text(events: &[Event]) -> String {
    let mut out = String::new();
    for e in events {
        if let Event::Text(line) = e {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.trim().to_owned()
}

/// The decimal-digit prefix of a migration filename -- the only part of the
/// name that participates in identity. `descriptor` is free text and is
/// discarded.
pub fn version_of(file_name: &str) -> Option<String> {
    let digits: String = file_name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "-- migrate:up\nCREATE TABLE users (id INT);\n-- migrate:down\nDROP TABLE users;\n";

    #[test]
    fn parses_single_section() {
        let m = parse(SIMPLE).unwrap();
        assert_eq!(m.sections.len(), 1);
        assert_eq!(m.sections[0].up_body, "CREATE TABLE users (id INT);");
        assert_eq!(m.sections[0].down_body, "DROP TABLE users;");
        assert!(m.sections[0].up_options.transaction);
    }

    #[test]
    fn parses_multiple_sections() {
        let src = "-- migrate:up\nCREATE TABLE a(id INT);\n-- migrate:down\nDROP TABLE a;\n\
                   -- migrate:up\nCREATE TABLE b(id INT);\n-- migrate:down\nDROP TABLE b;\n";
        let m = parse(src).unwrap();
        assert_eq!(m.sections.len(), 2);
        assert_eq!(m.sections[1].up_body, "CREATE TABLE b(id INT);");
    }

    #[test]
    fn parses_transaction_false_option() {
        let src = "-- migrate:up transaction:false\nCREATE TYPE colors AS ENUM ('red');\n\
                   -- migrate:down transaction:false\nDROP TYPE colors;\n";
        let m = parse(src).unwrap();
        assert_eq!(m.sections[0].up_options.transaction, false);
        assert_eq!(m.sections[0].down_options.transaction, false);
    }

    #[test]
    fn rejects_leading_sql() {
        let src = "CREATE TABLE oops(id int);\n-- migrate:up\nSELECT 1;\n-- migrate:down\nSELECT 1;\n";
        let err = parse(src).unwrap_err();
        assert!(err.to_string().contains("leading_sql_before_up"));
    }

    #[test]
    fn allows_leading_comments() {
        let src = "-- a license header\n-- another comment\n-- migrate:up\nSELECT 1;\n-- migrate:down\nSELECT 1;\n";
        assert!(parse(src).is_ok());
    }

    #[test]
    fn rejects_missing_down() {
        let src = "-- migrate:up\nSELECT 1;\n";
        let err = parse(src).unwrap_err();
        assert!(err.to_string().contains("missing_down_for_up"));
    }

    #[test]
    fn rejects_double_up() {
        let src = "-- migrate:up\nSELECT 1;\n-- migrate:up\nSELECT 2;\n-- migrate:down\nSELECT 1;\n";
        let err = parse(src).unwrap_err();
        assert!(err.to_string().contains("missing_down_for_up"));
    }

    #[test]
    fn rejects_unknown_option() {
        let src = "-- migrate:up retries:3\nSELECT 1;\n-- migrate:down\nSELECT 1;\n";
        let err = parse(src).unwrap_err();
        assert!(err.to_string().contains("unknown_option"));
    }

    #[test]
    fn rejects_bad_option_value() {
        let src = "-- migrate:up transaction:maybe\nSELECT 1;\n-- migrate:down\nSELECT 1;\n";
        let err = parse(src).unwrap_err();
        assert!(err.to_string().contains("bad_option_value"));
    }

    #[test]
    fn rejects_empty_file() {
        assert!(parse("").is_err());
        assert!(parse("   \n\n").is_err());
    }

    #[test]
    fn directive_inside_block_comment_text_is_not_a_directive() {
        // Not anchored at line-start after non-whitespace, so it must not match.
        let src = "-- migrate:up\nSELECT '-- migrate:up this is just a string literal';\n-- migrate:down\nSELECT 1;\n";
        let m = parse(src).unwrap();
        assert_eq!(m.sections.len(), 1);
        assert!(m.sections[0].up_body.contains("this is just a string literal"));
    }

    #[test]
    fn version_of_takes_digit_prefix() {
        assert_eq!(version_of("20200101000000_users.sql").as_deref(), Some("20200101000000"));
        assert_eq!(version_of("not_a_version.sql"), None);
    }
}

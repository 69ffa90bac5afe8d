//! Low-level Debian control-file tokenizer.
//!
//! A control file is a sequence of paragraphs separated by blank lines.
//! Each paragraph is a sequence of `Key: value` lines; a line beginning
//! with whitespace is a continuation of the previous field's value
//! (used by Release's `MD5Sum:`/`SHA256:` hash-list sections, where each
//! indented line is one `<hexhash> <size> <relpath>` entry).

use std::collections::HashMap;

use nom::{
    bytes::complete::{tag, take_until},
    character::complete::space0,
    combinator::verify,
    sequence::{separated_pair, terminated},
    IResult, Parser,
};

/// One paragraph: field name -> (first-line value, continuation lines).
///
/// `value` is the text following `Key:` on the same line (may be empty,
/// as in a hash-list header). `continuations` holds each subsequent
/// indented line with its single leading whitespace character stripped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Field {
    pub value: String,
    pub continuations: Vec<String>,
}

impl Field {
    /// All non-empty lines belonging to this field: the first-line value
    /// (if non-empty) followed by every continuation line.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.value.as_str())
            .filter(|s| !s.is_empty())
            .chain(self.continuations.iter().map(|s| s.as_str()))
    }
}

pub type Paragraph = HashMap<String, Field>;

#[inline]
fn key_name(input: &str) -> IResult<&str, &str> {
    verify(take_until(":"), |s: &str| {
        !s.is_empty() && !s.starts_with(['\n', ' ', '\t'])
    })
    .parse(input)
}

#[inline]
fn separator(input: &str) -> IResult<&str, ()> {
    (nom::character::complete::char(':'), space0)
        .map(|_| ())
        .parse(input)
}

#[inline]
fn rest_of_line(input: &str) -> IResult<&str, &str> {
    take_until("\n")(input)
}

#[inline]
fn key_value_line(input: &str) -> IResult<&str, (&str, &str)> {
    terminated(separated_pair(key_name, separator, rest_of_line), tag("\n")).parse(input)
}

fn is_continuation(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}

/// Splits `input` into paragraphs, each a map of field name to [`Field`].
///
/// A blank line (or end of input) terminates the current paragraph.
/// Field names are matched case-sensitively, as Debian control files do.
pub fn parse_paragraphs(input: &str) -> Vec<Paragraph> {
    let mut paragraphs = Vec::new();
    let mut current: Paragraph = Paragraph::new();
    let mut last_key: Option<String> = None;
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('\n') {
            // blank line: paragraph boundary
            rest = stripped;
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
                last_key = None;
            }
            continue;
        }

        if is_continuation(rest) {
            let line_end = rest.find('\n').unwrap_or(rest.len());
            let line = rest[1..line_end].to_string();
            if let Some(key) = &last_key {
                if let Some(field) = current.get_mut(key) {
                    field.continuations.push(line);
                }
            }
            rest = if line_end < rest.len() {
                &rest[line_end + 1..]
            } else {
                ""
            };
            continue;
        }

        match key_value_line(rest) {
            Ok((remainder, (key, value))) => {
                current.insert(
                    key.to_string(),
                    Field {
                        value: value.to_string(),
                        continuations: Vec::new(),
                    },
                );
                last_key = Some(key.to_string());
                rest = remainder;
            }
            Err(_) => {
                // malformed line with no trailing newline: consume the rest
                // as the final (keyless) fragment and stop.
                break;
            }
        }
    }

    if !current.is_empty() {
        paragraphs.push(current);
    }

    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_name() {
        assert_eq!(key_name("name: value"), Ok((": value", "name")));
    }

    #[test]
    fn test_separator() {
        assert_eq!(separator(": value"), Ok(("value", ())));
        assert_eq!(separator(": \tvalue"), Ok(("value", ())));
    }

    #[test]
    fn test_key_value_line() {
        assert_eq!(
            key_value_line("Package: zsync\n"),
            Ok(("", ("Package", "zsync")))
        );
    }

    #[test]
    fn single_paragraph_simple_fields() {
        let input = "Package: zsync\nVersion: 0.6.2-1\nArchitecture: amd64\n";
        let paragraphs = parse_paragraphs(input);
        assert_eq!(paragraphs.len(), 1);
        assert_eq!(paragraphs[0]["Package"].value, "zsync");
        assert_eq!(paragraphs[0]["Version"].value, "0.6.2-1");
    }

    #[test]
    fn multiple_paragraphs_separated_by_blank_line() {
        let input = "Package: a\nVersion: 1\n\nPackage: b\nVersion: 2\n";
        let paragraphs = parse_paragraphs(input);
        assert_eq!(paragraphs.len(), 2);
        assert_eq!(paragraphs[1]["Package"].value, "b");
    }

    #[test]
    fn hash_section_continuations_are_collected() {
        let input = "Origin: Debian\nMD5Sum:\n 0123456789abcdef0123456789abcdef 1234 main/Packages\n deadbeefdeadbeefdeadbeefdeadbeef 5678 main/Packages.gz\nSHA256:\n abc 1234 main/Packages\n";
        let paragraphs = parse_paragraphs(input);
        assert_eq!(paragraphs.len(), 1);
        let md5 = &paragraphs[0]["MD5Sum"];
        assert_eq!(md5.value, "");
        assert_eq!(md5.continuations.len(), 2);
        assert_eq!(
            md5.continuations[0],
            "0123456789abcdef0123456789abcdef 1234 main/Packages"
        );
        let sha256 = &paragraphs[0]["SHA256"];
        assert_eq!(sha256.continuations.len(), 1);
    }

    #[test]
    fn field_lines_iterates_value_then_continuations() {
        let field = Field {
            value: String::new(),
            continuations: vec!["a".into(), "b".into()],
        };
        let lines: Vec<&str> = field.lines().collect();
        assert_eq!(lines, vec!["a", "b"]);
    }
}

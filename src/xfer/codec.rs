//! Line-oriented sync message codec.
//!
//! One message per `\n`-terminated line, at most 5 whitespace-separated
//! tokens. A `file` line is followed by exactly SIZE raw bytes before the
//! next line starts. Blank lines and `#` comments are skipped.
//!
//! Free text (`message`, `error`, `cookie`, user names) is escaped so it
//! always stays a single token.

use crate::hash::ArtifactId;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Maximum tokens on one line
pub const MAX_TOKENS: usize = 5;

// =============================================================================
// Text escaping
// =============================================================================

/// Escape free text into a single wire token.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            '\x0b' => out.push_str("\\v"),
            '\x0c' => out.push_str("\\f"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`]. Unknown escapes decode to the escaped character.
pub fn unescape(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('v') => out.push('\x0b'),
            Some('f') => out.push('\x0c'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

// =============================================================================
// Messages
// =============================================================================

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Login {
        user: String,
        nonce: String,
        signature: String,
    },
    Pull {
        server_code: String,
        project_code: String,
    },
    Push {
        server_code: String,
        project_code: String,
    },
    Clone,
    Gimme(ArtifactId),
    Igot(ArtifactId),
    File {
        id: ArtifactId,
        delta_source: Option<ArtifactId>,
        content: Bytes,
    },
    Cookie(String),
    Message(String),
    Error(String),
}

impl Message {
    pub fn verb(&self) -> &'static str {
        match self {
            Message::Login { .. } => "login",
            Message::Pull { .. } => "pull",
            Message::Push { .. } => "push",
            Message::Clone => "clone",
            Message::Gimme(_) => "gimme",
            Message::Igot(_) => "igot",
            Message::File { .. } => "file",
            Message::Cookie(_) => "cookie",
            Message::Message(_) => "message",
            Message::Error(_) => "error",
        }
    }

    /// Append the wire form of this message to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Message::Login {
                user,
                nonce,
                signature,
            } => put_line(out, &["login", &escape(user), nonce, signature]),
            Message::Pull {
                server_code,
                project_code,
            } => put_line(out, &["pull", server_code, project_code]),
            Message::Push {
                server_code,
                project_code,
            } => put_line(out, &["push", server_code, project_code]),
            Message::Clone => put_line(out, &["clone"]),
            Message::Gimme(id) => put_line(out, &["gimme", id.as_str()]),
            Message::Igot(id) => put_line(out, &["igot", id.as_str()]),
            Message::File {
                id,
                delta_source,
                content,
            } => {
                let size = content.len().to_string();
                match delta_source {
                    Some(src) => put_line(out, &["file", id.as_str(), src.as_str(), &size]),
                    None => put_line(out, &["file", id.as_str(), &size]),
                }
                out.put_slice(content);
            }
            Message::Cookie(text) => put_line(out, &["cookie", &escape(text)]),
            Message::Message(text) => put_line(out, &["message", &escape(text)]),
            Message::Error(text) => put_line(out, &["error", &escape(text)]),
        }
    }

    /// Encoded form as a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }
}

fn put_line(out: &mut BytesMut, tokens: &[&str]) {
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.put_u8(b' ');
        }
        out.put_slice(token.as_bytes());
    }
    out.put_u8(b'\n');
}

// =============================================================================
// Parsing
// =============================================================================

/// Why a line could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown verb or wrong structure; carries the offending line
    BadCommand(String),
    /// A `file` line with bad arity, id, size, or a truncated payload
    MalformedFile,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadCommand(line) => write!(f, "bad command: {}", line),
            ParseError::MalformedFile => f.write_str("malformed file line"),
        }
    }
}

/// A tokenized line.
#[derive(Debug, Clone)]
pub struct Line {
    /// The line without its terminator
    pub text: String,
    pub tokens: Vec<String>,
}

/// Reads messages from one batch.
pub struct BatchReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> BatchReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    /// Next non-blank, non-comment line.
    pub fn next_line(&mut self) -> Option<Line> {
        loop {
            if self.pos >= self.input.len() {
                return None;
            }
            let rest = &self.input[self.pos..];
            let (raw, consumed) = match rest.iter().position(|&b| b == b'\n') {
                Some(n) => (&rest[..n], n + 1),
                None => (rest, rest.len()),
            };
            self.pos += consumed;

            let text = String::from_utf8_lossy(raw).trim_end_matches('\r').to_string();
            if text.trim().is_empty() || text.trim_start().starts_with('#') {
                continue;
            }
            let tokens = text.split_ascii_whitespace().map(str::to_string).collect();
            return Some(Line { text, tokens });
        }
    }

    /// Consume exactly `size` payload bytes.
    pub fn read_payload(&mut self, size: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(size)?;
        if end > self.input.len() {
            return None;
        }
        let payload = &self.input[self.pos..end];
        self.pos = end;
        Some(payload)
    }

    /// Read and parse the next message, consuming a file payload if any.
    pub fn next_message(&mut self) -> Option<(Line, Result<Message, ParseError>)> {
        let line = self.next_line()?;
        let parsed = self.parse(&line);
        Some((line, parsed))
    }

    fn parse(&mut self, line: &Line) -> Result<Message, ParseError> {
        let bad = || ParseError::BadCommand(line.text.clone());
        let t = &line.tokens;
        if t.len() > MAX_TOKENS {
            return Err(bad());
        }

        let message = match (t[0].as_str(), t.len()) {
            ("login", 4) => Message::Login {
                user: unescape(&t[1]),
                nonce: t[2].clone(),
                signature: t[3].clone(),
            },
            ("pull", 3) => Message::Pull {
                server_code: t[1].clone(),
                project_code: t[2].clone(),
            },
            ("push", 3) => Message::Push {
                server_code: t[1].clone(),
                project_code: t[2].clone(),
            },
            ("clone", 1) => Message::Clone,
            ("gimme", 2) => Message::Gimme(ArtifactId::parse(&t[1]).ok_or_else(bad)?),
            ("igot", 2) => Message::Igot(ArtifactId::parse(&t[1]).ok_or_else(bad)?),
            ("file", _) => self.parse_file(t)?,
            ("cookie", 2) => Message::Cookie(unescape(&t[1])),
            ("message", 2) => Message::Message(unescape(&t[1])),
            ("error", 2) => Message::Error(unescape(&t[1])),
            _ => return Err(bad()),
        };
        Ok(message)
    }

    fn parse_file(&mut self, t: &[String]) -> Result<Message, ParseError> {
        let (id, delta_source, size) = match t.len() {
            3 => (&t[1], None, &t[2]),
            4 => (&t[1], Some(&t[2]), &t[3]),
            _ => return Err(ParseError::MalformedFile),
        };
        let id = ArtifactId::parse(id).ok_or(ParseError::MalformedFile)?;
        let delta_source = match delta_source {
            Some(src) => Some(ArtifactId::parse(src).ok_or(ParseError::MalformedFile)?),
            None => None,
        };
        if !size.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::MalformedFile);
        }
        let size: usize = size.parse().map_err(|_| ParseError::MalformedFile)?;
        let content = self
            .read_payload(size)
            .ok_or(ParseError::MalformedFile)?;

        Ok(Message::File {
            id,
            delta_source,
            content: Bytes::copy_from_slice(content),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(content: &[u8]) -> ArtifactId {
        ArtifactId::of(content)
    }

    #[test]
    fn test_escape_roundtrip() {
        let text = "not authorized\tto \\write\n\0";
        let escaped = escape(text);
        assert!(!escaped.contains(' '));
        assert!(!escaped.contains('\n'));
        assert_eq!(unescape(&escaped), text);
    }

    #[test]
    fn test_unescape_unknown_and_trailing() {
        assert_eq!(unescape("a\\qb"), "aqb");
        assert_eq!(unescape("end\\"), "end\\");
    }

    #[test]
    fn test_file_with_payload_then_next_line() {
        let content = Bytes::from_static(b"line one\nline two\n");
        let mut out = BytesMut::new();
        Message::File {
            id: id(&content),
            delta_source: None,
            content: content.clone(),
        }
        .encode(&mut out);
        Message::Igot(id(b"x")).encode(&mut out);

        let mut reader = BatchReader::new(&out);
        let (_, first) = reader.next_message().unwrap();
        match first.unwrap() {
            Message::File {
                id: got,
                delta_source,
                content: payload,
            } => {
                assert_eq!(got, id(&content));
                assert!(delta_source.is_none());
                assert_eq!(payload, content);
            }
            other => panic!("Expected File, got {:?}", other),
        }
        let (_, second) = reader.next_message().unwrap();
        assert_eq!(second.unwrap(), Message::Igot(id(b"x")));
        assert!(reader.next_message().is_none());
    }

    #[test]
    fn test_file_with_delta_source() {
        let src = id(b"base");
        let line = format!("file {} {} 3\nabc", id(b"abc"), src);
        let mut reader = BatchReader::new(line.as_bytes());
        let (_, msg) = reader.next_message().unwrap();
        match msg.unwrap() {
            Message::File { delta_source, .. } => assert_eq!(delta_source, Some(src)),
            other => panic!("Expected File, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_file_lines() {
        let good = id(b"abc");
        let cases = [
            format!("file {} abc\nabc", good),
            format!("file {} -3\nabc", good),
            format!("file {} +3\nabc", good),
            format!("file {} 3", good),
            format!("file nothex 3\nabc"),
            format!("file {} zz 3\nabc", good),
            format!("file {}\n", good),
            format!("file {} {} {} 3\nabc", good, good, good),
        ];
        for case in cases {
            let mut reader = BatchReader::new(case.as_bytes());
            let (_, msg) = reader.next_message().unwrap();
            assert_eq!(msg, Err(ParseError::MalformedFile), "case: {:?}", case);
        }
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let input = b"# header comment\n\n   \npull abc def\n";
        let mut reader = BatchReader::new(input);
        let (_, msg) = reader.next_message().unwrap();
        assert_eq!(
            msg.unwrap(),
            Message::Pull {
                server_code: "abc".to_string(),
                project_code: "def".to_string()
            }
        );
        assert!(reader.next_message().is_none());
    }

    #[test]
    fn test_indented_comment_skipped() {
        let input = b"  # indented comment\n\t# tabbed\nigot 0000000000000000000000000000000000000000\n";
        let mut reader = BatchReader::new(input);
        let (_, msg) = reader.next_message().unwrap();
        assert!(matches!(msg, Ok(Message::Igot(_))));
        assert!(reader.next_message().is_none());
    }

    #[test]
    fn test_bad_commands() {
        for input in [
            "bogus verb\n",
            "gimme 1234\n",
            "pull onlyone\n",
            "a b c d e f\n",
            "clone extra\n",
        ] {
            let mut reader = BatchReader::new(input.as_bytes());
            let (line, msg) = reader.next_message().unwrap();
            assert_eq!(msg, Err(ParseError::BadCommand(line.text.clone())));
        }
    }

    #[test]
    fn test_remaining_after_login() {
        let input = b"login bob n s\npull a b\n";
        let mut reader = BatchReader::new(input);
        reader.next_message().unwrap();
        assert_eq!(reader.remaining(), b"pull a b\n");
    }

    #[test]
    fn test_text_messages_keep_spaces() {
        let encoded = Message::Error("not authorized to write".to_string()).to_bytes();
        assert_eq!(encoded.as_ref(), b"error not\\sauthorized\\sto\\swrite\n");
        let mut reader = BatchReader::new(&encoded);
        let (_, msg) = reader.next_message().unwrap();
        assert_eq!(
            msg.unwrap(),
            Message::Error("not authorized to write".to_string())
        );
    }
}

//! Parsing for control-port replies.
//!
//! A reply is one or more lines of the form `250-text`, `250+text`
//! (followed by a dot-terminated data block), ending with a `250 text`
//! line.  Asynchronous events use code 650 and are handled separately in
//! [`crate::events`].

use crate::Error;

/// The status code that introduces an asynchronous event.
pub(crate) const EVENT_CODE: u16 = 650;

/// How one reply line continues (or ends) the reply it belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LineKind {
    /// A `-` line: more lines follow.
    Middle,
    /// A `+` line: a dot-terminated data block follows, then more lines.
    Data,
    /// A ` ` line: this is the final line of the reply.
    Final,
}

/// A single decoded reply line.
#[derive(Clone, Debug)]
pub(crate) struct ReplyLine {
    /// The three-digit status code.
    pub(crate) code: u16,
    /// Continuation marker.
    pub(crate) kind: LineKind,
    /// The text after the marker.
    pub(crate) text: String,
}

/// Split a raw control-port line into code, continuation kind, and text.
pub(crate) fn decode_line(line: &str) -> Result<ReplyLine, Error> {
    if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
        return Err(Error::Protocol(format!("short reply line: {:?}", line)));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| Error::Protocol(format!("bad status code in line: {:?}", line)))?;
    let kind = match &line[3..4] {
        "-" => LineKind::Middle,
        "+" => LineKind::Data,
        " " => LineKind::Final,
        _ => {
            return Err(Error::Protocol(format!(
                "bad continuation marker in line: {:?}",
                line
            )))
        }
    };
    Ok(ReplyLine {
        code,
        kind,
        text: line[4..].to_owned(),
    })
}

/// A complete reply to one control-port command.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Reply {
    /// The status code of the final reply line.
    pub code: u16,
    /// All reply lines, in order, without their code prefixes.
    pub lines: Vec<String>,
}

impl Reply {
    /// Return true if the controller reported success.
    pub fn is_positive(&self) -> bool {
        self.code / 100 == 2
    }

    /// Return the text of the first reply line, or an empty string.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    /// Convert a negative reply into a [`Error::Rejected`].
    pub(crate) fn into_result(self) -> Result<Reply, Error> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(Error::Rejected {
                code: self.code,
                msg: self.lines.join(" / "),
            })
        }
    }

    /// Search all reply lines for a `KEY=VALUE` or `KEY="VALUE"` pair and
    /// return the value.
    ///
    /// This is how replies such as PROTOCOLINFO carry their attributes.
    pub fn find_value(&self, key: &str) -> Option<String> {
        for line in &self.lines {
            for word in split_quoted(line) {
                if let Some(rest) = word.strip_prefix(key) {
                    if let Some(value) = rest.strip_prefix('=') {
                        return Some(unquote(value));
                    }
                }
            }
        }
        None
    }
}

/// Split a reply line on spaces, keeping double-quoted spans together.
pub(crate) fn split_quoted(line: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let bytes = line.as_bytes();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b' ' if !in_quotes => {
                if i > start {
                    words.push(&line[start..i]);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < line.len() {
        words.push(&line[start..]);
    }
    words
}

/// Strip one level of surrounding double quotes, if present.
pub(crate) fn unquote(s: &str) -> String {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
        .to_owned()
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn decode_kinds() {
        let l = decode_line("250 OK").unwrap();
        assert_eq!((l.code, l.kind, l.text.as_str()), (250, LineKind::Final, "OK"));
        let l = decode_line("250-AUTH METHODS=COOKIE").unwrap();
        assert_eq!(l.kind, LineKind::Middle);
        let l = decode_line("250+info=").unwrap();
        assert_eq!(l.kind, LineKind::Data);
        assert!(decode_line("25").is_err());
        assert!(decode_line("xyz OK").is_err());
        assert!(decode_line("250?OK").is_err());
    }

    #[test]
    fn reply_results() {
        let ok = Reply {
            code: 250,
            lines: vec!["EXTENDED 7".into()],
        };
        assert!(ok.is_positive());
        assert_eq!(ok.first_line(), "EXTENDED 7");
        assert!(ok.into_result().is_ok());

        let bad = Reply {
            code: 552,
            lines: vec!["Unknown circuit \"99\"".into()],
        };
        match bad.into_result() {
            Err(Error::Rejected { code: 552, .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn find_values() {
        let reply = Reply {
            code: 250,
            lines: vec![
                "PROTOCOLINFO 1".into(),
                "AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/var/run/tor data/control_auth_cookie\"".into(),
                "VERSION Tor=\"0.4.8.9\"".into(),
            ],
        };
        assert_eq!(
            reply.find_value("METHODS").unwrap(),
            "COOKIE,SAFECOOKIE"
        );
        assert_eq!(
            reply.find_value("COOKIEFILE").unwrap(),
            "/var/run/tor data/control_auth_cookie"
        );
        assert!(reply.find_value("NOSUCH").is_none());
    }
}

//! TOON journal format parser using nom
//!
//! File format:
//! ```text
//! TOON001
//! [version: u32]
//! [row_count: u32]
//! ...TOON lines (\n-terminated)...
//! ```
//!
//! Journal lines:
//! ```text
//! Post{id,name}: 1,"Hibernate Master Class"
//! PostDetails{id,created_on,post}: 1,@1700000000000,1
//! Comment!{id}: 3
//! ```
//!
//! The first form writes a full row, the `!` form deletes it. Values are
//! `~` (null), `true`/`false`, integers, `@millis` timestamps and
//! double-quoted strings.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, digit1, space0},
    combinator::{map, map_res, opt, recognize},
    error::ErrorKind,
    multi::separated_list1,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

use crate::error::{Error, Result};
use crate::schema::ID_COLUMN;
use crate::value::{Id, Value};

/// Magic header for TOON files
pub const TOON_MAGIC: &[u8] = b"TOON001\n";

/// Magic header for TOON index files
pub const TOON_IDX_MAGIC: &[u8] = b"TOONIDX1";

/// TOON file header
#[derive(Debug, Clone, PartialEq)]
pub struct ToonHeader {
    /// File format version
    pub version: u32,
    /// Number of rows in the file
    pub row_count: u32,
}

/// Parse TOON file header
///
/// Format:
/// ```text
/// TOON001\n
/// [4 bytes: version u32 little-endian]
/// [4 bytes: row_count u32 little-endian]
/// ```
pub fn parse_header(input: &[u8]) -> Result<ToonHeader> {
    if input.len() < TOON_MAGIC.len() + 8 {
        return Err(Error::Parse("Input too short for header".to_string()));
    }

    if &input[0..TOON_MAGIC.len()] != TOON_MAGIC {
        return Err(Error::Parse("Invalid TOON magic header".to_string()));
    }

    let version_bytes = &input[TOON_MAGIC.len()..TOON_MAGIC.len() + 4];
    let row_count_bytes = &input[TOON_MAGIC.len() + 4..TOON_MAGIC.len() + 8];

    let version = u32::from_le_bytes([
        version_bytes[0],
        version_bytes[1],
        version_bytes[2],
        version_bytes[3],
    ]);

    let row_count = u32::from_le_bytes([
        row_count_bytes[0],
        row_count_bytes[1],
        row_count_bytes[2],
        row_count_bytes[3],
    ]);

    Ok(ToonHeader { version, row_count })
}

/// Create a TOON file header
pub fn create_header(version: u32, row_count: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(TOON_MAGIC.len() + 8);
    header.extend_from_slice(TOON_MAGIC);
    header.extend_from_slice(&version.to_le_bytes());
    header.extend_from_slice(&row_count.to_le_bytes());
    header
}

/// Parse a single TOON line (raw, no interpretation)
///
/// Returns the line content without the trailing newline
pub fn parse_line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_until("\n"), char('\n'))(input)
}

/// A journal record
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Full row image
    Upsert {
        /// Table name
        table: String,
        /// Column names, `id` first
        columns: Vec<String>,
        /// Row identifier
        id: Id,
        /// Values for the remaining columns
        values: Vec<Value>,
    },
    /// Row removal
    Delete {
        /// Table name
        table: String,
        /// Row identifier
        id: Id,
    },
}

/// Encode a record as a TOON line (without the trailing newline)
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut line = String::new();
    match record {
        Record::Upsert {
            table,
            columns,
            id,
            values,
        } => {
            line.push_str(table);
            line.push('{');
            line.push_str(&columns.join(","));
            line.push_str("}: ");
            line.push_str(&id.to_string());
            for value in values {
                line.push(',');
                encode_value(value, &mut line);
            }
        }
        Record::Delete { table, id } => {
            line.push_str(table);
            line.push_str("!{id}: ");
            line.push_str(&id.to_string());
        }
    }
    line.into_bytes()
}

fn encode_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push('~'),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Timestamp(ms) => {
            out.push('@');
            out.push_str(&ms.to_string());
        }
        Value::Text(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
    }
}

/// Decode one journal line
pub fn decode_record(line: &[u8]) -> Result<Record> {
    let text = std::str::from_utf8(line)
        .map_err(|e| Error::Parse(format!("journal line is not UTF-8: {}", e)))?;
    let (rest, record) = record(text)?;
    if !rest.trim().is_empty() {
        return Err(Error::Parse(format!("trailing input: {}", rest)));
    }
    Ok(record)
}

fn record(input: &str) -> IResult<&str, Record> {
    let (input, table) = identifier(input)?;
    let (input, deleted) = opt(char('!'))(input)?;
    let (input, columns) = delimited(
        char('{'),
        separated_list1(char(','), identifier),
        char('}'),
    )(input)?;
    let (input, _) = pair(char(':'), space0)(input)?;
    let (input, values) = separated_list1(char(','), value_literal)(input)?;

    let id = match (columns.first(), values.first()) {
        (Some(column), Some(v)) if *column == ID_COLUMN => v.as_id(),
        _ => None,
    };
    let id = match id {
        Some(id) if columns.len() == values.len() => id,
        _ => return Err(nom::Err::Failure(nom::error::Error::new(input, ErrorKind::Verify))),
    };

    let record = if deleted.is_some() {
        Record::Delete {
            table: table.to_string(),
            id,
        }
    } else {
        Record::Upsert {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            id,
            values: values[1..].to_vec(),
        }
    };
    Ok((input, record))
}

/// Table, column, alias and parameter names
pub(crate) fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn integer(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
        s.parse::<i64>()
    })(input)
}

/// A single literal value
pub(crate) fn value_literal(input: &str) -> IResult<&str, Value> {
    alt((
        map(char('~'), |_| Value::Null),
        map(tag("true"), |_| Value::Bool(true)),
        map(tag("false"), |_| Value::Bool(false)),
        map(preceded(char('@'), integer), Value::Timestamp),
        map(integer, Value::Int),
        map(quoted, Value::Text),
    ))(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"')(input)?;
    let mut out = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            None => return Err(nom::Err::Error(nom::error::Error::new(rest, ErrorKind::Char))),
            Some('"') => return Ok((&rest[1..], out)),
            Some('\\') => match chars.next() {
                Some(c) => {
                    out.push(match c {
                        'n' => '\n',
                        'r' => '\r',
                        other => other,
                    });
                    rest = &rest[1 + c.len_utf8()..];
                }
                None => {
                    return Err(nom::Err::Error(nom::error::Error::new(rest, ErrorKind::Escaped)))
                }
            },
            Some(c) => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let header = create_header(1, 42);
        let parsed = parse_header(&header).unwrap();

        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.row_count, 42);
    }

    #[test]
    fn test_parse_header_invalid_magic() {
        let mut header = create_header(1, 0);
        header[0] = b'X'; // Corrupt magic

        let result = parse_header(&header);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_header_too_short() {
        let header = b"TOON001\n";
        let result = parse_header(header);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_line() {
        let input = b"Post{id,name}: 1,\"a\"\nmore data";
        let (remaining, line) = parse_line(input).unwrap();

        assert_eq!(line, b"Post{id,name}: 1,\"a\"");
        assert_eq!(remaining, b"more data");
    }

    #[test]
    fn test_decode_upsert() {
        let record = decode_record(b"PostDetails{id,created_on,post}: 1,@1700000000000,1").unwrap();
        assert_eq!(
            record,
            Record::Upsert {
                table: "PostDetails".into(),
                columns: vec!["id".into(), "created_on".into(), "post".into()],
                id: 1,
                values: vec![Value::Timestamp(1_700_000_000_000), Value::Int(1)],
            }
        );
    }

    #[test]
    fn test_decode_delete() {
        let record = decode_record(b"Comment!{id}: 3").unwrap();
        assert_eq!(
            record,
            Record::Delete {
                table: "Comment".into(),
                id: 3
            }
        );
    }

    #[test]
    fn test_text_escapes_survive_encoding() {
        let record = Record::Upsert {
            table: "Comment".into(),
            columns: vec!["id".into(), "review".into(), "post".into()],
            id: 2,
            values: vec![Value::Text("say \"hi\",\nthen \\ leave".into()), Value::Null],
        };
        let line = encode_record(&record);
        assert!(!line.contains(&b'\n'));
        assert_eq!(decode_record(&line).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        assert!(decode_record(b"Post{name}: \"x\"").is_err());
        assert!(decode_record(b"Post{id,name}: 1").is_err());
    }

    #[test]
    fn test_value_literals() {
        assert_eq!(value_literal("~").unwrap().1, Value::Null);
        assert_eq!(value_literal("false").unwrap().1, Value::Bool(false));
        assert_eq!(value_literal("-12").unwrap().1, Value::Int(-12));
        assert_eq!(value_literal("\"\"").unwrap().1, Value::Text(String::new()));
    }

    #[test]
    fn test_create_header_format() {
        let header = create_header(1, 100);

        assert_eq!(&header[0..8], TOON_MAGIC);
        assert_eq!(u32::from_le_bytes([header[8], header[9], header[10], header[11]]), 1);
        assert_eq!(u32::from_le_bytes([header[12], header[13], header[14], header[15]]), 100);
    }
}

//! Zone master-file parsing.
//!
//! Each record becomes a `(key, text)` pair for the store: the key is
//! `"<owner>_<type number>"` and the text is the record in canonical
//! one-line form, `"<owner> <ttl> IN <TYPE> <rdata>"`. The same text is
//! parsed back into a DNS record when a query is answered.

use std::fmt;
use std::str::FromStr;

use dnsraft_common::error::{StoreError, StoreResult};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use hickory_proto::serialize::txt::RDataParser;

/// TTL used when neither the record, `$TTL`, nor a previous record gives one.
pub const DEFAULT_TTL: u32 = 3600;

fn dns_name(name: &str) -> StoreResult<Name> {
    Name::from_ascii(name).map_err(|err| StoreError::Codec(format!("invalid name {:?}: {}", name, err)))
}

fn quoted(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Presentation form of `rdata`. Character strings are always quoted so
/// that embedded spaces survive a round trip.
fn rdata_text(rdata: &RData) -> String {
    match rdata {
        RData::TXT(txt) => txt
            .txt_data()
            .iter()
            .map(|s| quoted(s))
            .collect::<Vec<_>>()
            .join(" "),
        RData::HINFO(hinfo) => format!("{} {}", quoted(hinfo.cpu()), quoted(hinfo.os())),
        other => other.to_string(),
    }
}

/// One resource record with a fully qualified, lowercase owner name.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRecord {
    pub name: String,
    pub ttl: u32,
    pub data: RData,
}

impl ZoneRecord {
    pub fn record_type(&self) -> RecordType {
        self.data.record_type()
    }

    /// Store key for this record's owner and type.
    pub fn key(&self) -> String {
        record_key(&self.name, self.record_type())
    }

    /// Parses the canonical text produced by `Display`.
    pub fn from_text(text: &str) -> StoreResult<Self> {
        let tokens = tokenize(text, 1)?
            .into_iter()
            .filter(|t| !matches!(t, Token::Open | Token::Close))
            .collect();
        let mut ctx = ZoneParser::new(None);
        match ctx.parse_entry(tokens, false, 1)? {
            Some(record) => Ok(record),
            None => Err(StoreError::Parse {
                line: 1,
                message: "directive is not a record".into(),
            }),
        }
    }

    pub fn to_record(&self) -> StoreResult<Record> {
        let mut record = Record::from_rdata(dns_name(&self.name)?, self.ttl, self.data.clone());
        record.set_dns_class(DNSClass::IN);
        Ok(record)
    }
}

impl fmt::Display for ZoneRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} IN {} {}",
            self.name,
            self.ttl,
            self.record_type(),
            rdata_text(&self.data)
        )
    }
}

/// `"<name>_<type number>"`, with `name` fully qualified.
pub fn record_key(name: &str, record_type: RecordType) -> String {
    format!("{}_{}", name.to_ascii_lowercase(), u16::from(record_type))
}

/// Records parsed from a zone file plus the per-record failures.
#[derive(Debug, Default)]
pub struct ParsedZone {
    pub records: Vec<ZoneRecord>,
    pub errors: Vec<StoreError>,
}

/// Parses a whole zone file. Malformed records are collected in `errors`
/// and parsing continues with the next record.
pub fn parse_zone(input: &str, origin: Option<&str>) -> ParsedZone {
    let mut parser = ZoneParser::new(origin.map(absolute));
    let mut zone = ParsedZone::default();

    let mut pending = Vec::new();
    let mut depth = 0usize;
    let mut start_line = 0;
    let mut owner_omitted = false;
    let mut broken = false;

    for (idx, raw) in input.lines().enumerate() {
        let line = idx + 1;
        let tokens = match tokenize(raw, line) {
            Ok(tokens) => tokens,
            Err(err) => {
                zone.errors.push(err);
                if depth > 0 {
                    broken = true;
                }
                continue;
            }
        };
        if depth == 0 {
            if tokens.is_empty() {
                continue;
            }
            start_line = line;
            owner_omitted = raw.starts_with([' ', '\t']);
            broken = false;
        }

        for token in tokens {
            match token {
                Token::Open => depth += 1,
                Token::Close if depth == 0 => {
                    if !broken {
                        zone.errors.push(StoreError::Parse {
                            line,
                            message: "unbalanced ')'".into(),
                        });
                    }
                    broken = true;
                }
                Token::Close => depth -= 1,
                other => pending.push(other),
            }
        }

        if depth == 0 {
            let entry = std::mem::take(&mut pending);
            if broken || entry.is_empty() {
                continue;
            }
            match parser.parse_entry(entry, owner_omitted, start_line) {
                Ok(Some(record)) => zone.records.push(record),
                Ok(None) => {}
                Err(err) => zone.errors.push(err),
            }
        }
    }

    if depth > 0 {
        zone.errors.push(StoreError::Parse {
            line: start_line,
            message: "unterminated '('".into(),
        });
    }
    zone
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Open,
    Close,
}

fn tokenize(line: &str, line_no: usize) -> StoreResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ';' => break,
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                text.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => text.push(other),
                    }
                }
                if !closed {
                    return Err(StoreError::Parse {
                        line: line_no,
                        message: "unterminated quoted string".into(),
                    });
                }
                tokens.push(Token::Quoted(text));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, ';' | '(' | ')' | '"') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

fn rdata_words(tokens: Vec<Token>) -> Vec<String> {
    tokens
        .into_iter()
        .filter_map(|t| match t {
            Token::Word(s) | Token::Quoted(s) => Some(s),
            Token::Open | Token::Close => None,
        })
        .collect()
}

fn absolute(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with('.') {
        lower
    } else {
        format!("{}.", lower)
    }
}

/// Parses `3600`, `1h`, `1h30m`, `2d` and friends into seconds.
fn parse_ttl(text: &str) -> Option<u32> {
    if text.is_empty() || !text.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    if let Ok(seconds) = text.parse::<u32>() {
        return Some(seconds);
    }
    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            'w' => 604_800,
            _ => return None,
        };
        let value: u64 = digits.parse().ok()?;
        total += value * unit;
        digits.clear();
    }
    if !digits.is_empty() {
        total += digits.parse::<u64>().ok()?;
    }
    u32::try_from(total).ok()
}

/// Parser state carried between entries of one file.
struct ZoneParser {
    origin: Option<String>,
    default_ttl: Option<u32>,
    last_owner: Option<String>,
    last_ttl: Option<u32>,
}

impl ZoneParser {
    fn new(origin: Option<String>) -> Self {
        Self {
            origin,
            default_ttl: None,
            last_owner: None,
            last_ttl: None,
        }
    }

    fn qualify(&self, name: &str, line: usize) -> StoreResult<String> {
        let qualified = if name == "@" {
            self.origin.clone().ok_or_else(|| StoreError::Parse {
                line,
                message: "'@' used without $ORIGIN".into(),
            })?
        } else if name.ends_with('.') {
            name.to_ascii_lowercase()
        } else {
            match self.origin.as_deref() {
                Some(".") => format!("{}.", name.to_ascii_lowercase()),
                Some(origin) => format!("{}.{}", name.to_ascii_lowercase(), origin),
                None => {
                    return Err(StoreError::Parse {
                        line,
                        message: format!("relative name {:?} without $ORIGIN", name),
                    })
                }
            }
        };
        Name::from_ascii(&qualified).map_err(|err| StoreError::Parse {
            line,
            message: format!("invalid name {:?}: {}", qualified, err),
        })?;
        Ok(qualified)
    }

    /// Parses one logical entry. Directives return `None`.
    fn parse_entry(
        &mut self,
        tokens: Vec<Token>,
        owner_omitted: bool,
        line: usize,
    ) -> StoreResult<Option<ZoneRecord>> {
        let fail = |message: String| StoreError::Parse { line, message };
        let mut fields = tokens.into_iter().peekable();

        if !owner_omitted {
            if let Some(Token::Word(first)) = fields.peek() {
                if first.starts_with('$') {
                    let directive = first.to_ascii_uppercase();
                    fields.next();
                    let arg = match fields.next() {
                        Some(Token::Word(arg)) => arg,
                        _ => return Err(fail(format!("{} needs an argument", directive))),
                    };
                    match directive.as_str() {
                        "$ORIGIN" => {
                            let origin = if arg.ends_with('.') {
                                absolute(&arg)
                            } else {
                                self.qualify(&arg, line)?
                            };
                            self.origin = Some(origin);
                        }
                        "$TTL" => {
                            let ttl = parse_ttl(&arg)
                                .ok_or_else(|| fail(format!("invalid $TTL {:?}", arg)))?;
                            self.default_ttl = Some(ttl);
                        }
                        other => return Err(fail(format!("unsupported directive {}", other))),
                    }
                    return Ok(None);
                }
            }
        }

        let owner = if owner_omitted {
            self.last_owner
                .clone()
                .ok_or_else(|| fail("no previous owner name".into()))?
        } else {
            match fields.next() {
                Some(Token::Word(name)) => self.qualify(&name, line)?,
                _ => return Err(fail("expected an owner name".into())),
            }
        };

        let mut ttl = None;
        let rtype = loop {
            let word = match fields.next() {
                Some(Token::Word(word)) => word,
                Some(_) => return Err(fail("unexpected quoted string".into())),
                None => return Err(fail("missing record type".into())),
            };
            if let Some(value) = parse_ttl(&word) {
                if ttl.replace(value).is_some() {
                    return Err(fail("TTL given twice".into()));
                }
                continue;
            }
            match word.to_ascii_uppercase().as_str() {
                "IN" => continue,
                "CH" | "HS" | "CS" | "ANY" => {
                    return Err(fail(format!("unsupported class {}", word)))
                }
                _ => {}
            }
            break RecordType::from_str(&word.to_ascii_uppercase())
                .map_err(|_| fail(format!("unsupported record type {}", word)))?;
        };

        let rest: Vec<Token> = fields.collect();
        let data = self.parse_rdata(rtype, rest, line)?;
        let ttl = ttl
            .or(self.default_ttl)
            .or(self.last_ttl)
            .unwrap_or(DEFAULT_TTL);

        let record = ZoneRecord {
            name: owner.clone(),
            ttl,
            data,
        };
        // Reject what could not be sent on the wire, e.g. over-long strings.
        record
            .to_record()
            .and_then(|r| r.to_bytes().map_err(|err| StoreError::Codec(err.to_string())))
            .map_err(|err| fail(err.to_string()))?;

        self.last_owner = Some(owner);
        self.last_ttl = Some(ttl);
        Ok(Some(record))
    }

    fn parse_rdata(&self, rtype: RecordType, tokens: Vec<Token>, line: usize) -> StoreResult<RData> {
        let fail = |message: String| StoreError::Parse { line, message };
        let words = rdata_words(tokens);
        let origin = match self.origin.as_deref() {
            Some(origin) => Some(dns_name(origin).map_err(|err| fail(err.to_string()))?),
            None => None,
        };

        let rdata = RData::parse(rtype, words.iter().map(String::as_str), origin.as_ref())
            .map_err(|err| fail(format!("invalid {} rdata: {}", rtype, err)))?;

        // Stored text must read back as the same record.
        let text = rdata_text(&rdata);
        let reparsed = tokenize(&text, line).and_then(|tokens| {
            let words = rdata_words(tokens);
            RData::parse(rtype, words.iter().map(String::as_str), None)
                .map_err(|err| fail(err.to_string()))
        });
        match reparsed {
            Ok(again) if again == rdata => Ok(rdata),
            _ => Err(fail(format!("{} rdata {:?} has no stable text form", rtype, text))),
        }
    }
}

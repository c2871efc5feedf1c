//! Source map decoding and generated → original position lookup.
//!
//! Only revision 3 maps are understood. The `mappings` field is decoded once
//! into a flat segment table sorted by generated position; lookups are a
//! binary search for the nearest preceding segment.

use crate::error::SourceMapParseError;
use serde::Deserialize;

/// A position in the compiled bundle. Zero-based line and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeneratedPosition {
    pub line: u32,
    pub column: u32,
}

impl GeneratedPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A position in an original source file. Zero-based line and column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source: String,
    pub line: u32,
    pub column: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Origin {
    source: u32,
    line: u32,
    column: u32,
    name: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    generated: GeneratedPosition,
    /// `None` for one-field segments, which end the preceding mapping.
    origin: Option<Origin>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    version: u32,
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    sources: Vec<Option<String>>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    mappings: String,
    #[serde(default)]
    sections: Option<serde_json::Value>,
}

/// Decoded, immutable position table for one bundle.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    /// `None` for `null` entries; segments pointing at them have no mapping.
    sources: Vec<Option<String>>,
    names: Vec<String>,
    segments: Vec<Segment>,
}

impl SourceMap {
    /// Parse a source map from its JSON text.
    pub fn parse(text: &str) -> Result<Self, SourceMapParseError> {
        let raw: RawSourceMap = serde_json::from_str(text)?;
        if raw.sections.is_some() {
            return Err(SourceMapParseError::Indexed);
        }
        if raw.version != 3 {
            return Err(SourceMapParseError::UnsupportedVersion(raw.version));
        }

        let root = raw
            .source_root
            .as_deref()
            .map(|r| r.trim_end_matches('/'))
            .filter(|r| !r.is_empty());
        let sources = raw
            .sources
            .into_iter()
            .map(|s| {
                s.filter(|s| !s.is_empty()).map(|s| match root {
                    Some(root) => format!("{}/{}", root, s),
                    None => s,
                })
            })
            .collect::<Vec<_>>();

        let mut segments = decode_mappings(&raw.mappings, sources.len(), raw.names.len())?;

        // Bundlers emit segments in order, but nothing guarantees it. Sort
        // stably and keep the first segment for each generated position.
        segments.sort_by_key(|s| s.generated);
        segments.dedup_by_key(|s| s.generated);

        Ok(Self {
            sources,
            names: raw.names,
            segments,
        })
    }

    /// Number of decoded segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Translate a generated position to the original position of the
    /// greatest segment at or before it.
    ///
    /// Returns `None` for an empty table, a position before the first
    /// segment, or a nearest segment that carries no original position or
    /// points at a `null` source.
    pub fn translate(&self, position: GeneratedPosition) -> Option<OriginalPosition> {
        let idx = self.segments.partition_point(|s| s.generated <= position);
        let segment = self.segments.get(idx.checked_sub(1)?)?;
        let origin = segment.origin?;

        Some(OriginalPosition {
            source: self.sources.get(origin.source as usize)?.clone()?,
            line: origin.line,
            column: origin.column,
            name: origin
                .name
                .and_then(|n| self.names.get(n as usize))
                .cloned(),
        })
    }
}

fn base64_digit(byte: u8) -> Option<i64> {
    let value = match byte {
        b'A'..=b'Z' => byte - b'A',
        b'a'..=b'z' => byte - b'a' + 26,
        b'0'..=b'9' => byte - b'0' + 52,
        b'+' => 62,
        b'/' => 63,
        _ => return None,
    };
    Some(value as i64)
}

/// Decode every VLQ value of one comma-separated segment.
fn decode_segment(segment: &str, line: u32, out: &mut Vec<i64>) -> Result<(), SourceMapParseError> {
    out.clear();
    let mut value: i64 = 0;
    let mut shift = 0u32;
    let mut pending = false;

    for byte in segment.bytes() {
        let digit = base64_digit(byte).ok_or(SourceMapParseError::Vlq {
            line,
            reason: "invalid base64 character",
        })?;
        if shift >= 60 {
            return Err(SourceMapParseError::Vlq {
                line,
                reason: "value overflows 64 bits",
            });
        }
        value |= (digit & 0b11111) << shift;
        if digit & 0b100000 != 0 {
            shift += 5;
            pending = true;
            continue;
        }

        let magnitude = value >> 1;
        out.push(if value & 1 == 1 { -magnitude } else { magnitude });
        value = 0;
        shift = 0;
        pending = false;
    }

    if pending {
        return Err(SourceMapParseError::Vlq {
            line,
            reason: "truncated value",
        });
    }
    Ok(())
}

/// Apply a relative VLQ field to its running total.
fn accumulate(total: &mut i64, delta: i64, line: u32) -> Result<(), SourceMapParseError> {
    *total = total.checked_add(delta).ok_or(SourceMapParseError::Vlq {
        line,
        reason: "value out of range",
    })?;
    Ok(())
}

fn position(value: i64, line: u32, what: &'static str) -> Result<u32, SourceMapParseError> {
    if value < 0 {
        return Err(SourceMapParseError::Negative { line, what });
    }
    u32::try_from(value).map_err(|_| SourceMapParseError::Vlq {
        line,
        reason: "value out of range",
    })
}

fn decode_mappings(
    mappings: &str,
    source_count: usize,
    name_count: usize,
) -> Result<Vec<Segment>, SourceMapParseError> {
    let mut segments = Vec::new();
    let mut fields = Vec::with_capacity(5);

    // Everything except the generated column is relative across the whole map.
    let mut source: i64 = 0;
    let mut orig_line: i64 = 0;
    let mut orig_col: i64 = 0;
    let mut name: i64 = 0;

    for (line_idx, line) in mappings.split(';').enumerate() {
        let line_no = u32::try_from(line_idx).map_err(|_| SourceMapParseError::Vlq {
            line: u32::MAX,
            reason: "too many lines",
        })?;
        let mut gen_col: i64 = 0;

        for raw in line.split(',').filter(|s| !s.is_empty()) {
            decode_segment(raw, line_no, &mut fields)?;

            accumulate(&mut gen_col, fields[0], line_no)?;
            let generated = GeneratedPosition::new(line_no, position(gen_col, line_no, "generated column")?);

            let origin = match fields.len() {
                1 => None,
                4 | 5 => {
                    accumulate(&mut source, fields[1], line_no)?;
                    accumulate(&mut orig_line, fields[2], line_no)?;
                    accumulate(&mut orig_col, fields[3], line_no)?;
                    if source < 0 || source as u64 >= source_count as u64 {
                        return Err(SourceMapParseError::IndexOutOfRange {
                            line: line_no,
                            what: "source",
                            index: source,
                        });
                    }
                    let symbol = if fields.len() == 5 {
                        accumulate(&mut name, fields[4], line_no)?;
                        if name < 0 || name as u64 >= name_count as u64 {
                            return Err(SourceMapParseError::IndexOutOfRange {
                                line: line_no,
                                what: "name",
                                index: name,
                            });
                        }
                        Some(name as u32)
                    } else {
                        None
                    };
                    Some(Origin {
                        source: source as u32,
                        line: position(orig_line, line_no, "original line")?,
                        column: position(orig_col, line_no, "original column")?,
                        name: symbol,
                    })
                }
                n => {
                    return Err(SourceMapParseError::SegmentArity {
                        line: line_no,
                        fields: n,
                    })
                }
            };

            segments.push(Segment { generated, origin });
        }
    }

    Ok(segments)
}

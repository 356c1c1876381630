//! Decoding of staged files into typed rows for bulk copy.

use csv::{ReaderBuilder, Terminator};
use flate2::read::MultiGzDecoder;
use std::io::Read;

use super::{Compression, CopyOptions, ParseFormat, SqlValue};
use crate::schema::ColumnType;

/// One parsed record with its 1-based physical line number.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub line: usize,
    pub fields: Vec<Option<String>>,
}

/// Undo transport compression.
pub fn decompress(payload: &[u8], compression: Compression) -> Result<Vec<u8>, String> {
    match compression {
        Compression::None => Ok(payload.to_vec()),
        Compression::Gzip => {
            let mut out = Vec::new();
            MultiGzDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| format!("gzip decode failed: {e}"))?;
            Ok(out)
        }
    }
}

/// Reader over delimited text configured from the copy options.
///
/// Headers are not interpreted; field counts are checked against the target
/// columns later so the error can name the line.
fn csv_reader<'a>(text: &'a str, options: &CopyOptions) -> Result<csv::Reader<&'a [u8]>, String> {
    let delimiter = single_byte(options.delimiter, "delimiter")?;
    let mut builder = ReaderBuilder::new();
    builder
        .has_headers(false)
        .delimiter(delimiter)
        .terminator(Terminator::CRLF)
        .flexible(true);
    match options.quote {
        Some(quote) => {
            builder.quoting(true).quote(single_byte(quote, "quote")?).double_quote(true);
        }
        None => {
            builder.quoting(false);
        }
    }
    Ok(builder.from_reader(text.as_bytes()))
}

fn single_byte(c: char, what: &str) -> Result<u8, String> {
    u8::try_from(c)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| format!("{what} '{c}' must be a single-byte character"))
}

/// Parse decoded text into records, honouring header skip and null marker.
///
/// `columns` names the target columns in order; JSON records are matched to
/// them by name (exact first, then case-insensitive).
pub fn parse_records(
    text: &str,
    options: &CopyOptions,
    columns: &[String],
) -> Result<Vec<RawRecord>, String> {
    match options.format {
        ParseFormat::Delimited => delimited_records(text, options),
        ParseFormat::Json => json_records(text, options, columns),
    }
}

fn delimited_records(text: &str, options: &CopyOptions) -> Result<Vec<RawRecord>, String> {
    let mut reader = csv_reader(text, options)?;
    let mut records = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| match e.position() {
            Some(pos) => format!("line {}: {e}", pos.line()),
            None => e.to_string(),
        })?;
        if idx < options.ignore_header as usize {
            continue;
        }
        let line = record
            .position()
            .map(|pos| pos.line() as usize)
            .unwrap_or(idx + 1);
        let fields = record
            .iter()
            .map(|f| if f == options.null_as { None } else { Some(f.to_string()) })
            .collect();
        records.push(RawRecord { line, fields });
    }
    Ok(records)
}

fn json_records(text: &str, options: &CopyOptions, columns: &[String]) -> Result<Vec<RawRecord>, String> {
    let mut records = Vec::new();
    for (idx, raw_line) in text.split('\n').enumerate() {
        let line_no = idx + 1;
        if line_no <= options.ignore_header as usize {
            continue;
        }
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() {
            continue;
        }
        let fields = json_fields(line, columns).map_err(|e| format!("line {line_no}: {e}"))?;
        records.push(RawRecord {
            line: line_no,
            fields,
        });
    }
    Ok(records)
}

fn json_fields(line: &str, columns: &[String]) -> Result<Vec<Option<String>>, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("invalid JSON record: {e}"))?;
    let object = value
        .as_object()
        .ok_or_else(|| "JSON record is not an object".to_string())?;
    Ok(columns
        .iter()
        .map(|col| {
            let field = object.get(col).or_else(|| {
                object
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(col))
                    .map(|(_, v)| v)
            });
            match field {
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            }
        })
        .collect())
}

/// Convert a raw field to the column's semantic type.
pub fn coerce(raw: Option<&str>, ty: ColumnType) -> Result<SqlValue, String> {
    let Some(raw) = raw else {
        return Ok(SqlValue::Null);
    };
    match ty {
        ColumnType::Varchar(limit) => {
            if let Some(limit) = limit {
                let len = raw.chars().count();
                if len > limit as usize {
                    return Err(format!("value of length {len} exceeds VARCHAR({limit})"));
                }
            }
            Ok(SqlValue::Text(raw.to_string()))
        }
        ColumnType::Integer => raw
            .trim()
            .parse::<i64>()
            .map(SqlValue::Integer)
            .map_err(|_| format!("invalid integer '{raw}'")),
        ColumnType::Float => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(SqlValue::Float)
            .ok_or_else(|| format!("invalid float '{raw}'")),
        ColumnType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "y" | "yes" => Ok(SqlValue::Boolean(true)),
            "0" | "f" | "false" | "n" | "no" => Ok(SqlValue::Boolean(false)),
            _ => Err(format!("invalid boolean '{raw}'")),
        },
    }
}

/// Parse and coerce a whole file against the target columns.
///
/// Fails on the first malformed record, naming its line and column.
pub fn decode_rows(
    payload: &[u8],
    options: &CopyOptions,
    columns: &[(String, ColumnType)],
) -> Result<Vec<Vec<SqlValue>>, String> {
    let raw = decompress(payload, options.compression)?;
    let text = String::from_utf8(raw).map_err(|e| format!("file is not valid UTF-8: {e}"))?;
    let names: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();
    let records = parse_records(&text, options, &names)?;

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        if record.fields.len() != columns.len() {
            return Err(format!(
                "line {}: expected {} fields, found {}",
                record.line,
                columns.len(),
                record.fields.len()
            ));
        }
        let mut row = Vec::with_capacity(columns.len());
        for ((name, ty), field) in columns.iter().zip(&record.fields) {
            let value = coerce(field.as_deref(), *ty)
                .map_err(|e| format!("line {}, column {name}: {e}", record.line))?;
            row.push(value);
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn ratings_columns() -> Vec<(String, ColumnType)> {
        vec![
            ("tconst".into(), ColumnType::Varchar(Some(255))),
            ("averageRating".into(), ColumnType::Float),
            ("numVotes".into(), ColumnType::Integer),
        ]
    }

    #[test]
    fn test_decode_gzip_tsv_skips_header() {
        let tsv = b"tconst\taverageRating\tnumVotes\ntt0000001\t5.7\t1965\n";
        let rows = decode_rows(&gzip(tsv), &CopyOptions::gzip_tsv_with_header(), &ratings_columns())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0],
            vec![
                SqlValue::Text("tt0000001".into()),
                SqlValue::Float(5.7),
                SqlValue::Integer(1965)
            ]
        );
    }

    #[test]
    fn test_null_marker_and_crlf() {
        let options = CopyOptions::default();
        let rows = decode_rows(b"tt1\t\\N\t3\r\n", &options, &ratings_columns()).unwrap();
        assert_eq!(rows[0][1], SqlValue::Null);
        assert_eq!(rows[0][2], SqlValue::Integer(3));
    }

    #[test]
    fn test_type_mismatch_names_line_and_column() {
        let options = CopyOptions {
            ignore_header: 1,
            ..Default::default()
        };
        let err = decode_rows(b"h\th\th\ntt1\t5.0\t10\ntt2\t6.1\tmany\n", &options, &ratings_columns())
            .unwrap_err();
        assert_eq!(err, "line 3, column numVotes: invalid integer 'many'");
    }

    #[test]
    fn test_field_count_mismatch() {
        let err = decode_rows(b"tt1\t5.0\n", &CopyOptions::default(), &ratings_columns()).unwrap_err();
        assert!(err.contains("expected 3 fields, found 2"));
    }

    #[test]
    fn test_quoted_csv_fields() {
        let options = CopyOptions {
            delimiter: ',',
            quote: Some('"'),
            null_as: String::new(),
            ..Default::default()
        };
        let columns = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let records = parse_records("x,\"b,c\",\"say \"\"hi\"\"\",\n", &options, &columns).unwrap();
        assert_eq!(
            records[0].fields,
            vec![
                Some("x".to_string()),
                Some("b,c".to_string()),
                Some(r#"say "hi""#.to_string()),
                None
            ]
        );
    }

    #[test]
    fn test_unquoted_mode_keeps_quote_characters() {
        let records = parse_records("\"a\"\tb\n", &CopyOptions::default(), &[]).unwrap();
        assert_eq!(records[0].fields[0].as_deref(), Some("\"a\""));
    }

    #[test]
    fn test_header_skip_and_line_numbers() {
        let options = CopyOptions {
            ignore_header: 1,
            ..Default::default()
        };
        let records = parse_records("h1\th2\n\nr1\tx\nr2\ty\n", &options, &[]).unwrap();
        let lines: Vec<usize> = records.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![3, 4]);
    }

    #[test]
    fn test_multibyte_delimiter_is_rejected() {
        let options = CopyOptions {
            delimiter: '¦',
            ..Default::default()
        };
        let err = parse_records("a¦b\n", &options, &[]).unwrap_err();
        assert!(err.contains("single-byte"));
    }

    #[test]
    fn test_json_records_match_columns() {
        let options = CopyOptions {
            format: ParseFormat::Json,
            ..Default::default()
        };
        let text = b"{\"tconst\":\"tt1\",\"AVERAGERATING\":7.5,\"numVotes\":12}\n{\"tconst\":\"tt2\"}\n";
        let rows = decode_rows(text, &options, &ratings_columns()).unwrap();
        assert_eq!(rows[0][1], SqlValue::Float(7.5));
        assert_eq!(rows[1][2], SqlValue::Null);
    }

    #[test]
    fn test_coerce_booleans_and_limits() {
        assert_eq!(coerce(Some("1"), ColumnType::Boolean).unwrap(), SqlValue::Boolean(true));
        assert_eq!(coerce(Some("f"), ColumnType::Boolean).unwrap(), SqlValue::Boolean(false));
        assert!(coerce(Some("maybe"), ColumnType::Boolean).is_err());
        assert!(coerce(Some("abcdef"), ColumnType::Varchar(Some(3))).is_err());
        assert!(coerce(Some("nan"), ColumnType::Float).is_err());
        assert_eq!(coerce(None, ColumnType::Integer).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_corrupt_gzip_is_reported() {
        let err = decompress(b"not gzip", Compression::Gzip).unwrap_err();
        assert!(err.starts_with("gzip decode failed"));
    }
}

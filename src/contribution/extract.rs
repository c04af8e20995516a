//! CSV decoding and column extraction.
//!
//! Uploaded files are decoded as UTF-8 with a Latin-1 fallback, since field
//! exports from legacy spreadsheet tooling are the most common input.
//! Headerless files get positional column names ("0", "1", ...), so the rest
//! of the pipeline never needs to care whether a header row existed.

use std::borrow::Cow;
use std::path::Path;

use csv::ReaderBuilder;

use crate::config::StorageConfig;
use crate::error::Result;

/// Decode raw upload bytes, falling back to Latin-1 when they are not UTF-8.
pub(crate) fn decode_bytes(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(encoding_rs::mem::decode_latin1(bytes).into_owned()),
    }
}

/// Column names of a CSV document: the header row when present, positional
/// indices otherwise. An empty file yields no columns.
pub(crate) fn parse_column_names(text: &str, has_header: bool) -> Result<Vec<String>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .from_reader(text.as_bytes());

    if has_header {
        let headers = reader.headers()?;
        return Ok(headers.iter().map(|h| h.trim().to_string()).collect());
    }

    match reader.records().next() {
        Some(record) => {
            let width = record?.len();
            Ok((0..width).map(|i| i.to_string()).collect())
        }
        None => Ok(Vec::new()),
    }
}

/// Data rows of a CSV document, header excluded. Rows may be ragged; value
/// ingestion treats a missing cell like an empty one.
pub(crate) fn parse_rows(text: &str, has_header: bool) -> Result<Vec<Vec<String>>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(String::from).collect());
    }
    Ok(rows)
}

/// Load and decode an uploaded contribution file from the storage directory.
pub(crate) async fn read_contribution_file(
    storage: &StorageConfig,
    file_name: &str,
) -> Result<String> {
    // Uploads are stored under server-generated names; reject anything that
    // could escape the upload directory.
    let path = Path::new(file_name);
    let bytes = if path.is_absolute() || file_name.contains("..") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid upload file name: {file_name}"),
        )
        .into());
    } else {
        tokio::fs::read(storage.upload_dir.join(path)).await?
    };
    Ok(decode_bytes(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_prefers_utf8() {
        assert_eq!(decode_bytes("héllo".as_bytes()), "héllo");
    }

    #[test]
    fn test_decode_falls_back_to_latin1() {
        // 0xE9 is 'é' in Latin-1 but invalid as a standalone UTF-8 byte.
        let bytes = b"caf\xe9";
        assert_eq!(decode_bytes(bytes), "café");
    }

    #[test]
    fn test_header_row_names_columns() {
        let names = parse_column_names("name,height\nacme,2.0\n", true).unwrap();
        assert_eq!(names, vec!["name", "height"]);
    }

    #[test]
    fn test_headerless_columns_are_positional() {
        let names = parse_column_names("acme,2.0\nother,3.5\n", false).unwrap();
        assert_eq!(names, vec!["0", "1"]);
    }

    #[test]
    fn test_empty_file_has_no_columns() {
        assert!(parse_column_names("", false).unwrap().is_empty());
    }

    #[test]
    fn test_rows_skip_header() {
        let rows = parse_rows("name,height\nacme,2.0\n", true).unwrap();
        assert_eq!(rows, vec![vec!["acme".to_string(), "2.0".to_string()]]);
    }

    #[test]
    fn test_headerless_rows_include_first_line() {
        let rows = parse_rows("acme,2.0\nother,3.5\n", false).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], "acme");
    }
}

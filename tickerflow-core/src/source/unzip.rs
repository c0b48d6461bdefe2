//! Extraction of single-file zip archives (Tiingo ships the supported
//! tickers list as `supported_tickers.zip` holding one CSV).

use crate::error::TransformError;
use std::io::{Cursor, Read};

/// Return the contents of the first entry of a zip archive.
pub fn unzip_single_csv(archive: &[u8]) -> Result<Vec<u8>, TransformError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| TransformError::Archive(format!("open archive: {e}")))?;

    if zip.len() == 0 {
        return Err(TransformError::Archive("archive has no entries".into()));
    }

    let mut entry = zip
        .by_index(0)
        .map_err(|e| TransformError::Archive(format!("read entry: {e}")))?;
    let mut csv = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut csv)?;
    Ok(csv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zipped(name: &str, body: &[u8]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn extracts_first_entry() {
        let body = b"ticker,exchange\nAAPL,NASDAQ\n";
        let archive = zipped("supported_tickers.csv", body);
        assert_eq!(unzip_single_csv(&archive).unwrap(), body.to_vec());
    }

    #[test]
    fn rejects_garbage() {
        let err = unzip_single_csv(b"not a zip").unwrap_err();
        assert!(matches!(err, TransformError::Archive(_)));
    }

    #[test]
    fn rejects_empty_archive() {
        let writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let archive = writer.finish().unwrap().into_inner();
        assert!(matches!(
            unzip_single_csv(&archive),
            Err(TransformError::Archive(_))
        ));
    }
}

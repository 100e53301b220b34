use thiserror::Error;
use veritor_common::types::ExecutionRecord;

#[derive(Debug, Error)]
pub enum InvalidResultError {
    #[error("log {0} has no result line")]
    Empty(String),
    #[error("invalid result length {0}, want 64 hex characters")]
    BadLength(usize),
    #[error("result is not hexadecimal")]
    NotHex,
    #[error("failed to read result log: {0}")]
    Io(#[from] std::io::Error),
}

/// A 32-byte result hash, validated to be exactly 64 hex characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultHash {
    hex: String,
    bytes: [u8; 32],
}

impl ResultHash {
    /// Validates a raw line printed by the verification program. This is
    /// the sole trust boundary between sandbox output and what gets
    /// submitted on-chain: exactly 64 hex characters, no truncation, no
    /// padding, no coercion.
    pub fn parse(raw: &str) -> Result<Self, InvalidResultError> {
        if raw.len() != 64 {
            return Err(InvalidResultError::BadLength(raw.len()));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(raw, &mut bytes).map_err(|_| InvalidResultError::NotHex)?;

        Ok(Self {
            hex: raw.to_string(),
            bytes,
        })
    }

    /// The hash exactly as the program printed it.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    pub fn bytes(&self) -> [u8; 32] {
        self.bytes
    }
}

/// Reads the last non-empty line of the request's log and validates it.
pub async fn extract_result(record: &ExecutionRecord) -> Result<ResultHash, InvalidResultError> {
    let contents = tokio::fs::read_to_string(&record.log_path).await?;
    let line = contents
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| InvalidResultError::Empty(record.log_path.display().to_string()))?;

    ResultHash::parse(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const SAMPLE: &str = "6644a3057b9d236bcc3b632068af92d008b2f4baf20ae9b78052ea75f729cedf";

    fn record(dir: &Path, contents: &str) -> ExecutionRecord {
        let log_path = dir.join("0.log");
        std::fs::write(&log_path, contents).unwrap();
        ExecutionRecord {
            request_number: 0,
            log_path,
        }
    }

    #[test]
    fn accepts_lowercase_hex_unchanged() {
        let hash = ResultHash::parse(SAMPLE).unwrap();
        assert_eq!(hash.as_str(), SAMPLE);
        assert_eq!(hash.bytes()[0], 0x66);
        assert_eq!(hash.bytes()[31], 0xdf);
    }

    #[test]
    fn accepts_uppercase_hex() {
        let upper = SAMPLE.to_ascii_uppercase();
        let hash = ResultHash::parse(&upper).unwrap();
        assert_eq!(hash.as_str(), upper);
    }

    #[test]
    fn rejects_short_result() {
        let err = ResultHash::parse("abc").unwrap_err();
        assert!(matches!(err, InvalidResultError::BadLength(3)));
    }

    #[test]
    fn rejects_non_hex_result() {
        let line = "g".repeat(64);
        let err = ResultHash::parse(&line).unwrap_err();
        assert!(matches!(err, InvalidResultError::NotHex));
    }

    #[tokio::test]
    async fn strips_single_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let record = record(dir.path(), &format!("{}\n", SAMPLE));

        let hash = extract_result(&record).await.unwrap();
        assert_eq!(hash.as_str(), SAMPLE);
    }

    #[tokio::test]
    async fn takes_last_non_empty_line() {
        let dir = tempfile::tempdir().unwrap();
        let record = record(
            dir.path(),
            &format!("fetching input\nrunning checks\n{}\n\n", SAMPLE),
        );

        let hash = extract_result(&record).await.unwrap();
        assert_eq!(hash.as_str(), SAMPLE);
    }

    #[tokio::test]
    async fn rejects_short_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let record = record(dir.path(), "abc\n");

        let err = extract_result(&record).await.unwrap_err();
        assert!(matches!(err, InvalidResultError::BadLength(3)));
    }

    #[tokio::test]
    async fn rejects_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let record = record(dir.path(), "");

        let err = extract_result(&record).await.unwrap_err();
        assert!(matches!(err, InvalidResultError::Empty(_)));
    }
}

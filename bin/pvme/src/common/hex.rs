//! Hex loading utilities for pvme

use std::{fs, io::Read};

use super::{PvmeError, Result};

/// Load hex-encoded bytes from an argument or a file. If the file is a dash (-), read from stdin.
/// Priority: arg > file. Returns `None` if neither is provided.
pub fn load_hex(arg: Option<String>, file: Option<String>) -> Result<Option<Vec<u8>>> {
    let hex_string = if let Some(arg) = arg {
        arg
    } else if let Some(file) = file {
        if file == "-" {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        } else {
            fs::read_to_string(file)?
        }
    } else {
        return Ok(None);
    };

    decode_hex(&hex_string).map(Some)
}

/// Decode hex string, handling optional 0x prefix
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let hex_str = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);

    if hex_str.len() % 2 != 0 {
        return Err(PvmeError::InvalidInput(format!(
            "Invalid hex string length: {} (must be even)",
            hex_str.len()
        )));
    }

    Ok(hex::decode(hex_str)?)
}

/// Encode bytes as a 0x-prefixed hex string
pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;
    use tempfile::NamedTempFile;

    use super::*;

    #[rstest]
    #[case::empty("", vec![])]
    #[case::prefixed("0x00ff", vec![0x00, 0xff])]
    #[case::upper_prefix("0X0a", vec![0x0a])]
    #[case::whitespace("  0102\n", vec![1, 2])]
    fn test_decode_hex(#[case] input: &str, #[case] expected: Vec<u8>) {
        assert_eq!(decode_hex(input).unwrap(), expected);
    }

    #[test]
    fn test_odd_length_is_rejected() {
        assert!(matches!(decode_hex("0x123"), Err(PvmeError::InvalidInput(_))));
        assert!(matches!(decode_hex("zz"), Err(PvmeError::InvalidHex(_))));
    }

    #[test]
    fn test_argument_wins_over_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0xbeef").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        assert_eq!(load_hex(None, Some(path.clone())).unwrap(), Some(vec![0xbe, 0xef]));
        assert_eq!(load_hex(Some("01".into()), Some(path)).unwrap(), Some(vec![1]));
        assert_eq!(load_hex(None, None).unwrap(), None);
    }
}

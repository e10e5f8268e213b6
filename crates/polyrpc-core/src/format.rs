//! Wire formatter contract and the JSON reference formatter.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{FormatError, FormatResult};

/// Serializes message objects into a byte sink and back.
///
/// One formatter instance is created per session and owned exclusively by it.
pub trait Formatter: Default + Send + 'static {
    /// Short name of the format, used in logs.
    fn name(&self) -> &'static str;

    /// Appends the serialized form of `value` to `out`.
    fn serialize<T: Serialize + ?Sized>(&mut self, value: &T, out: &mut Vec<u8>)
    -> FormatResult<()>;

    /// Reads a `T` from exactly `bytes`.
    ///
    /// Input that stops in the middle of an object yields
    /// [`FormatError::EndOfData`].
    fn deserialize<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> FormatResult<T>;
}

/// JSON formatter backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
        out: &mut Vec<u8>,
    ) -> FormatResult<()> {
        serde_json::to_writer(out, value).map_err(json_error)
    }

    fn deserialize<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> FormatResult<T> {
        serde_json::from_slice(bytes).map_err(json_error)
    }
}

fn json_error(err: serde_json::Error) -> FormatError {
    if err.is_eof() {
        FormatError::EndOfData
    } else {
        FormatError::UnexpectedData(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        text: String,
        count: u32,
    }

    #[test]
    fn json_appends_to_sink() {
        let mut formatter = JsonFormatter;
        let mut out = b"xx".to_vec();
        formatter
            .serialize(&Sample { text: "hi".into(), count: 2 }, &mut out)
            .unwrap();
        assert_eq!(&out[..2], b"xx");

        let decoded: Sample = formatter.deserialize(&out[2..]).unwrap();
        assert_eq!(decoded, Sample { text: "hi".into(), count: 2 });
    }

    #[test]
    fn truncated_input_is_end_of_data() {
        let mut formatter = JsonFormatter;
        let result: FormatResult<Sample> = formatter.deserialize(br#"{"text":"hi","#);
        assert!(matches!(result, Err(FormatError::EndOfData)));

        let result: FormatResult<Sample> = formatter.deserialize(b"");
        assert!(matches!(result, Err(FormatError::EndOfData)));
    }

    #[test]
    fn malformed_input_is_unexpected_data() {
        let mut formatter = JsonFormatter;
        let result: FormatResult<Sample> = formatter.deserialize(br#"{"text":5}"#);
        assert!(matches!(result, Err(FormatError::UnexpectedData(_))));
    }
}

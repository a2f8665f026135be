//! Uniform result shape handed to the presentation layer.

use serde::Serialize;

use crate::error::PatchError;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Envelope<T> {
    Success { data: T },
    Error { error: ErrorBody },
}

impl<T: Serialize> Envelope<T> {
    /// `operation` prefixes the error message, e.g. "Failed to list patches".
    pub fn from_result(operation: &str, result: Result<T, PatchError>) -> Self {
        match result {
            Ok(data) => Envelope::Success { data },
            Err(e) => Envelope::Error {
                error: ErrorBody {
                    kind: e.kind().to_string(),
                    message: format!("{}: {}", operation, e),
                },
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_shape() {
        let env = Envelope::from_result("Failed to list patches", Ok(vec![1, 2]));
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_error_shape_tags_operation() {
        let env: Envelope<()> = Envelope::from_result(
            "Failed to list patches",
            Err(PatchError::Input("bad".into())),
        );
        assert!(!env.is_success());
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["kind"], "InputError");
        assert_eq!(json["error"]["message"], "Failed to list patches: bad");
    }
}

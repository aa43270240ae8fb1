use serde_json::Value;

use crate::commands::result::CommandParams;
use crate::error::{AgentError, Result};

/// Fail with `InvalidParams` unless every name in `required` is present.
pub fn require_params(command: &str, params: &CommandParams, required: &[&str]) -> Result<()> {
    match required.iter().find(|name| !params.contains_key(**name)) {
        Some(missing) => Err(AgentError::InvalidParams(format!(
            "missing parameter \"{missing}\" in \"{command}\" command"
        ))),
        None => Ok(()),
    }
}

/// Check one entry of an `image_infos` list.
pub fn validate_image_info(image_info: &Value) -> Result<()> {
    let Value::Object(info) = image_info else {
        return Err(AgentError::InvalidParams(
            "Image info must be an object.".to_string(),
        ));
    };

    for field in ["id", "urls", "hashes"] {
        if !info.contains_key(field) {
            return Err(AgentError::InvalidParams(format!(
                "Image is missing '{field}' field."
            )));
        }
    }

    if !info["urls"].is_array() {
        return Err(AgentError::InvalidParams(
            "Image 'urls' must be a list.".to_string(),
        ));
    }

    if !info["hashes"].is_object() {
        return Err(AgentError::InvalidParams(
            "Image 'hashes' must be a dictionary.".to_string(),
        ));
    }

    Ok(())
}

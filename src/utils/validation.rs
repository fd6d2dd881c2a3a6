use crate::utils::error::{FetchError, Result};
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

pub fn validate_url(field_name: &str, url_str: &str) -> Result<()> {
    if url_str.is_empty() {
        return Err(FetchError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: "URL cannot be empty".to_string(),
        });
    }

    match Url::parse(url_str) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(FetchError::InvalidConfigValueError {
                field: field_name.to_string(),
                value: url_str.to_string(),
                reason: format!("Unsupported URL scheme: {}", scheme),
            }),
        },
        Err(e) => Err(FetchError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: url_str.to_string(),
            reason: format!("Invalid URL format: {}", e),
        }),
    }
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(FetchError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path cannot be empty".to_string(),
        });
    }

    if path.contains('\0') {
        return Err(FetchError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path contains null bytes".to_string(),
        });
    }

    Ok(())
}

/// 檔名前綴只能是單一路徑片段
pub fn validate_file_prefix(field_name: &str, prefix: &str) -> Result<()> {
    validate_non_empty_string(field_name, prefix)?;

    if let Some(bad) = prefix
        .chars()
        .find(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control())
    {
        return Err(FetchError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: prefix.to_string(),
            reason: format!("Prefix may not contain {:?}", bad),
        });
    }

    Ok(())
}

pub fn validate_required_field<'a, T>(field_name: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| FetchError::MissingConfigError {
        field: field_name.to_string(),
    })
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(FetchError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Value cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(FetchError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be between {} and {}", min, max),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("token_endpoint", "https://identity.example.com/connect/token").is_ok());
        assert!(validate_url("token_endpoint", "http://127.0.0.1:8080/token").is_ok());
        assert!(validate_url("token_endpoint", "").is_err());
        assert!(validate_url("token_endpoint", "invalid-url").is_err());
        assert!(validate_url("token_endpoint", "ftp://example.com").is_err());
    }

    #[test]
    fn test_validate_file_prefix() {
        assert!(validate_file_prefix("output_prefix", "demo_company").is_ok());
        assert!(validate_file_prefix("output_prefix", "").is_err());
        assert!(validate_file_prefix("output_prefix", "../escape").is_err());
        assert!(validate_file_prefix("output_prefix", "c:drive").is_err());
    }

    #[test]
    fn test_validate_required_field() {
        let missing: Option<String> = None;
        let err = validate_required_field("client_id", &missing).unwrap_err();
        assert!(matches!(err, FetchError::MissingConfigError { field } if field == "client_id"));
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range("request_timeout_secs", 60, 1, 3600).is_ok());
        assert!(validate_range("request_timeout_secs", 0, 1, 3600).is_err());
    }
}

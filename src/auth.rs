use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// API key pair used for private endpoints.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Generate HMAC-SHA256 signature for the Bybit v5 API
///
/// Message format: timestamp + api_key + recv_window + payload, where payload is
/// the query string for GET and the JSON body for POST.
pub fn generate_signature(
    secret: &str,
    timestamp: &str,
    api_key: &str,
    recv_window: &str,
    payload: &str,
) -> Result<String> {
    let message = format!("{}{}{}{}", timestamp, api_key, recv_window, payload);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(message.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Get current timestamp in milliseconds
pub fn get_timestamp_ms() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
        .to_string()
}

/// Generate all auth headers for a private request
pub fn generate_headers(
    credentials: &Credentials,
    recv_window_ms: u64,
    payload: &str,
) -> Result<Vec<(String, String)>> {
    let timestamp = get_timestamp_ms();
    let recv_window = recv_window_ms.to_string();
    let signature = generate_signature(
        &credentials.api_secret,
        &timestamp,
        &credentials.api_key,
        &recv_window,
        payload,
    )?;

    Ok(vec![
        ("X-BAPI-API-KEY".to_string(), credentials.api_key.clone()),
        ("X-BAPI-TIMESTAMP".to_string(), timestamp),
        ("X-BAPI-RECV-WINDOW".to_string(), recv_window),
        ("X-BAPI-SIGN".to_string(), signature),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_hex_sha256() {
        let sig = generate_signature("secret", "1700000000000", "key", "5000", "category=linear")
            .unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_depends_on_payload() {
        let a = generate_signature("secret", "1", "key", "5000", "symbol=BTCUSDT").unwrap();
        let b = generate_signature("secret", "1", "key", "5000", "symbol=ETHUSDT").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_headers_carry_key_and_window() {
        let creds = Credentials {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
        };
        let headers = generate_headers(&creds, 5000, "").unwrap();
        assert!(headers.iter().any(|(k, v)| k == "X-BAPI-API-KEY" && v == "key"));
        assert!(headers.iter().any(|(k, v)| k == "X-BAPI-RECV-WINDOW" && v == "5000"));
        assert_eq!(headers.len(), 4);
    }
}

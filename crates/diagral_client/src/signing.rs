use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Headers authenticating a request made with an API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp: String,
    pub hmac: String,
    pub api_key: String,
}

/// Sign a request for `serial_id` at `timestamp` (seconds since the epoch).
///
/// The cloud expects `hex(HMAC-SHA256(secret, "{timestamp}.{serial}.{api_key}"))`.
pub fn sign(serial_id: &str, api_key: &str, secret_key: &str, timestamp: i64) -> SignedHeaders {
    let message = format!("{}.{}.{}", timestamp, serial_id, api_key);

    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(message.as_bytes());

    SignedHeaders {
        timestamp: timestamp.to_string(),
        hmac: hex::encode(mac.finalize().into_bytes()),
        api_key: api_key.to_string(),
    }
}

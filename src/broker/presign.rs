//! SigV4 query signing for the device gateway websocket endpoint.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::identity::Credential;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "iotdevicegateway";
const MQTT_PATH: &str = "/mqtt";

/// RFC 3986 unreserved characters are left as-is; everything else is encoded.
const URI_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresignError {
    #[error("credentials are incomplete")]
    IncompleteCredential,

    #[error("invalid signing key")]
    InvalidKey,
}

/// Builds a signed `<scheme>://<host>/mqtt` URL valid for `credential`.
///
/// The session token is appended after the signature, as the gateway expects.
pub fn presign_url(
    scheme: &str,
    host: &str,
    region: &str,
    credential: &Credential,
    now: DateTime<Utc>,
) -> Result<String, PresignError> {
    if !credential.is_complete() {
        return Err(PresignError::IncompleteCredential);
    }

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");

    let query = format!(
        "X-Amz-Algorithm={ALGORITHM}&X-Amz-Credential={}&X-Amz-Date={amz_date}&X-Amz-SignedHeaders=host",
        uri_encode(&format!("{}/{scope}", credential.access_key_id)),
    );
    let canonical_request = format!(
        "GET\n{MQTT_PATH}\n{query}\nhost:{host}\n\nhost\n{}",
        hex_sha256(b"")
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(
        credential.secret_key.expose_secret(),
        &date,
        region,
        SERVICE,
    )?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(format!(
        "{scheme}://{host}{MQTT_PATH}?{query}&X-Amz-Signature={signature}&X-Amz-Security-Token={}",
        uri_encode(credential.session_token.expose_secret())
    ))
}

fn derive_signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, PresignError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, PresignError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| PresignError::InvalidKey)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_ENCODE).to_string()
}

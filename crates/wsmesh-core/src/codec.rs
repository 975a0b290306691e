//! Wire codec for packets.
//!
//! Plaintext mode (no password): compact JSON text.
//!
//! Encrypted mode: `salt(16) ∥ iv(16) ∥ AES-256-CBC(compact JSON)` with
//! PKCS#7 padding, where `key = HMAC-SHA256(key = password, message = salt)`.
//! The blob is emitted raw on binary frames, Base64 on text frames. The
//! per-message salt and iv make identical plaintexts produce distinct
//! ciphertexts.

use crate::error::{MeshError, MeshResult};
use crate::packet::Packet;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;

/// A single outbound or inbound WebSocket frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Derive the AES-256 key for one message: HMAC-SHA256 keyed by the
/// password over the message salt.
fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(password.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(salt);
    mac.finalize().into_bytes().into()
}

/// Encode a packet for the wire.
pub fn encode(packet: &Packet, password: Option<&str>, binary: bool) -> MeshResult<WireFrame> {
    let json = serde_json::to_string(packet)?;
    let password = match password {
        Some(p) => p,
        None => return Ok(WireFrame::Text(json)),
    };

    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| MeshError::Crypto(format!("cipher init: {e}")))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(json.as_bytes());

    let mut blob = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext.len());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);

    if binary {
        Ok(WireFrame::Binary(blob))
    } else {
        Ok(WireFrame::Text(STANDARD.encode(blob)))
    }
}

/// Decode a frame body into a JSON value.
///
/// Empty inputs decode to an empty object, which then fails packet shape
/// validation downstream. Any failure (bad Base64, truncation, bad padding,
/// non-JSON plaintext) is an error, never a panic; the caller maps it to
/// close code 4001.
pub fn decode(frame: &WireFrame, password: Option<&str>) -> MeshResult<Value> {
    match password {
        None => {
            let text = match frame {
                WireFrame::Text(t) => t.as_str().to_owned(),
                WireFrame::Binary(b) => std::str::from_utf8(b)
                    .map_err(|e| MeshError::Codec(format!("frame is not UTF-8: {e}")))?
                    .to_owned(),
            };
            if text.is_empty() {
                return Ok(Value::Object(serde_json::Map::new()));
            }
            Ok(serde_json::from_str(&text)?)
        }
        Some(password) => {
            let blob = match frame {
                WireFrame::Binary(b) => b.clone(),
                WireFrame::Text(t) => STANDARD
                    .decode(t.as_bytes())
                    .map_err(|e| MeshError::Codec(format!("base64: {e}")))?,
            };
            if blob.is_empty() {
                return Ok(Value::Object(serde_json::Map::new()));
            }
            if blob.len() < SALT_LEN + IV_LEN {
                return Err(MeshError::Codec(format!(
                    "encrypted frame too short: {} bytes",
                    blob.len()
                )));
            }
            let (salt, rest) = blob.split_at(SALT_LEN);
            let (iv, ciphertext) = rest.split_at(IV_LEN);

            let key = derive_key(password, salt);
            let cipher = Aes256CbcDec::new_from_slices(&key, iv)
                .map_err(|e| MeshError::Crypto(format!("cipher init: {e}")))?;
            let plaintext = cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| MeshError::Codec("decrypt failed".into()))?;

            Ok(serde_json::from_slice(&plaintext)?)
        }
    }
}

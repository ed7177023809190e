// Key fetching and AES-128-CBC segment decryption.

use crate::config::FetcherConfig;
use crate::error::{HlsError, is_retryable_reqwest_error, is_retryable_status};
use crate::playlist::{EncryptionInfo, EncryptionMethod};
use crate::retry::{RetryAction, retry_with_backoff};
use aes::Aes128;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use reqwest::Client;
use reqwest::header::{ACCEPT, REFERER};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// A fetched 16-byte clear key together with the playlist-declared IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCipher {
    pub key: [u8; 16],
    /// IV parsed from the playlist; absent means the per-segment index IV
    /// convention applies.
    pub iv: Option<[u8; 16]>,
}

impl SegmentCipher {
    /// IV for segment `index`: the explicit playlist IV when declared,
    /// otherwise the 16-byte big-endian encoding of the index.
    pub fn iv_for_segment(&self, index: u64) -> [u8; 16] {
        self.iv
            .unwrap_or_else(|| (index as u128).to_be_bytes())
    }

    /// Decrypt one segment in place semantics: returns the plaintext.
    pub fn decrypt(&self, data: &[u8], index: u64) -> Result<Vec<u8>, HlsError> {
        decrypt_aes128_cbc(data, &self.key, &self.iv_for_segment(index))
    }
}

/// AES-128-CBC with PKCS#7 padding.
pub fn decrypt_aes128_cbc(
    data: &[u8],
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Vec<u8>, HlsError> {
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|e| HlsError::decryption(format!("failed to initialize AES decryptor: {e}")))?;

    let mut buffer = data.to_vec();
    let plaintext_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| HlsError::decryption(format!("decryption failed: {e}")))?
        .len();
    buffer.truncate(plaintext_len);
    Ok(buffer)
}

pub fn parse_iv(iv_hex: &str) -> Result<[u8; 16], HlsError> {
    let trimmed = iv_hex.trim_start_matches("0x").trim_start_matches("0X");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(trimmed, &mut iv)
        .map_err(|e| HlsError::decryption(format!("failed to parse IV `{iv_hex}`: {e}")))?;
    Ok(iv)
}

/// Resolve an [`EncryptionInfo`] into a usable cipher by fetching the key.
///
/// Methods other than AES-128 are a fatal fetch error; `NONE` never reaches
/// this point because the parser drops it.
pub async fn fetch_cipher(
    client: &Client,
    config: &FetcherConfig,
    encryption: &EncryptionInfo,
    referer: &str,
    token: &CancellationToken,
) -> Result<SegmentCipher, HlsError> {
    match &encryption.method {
        EncryptionMethod::Aes128 => {}
        EncryptionMethod::None => {
            return Err(HlsError::Internal {
                reason: "fetch_cipher called for an unencrypted track".to_string(),
            });
        }
        EncryptionMethod::Other(name) => {
            return Err(HlsError::UnsupportedEncryption {
                method: name.clone(),
            });
        }
    }

    let key_url = encryption
        .key_url
        .as_ref()
        .ok_or_else(|| HlsError::decryption("AES-128 key URI is missing"))?;

    let key_bytes = fetch_key(client, config, key_url, referer, token).await?;
    let iv = match &encryption.iv_hex {
        Some(iv_hex) => Some(parse_iv(iv_hex)?),
        None => None,
    };

    debug!(key_url = %key_url, explicit_iv = iv.is_some(), "Fetched segment decryption key");
    Ok(SegmentCipher { key: key_bytes, iv })
}

async fn fetch_key(
    client: &Client,
    config: &FetcherConfig,
    key_url: &Url,
    referer: &str,
    token: &CancellationToken,
) -> Result<[u8; 16], HlsError> {
    let bytes = retry_with_backoff(&config.key_retry, token, |_attempt| async {
        let response = tokio::select! {
            _ = token.cancelled() => return RetryAction::Fail(HlsError::Cancelled),
            response = client
                .get(key_url.clone())
                .header(ACCEPT, "*/*")
                .header(REFERER, referer)
                .timeout(config.key_timeout)
                .send() => response,
        };

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    match response.bytes().await {
                        Ok(bytes) => RetryAction::Success(bytes),
                        Err(e) => RetryAction::Retry(HlsError::from(e)),
                    }
                } else if is_retryable_status(status) {
                    RetryAction::Retry(HlsError::http_status(
                        status,
                        key_url.as_str(),
                        "key fetch",
                    ))
                } else {
                    RetryAction::Fail(HlsError::http_status(
                        status,
                        key_url.as_str(),
                        "key fetch",
                    ))
                }
            }
            Err(e) => {
                if is_retryable_reqwest_error(&e) {
                    RetryAction::Retry(HlsError::from(e))
                } else {
                    RetryAction::Fail(HlsError::from(e))
                }
            }
        }
    })
    .await?;

    <[u8; 16]>::try_from(bytes.as_ref()).map_err(|_| {
        HlsError::decryption(format!(
            "key from {} has length {} (expected 16)",
            key_url,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher::{BlockEncryptMut, KeyIvInit};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = (plaintext.len() / 16 + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    #[test]
    fn round_trips_one_block() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let plaintext = b"fifteen bytes!!";
        let encrypted = encrypt(plaintext, &key, &iv);
        let decrypted = decrypt_aes128_cbc(&encrypted, &key, &iv).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn bad_padding_is_a_decryption_error() {
        let key = [0u8; 16];
        let iv = [0u8; 16];
        let err = decrypt_aes128_cbc(&[0xFFu8; 32], &key, &iv).unwrap_err();
        assert!(matches!(err, HlsError::Decryption { .. }));
    }

    #[test]
    fn parses_prefixed_and_bare_iv() {
        let expected: [u8; 16] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ];
        assert_eq!(
            parse_iv("0x000102030405060708090a0b0c0d0e0f").unwrap(),
            expected
        );
        assert_eq!(
            parse_iv("000102030405060708090a0b0c0d0e0f").unwrap(),
            expected
        );
        assert!(parse_iv("0xdeadbeef").is_err());
    }

    #[test]
    fn index_iv_is_big_endian_counter() {
        let cipher = SegmentCipher {
            key: [0u8; 16],
            iv: None,
        };
        assert_eq!(cipher.iv_for_segment(0), [0u8; 16]);

        let mut expected = [0u8; 16];
        expected[15] = 7;
        assert_eq!(cipher.iv_for_segment(7), expected);

        let mut expected = [0u8; 16];
        expected[14] = 0x01;
        expected[15] = 0x00;
        assert_eq!(cipher.iv_for_segment(256), expected);
    }

    #[test]
    fn explicit_iv_overrides_index() {
        let iv = [0x11u8; 16];
        let cipher = SegmentCipher {
            key: [0u8; 16],
            iv: Some(iv),
        };
        assert_eq!(cipher.iv_for_segment(42), iv);
    }

    #[test]
    fn segment_decrypt_uses_index_derived_iv() {
        let key = [0x10u8; 16];
        let cipher = SegmentCipher { key, iv: None };
        let index = 3u64;
        let iv = cipher.iv_for_segment(index);
        let plaintext = b"segment payload bytes";
        let encrypted = encrypt(plaintext, &key, &iv);
        assert_eq!(cipher.decrypt(&encrypted, index).unwrap(), plaintext);
    }
}

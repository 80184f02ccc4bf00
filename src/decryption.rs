//! Decryption of encrypted features and saved groups payloads.
use aes::cipher::{block_padding::Pkcs7, BlockCipher, BlockDecryptMut, KeyInit, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::{Error, Result};

/// Decrypt a `<base64 iv>.<base64 cipher text>` payload with a base64-encoded AES key.
///
/// Payloads are AES-CBC encrypted with PKCS#7 padding. 128, 192 and 256-bit keys are accepted.
pub(crate) fn decrypt(payload: &str, decryption_key: &str) -> Result<String> {
    let (iv, cipher_text) = payload
        .split_once('.')
        .ok_or_else(|| Error::Decryption("invalid payload".to_owned()))?;

    let key = decode(decryption_key, "key")?;
    let iv = decode(iv, "iv")?;
    let cipher_text = decode(cipher_text, "cipher text")?;

    let plain_text = match key.len() {
        16 => decrypt_cbc::<aes::Aes128>(&key, &iv, &cipher_text)?,
        24 => decrypt_cbc::<aes::Aes192>(&key, &iv, &cipher_text)?,
        32 => decrypt_cbc::<aes::Aes256>(&key, &iv, &cipher_text)?,
        _ => return Err(Error::Decryption("invalid key length".to_owned())),
    };

    String::from_utf8(plain_text)
        .map(|plain_text| plain_text.trim().to_owned())
        .map_err(|_| Error::Decryption("decrypted payload is not valid UTF-8".to_owned()))
}

fn decode(input: &str, what: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(input.trim())
        .map_err(|err| Error::Decryption(format!("invalid base64 {what}: {err}")))
}

fn decrypt_cbc<C>(key: &[u8], iv: &[u8], cipher_text: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::Decryption("invalid iv length".to_owned()))?
        .decrypt_padded_vec_mut::<Pkcs7>(cipher_text)
        .map_err(|_| Error::Decryption("wrong key or corrupted payload".to_owned()))
}

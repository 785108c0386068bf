// AES-128-CBC segment decryption with PKCS#7 unpadding.

use crate::error::DownloadError;
use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockModeDecrypt, KeyIvInit, block_padding::Pkcs7};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Decrypts segment payloads, optionally on the blocking thread pool so
/// large segments do not stall the async runtime.
pub struct Decryptor {
    offload: bool,
}

impl Decryptor {
    pub fn new(offload: bool) -> Self {
        Self { offload }
    }

    pub async fn decrypt(
        &self,
        data: Bytes,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<Bytes, DownloadError> {
        if self.offload {
            let key = *key;
            let iv = *iv;
            tokio::task::spawn_blocking(move || decrypt_sync(data, &key, &iv))
                .await
                .map_err(|e| DownloadError::Decryption {
                    reason: format!("decryption offload task failed: {e}"),
                })?
        } else {
            decrypt_sync(data, key, iv)
        }
    }
}

/// Synchronous AES-128-CBC decryption. Ciphertext whose length is not a
/// multiple of the block size, or with invalid padding, is rejected.
pub fn decrypt_sync(data: Bytes, key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, DownloadError> {
    let mut buffer = data.to_vec();
    let cipher =
        Aes128CbcDec::new_from_slices(key, iv).map_err(|e| DownloadError::Decryption {
            reason: format!("failed to initialize AES decryptor: {e}"),
        })?;
    let decrypted_len = cipher
        .decrypt_padded::<Pkcs7>(&mut buffer)
        .map_err(|e| DownloadError::Decryption {
            reason: format!("decryption failed: {e}"),
        })?
        .len();
    buffer.truncate(decrypted_len);
    Ok(Bytes::from(buffer))
}

/// Encryption counterpart used by tests across the crate to build
/// ciphertext fixtures.
#[cfg(test)]
pub(crate) fn encrypt_for_tests(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    use cipher::BlockModeEncrypt;
    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
    let padded_len = ((plaintext.len() / 16) + 1) * 16;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cipher
        .encrypt_padded::<Pkcs7>(&mut buffer, plaintext.len())
        .unwrap()
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_block() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let plaintext = b"fifteen bytes!!";
        let ciphertext = encrypt_for_tests(plaintext, &key, &iv);
        let decrypted = decrypt_sync(Bytes::from(ciphertext), &key, &iv).unwrap();
        assert_eq!(decrypted.as_ref(), plaintext);
    }

    #[tokio::test]
    async fn round_trip_offloaded() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let plaintext: Vec<u8> = (0..64 * 1024).map(|i| (i % 256) as u8).collect();
        let ciphertext = encrypt_for_tests(&plaintext, &key, &iv);

        let decryptor = Decryptor::new(true);
        let decrypted = decryptor
            .decrypt(Bytes::from(ciphertext), &key, &iv)
            .await
            .unwrap();
        assert_eq!(decrypted.as_ref(), plaintext.as_slice());
    }

    #[tokio::test]
    async fn wrong_key_fails_padding_check() {
        let key = [0x01u8; 16];
        let iv = [0x02u8; 16];
        let ciphertext = encrypt_for_tests(b"some payload data here", &key, &iv);

        let wrong_key = [0xffu8; 16];
        let result = decrypt_sync(Bytes::from(ciphertext), &wrong_key, &iv);
        assert!(matches!(result, Err(DownloadError::Decryption { .. })));
    }

    #[test]
    fn partial_block_is_rejected() {
        let key = [0u8; 16];
        let iv = [0u8; 16];
        let result = decrypt_sync(Bytes::from_static(&[1, 2, 3]), &key, &iv);
        assert!(matches!(result, Err(DownloadError::Decryption { .. })));
    }
}

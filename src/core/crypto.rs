//! Artifact encryption: AES-256-CBC with a random 16-byte IV prepended to
//! the ciphertext. The layout (16 raw IV bytes, then PKCS7-padded CBC
//! ciphertext) is a compatibility contract with previously created
//! artifacts and must not change.
//!
//! Artifacts are full datastore dumps, so both directions process the file
//! in fixed-size chunks over buffered IO instead of loading it whole.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

use crate::error::{PipelineError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const IV_LEN: usize = 16;

const BLOCK: usize = 16;
/// Bytes ciphered per pass; must be a multiple of the cipher block size.
const CHUNK: usize = 64 * 1024;

/// Encrypt `src` into `dest`. The first 16 bytes of `dest` are the IV.
pub fn encrypt_file(src: &Path, dest: &Path, key: &[u8; 32]) -> Result<()> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let mut cipher = Aes256CbcEnc::new_from_slices(key, &iv)
        .map_err(|e| PipelineError::CryptoFailed(e.to_string()))?;

    let mut reader = BufReader::new(File::open(src)?);
    let mut writer = BufWriter::new(File::create(dest)?);
    writer.write_all(&iv)?;

    let mut buf = vec![0u8; CHUNK];
    let mut filled = 0;
    loop {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == CHUNK {
            for block in buf.chunks_exact_mut(BLOCK) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&buf)?;
            filled = 0;
        }
    }

    // The final chunk carries the PKCS7 padding, even when it is empty.
    let tail = cipher.encrypt_padded_vec_mut::<Pkcs7>(&buf[..filled]);
    writer.write_all(&tail)?;
    writer.flush()?;

    debug!(src = %src.display(), dest = %dest.display(), "Encrypted artifact");
    Ok(())
}

/// Decrypt `src` (IV-prepended layout) into `dest`.
pub fn decrypt_file(src: &Path, dest: &Path, key: &[u8; 32]) -> Result<()> {
    let mut reader = BufReader::new(File::open(src)?);

    let mut iv = [0u8; IV_LEN];
    reader.read_exact(&mut iv).map_err(|_| {
        PipelineError::CryptoFailed("file too short to contain an IV".to_string())
    })?;

    let mut cipher = Aes256CbcDec::new_from_slices(key, &iv)
        .map_err(|e| PipelineError::CryptoFailed(e.to_string()))?;

    let mut writer = BufWriter::new(File::create(dest)?);
    let mut buf = vec![0u8; CHUNK];
    // Bytes read but not yet deciphered. The trailing block is always held
    // back until EOF because it carries the padding.
    let mut pending: Vec<u8> = Vec::with_capacity(CHUNK + BLOCK);
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);

        let ready = pending.len().saturating_sub(BLOCK);
        let ready = ready - ready % BLOCK;
        if ready > 0 {
            for block in pending[..ready].chunks_exact_mut(BLOCK) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&pending[..ready])?;
            pending.drain(..ready);
        }
    }

    if pending.is_empty() || pending.len() % BLOCK != 0 {
        return Err(PipelineError::CryptoFailed(format!(
            "truncated ciphertext: {} trailing bytes",
            pending.len()
        )));
    }

    let tail = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&pending)
        .map_err(|e| PipelineError::CryptoFailed(format!("bad padding or wrong key: {e}")))?;
    writer.write_all(&tail)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_restores_exact_bytes() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("plain.zip");
        let enc = temp.path().join("plain.zip.enc");
        let dec = temp.path().join("recovered.zip");

        let content: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let key = [7u8; 32];
        encrypt_file(&src, &enc, &key).unwrap();
        decrypt_file(&enc, &dec, &key).unwrap();

        assert_eq!(std::fs::read(&dec).unwrap(), content);
    }

    #[test]
    fn sizes_around_the_chunk_boundary_round_trip() {
        let temp = tempdir().unwrap();
        let key = [9u8; 32];

        for size in [0, BLOCK, CHUNK - 1, CHUNK, CHUNK + 5, 3 * CHUNK + 17] {
            let src = temp.path().join(format!("plain-{size}"));
            let enc = temp.path().join(format!("enc-{size}"));
            let dec = temp.path().join(format!("dec-{size}"));

            let content: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
            std::fs::write(&src, &content).unwrap();

            encrypt_file(&src, &enc, &key).unwrap();
            // IV, then the plaintext padded up to the next whole block.
            let expected_len = IV_LEN + (size / BLOCK + 1) * BLOCK;
            assert_eq!(std::fs::metadata(&enc).unwrap().len() as usize, expected_len);

            decrypt_file(&enc, &dec, &key).unwrap();
            assert_eq!(std::fs::read(&dec).unwrap(), content, "size {size}");
        }
    }

    #[test]
    fn ciphertext_starts_with_fresh_iv_each_run() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("plain");
        std::fs::write(&src, b"same plaintext").unwrap();

        let key = [1u8; 32];
        let enc_a = temp.path().join("a.enc");
        let enc_b = temp.path().join("b.enc");
        encrypt_file(&src, &enc_a, &key).unwrap();
        encrypt_file(&src, &enc_b, &key).unwrap();

        let a = std::fs::read(&enc_a).unwrap();
        let b = std::fs::read(&enc_b).unwrap();
        assert!(a.len() > IV_LEN);
        // Random IVs make independent encryptions of the same input differ.
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("plain");
        let enc = temp.path().join("enc");
        let dec = temp.path().join("dec");
        std::fs::write(&src, b"secret payload").unwrap();

        encrypt_file(&src, &enc, &[2u8; 32]).unwrap();
        let result = decrypt_file(&enc, &dec, &[3u8; 32]);
        assert!(matches!(result, Err(PipelineError::CryptoFailed(_))));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let temp = tempdir().unwrap();
        let enc = temp.path().join("short");
        std::fs::write(&enc, b"tiny").unwrap();

        let result = decrypt_file(&enc, &temp.path().join("out"), &[0u8; 32]);
        assert!(matches!(result, Err(PipelineError::CryptoFailed(_))));
    }

    #[test]
    fn ragged_ciphertext_length_is_rejected() {
        let temp = tempdir().unwrap();
        let enc = temp.path().join("ragged");
        // An IV plus a ciphertext that is not a whole number of blocks.
        std::fs::write(&enc, [0x5A; IV_LEN + 34]).unwrap();

        let result = decrypt_file(&enc, &temp.path().join("out"), &[0u8; 32]);
        assert!(matches!(result, Err(PipelineError::CryptoFailed(_))));
    }
}

//! Wallet-signature verification
//!
//! Ownership of a wallet is proven with an EIP-191 signature over the
//! fixed challenge string. The recovered address must match the claimed
//! one, case-insensitively.

use sha3::{Digest, Keccak256};

use crate::error::{CoreError, Result};

/// The literal UTF-8 message every wallet signs.
pub const WALLET_CHALLENGE: &str = "I Love Shogun";

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// EIP-191 digest: `keccak256("\x19Ethereum Signed Message:\n" + len + msg)`.
pub fn eip191_digest(message: &str) -> [u8; 32] {
    let prefixed = format!("\x19Ethereum Signed Message:\n{}{}", message.len(), message);
    keccak256(prefixed.as_bytes())
}

fn decode_signature(signature: &str) -> Result<([u8; 64], u8)> {
    let raw = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|_| CoreError::Unauthenticated("malformed wallet signature".into()))?;
    if raw.len() != 65 {
        return Err(CoreError::Unauthenticated(format!(
            "wallet signature must be 65 bytes, got {}",
            raw.len()
        )));
    }
    let mut rs = [0u8; 64];
    rs.copy_from_slice(&raw[..64]);
    // Wallets emit v as 27/28; the recovery id is 0/1.
    let v = if raw[64] >= 27 { raw[64] - 27 } else { raw[64] };
    Ok((rs, v))
}

/// Recovers the `0x` address that signed `message`.
pub fn recover_address(message: &str, signature: &str) -> Result<String> {
    let (rs, v) = decode_signature(signature)?;
    let digest = eip191_digest(message);

    let rec_id = libsecp256k1::RecoveryId::parse(v)
        .map_err(|_| CoreError::Unauthenticated("invalid signature recovery id".into()))?;
    let msg = libsecp256k1::Message::parse(&digest);
    let sig = libsecp256k1::Signature::parse_standard(&rs)
        .map_err(|_| CoreError::Unauthenticated("invalid wallet signature".into()))?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &rec_id)
        .map_err(|_| CoreError::Unauthenticated("signature recovery failed".into()))?;

    // Uncompressed key is 0x04 || X || Y; the address is the keccak of X||Y.
    let serialized = pubkey.serialize();
    let hash = keccak256(&serialized[1..]);
    Ok(format!("0x{}", hex::encode(&hash[12..])))
}

/// Verifies `signature` proves ownership of `claimed`; returns the
/// normalized (lowercase) address on success.
pub fn verify_wallet(claimed: &str, signature: &str) -> Result<String> {
    let recovered = recover_address(WALLET_CHALLENGE, signature)?;
    if recovered.eq_ignore_ascii_case(claimed) {
        Ok(recovered)
    } else {
        Err(CoreError::Unauthenticated(
            "recovered address does not match claimed address".into(),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Signs `message` the way a wallet would; returns `(address, sig_hex)`.
    pub(crate) fn sign_challenge(secret: &[u8; 32], message: &str) -> (String, String) {
        let sk = libsecp256k1::SecretKey::parse(secret).unwrap();
        let pk = libsecp256k1::PublicKey::from_secret_key(&sk);
        let serialized = pk.serialize();
        let hash = keccak256(&serialized[1..]);
        let address = format!("0x{}", hex::encode(&hash[12..]));

        let digest = eip191_digest(message);
        let (sig, rec_id) = libsecp256k1::sign(&libsecp256k1::Message::parse(&digest), &sk);
        let mut raw = [0u8; 65];
        raw[..64].copy_from_slice(&sig.serialize());
        raw[64] = rec_id.serialize() + 27;
        (address, format!("0x{}", hex::encode(raw)))
    }

    #[test]
    fn recover_round_trips_with_signer() {
        let (address, sig) = sign_challenge(&[7u8; 32], WALLET_CHALLENGE);
        let recovered = verify_wallet(&address, &sig).unwrap();
        assert_eq!(recovered, address);
    }

    #[test]
    fn claimed_address_is_case_insensitive() {
        let (address, sig) = sign_challenge(&[9u8; 32], WALLET_CHALLENGE);
        let upper = address.to_uppercase().replace("0X", "0x");
        assert!(verify_wallet(&upper, &sig).is_ok());
    }

    #[test]
    fn wrong_address_is_rejected() {
        let (_, sig) = sign_challenge(&[11u8; 32], WALLET_CHALLENGE);
        let err = verify_wallet("0x0000000000000000000000000000000000000001", &sig).unwrap_err();
        assert!(matches!(err, CoreError::Unauthenticated(_)));
    }

    #[test]
    fn signature_over_other_message_is_rejected() {
        let (address, sig) = sign_challenge(&[13u8; 32], "I Love Something Else");
        assert!(verify_wallet(&address, &sig).is_err());
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        assert!(recover_address(WALLET_CHALLENGE, "0xzz").is_err());
        assert!(recover_address(WALLET_CHALLENGE, "0xdead").is_err());
    }

    #[test]
    fn digest_matches_eip191_shape() {
        // 13-byte message: prefix carries its decimal length.
        let digest = eip191_digest(WALLET_CHALLENGE);
        let manual = keccak256(b"\x19Ethereum Signed Message:\n13I Love Shogun");
        assert_eq!(digest, manual);
    }
}

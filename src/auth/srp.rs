//! Secure Remote Password proof for Cognito's `USER_SRP_AUTH` flow.

use anyhow::{Context as _, Result, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac as _};
use num::{BigUint, Zero as _};
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// The 3072-bit MODP group of RFC 3526.
const N_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF",
);
const G: u32 = 2;
const DERIVED_KEY_INFO: &[u8] = b"Caldera Derived Key";
const TIMESTAMP_FORMAT: &str = "%a %b %-d %H:%M:%S UTC %Y";

/// What the server sends back after `USER_SRP_AUTH` in its
/// `PASSWORD_VERIFIER` challenge.
#[derive(Debug, Clone)]
pub struct PasswordVerifier<'a> {
    pub user_id_for_srp: &'a str,
    pub salt: &'a str,
    pub srp_b: &'a str,
    pub secret_block: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordClaim {
    pub timestamp: String,
    pub signature: String,
}

pub struct SrpClient {
    n: BigUint,
    g: BigUint,
    k: BigUint,
    a: BigUint,
    big_a: BigUint,
}

impl SrpClient {
    pub fn new() -> Self {
        let mut secret = [0u8; 128];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::with_secret(BigUint::from_bytes_be(&secret))
    }

    fn with_secret(a: BigUint) -> Self {
        let n = modulus();
        let g = BigUint::from(G);
        let k = hash_to_int(&[&padded(&n), &padded(&g)]);
        let a = a % &n;
        let big_a = g.modpow(&a, &n);
        Self { n, g, k, a, big_a }
    }

    /// `SRP_A` as sent in the auth parameters.
    pub fn public_a(&self) -> String {
        format!("{:x}", self.big_a)
    }

    /// Signs the server's secret block with the key derived from the
    /// password, proving knowledge of it.
    pub fn password_claim(
        &self,
        pool_id: &str,
        password: &str,
        verifier: &PasswordVerifier<'_>,
        now: DateTime<Utc>,
    ) -> Result<PasswordClaim> {
        let pool_name = pool_id
            .split_once('_')
            .map(|(_, name)| name)
            .with_context(|| format!("user pool id {pool_id} has no region prefix"))?;

        let key = self.derive_key(pool_name, verifier, password)?;
        let secret_block = STANDARD
            .decode(verifier.secret_block)
            .context("SECRET_BLOCK is not base64")?;
        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();

        let mut mac = HmacSha256::new_from_slice(&key).unwrap_or_else(|_| unreachable!());
        mac.update(pool_name.as_bytes());
        mac.update(verifier.user_id_for_srp.as_bytes());
        mac.update(&secret_block);
        mac.update(timestamp.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        Ok(PasswordClaim {
            timestamp,
            signature,
        })
    }

    fn derive_key(
        &self,
        pool_name: &str,
        verifier: &PasswordVerifier<'_>,
        password: &str,
    ) -> Result<[u8; 16]> {
        let big_b = BigUint::parse_bytes(verifier.srp_b.as_bytes(), 16)
            .context("SRP_B is not hex")?;
        ensure!(!(&big_b % &self.n).is_zero(), "server sent an invalid SRP_B");

        let u = hash_to_int(&[&padded(&self.big_a), &padded(&big_b)]);
        ensure!(!u.is_zero(), "SRP scrambling parameter is zero");

        let identity = Sha256::digest(
            format!("{pool_name}{}:{password}", verifier.user_id_for_srp).as_bytes(),
        );
        let x = hash_to_int(&[&padded_hex(verifier.salt)?, &identity]);

        let g_x = self.g.modpow(&x, &self.n);
        let base = (&big_b % &self.n + &self.n - (&self.k * g_x) % &self.n) % &self.n;
        let s = base.modpow(&(&self.a + &u * &x), &self.n);

        let salt = padded(&u);
        let mut key = [0u8; 16];
        Hkdf::<Sha256>::new(Some(salt.as_slice()), &padded(&s))
            .expand(DERIVED_KEY_INFO, &mut key)
            .unwrap_or_else(|_| unreachable!());
        Ok(key)
    }
}

impl Default for SrpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn modulus() -> BigUint {
    BigUint::parse_bytes(N_HEX.as_bytes(), 16).unwrap_or_else(|| unreachable!())
}

fn hash_to_int(parts: &[&[u8]]) -> BigUint {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    BigUint::from_bytes_be(&hasher.finalize())
}

/// Big-endian bytes with a leading zero whenever the top bit is set, so the
/// value never reads as negative.
fn padded(n: &BigUint) -> Vec<u8> {
    let mut bytes = n.to_bytes_be();
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    bytes
}

/// Like [`padded`], for a hex string whose leading zeros must survive.
fn padded_hex(hex_str: &str) -> Result<Vec<u8>> {
    let padded = if hex_str.len() % 2 == 1 {
        format!("0{hex_str}")
    } else if hex_str.starts_with(|c: char| matches!(c, '8'..='9' | 'a'..='f' | 'A'..='F')) {
        format!("00{hex_str}")
    } else {
        hex_str.to_owned()
    };
    hex::decode(padded).context("SALT is not hex")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    const SRP_A: &str = concat!(
        "8a950a979867216cff55d2c47ccceb844081aba9ebf118a340bcb2f3326c94e1",
        "13b813df0307245d155a474b45dd4cd5167dea3de01375128d33c513d8aaafd7",
        "d6cea4282f63f4ccf84777f92a0dcbd3907ce548576c31a3d50c455c647fa48d",
        "4460e997720b073c03e14764f54c4f50167328885faea1da7e1e3e914c283db1",
        "57a53c44220312528a9d3932501cf7d1d208b298c7eb819812aaf49a7063a335",
        "d1a6309098ef3b01f28c7fb8f5215c0bcd515f72b8fdaada5db2e7df6396ec05",
        "893ac0082b8d5c1b355767e8ab6ec729697076fe697e3a88ca52d1fca660de63",
        "1c97e0f48ff249ae30d55b2824ec3e79f7e5c63afd9c1ec266c657d41c55ec11",
        "ed67d668df95aa668c921c53330a04c810874d7e55accd57cf420cfd6620d48a",
        "d846d50dbf60fa8229d44c0fb5d89eedf14aa8bff85dc337445dae639c98d1f1",
        "de07a86fb8e2725aa3cc01d7f53c0387da9e535109f0948c90f75720bcfe33c9",
        "bdb4e580fc34730d34196db38c4cec3a0d8278ad15c21fccb2b52f22c7368361",
    );

    const SRP_B: &str = concat!(
        "8d236d5329b04a0f98ff466b95c513990ca56bea4aa8141a749b2b273e0ba7d9",
        "70eed7d5b7b770be7eac2f1e14f4f31ce396c27a028749649d9d86cafc0b9d55",
        "9e216eb5b26e326bd975607202ed179cc769fe8bfe0635c48f789fda9bd918e8",
        "2448f994cdc029723f2f10582fbf2564862528d6162b381470855e8294a948a6",
        "792c011ba853335549aa221889ea0831b6402bde9c0f38981f00b2732714cdde",
        "acbbb81428a6e34603ea10668f39167f7c2e42356ede8547bf5ce024c7648826",
        "0cb07abb68bcd8c71dff535daa9cccfa52293f6628930aa253122014fa8430bb",
        "d33ae6014a7b4d3086413ca8c31592475faedeb73c9eee4351fb4a0584d424de",
        "8cfb29b02af949e2c4809104b08193ea41f4a940580692d9c7a3db3c3c4319c3",
        "8ec632ec04dd90ca97c54210be67f373cbefa15dfa948fcb9fafcc27f0fa56bd",
        "c13e1d19c438db38a0d5bdd5817116b45f25cf29d6e5205ced35a35f7c3c9c56",
        "da27005d0569ccb0174bf2a0a88d0017fb76b48d2cce291ed0f5da4063b1e4dd",
    );

    fn client() -> SrpClient {
        SrpClient::with_secret(BigUint::parse_bytes("7c".repeat(64).as_bytes(), 16).unwrap())
    }

    fn verifier() -> PasswordVerifier<'static> {
        PasswordVerifier {
            user_id_for_srp: "0f6c-user",
            salt: "8a3b0c1d2e3f40516273",
            srp_b: SRP_B,
            secret_block: "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8gISIjJCUmJw==",
        }
    }

    #[test]
    fn multiplier_matches_group() {
        assert_eq!(
            format!("{:x}", client().k),
            "538282c4354742d7cbbde2359fcf67f9f5b3a6b08791e5011b43b8a5b66d9ee6"
        );
    }

    #[test]
    fn derives_public_value() {
        assert_eq!(client().public_a(), SRP_A);
    }

    #[test]
    fn signs_secret_block() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        let claim = client()
            .password_claim("us-east-1_GUFWfhI7g", "hunter2", &verifier(), now)
            .unwrap();

        assert_eq!(claim.timestamp, "Tue Jan 2 03:04:05 UTC 2024");
        assert_eq!(claim.signature, "f50B1I8ZRGkXFqDESL+tzOXJOt3aneG+kIrU02KmRiQ=");
    }

    #[test]
    fn wrong_password_changes_signature() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

        let claim = client()
            .password_claim("us-east-1_GUFWfhI7g", "hunter3", &verifier(), now)
            .unwrap();

        assert_ne!(claim.signature, "f50B1I8ZRGkXFqDESL+tzOXJOt3aneG+kIrU02KmRiQ=");
    }

    #[test]
    fn rejects_degenerate_server_value() {
        let now = Utc::now();
        let verifier = PasswordVerifier {
            srp_b: N_HEX,
            ..verifier()
        };

        assert!(
            client()
                .password_claim("us-east-1_GUFWfhI7g", "hunter2", &verifier, now)
                .is_err()
        );
    }

    #[test]
    fn pads_like_signed_integers() {
        assert_eq!(padded(&BigUint::from(0x7fu32)), vec![0x7f]);
        assert_eq!(padded(&BigUint::from(0x80u32)), vec![0x00, 0x80]);
        assert_eq!(padded_hex("abc").unwrap(), vec![0x0a, 0xbc]);
        assert_eq!(padded_hex("0a8b").unwrap(), vec![0x0a, 0x8b]);
        assert_eq!(padded_hex("8a").unwrap(), vec![0x00, 0x8a]);
    }
}

use hmac::{Hmac, Mac};
use krpc_encoding::{encode_peer, NodeID};
use rand::Rng;
use sha1::Sha1;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

type HmacSha1 = Hmac<Sha1>;

const SECRET_LEN: usize = 20;

/// How often the session secret is replaced. Tokens minted under the
/// previous secret stay valid for one more interval.
const ROTATION_INTERVAL: Duration = Duration::from_secs(600);

/// Issues and checks `get_peers`/`announce_peer` tokens.
///
/// A token is the HMAC-SHA1 of `info_hash ‖ querier id ‖ endpoint` under a
/// random session secret, with the endpoint canonicalized to its 6-byte
/// compact form. Nothing is stored per token: an `announce_peer` is checked
/// by recomputing, which binds the token to the exact requester without any
/// per-info-hash state. A token captured from one peer is useless to any
/// other.
pub(crate) struct TokenMinter {
    current: [u8; SECRET_LEN],
    previous: Option<[u8; SECRET_LEN]>,
    rotated_at: Instant,
}

impl TokenMinter {
    pub(crate) fn new() -> TokenMinter {
        TokenMinter {
            current: rand::thread_rng().gen(),
            previous: None,
            rotated_at: Instant::now(),
        }
    }

    pub(crate) fn mint(
        &self,
        info_hash: &NodeID,
        querier: &NodeID,
        endpoint: SocketAddrV4,
    ) -> Vec<u8> {
        mac_for(&self.current, info_hash, querier, endpoint)
            .finalize()
            .into_bytes()
            .to_vec()
    }

    /// Checks `token` against the current secret, then against the previous
    /// one so announces straddling a rotation still land.
    pub(crate) fn verify(
        &self,
        token: &[u8],
        info_hash: &NodeID,
        querier: &NodeID,
        endpoint: SocketAddrV4,
    ) -> bool {
        let check = |secret: &[u8; SECRET_LEN]| {
            mac_for(secret, info_hash, querier, endpoint)
                .verify_slice(token)
                .is_ok()
        };
        check(&self.current) || self.previous.as_ref().map_or(false, check)
    }

    /// Rotates the secret once [`ROTATION_INTERVAL`] has passed. Returns
    /// whether a rotation happened.
    pub(crate) fn rotate_if_due(&mut self) -> bool {
        if self.rotated_at.elapsed() < ROTATION_INTERVAL {
            return false;
        }
        self.rotate();
        true
    }

    fn rotate(&mut self) {
        self.previous = Some(std::mem::replace(
            &mut self.current,
            rand::thread_rng().gen(),
        ));
        self.rotated_at = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn force_rotate(&mut self) {
        self.rotate();
    }
}

fn mac_for(
    secret: &[u8; SECRET_LEN],
    info_hash: &NodeID,
    querier: &NodeID,
    endpoint: SocketAddrV4,
) -> HmacSha1 {
    let mut mac = HmacSha1::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(info_hash.as_bytes());
    mac.update(querier.as_bytes());
    mac.update(&encode_peer(&endpoint));
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([10, 0, 0, 1].into(), port)
    }

    #[test]
    fn token_binds_to_the_full_triple() {
        let minter = TokenMinter::new();
        let info_hash = NodeID::new([1; 20]);
        let querier = NodeID::new([2; 20]);
        let token = minter.mint(&info_hash, &querier, endpoint(6881));

        assert_eq!(token.len(), 20);
        assert!(minter.verify(&token, &info_hash, &querier, endpoint(6881)));
        assert!(!minter.verify(&token, &NodeID::new([9; 20]), &querier, endpoint(6881)));
        assert!(!minter.verify(&token, &info_hash, &NodeID::new([9; 20]), endpoint(6881)));
        assert!(!minter.verify(&token, &info_hash, &querier, endpoint(6882)));
    }

    #[test]
    fn previous_secret_is_honored_for_one_rotation() {
        let mut minter = TokenMinter::new();
        let info_hash = NodeID::new([1; 20]);
        let querier = NodeID::new([2; 20]);
        let token = minter.mint(&info_hash, &querier, endpoint(6881));

        minter.force_rotate();
        assert!(minter.verify(&token, &info_hash, &querier, endpoint(6881)));

        minter.force_rotate();
        assert!(!minter.verify(&token, &info_hash, &querier, endpoint(6881)));
    }

    #[test]
    fn rotation_waits_for_the_interval() {
        let mut minter = TokenMinter::new();
        assert!(!minter.rotate_if_due());
        assert!(minter.previous.is_none());
    }
}

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Alphabet channel ids are drawn from: digits 2-9 and lowercase letters,
/// excluding `l` and `o` (too easily confused with `1` and `0` when a
/// channel id is read off one device and typed into another).
pub const CID_CHARS: &[u8] = b"23456789abcdefghijkmnpqrstuvwxyz";

/// Payload value a channel is created with, meaning "no payload yet".
pub const EMPTY_SENTINEL: &[u8] = b"{}";

/// A client id is opaque and accepted iff exactly this many code units
/// long.
pub const CLIENT_ID_LEN: usize = 256;

/// The stored state of one channel: a 4-tuple of expiry, registered
/// client ids, payload, and that payload's etag.
#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub ttl_epoch: u64,
    pub ids: Vec<String>,
    pub payload: Vec<u8>,
    pub etag: Option<String>,
}

impl Channel {
    pub fn new(ttl_epoch: u64, first_client_id: &str) -> Self {
        Self {
            ttl_epoch,
            ids: vec![first_client_id.to_string()],
            payload: EMPTY_SENTINEL.to_vec(),
            etag: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.payload == EMPTY_SENTINEL
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub fn valid_client_id(client_id: &str) -> bool {
    client_id.len() == CLIENT_ID_LEN
}

/// Draws a random channel id of `len` characters from [`CID_CHARS`].
pub fn generate_cid(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CID_CHARS[rng.gen_range(0..CID_CHARS.len())] as char)
        .collect()
}

pub fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}

//! Relay wire: each frame on a relay QUIC stream is a 32-byte HMAC-SHA256
//! signature followed by a JSON body. Binary payloads ride base64 inside the
//! JSON, matching what the launcher-side tooling expects.

use hmac::Hmac;
use hmac::Mac;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;

use crate::ProtoError;

pub const SIGNATURE_LEN: usize = 32;

/// ALPN the relay endpoint negotiates.
pub const ALPN: &[u8] = b"game-relay";

/// Default shared secret; overridable with `RELAY_SECRET`.
pub const DEFAULT_SECRET: &str = "shared-secret-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketType {
    Join,
    Leave,
    Data,
    Tcp,
    Udp,
    Broadcast,
    Migrate,
}

/// One relay packet body. `to` is absent on broadcasts and join/leave;
/// `payload` carries opaque game bytes for the data kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPacket {
    #[serde(rename = "type")]
    pub kind: PacketType,
    pub room: String,
    pub from: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_base64"
    )]
    pub payload: Option<Vec<u8>>,
}

mod opt_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let opt = Option::<String>::deserialize(d)?;
        match opt {
            Some(text) => STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

impl RelayPacket {
    pub fn join(room: impl Into<String>, from: i64) -> Self {
        Self {
            kind: PacketType::Join,
            room: room.into(),
            from,
            to: None,
            payload: None,
        }
    }

    pub fn leave(room: impl Into<String>, from: i64) -> Self {
        Self {
            kind: PacketType::Leave,
            room: room.into(),
            from,
            to: None,
            payload: None,
        }
    }

    pub fn migrate(room: impl Into<String>, new_host: i64) -> Self {
        Self {
            kind: PacketType::Migrate,
            room: room.into(),
            from: new_host,
            to: None,
            payload: None,
        }
    }
}

/// Signs and verifies relay frame bodies with a shared secret.
///
/// Verification is advisory: callers log a mismatch and keep the frame, so a
/// zeroed signature from an old client still routes.
#[derive(Clone)]
pub struct FrameSigner {
    key: Vec<u8>,
}

impl FrameSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    pub fn sign(&self, body: &[u8]) -> [u8; SIGNATURE_LEN] {
        // hmac accepts any key length; a zeroed signature is the documented
        // fallback and old receivers ignore signatures anyway
        let Ok(mut mac) = <Hmac<Sha256>>::new_from_slice(&self.key) else {
            return [0u8; SIGNATURE_LEN];
        };
        mac.update(body);
        mac.finalize().into_bytes().into()
    }

    pub fn verify(&self, signature: &[u8], body: &[u8]) -> bool {
        let mut mac = match <Hmac<Sha256>>::new_from_slice(&self.key) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(body);
        mac.verify_slice(signature).is_ok()
    }
}

impl std::fmt::Debug for FrameSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSigner").finish_non_exhaustive()
    }
}

/// Encode one relay frame: signature then JSON body.
pub fn encode_frame(signer: &FrameSigner, packet: &RelayPacket) -> Result<Vec<u8>, ProtoError> {
    let body = serde_json::to_vec(packet).map_err(|_| ProtoError::Malformed("json encode"))?;
    let mut out = Vec::with_capacity(SIGNATURE_LEN + body.len());
    out.extend_from_slice(&signer.sign(&body));
    out.extend_from_slice(&body);
    Ok(out)
}

/// Split one relay frame into its signature and decoded body.
pub fn decode_frame(frame: &[u8]) -> Result<(&[u8], RelayPacket), ProtoError> {
    if frame.len() < SIGNATURE_LEN {
        return Err(ProtoError::TooShort {
            need: SIGNATURE_LEN,
            got: frame.len(),
        });
    }
    let (sig, body) = frame.split_at(SIGNATURE_LEN);
    let packet = serde_json::from_slice(body).map_err(|_| ProtoError::Malformed("json decode"))?;
    Ok((sig, packet))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let signer = FrameSigner::new(DEFAULT_SECRET);
        let packet = RelayPacket {
            kind: PacketType::Data,
            room: "room".into(),
            from: 7,
            to: Some(9),
            payload: Some(vec![0xFF, 0x15, 0x06, 0x00, 0x01, 0x00]),
        };
        let frame = encode_frame(&signer, &packet).unwrap();
        let (sig, decoded) = decode_frame(&frame).unwrap();
        assert!(signer.verify(sig, &frame[SIGNATURE_LEN..]));
        assert_eq!(decoded, packet);
    }

    #[test]
    fn zeroed_signature_still_decodes() {
        let signer = FrameSigner::new(DEFAULT_SECRET);
        let mut frame = encode_frame(&signer, &RelayPacket::join("room", 7)).unwrap();
        frame[..SIGNATURE_LEN].fill(0);
        let (sig, decoded) = decode_frame(&frame).unwrap();
        assert!(!signer.verify(sig, &frame[SIGNATURE_LEN..]));
        assert_eq!(decoded.kind, PacketType::Join);
    }

    #[test]
    fn kind_names_are_lowercase_on_the_wire() {
        let body = serde_json::to_string(&RelayPacket::migrate("room", 3)).unwrap();
        assert!(body.contains("\"type\":\"migrate\""));
        assert!(!body.contains("payload"));
    }
}

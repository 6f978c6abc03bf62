//! X3DH asynchronous key agreement.
//!
//! Stateless: nothing here touches storage. The session manager calls the
//! initiator half with a peer's published bundle, and the responder half
//! with the keys referenced by an incoming [`PreKeyMessage`].
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)          (only when a one-time prekey was used)
//!
//! root ‖ chain = HKDF(salt = 0^32, ikm = 0xFF^32 ‖ DH1 ‖ DH2 ‖ DH3 [‖ DH4],
//!                     info = "CinderX3DH", 64)
//! ```

use bytes::{BufMut, BytesMut};
use cinder_crypto::{
    ENCODED_PUBLIC_KEY_SIZE, IDENTITY_KEY_SIZE, IdentityKey, IdentityKeyPair, KeyPair, PublicKey,
    Secret, Signature, kdf,
};
use zeroize::Zeroizing;

use crate::{
    E2eeError,
    codec::{Reader, malformed},
    env::Environment,
    prekey::verify_signed_pre_key,
};

/// Current `PreKeyMessage` wire version.
pub const PRE_KEY_MESSAGE_VERSION: u8 = 3;

/// Domain-separation prefix placed before the DH outputs.
const KDF_PREFIX: [u8; 32] = [0xFF; 32];

/// Published key material needed to start a session with a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Registration id of the publishing device
    pub registration_id: u32,
    /// Device id of the publishing device
    pub device_id: u32,
    /// Long-term identity key
    pub identity_key: IdentityKey,
    /// Id of the signed prekey
    pub signed_pre_key_id: u32,
    /// Signed prekey public half
    pub signed_pre_key: PublicKey,
    /// Identity signature over the encoded signed prekey
    pub signed_pre_key_signature: Signature,
    /// Unused one-time prekey `(id, public key)`, if any were left
    pub one_time_pre_key: Option<(u32, PublicKey)>,
}

impl PreKeyBundle {
    /// Check the signed prekey signature against the bundle's identity.
    pub fn verify(&self) -> Result<(), E2eeError> {
        verify_signed_pre_key(
            &self.identity_key,
            &self.signed_pre_key,
            &self.signed_pre_key_signature,
        )
    }
}

/// Concatenated DH outputs (with prefix). Zeroed on drop.
pub struct X3dhSecret {
    material: Zeroizing<Vec<u8>>,
    used_one_time_pre_key: bool,
}

impl X3dhSecret {
    fn new(outputs: &[Secret<32>]) -> Self {
        let mut material = Zeroizing::new(Vec::with_capacity(32 * (outputs.len() + 1)));
        material.extend_from_slice(&KDF_PREFIX);
        for output in outputs {
            material.extend_from_slice(output.as_bytes());
        }
        Self { material, used_one_time_pre_key: outputs.len() == 4 }
    }

    /// True if four DH values went into the secret.
    pub fn used_one_time_pre_key(&self) -> bool {
        self.used_one_time_pre_key
    }
}

/// Root and first chain key of a new session.
#[derive(Debug)]
pub struct InitialKeys {
    /// Root key for the DH ratchet
    pub root_key: Secret<32>,
    /// First symmetric chain key (initiator sending, responder receiving)
    pub chain_key: Secret<32>,
}

/// Initiator side: verify the bundle, generate an ephemeral key and compute
/// the shared secret.
///
/// Returns the secret and the ephemeral key pair, whose public half becomes
/// the `base_key` of the [`PreKeyMessage`].
///
/// # Errors
///
/// - `InvalidSignature`: the signed prekey is not signed by the bundle's
///   identity
/// - `DecryptionFailed`: a bundle key is a low-order point
pub fn initiator_calculate_secret<E: Environment>(
    identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
    env: &E,
) -> Result<(X3dhSecret, KeyPair), E2eeError> {
    bundle.verify()?;

    let ephemeral = KeyPair::from_random(env.random_array());

    let mut outputs = vec![
        identity.dh_key_pair().diffie_hellman(&bundle.signed_pre_key)?,
        ephemeral.diffie_hellman(bundle.identity_key.dh_key())?,
        ephemeral.diffie_hellman(&bundle.signed_pre_key)?,
    ];
    if let Some((_, one_time)) = &bundle.one_time_pre_key {
        outputs.push(ephemeral.diffie_hellman(one_time)?);
    }

    Ok((X3dhSecret::new(&outputs), ephemeral))
}

/// Responder side: compute the same secret from our prekeys and the
/// initiator's identity and ephemeral key.
pub fn responder_calculate_secret(
    identity: &IdentityKeyPair,
    signed_pre_key: &KeyPair,
    one_time_pre_key: Option<&KeyPair>,
    peer_identity: &IdentityKey,
    peer_ephemeral: &PublicKey,
) -> Result<X3dhSecret, E2eeError> {
    let mut outputs = vec![
        signed_pre_key.diffie_hellman(peer_identity.dh_key())?,
        identity.dh_key_pair().diffie_hellman(peer_ephemeral)?,
        signed_pre_key.diffie_hellman(peer_ephemeral)?,
    ];
    if let Some(one_time) = one_time_pre_key {
        outputs.push(one_time.diffie_hellman(peer_ephemeral)?);
    }

    Ok(X3dhSecret::new(&outputs))
}

/// Derive the root key and first chain key from the shared secret.
pub fn derive_initial_keys(secret: &X3dhSecret) -> InitialKeys {
    let material = kdf::hkdf::<64>(Some(&[0u8; 32]), &secret.material, kdf::X3DH_LABEL);
    let (root_key, chain_key) = kdf::split(&material);
    InitialKeys { root_key, chain_key }
}

/// First-contact header sent by the initiator until the responder replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    /// Initiator's registration id
    pub registration_id: u32,
    /// Initiator's identity key
    pub identity_key: IdentityKey,
    /// Initiator's ephemeral (base) key
    pub base_key: PublicKey,
    /// Responder's signed prekey used
    pub signed_pre_key_id: u32,
    /// Responder's one-time prekey used, if any
    pub one_time_pre_key_id: Option<u32>,
}

impl PreKeyMessage {
    /// Encode as `version | registrationId | identityKey | baseKey |
    /// signedPreKeyId | hasOneTime [| oneTimePreKeyId]`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(PRE_KEY_MESSAGE_VERSION);
        buf.put_u32(self.registration_id);
        buf.put_slice(&self.identity_key.encode());
        buf.put_slice(&self.base_key.encode());
        buf.put_u32(self.signed_pre_key_id);
        match self.one_time_pre_key_id {
            Some(id) => {
                buf.put_u8(1);
                buf.put_u32(id);
            },
            None => buf.put_u8(0),
        }
    }

    pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<Self, E2eeError> {
        let version = reader.u8()?;
        if version != PRE_KEY_MESSAGE_VERSION {
            return Err(E2eeError::UnsupportedVersion(version));
        }

        let registration_id = reader.u32()?;
        let identity_key =
            IdentityKey::decode(reader.bytes(IDENTITY_KEY_SIZE)?).map_err(malformed)?;
        let base_key =
            PublicKey::decode(reader.bytes(ENCODED_PUBLIC_KEY_SIZE)?).map_err(malformed)?;
        let signed_pre_key_id = reader.u32()?;
        let one_time_pre_key_id = match reader.u8()? {
            0 => None,
            1 => Some(reader.u32()?),
            _ => return Err(E2eeError::InvalidMessage),
        };

        Ok(Self { registration_id, identity_key, base_key, signed_pre_key_id, one_time_pre_key_id })
    }

    /// Decode a standalone encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, E2eeError> {
        let mut reader = Reader::new(bytes);
        let message = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(message)
    }
}

/// Package the initiator's identity, ephemeral key and the prekey ids used.
pub fn create_initial_message(
    identity_key: IdentityKey,
    registration_id: u32,
    base_key: PublicKey,
    bundle: &PreKeyBundle,
) -> PreKeyMessage {
    PreKeyMessage {
        registration_id,
        identity_key,
        base_key,
        signed_pre_key_id: bundle.signed_pre_key_id,
        one_time_pre_key_id: bundle.one_time_pre_key.as_ref().map(|(id, _)| *id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_env::TestEnv;

    struct Responder {
        identity: IdentityKeyPair,
        signed_pre_key: KeyPair,
        one_time_pre_key: KeyPair,
    }

    fn responder(env: &TestEnv) -> Responder {
        Responder {
            identity: IdentityKeyPair::from_random(env.random_array(), env.random_array()),
            signed_pre_key: KeyPair::from_random(env.random_array()),
            one_time_pre_key: KeyPair::from_random(env.random_array()),
        }
    }

    fn bundle(responder: &Responder, with_one_time: bool) -> PreKeyBundle {
        let signature = responder.identity.sign(&responder.signed_pre_key.public_key().encode());
        PreKeyBundle {
            registration_id: 42,
            device_id: 1,
            identity_key: responder.identity.public_key(),
            signed_pre_key_id: 7,
            signed_pre_key: *responder.signed_pre_key.public_key(),
            signed_pre_key_signature: signature,
            one_time_pre_key: with_one_time
                .then(|| (9, *responder.one_time_pre_key.public_key())),
        }
    }

    fn agree(with_one_time: bool) -> (InitialKeys, InitialKeys, bool) {
        let env = TestEnv::new(1);
        let alice = IdentityKeyPair::from_random(env.random_array(), env.random_array());
        let bob = responder(&env);
        let bundle = bundle(&bob, with_one_time);

        let (alice_secret, ephemeral) = initiator_calculate_secret(&alice, &bundle, &env).unwrap();
        let bob_secret = responder_calculate_secret(
            &bob.identity,
            &bob.signed_pre_key,
            with_one_time.then_some(&bob.one_time_pre_key),
            &alice.public_key(),
            ephemeral.public_key(),
        )
        .unwrap();

        let used = alice_secret.used_one_time_pre_key();
        (derive_initial_keys(&alice_secret), derive_initial_keys(&bob_secret), used)
    }

    #[test]
    fn four_dh_agreement() {
        let (alice, bob, used) = agree(true);
        assert!(used);
        assert_eq!(alice.root_key, bob.root_key);
        assert_eq!(alice.chain_key, bob.chain_key);
        assert_ne!(alice.root_key, alice.chain_key);
    }

    #[test]
    fn three_dh_agreement() {
        let (alice, bob, used) = agree(false);
        assert!(!used);
        assert_eq!(alice.root_key, bob.root_key);
        assert_eq!(alice.chain_key, bob.chain_key);
    }

    #[test]
    fn missing_one_time_key_on_responder_diverges() {
        let env = TestEnv::new(2);
        let alice = IdentityKeyPair::from_random(env.random_array(), env.random_array());
        let bob = responder(&env);
        let bundle = bundle(&bob, true);

        let (alice_secret, ephemeral) = initiator_calculate_secret(&alice, &bundle, &env).unwrap();
        let bob_secret = responder_calculate_secret(
            &bob.identity,
            &bob.signed_pre_key,
            None,
            &alice.public_key(),
            ephemeral.public_key(),
        )
        .unwrap();

        assert_ne!(
            derive_initial_keys(&alice_secret).root_key,
            derive_initial_keys(&bob_secret).root_key
        );
    }

    #[test]
    fn forged_signed_pre_key_is_rejected() {
        let env = TestEnv::new(3);
        let alice = IdentityKeyPair::from_random(env.random_array(), env.random_array());
        let bob = responder(&env);
        let mut bundle = bundle(&bob, true);
        bundle.signed_pre_key = *KeyPair::from_random(env.random_array()).public_key();

        let result = initiator_calculate_secret(&alice, &bundle, &env);
        assert!(matches!(result, Err(E2eeError::InvalidSignature)));
    }

    #[test]
    fn initial_message_roundtrip() {
        let env = TestEnv::new(4);
        let alice = IdentityKeyPair::from_random(env.random_array(), env.random_array());
        let bob = responder(&env);
        let bundle = bundle(&bob, true);
        let ephemeral = KeyPair::from_random(env.random_array());

        let message =
            create_initial_message(alice.public_key(), 77, *ephemeral.public_key(), &bundle);
        assert_eq!(message.signed_pre_key_id, 7);
        assert_eq!(message.one_time_pre_key_id, Some(9));

        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        assert_eq!(PreKeyMessage::decode(&buf).unwrap(), message);
    }

    #[test]
    fn initial_message_rejects_unknown_version() {
        let mut bytes = vec![PRE_KEY_MESSAGE_VERSION + 1];
        bytes.extend_from_slice(&[0u8; 120]);
        assert_eq!(
            PreKeyMessage::decode(&bytes).unwrap_err(),
            E2eeError::UnsupportedVersion(PRE_KEY_MESSAGE_VERSION + 1)
        );
    }
}

// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RSA → AES session key exchange.
//!
//! The client asks for the server's RSA public key, generates 32 random bytes
//! (16 byte AES-128 key followed by a 16 byte IV), seals them with RSA-OAEP and
//! sends them back. Both ends then encrypt every data payload with AES-128-CBC.
//! Control frames and all frame headers stay in the clear.
//!
//! ```text
//! client                                   server
//!   | -- CONTROL|REQUEST  [0]           -->  |
//!   | <-- CONTROL|RESPONSE [1] ++ pem    --  |   or [0] without a keypair
//!   | -- CONTROL|REQUEST  [1] ++ sealed  --> |
//!   | <-- CONTROL|RESPONSE [1]           --  |   server installs the key here
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use super::frame::{Frame, FrameFlags};
use super::session::{Role, Session};
use crate::service::EncryptionMode;
use crate::{AppError, AppResult};

pub const STATUS_FAILED: u8 = 0;
pub const STATUS_OK: u8 = 1;

const KEY_SIZE: usize = 16;
const IV_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// First payload byte of an InternalControl request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCode {
    RequestRsaPublicKey = 0,
    SendAesKeysViaRsa = 1,
}

impl TryFrom<u8> for ControlCode {
    type Error = AppError;

    fn try_from(value: u8) -> AppResult<Self> {
        match value {
            0 => Ok(ControlCode::RequestRsaPublicKey),
            1 => Ok(ControlCode::SendAesKeysViaRsa),
            other => Err(AppError::ProtocolViolation(format!(
                "unknown control code {}",
                other
            ))),
        }
    }
}

/// AES key and IV of one session.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl KeyMaterial {
    pub fn generate() -> KeyMaterial {
        let mut bytes = [0u8; KEY_SIZE + IV_SIZE];
        OsRng.fill_bytes(&mut bytes);
        KeyMaterial::split(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> AppResult<KeyMaterial> {
        if bytes.len() != KEY_SIZE + IV_SIZE {
            return Err(AppError::Crypto(format!(
                "session key material must be {} bytes, got {}",
                KEY_SIZE + IV_SIZE,
                bytes.len()
            )));
        }
        Ok(KeyMaterial::split(bytes))
    }

    fn split(bytes: &[u8]) -> KeyMaterial {
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        key.copy_from_slice(&bytes[..KEY_SIZE]);
        iv.copy_from_slice(&bytes[KEY_SIZE..KEY_SIZE + IV_SIZE]);
        KeyMaterial { key, iv }
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE + IV_SIZE] {
        let mut bytes = [0u8; KEY_SIZE + IV_SIZE];
        bytes[..KEY_SIZE].copy_from_slice(&self.key);
        bytes[KEY_SIZE..].copy_from_slice(&self.iv);
        bytes
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// AES-128-CBC with PKCS#7 padding under a fixed key and IV.
///
/// The key schedule is expanded on first use and shared read-only afterwards.
pub struct SessionCipher {
    material: KeyMaterial,
    block: OnceLock<Aes128>,
}

impl SessionCipher {
    pub fn new(material: KeyMaterial) -> SessionCipher {
        SessionCipher {
            material,
            block: OnceLock::new(),
        }
    }

    fn block(&self) -> &Aes128 {
        self.block
            .get_or_init(|| Aes128::new(&self.material.key.into()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::inner_iv_init(self.block().clone(), &self.material.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> AppResult<Vec<u8>> {
        Aes128CbcDec::inner_iv_init(self.block().clone(), &self.material.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| AppError::ProtocolViolation("payload does not decrypt".into()))
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("expanded", &self.block.get().is_some())
            .finish()
    }
}

/// Server RSA keypair. Only the public half is ever exported.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public_pem: String,
}

impl RsaKeyPair {
    pub fn generate(bits: usize) -> AppResult<RsaKeyPair> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| AppError::Crypto(format!("generate {} bit RSA key: {}", bits, e)))?;
        RsaKeyPair::from_private_key(private)
    }

    pub fn from_private_key(private: RsaPrivateKey) -> AppResult<RsaKeyPair> {
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Crypto(format!("export RSA public key: {}", e)))?;
        Ok(RsaKeyPair {
            private,
            public_pem,
        })
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn open_key_material(&self, sealed: &[u8]) -> AppResult<KeyMaterial> {
        let plain = self
            .private
            .decrypt(Oaep::new::<Sha1>(), sealed)
            .map_err(|e| AppError::Crypto(format!("RSA-OAEP decrypt: {}", e)))?;
        KeyMaterial::from_bytes(&plain)
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("public_pem", &self.public_pem)
            .finish()
    }
}

/// Seals `material` for the holder of the PEM encoded public key.
pub fn seal_key_material(public_pem: &str, material: &KeyMaterial) -> AppResult<Vec<u8>> {
    let public = RsaPublicKey::from_public_key_pem(public_pem)
        .map_err(|e| AppError::Crypto(format!("import RSA public key: {}", e)))?;
    public
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &material.to_bytes())
        .map_err(|e| AppError::Crypto(format!("RSA-OAEP encrypt: {}", e)))
}

/// Server-side key source.
///
/// Disabled stores never hold a keypair. Otherwise the keypair is either injected
/// up front or generated on a blocking thread the first time a client asks.
pub struct KeyStore {
    mode: EncryptionMode,
    bits: usize,
    keys: OnceCell<Option<Arc<RsaKeyPair>>>,
}

impl KeyStore {
    pub fn new(mode: EncryptionMode, bits: usize) -> KeyStore {
        KeyStore {
            mode,
            bits,
            keys: OnceCell::new(),
        }
    }

    pub fn with_keypair(mode: EncryptionMode, keypair: Arc<RsaKeyPair>) -> KeyStore {
        let keys = if mode == EncryptionMode::Disabled {
            OnceCell::new_with(Some(None))
        } else {
            OnceCell::new_with(Some(Some(keypair)))
        };
        KeyStore {
            mode,
            bits: 0,
            keys,
        }
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub async fn keypair(&self) -> Option<Arc<RsaKeyPair>> {
        if self.mode == EncryptionMode::Disabled {
            return None;
        }
        let bits = self.bits;
        self.keys
            .get_or_init(|| async move {
                debug!("generating {} bit RSA keypair", bits);
                match tokio::task::spawn_blocking(move || RsaKeyPair::generate(bits)).await {
                    Ok(Ok(keypair)) => Some(Arc::new(keypair)),
                    Ok(Err(e)) => {
                        error!("RSA keypair unavailable: {}", e);
                        None
                    }
                    Err(e) => {
                        error!("RSA key generation task failed: {}", e);
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("mode", &self.mode)
            .field("bits", &self.bits)
            .field("ready", &self.keys.initialized())
            .finish()
    }
}

fn handshake_failure(stage: &str, error: AppError) -> AppError {
    match error {
        AppError::HandshakeFailure(_) => error,
        other => AppError::HandshakeFailure(format!("{}: {}", stage, other)),
    }
}

/// Client side of the exchange.
///
/// The send lock is held for both round trips so no data frame is written while
/// the key is in flux. The receive loop installs the staged key when it sees the
/// server accept it, which keeps decryption aligned with the server's switch.
pub(crate) async fn negotiate(session: &Arc<Session>, timeout: Duration) -> AppResult<()> {
    if session.is_encrypted() {
        return Ok(());
    }
    if session.role() != Role::Client {
        return Err(AppError::InvalidOperation(
            "only the connecting side starts a handshake".into(),
        ));
    }
    let control_request = FrameFlags::INTERNAL_CONTROL | FrameFlags::REQUEST;

    let mut sender = session.lock_sender().await;
    session.begin_negotiation();

    let message_id = sender.next_message_id();
    let waiter = session.replies().register(message_id);
    sender
        .write_frame(
            session.id(),
            control_request,
            message_id,
            &[ControlCode::RequestRsaPublicKey as u8],
        )
        .await
        .map_err(|e| handshake_failure("request public key", e))?;
    let reply = waiter
        .wait(session.replies(), timeout)
        .await
        .map_err(|e| handshake_failure("request public key", e))?;
    let public_pem = match reply.split_first() {
        Some((&STATUS_OK, pem)) => std::str::from_utf8(pem)
            .map_err(|_| AppError::HandshakeFailure("public key is not valid PEM text".into()))?,
        _ => {
            return Err(AppError::HandshakeFailure(
                "peer has no RSA key to offer".into(),
            ))
        }
    };

    let material = KeyMaterial::generate();
    let sealed = seal_key_material(public_pem, &material)
        .map_err(|e| handshake_failure("seal session key", e))?;
    let mut body = Vec::with_capacity(1 + sealed.len());
    body.push(ControlCode::SendAesKeysViaRsa as u8);
    body.extend_from_slice(&sealed);

    let message_id = sender.next_message_id();
    session.stage_key(message_id, material);
    let waiter = session.replies().register(message_id);
    sender
        .write_frame(session.id(), control_request, message_id, &body)
        .await
        .map_err(|e| handshake_failure("send session key", e))?;
    let reply = waiter
        .wait(session.replies(), timeout)
        .await
        .map_err(|e| handshake_failure("send session key", e))?;
    drop(sender);

    if reply[..] != [STATUS_OK] || !session.is_encrypted() {
        return Err(AppError::HandshakeFailure(
            "peer refused the session key".into(),
        ));
    }
    Ok(())
}

/// Server side: answers one InternalControl request inline in the receive loop.
pub(crate) async fn answer(session: &Session, keys: &KeyStore, frame: Frame) -> AppResult<()> {
    let control_response = FrameFlags::INTERNAL_CONTROL | FrameFlags::RESPONSE;
    let (code, body) = match frame.payload.split_first() {
        Some((code, body)) => (ControlCode::try_from(*code)?, body),
        None => {
            return Err(AppError::ProtocolViolation(
                "empty control frame".into(),
            ))
        }
    };

    match code {
        ControlCode::RequestRsaPublicKey => {
            let reply = match keys.keypair().await {
                Some(keypair) => {
                    session.begin_negotiation();
                    let pem = keypair.public_key_pem().as_bytes();
                    let mut reply = Vec::with_capacity(1 + pem.len());
                    reply.push(STATUS_OK);
                    reply.extend_from_slice(pem);
                    reply
                }
                None => {
                    warn!(
                        "session {} asked for a public key, encryption is disabled",
                        session.id()
                    );
                    vec![STATUS_FAILED]
                }
            };
            let mut sender = session.lock_sender().await;
            sender
                .write_frame(session.id(), control_response, frame.message_id, &reply)
                .await
        }
        ControlCode::SendAesKeysViaRsa => {
            let material = match keys.keypair().await {
                Some(keypair) => match keypair.open_key_material(body) {
                    Ok(material) => Some(material),
                    Err(e) => {
                        warn!("session {} sent an unusable key: {}", session.id(), e);
                        None
                    }
                },
                None => None,
            };
            // reply and switch under the send lock so nothing encrypted precedes the reply
            let mut sender = session.lock_sender().await;
            match material {
                Some(material) if !session.is_encrypted() => {
                    sender
                        .write_frame(session.id(), control_response, frame.message_id, &[STATUS_OK])
                        .await?;
                    session.install_key(material);
                    Ok(())
                }
                _ => {
                    sender
                        .write_frame(
                            session.id(),
                            control_response,
                            frame.message_id,
                            &[STATUS_FAILED],
                        )
                        .await
                }
            }
        }
    }
}

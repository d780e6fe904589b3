use crate::codec::{Reader, put_flag, put_varint};
use crate::session::skipped::{SkippedKey, SkippedKeys};
use crate::{
    Error, KeyId, MessageSecret, RatchetId, RatchetSession, RootRatchet, SessionConfig,
    SymmetricChain, X25519PublicKey, X25519Secret,
};
use zeroize::Zeroize;

impl RatchetSession {
    /// Serializes the session for storage. The output holds live secrets.
    ///
    /// The config is not included; see [`RatchetSession::from_bytes`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.skipped_keys.len() * 48);

        out.extend_from_slice(self.ratchet_id.as_bytes());
        put_flag(&mut out, self.remote_key_id.is_some());
        if let Some(key_id) = &self.remote_key_id {
            out.extend_from_slice(key_id.as_bytes());
        }

        out.extend_from_slice(self.root.root_key());
        let mut dh_secret = self.root.dh_secret().to_bytes();
        out.extend_from_slice(&dh_secret);
        dh_secret.zeroize();
        out.extend_from_slice(self.root.remote_dh_public_key().as_bytes());
        write_chain(&mut out, self.root.sending_chain());
        write_chain(&mut out, self.root.receiving_chain());

        put_varint(&mut out, self.previous_chain_length);

        let entries = self.skipped_keys.entries();
        put_varint(&mut out, entries.len() as u64);
        for entry in entries {
            put_varint(&mut out, entry.message_number);
            out.extend_from_slice(entry.secret.as_bytes());
            put_varint(&mut out, entry.created_at);
        }

        put_varint(&mut out, self.last_ratchet_at);
        out
    }

    /// Restores a session written by [`RatchetSession::to_bytes`] with
    /// [`SessionConfig::default`]; apply a custom config with
    /// [`RatchetSession::with_config`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader::new(bytes);

        let ratchet_id = RatchetId::from(reader.array()?);
        let remote_key_id = if reader.flag()? {
            Some(KeyId::from(reader.array()?))
        } else {
            None
        };

        let root_key = read_secret(&mut reader)?;
        let dh_secret = X25519Secret::from(read_secret(&mut reader)?);
        let remote_dh_public = X25519PublicKey::from(reader.array::<32>()?);
        let sending_chain = read_chain(&mut reader)?;
        let receiving_chain = read_chain(&mut reader)?;
        let root = RootRatchet::from_parts(
            root_key,
            dh_secret,
            remote_dh_public,
            sending_chain,
            receiving_chain,
        );

        let previous_chain_length = reader.varint()?;

        let count = reader.varint()?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let message_number = reader.varint()?;
            let secret = MessageSecret::from(read_secret(&mut reader)?);
            let created_at = reader.varint()?;
            entries.push(SkippedKey {
                message_number,
                secret,
                created_at,
            });
        }

        let last_ratchet_at = reader.varint()?;
        reader.finish()?;

        Ok(Self {
            ratchet_id,
            remote_key_id,
            root,
            previous_chain_length,
            skipped_keys: SkippedKeys::from_entries(entries),
            last_ratchet_at,
            config: SessionConfig::default(),
        })
    }
}

fn write_chain(out: &mut Vec<u8>, chain: &SymmetricChain) {
    put_flag(out, chain.is_initialized());
    if let Some(chain_key) = chain.chain_key() {
        out.extend_from_slice(chain_key);
    }
    put_varint(out, chain.message_number());
}

fn read_chain(reader: &mut Reader<'_>) -> Result<SymmetricChain, Error> {
    let chain_key = if reader.flag()? {
        Some(read_secret(reader)?)
    } else {
        None
    };
    Ok(SymmetricChain::restore(chain_key, reader.varint()?))
}

fn read_secret(reader: &mut Reader<'_>) -> Result<Box<[u8; 32]>, Error> {
    let mut secret = Box::new([0u8; 32]);
    secret.copy_from_slice(reader.bytes(32)?);
    Ok(secret)
}

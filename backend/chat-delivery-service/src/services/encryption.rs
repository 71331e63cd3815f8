use crate::error::AppResult;
use crate::metrics;
use crate::models::{Message, MessageView};
use crypto_core::{derive_key, open, seal, KEY_LEN};
use tracing::warn;

/// Server-managed at-rest encryption with one key per conversation, derived
/// from the master key. Sealed content is `nonce || ciphertext`.
#[derive(Clone)]
pub struct EncryptionService {
    master_key: [u8; KEY_LEN],
}

impl EncryptionService {
    pub fn new(master_key: [u8; KEY_LEN]) -> Self {
        Self { master_key }
    }

    fn conversation_key(&self, conversation_id: &str) -> AppResult<[u8; KEY_LEN]> {
        let context = format!("conversation:{conversation_id}");
        Ok(derive_key(&self.master_key, context.as_bytes())?)
    }

    pub fn encrypt(&self, conversation_id: &str, plaintext: &[u8]) -> AppResult<Vec<u8>> {
        let key = self.conversation_key(conversation_id)?;
        Ok(seal(plaintext, &key)?)
    }

    pub fn decrypt(&self, conversation_id: &str, sealed: &[u8]) -> AppResult<Vec<u8>> {
        let key = self.conversation_key(conversation_id)?;
        Ok(open(sealed, &key)?)
    }

    /// Plaintext as UTF-8, or `None` when it cannot be recovered.
    pub fn decrypt_text(&self, conversation_id: &str, sealed: &[u8]) -> Option<String> {
        let result = self
            .decrypt(conversation_id, sealed)
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|e| crate::error::AppError::Encryption(e.to_string()))
            });
        match result {
            Ok(text) => Some(text),
            Err(e) => {
                metrics::record_decrypt_failure();
                warn!(conversation_id, error = %e, "Message content could not be decrypted");
                None
            }
        }
    }

    pub fn view(&self, message: &Message) -> MessageView {
        MessageView::from_message(
            message,
            self.decrypt_text(&message.conversation_id, &message.content),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn keys_are_scoped_per_conversation() {
        let svc = EncryptionService::new([3u8; 32]);
        let sealed = svc.encrypt("c1", b"hi").unwrap();
        assert_eq!(svc.decrypt("c1", &sealed).unwrap(), b"hi");
        assert!(svc.decrypt("c2", &sealed).is_err());
        assert_eq!(svc.decrypt_text("c2", &sealed), None);
    }

    #[test]
    fn view_marks_unavailable_content() {
        let svc = EncryptionService::new([3u8; 32]);
        let message = Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: vec![0u8; 40],
            kind: Default::default(),
            reply_to: None,
            metadata: None,
            created_at: Utc::now(),
            edited_at: None,
            delivered: false,
            read_by: Default::default(),
            deleted_for: Default::default(),
            reactions: Default::default(),
        };
        let view = svc.view(&message);
        assert!(view.content.is_none());
        assert!(view.content_unavailable);
    }
}

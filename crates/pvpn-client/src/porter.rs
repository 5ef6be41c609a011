//! Зашифрованный экспорт и импорт сессии
//!
//! Бандл содержит конфигурацию пира и ключевую пару, зашифрованные
//! ключом, выведенным из парольной фразы с собственной случайной солью.
//! После импорта конфигурация пира снова проходит валидацию.

use std::sync::Arc;

use pvpn_core::crypto::{AeadCipher, EXPORT_KEY_INFO};
use pvpn_core::kdf::{derive_key, KdfParams, Salt};
use pvpn_core::{
    CryptoError, KeyPair, PeerConfig, Result, SecureBlob, SecureVault, SessionKey, VpnError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::controller::TunnelController;

/// Текущая версия формата бандла
pub const EXPORT_VERSION: u32 = 1;

/// Контекст AAD бандла
const EXPORT_CONTEXT: &[u8] = b"pvpn-export-bundle";

/// Версионированный документ экспорта
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    /// Версия формата
    pub version: u32,
    /// Параметры KDF парольной фразы
    pub kdf: KdfParams,
    /// Соль (base64)
    pub salt: String,
    /// Зашифрованное содержимое
    #[serde(flatten)]
    pub blob: SecureBlob,
}

impl ExportBundle {
    /// Сериализовать в JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|_| CryptoError::Encryption.into())
    }

    /// Разобрать JSON документ
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            warn!("Бандл экспорта не разобран: {}", e);
            CryptoError::Decryption(format!("бандл повреждён: {}", e)).into()
        })
    }
}

/// Открытое содержимое бандла (сериализация)
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadOut<'a> {
    peer_config: Value,
    private_key: &'a str,
    public_key: String,
}

/// Открытое содержимое бандла (разбор)
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadIn {
    peer_config: Value,
    private_key: String,
    public_key: String,
}

/// Результат импорта
#[derive(Debug)]
pub struct ImportedSession {
    /// Проверенная конфигурация пира
    pub peer_config: PeerConfig,
    /// Восстановленная ключевая пара
    pub key_pair: KeyPair,
}

/// Экспорт и импорт сессии
pub struct ConfigPorter {
    controller: TunnelController,
    vault: Arc<SecureVault>,
    params: KdfParams,
}

impl ConfigPorter {
    /// Создать портер
    pub fn new(controller: TunnelController, vault: Arc<SecureVault>, params: KdfParams) -> Self {
        Self {
            controller,
            vault,
            params,
        }
    }

    /// Экспортировать текущую или последнюю сессию
    pub async fn export(&self, passphrase: &str) -> Result<ExportBundle> {
        let (key_pair, peer) = self
            .controller
            .export_material()
            .await
            .ok_or(VpnError::NoSession)?;

        let private_key = key_pair.private_base64();
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&PayloadOut {
                peer_config: peer.to_value(),
                private_key: &private_key,
                public_key: key_pair.public_base64(),
            })
            .map_err(|_| CryptoError::Encryption)?,
        );
        drop(private_key);
        drop(key_pair);

        let salt = Salt::generate()?;
        let cipher = export_cipher(passphrase, salt, self.params).await?;
        let blob = SecureBlob::seal(&cipher, &plaintext, EXPORT_CONTEXT)?;

        info!("Сессия экспортирована ({})", peer.endpoint());

        Ok(ExportBundle {
            version: EXPORT_VERSION,
            kdf: self.params,
            salt: salt.to_base64(),
            blob,
        })
    }

    /// Импортировать бандл
    ///
    /// Неверная парольная фраза или повреждение дают `Integrity`/`Crypto`.
    pub async fn import(&self, bundle: &ExportBundle, passphrase: &str) -> Result<ImportedSession> {
        import_bundle(bundle, passphrase).await
    }

    /// Экспортировать и сохранить бандл в хранилище
    pub async fn export_to_vault(&self, name: &str, passphrase: &str) -> Result<ExportBundle> {
        let bundle = self.export(passphrase).await?;
        self.vault.put(name, bundle.to_json()?.as_bytes()).await?;
        Ok(bundle)
    }

    /// Прочитать бандл из хранилища и импортировать
    pub async fn import_from_vault(&self, name: &str, passphrase: &str) -> Result<ImportedSession> {
        let raw = self.vault.get(name).await?;
        let json = std::str::from_utf8(&raw)
            .map_err(|_| CryptoError::Decryption("бандл не в UTF-8".into()))?;
        let bundle = ExportBundle::from_json(json)?;
        import_bundle(&bundle, passphrase).await
    }
}

/// Импортировать бандл без контроллера (CLI)
pub async fn import_bundle(bundle: &ExportBundle, passphrase: &str) -> Result<ImportedSession> {
    if bundle.version != EXPORT_VERSION {
        return Err(CryptoError::UnsupportedAlgorithm(format!(
            "версия бандла {}",
            bundle.version
        ))
        .into());
    }

    let salt = Salt::from_base64(&bundle.salt)?;
    let cipher = export_cipher(passphrase, salt, bundle.kdf).await?;
    let plaintext = bundle.blob.open(&cipher, EXPORT_CONTEXT)?;

    let payload: PayloadIn = serde_json::from_slice(&plaintext)
        .map_err(|_| CryptoError::Decryption("содержимое бандла повреждено".into()))?;
    let private_key = Zeroizing::new(payload.private_key);

    let key_pair = KeyPair::from_private_base64(&private_key)?;
    if key_pair.public_base64() != payload.public_key {
        return Err(CryptoError::Decryption("ключевая пара не согласована".into()).into());
    }

    let peer_config = PeerConfig::from_value(payload.peer_config)?;

    info!(
        "Сессия импортирована ({}, ключ {})",
        peer_config.endpoint(),
        key_pair.fingerprint()
    );

    Ok(ImportedSession {
        peer_config,
        key_pair,
    })
}

async fn export_cipher(passphrase: &str, salt: Salt, params: KdfParams) -> Result<AeadCipher> {
    if passphrase.is_empty() {
        return Err(CryptoError::KeyDerivation("пустая парольная фраза".into()).into());
    }
    params.validate()?;

    let passphrase = Zeroizing::new(passphrase.to_string());
    let key: SessionKey =
        tokio::task::spawn_blocking(move || derive_key(passphrase.as_bytes(), &salt, &params))
            .await
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))??;

    Ok(AeadCipher::new(&key.subkey(EXPORT_KEY_INFO)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerSettings;
    use crate::provider::{SimulatedProvider, SimulationProfile};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use pvpn_core::kdf::KdfAlgorithm;
    use pvpn_core::storage::MemoryStorage;
    use std::time::Duration;

    fn fast_params() -> KdfParams {
        KdfParams {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: 8 * 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn raw_peer() -> String {
        serde_json::json!({
            "endpoint": "[2001:db8::1]:51820",
            "peerPublicKey": BASE64.encode([3u8; 32]),
            "allowedIPs": ["0.0.0.0/0", "::/0"],
            "dnsServers": ["9.9.9.9"],
            "clientAddress": "10.8.0.2/24",
            "persistentKeepalive": 25,
        })
        .to_string()
    }

    async fn porter() -> ConfigPorter {
        let provider = Arc::new(SimulatedProvider::new(SimulationProfile {
            handshake_delay: Duration::from_millis(1),
            disconnect_delay: Duration::from_millis(1),
            ..SimulationProfile::default()
        }));
        let controller = TunnelController::new(provider, ControllerSettings::default());
        let vault = Arc::new(
            SecureVault::with_key(
                Arc::new(MemoryStorage::new()),
                &SessionKey::from_bytes(&[5u8; 32]),
            )
            .unwrap(),
        );
        ConfigPorter::new(controller, vault, fast_params())
    }

    #[tokio::test]
    async fn test_export_without_session() {
        let porter = porter().await;
        assert!(matches!(porter.export("correct").await, Err(VpnError::NoSession)));
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let porter = porter().await;
        let info = porter.controller.connect(&raw_peer()).await.unwrap();

        let bundle = porter.export("correct").await.unwrap();
        let json = bundle.to_json().unwrap();
        assert!(json.contains("\"version\": 1"));
        assert!(json.contains("\"integrityTag\""));
        assert!(!json.contains("10.8.0.2"));

        let restored = ExportBundle::from_json(&json).unwrap();
        let imported = porter.import(&restored, "correct").await.unwrap();

        assert_eq!(imported.peer_config, PeerConfig::parse(&raw_peer()).unwrap());
        assert_eq!(Some(imported.key_pair.public_base64()), info.client_public_key);

        assert!(matches!(
            porter.import(&restored, "wrong").await,
            Err(VpnError::Integrity)
        ));
    }

    #[tokio::test]
    async fn test_tampered_bundle() {
        let porter = porter().await;
        porter.controller.connect(&raw_peer()).await.unwrap();
        let bundle = porter.export("correct").await.unwrap();

        let mut tampered = bundle.clone();
        tampered.blob.ciphertext[0] ^= 0x80;
        assert!(matches!(
            porter.import(&tampered, "correct").await,
            Err(VpnError::Integrity)
        ));

        let mut resalted = bundle.clone();
        resalted.salt = Salt::generate().unwrap().to_base64();
        assert!(matches!(
            porter.import(&resalted, "correct").await,
            Err(VpnError::Integrity)
        ));

        let mut future = bundle.clone();
        future.version = 2;
        assert!(matches!(
            porter.import(&future, "correct").await,
            Err(VpnError::Crypto(CryptoError::UnsupportedAlgorithm(_)))
        ));

        let mut weakened = bundle;
        weakened.kdf.memory_kib = 64;
        assert!(matches!(
            porter.import(&weakened, "correct").await,
            Err(VpnError::Crypto(CryptoError::WeakKdfParams(_)))
        ));
    }

    #[tokio::test]
    async fn test_reimport_revalidates_peer_config() {
        let porter = porter().await;
        let pair = KeyPair::generate().unwrap();

        // Бандл с некорректной конфигурацией пира, зашифрованный верным ключом
        let private_key = pair.private_base64();
        let plaintext = serde_json::to_vec(&PayloadOut {
            peer_config: serde_json::json!({"endpoint": "http://evil:1"}),
            private_key: &private_key,
            public_key: pair.public_base64(),
        })
        .unwrap();
        let salt = Salt::generate().unwrap();
        let cipher = export_cipher("correct", salt, fast_params()).await.unwrap();
        let bundle = ExportBundle {
            version: EXPORT_VERSION,
            kdf: fast_params(),
            salt: salt.to_base64(),
            blob: SecureBlob::seal(&cipher, &plaintext, EXPORT_CONTEXT).unwrap(),
        };

        assert!(matches!(
            porter.import(&bundle, "correct").await,
            Err(VpnError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_vault_roundtrip() {
        let porter = porter().await;
        porter.controller.connect(&raw_peer()).await.unwrap();

        porter.export_to_vault("backup", "correct").await.unwrap();
        let imported = porter.import_from_vault("backup", "correct").await.unwrap();
        assert_eq!(imported.peer_config.endpoint(), "[2001:db8::1]:51820");

        assert!(matches!(
            porter.import_from_vault("missing", "correct").await,
            Err(VpnError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_passphrase_rejected() {
        let porter = porter().await;
        porter.controller.connect(&raw_peer()).await.unwrap();
        assert!(matches!(
            porter.export("").await,
            Err(VpnError::Crypto(CryptoError::KeyDerivation(_)))
        ));
    }
}

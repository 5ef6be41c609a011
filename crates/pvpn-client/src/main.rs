//! Prime VPN Client CLI
//!
//! Управление туннельной сессией и защищённым хранилищем.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pvpn_client::porter::import_bundle;
use pvpn_client::provider::SimulationProfile;
use pvpn_client::{ClientConfig, ExportBundle, SimulatedProvider, VpnClient};
use pvpn_core::storage::FileStorage;
use pvpn_core::{KeyPair, PeerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

/// Переменная окружения с токеном аутентификации
const AUTH_TOKEN_ENV: &str = "PVPN_AUTH_TOKEN";

/// Переменная окружения с парольной фразой экспорта
const PASSPHRASE_ENV: &str = "PVPN_PASSPHRASE";

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(name = "pvpn-client")]
#[command(about = "Prime VPN tunnel session manager", long_about = None)]
struct Args {
    /// Путь к конфигурационному файлу
    #[arg(short, long, default_value = "client.toml")]
    config: PathBuf,

    /// Уровень логирования (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Подкоманды
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Генерация примера конфигурации
    GenerateConfig {
        /// Путь для сохранения
        #[arg(short, long, default_value = "client.toml")]
        output: PathBuf,
    },

    /// Сгенерировать ключевую пару X25519
    Keygen,

    /// Проверить конфигурацию пира (JSON)
    Validate {
        /// Файл конфигурации пира
        peer: PathBuf,
    },

    /// Подключиться через симулированного провайдера
    Simulate {
        /// Файл конфигурации пира
        #[arg(short, long)]
        peer: PathBuf,

        /// Длительность сессии (секунды)
        #[arg(short, long, default_value_t = 12)]
        duration: u64,

        /// Экспортировать сессию в файл перед отключением
        #[arg(short, long)]
        export: Option<PathBuf>,
    },

    /// Импортировать бандл экспорта
    Import {
        /// Файл бандла
        bundle: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Commands::GenerateConfig { output } = &args.command {
        if let Err(e) = generate_config(output) {
            eprintln!("Ошибка генерации конфигурации: {}", e);
            std::process::exit(1);
        }
        println!("Конфигурация сохранена в: {}", output.display());
        return;
    }

    // Загрузка конфигурации
    let config = if args.config.exists() {
        match ClientConfig::from_file(&args.config) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Ошибка загрузки конфигурации: {}", e);
                eprintln!("Проверьте файл: {}", args.config.display());
                std::process::exit(1);
            }
        }
    } else {
        ClientConfig::default()
    };

    // Инициализация логирования
    let log_level = args
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .parse::<Level>()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Не удалось установить global subscriber: {}", e);
    }

    if !args.config.exists() {
        warn!(
            "Конфигурационный файл {} не найден, используются значения по умолчанию",
            args.config.display()
        );
    }

    let result = match args.command {
        Commands::GenerateConfig { .. } => Ok(()),
        Commands::Keygen => keygen(),
        Commands::Validate { peer } => validate(&peer),
        Commands::Simulate {
            peer,
            duration,
            export,
        } => simulate(config, &peer, Duration::from_secs(duration), export.as_deref()).await,
        Commands::Import { bundle } => import(&bundle).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Генерация примера конфигурации
fn generate_config(path: &Path) -> anyhow::Result<()> {
    ClientConfig::default().to_file(path)
}

fn keygen() -> anyhow::Result<()> {
    let pair = KeyPair::generate()?;
    println!("PrivateKey = {}", &*pair.private_base64());
    println!("PublicKey = {}", pair.public_base64());
    println!("Fingerprint = {}", pair.fingerprint());
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("не удалось прочитать {}", path.display()))?;
    let peer = PeerConfig::parse(&raw)?;

    println!("✓ Конфигурация корректна");
    println!("  • Endpoint: {}", peer.endpoint());
    println!("  • Ключ пира: {}", peer.peer_fingerprint());
    println!(
        "  • AllowedIPs: {}",
        peer.allowed_ips()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  • Адрес клиента: {}", peer.client_address());
    Ok(())
}

async fn simulate(
    config: ClientConfig,
    peer_path: &Path,
    duration: Duration,
    export: Option<&Path>,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(peer_path)
        .with_context(|| format!("не удалось прочитать {}", peer_path.display()))?;

    let storage = Arc::new(FileStorage::open(&config.security.storage_dir).await?);
    let provider = Arc::new(SimulatedProvider::new(SimulationProfile::default()));
    let poll_interval = config.monitor_settings().poll_interval;
    let client = VpnClient::new(config, storage, provider).await?;

    info!("╔═══════════════════════════════════════════════════╗");
    info!("║      Prime VPN Client v{}                      ║", env!("CARGO_PKG_VERSION"));
    info!("╚═══════════════════════════════════════════════════╝");

    match std::env::var(AUTH_TOKEN_ENV) {
        Ok(token) => client.login(Zeroizing::new(token)).await?,
        Err(_) => warn!("{} не задан: хранилище останется заблокированным", AUTH_TOKEN_ENV),
    }

    let info = client.connect(&raw).await?;
    info!(
        "✓ Туннель активен: сессия {:?}, endpoint {}",
        info.session_id,
        info.endpoint.as_deref().unwrap_or("-")
    );

    let mut states = client.controller().subscribe();
    let deadline = tokio::time::Instant::now() + duration;
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Получен сигнал Ctrl+C, отключение...");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() || !states.borrow_and_update().has_session() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let status = client.status().await;
                if let Some(metrics) = status.metrics {
                    info!(
                        "{}: {:?}, ↓ {} байт, ↑ {} байт{}",
                        status.state,
                        metrics.duration,
                        metrics.bytes_in,
                        metrics.bytes_out,
                        if metrics.warning.is_some() { " (handshake устарел)" } else { "" }
                    );
                }
            }
        }
    }

    if let Some(path) = export {
        let passphrase = passphrase()?;
        let bundle = client.porter().export(&passphrase).await?;
        std::fs::write(path, bundle.to_json()?)?;
        info!("✓ Сессия экспортирована в {}", path.display());
    }

    let status = client.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if client.state().await == pvpn_core::TunnelState::Failed {
        client.reset().await?;
        bail!(
            "туннель завершился сбоем: {}",
            status.last_error.unwrap_or_default()
        );
    }

    client.disconnect().await?;
    info!("Клиент остановлен");
    Ok(())
}

async fn import(path: &Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("не удалось прочитать {}", path.display()))?;
    let bundle = ExportBundle::from_json(&json)?;
    let passphrase = passphrase()?;

    let imported = import_bundle(&bundle, &passphrase).await?;

    println!("✓ Бандл импортирован (создан {})", bundle.blob.created_at);
    println!("  • Endpoint: {}", imported.peer_config.endpoint());
    println!("  • Публичный ключ: {}", imported.key_pair.public_base64());
    Ok(())
}

fn passphrase() -> anyhow::Result<Zeroizing<String>> {
    match std::env::var(PASSPHRASE_ENV) {
        Ok(value) if !value.is_empty() => Ok(Zeroizing::new(value)),
        _ => bail!("парольная фраза не задана: установите {}", PASSPHRASE_ENV),
    }
}

//! Валидация конфигурации пира (сервера)
//!
//! Сырая конфигурация приходит от backend сервиса как JSON объект и
//! разбирается в закрытый тип [`PeerConfig`], инварианты которого проверены
//! на границе. Дальше в систему непроверенные данные не попадают.
//!
//! Поддерживаются две формы endpoint:
//! - `"endpoint": "host:port"` (IPv6 только в скобках: `"[::1]:51820"`)
//! - `"endpointHost": "host", "endpointPort": 51820` (порт числом или строкой)

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use zeroize::Zeroizing;

use crate::error::ValidationError;
use crate::keys::{public_key_fingerprint, KeyPair, X25519_KEY_SIZE};

/// Минимальный MTU туннеля
const MIN_MTU: u64 = 576;

/// Максимальный MTU туннеля
const MAX_MTU: u64 = 9000;

/// Максимальная длина DNS имени
const MAX_DOMAIN_LEN: usize = 253;

/// Максимальная длина метки DNS имени
const MAX_LABEL_LEN: usize = 63;

/// Хост endpoint: IP литерал или DNS имя
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// IPv4 или IPv6 адрес
    Ip(IpAddr),
    /// DNS имя (в нижнем регистре)
    Domain(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(ip) => write!(f, "{}", ip),
            Host::Domain(name) => f.write_str(name),
        }
    }
}

/// Диапазон адресов в нотации CIDR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    addr: IpAddr,
    prefix: u8,
}

impl IpCidr {
    /// Создать диапазон, проверив длину префикса
    pub fn new(addr: IpAddr, prefix: u8) -> Option<Self> {
        (prefix <= max_prefix(&addr)).then_some(Self { addr, prefix })
    }

    /// Диапазон из одного адреса (/32 или /128)
    pub fn host(addr: IpAddr) -> Self {
        Self {
            addr,
            prefix: max_prefix(&addr),
        }
    }

    /// Адрес
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Длина префикса
    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for IpCidr {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or("отсутствует длина префикса")?;
        let addr: IpAddr = addr.parse().map_err(|_| "некорректный IP адрес")?;

        if prefix.is_empty() || prefix.len() > 3 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err("некорректная длина префикса");
        }
        let prefix: u8 = prefix.parse().map_err(|_| "некорректная длина префикса")?;

        IpCidr::new(addr, prefix).ok_or("длина префикса больше размера адреса")
    }
}

impl fmt::Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Строка или список строк (backend присылает оба варианта)
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_items(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => s
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
            StringOrList::Many(items) => items,
        }
    }
}

/// Сырая конфигурация в том виде, в каком её прислал backend
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPeerConfig {
    endpoint: Option<String>,
    endpoint_host: Option<String>,
    endpoint_port: Option<Value>,
    peer_public_key: Option<String>,
    #[serde(rename = "allowedIPs", alias = "allowedIps")]
    allowed_ips: Option<StringOrList>,
    dns_servers: Option<StringOrList>,
    client_address: Option<String>,
    persistent_keepalive: Option<u64>,
    mtu: Option<u64>,
}

/// Проверенная конфигурация пира
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    endpoint_host: Host,
    endpoint_port: u16,
    peer_public_key: [u8; X25519_KEY_SIZE],
    allowed_ips: Vec<IpCidr>,
    dns_servers: Vec<IpAddr>,
    client_address: IpCidr,
    persistent_keepalive: Option<u16>,
    mtu: Option<u16>,
}

impl PeerConfig {
    /// Разобрать и проверить сырую конфигурацию (JSON)
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Разобрать и проверить уже декодированный JSON документ
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::Malformed("ожидается JSON объект".into()));
        }
        let raw: RawPeerConfig =
            serde_json::from_value(value).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawPeerConfig) -> Result<Self, ValidationError> {
        let (endpoint_host, endpoint_port) = match (raw.endpoint, raw.endpoint_host) {
            (Some(endpoint), _) => parse_endpoint(&endpoint)?,
            (None, Some(host)) => {
                let port = raw
                    .endpoint_port
                    .ok_or(ValidationError::MissingField("endpointPort"))?;
                let host = parse_host(host.trim()).map_err(|reason| {
                    ValidationError::InvalidEndpoint {
                        value: host.clone(),
                        reason,
                    }
                })?;
                (host, port_from_value(&port)?)
            }
            (None, None) => return Err(ValidationError::MissingField("endpoint")),
        };

        let peer_public_key = parse_public_key(
            &raw.peer_public_key
                .ok_or(ValidationError::MissingField("peerPublicKey"))?,
        )?;

        let allowed_ips = raw
            .allowed_ips
            .ok_or(ValidationError::MissingField("allowedIPs"))?
            .into_items();
        if allowed_ips.is_empty() {
            return Err(ValidationError::InvalidAllowedIps("список пуст".into()));
        }
        let allowed_ips = allowed_ips
            .iter()
            .map(|entry| {
                entry.trim().parse::<IpCidr>().map_err(|reason| {
                    ValidationError::InvalidAllowedIps(format!("'{}': {}", entry, reason))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let dns_servers = raw
            .dns_servers
            .map(StringOrList::into_items)
            .unwrap_or_default()
            .iter()
            .map(|entry| {
                entry
                    .trim()
                    .parse::<IpAddr>()
                    .map_err(|_| ValidationError::InvalidAddress {
                        field: "dnsServers",
                        value: entry.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let client_address = parse_client_address(
            &raw.client_address
                .ok_or(ValidationError::MissingField("clientAddress"))?,
        )?;

        let persistent_keepalive = match raw.persistent_keepalive {
            None | Some(0) => None,
            Some(secs) => Some(u16::try_from(secs).map_err(|_| {
                ValidationError::InvalidAddress {
                    field: "persistentKeepalive",
                    value: secs.to_string(),
                }
            })?),
        };

        let mtu = match raw.mtu {
            None => None,
            Some(mtu) if (MIN_MTU..=MAX_MTU).contains(&mtu) => Some(mtu as u16),
            Some(mtu) => {
                return Err(ValidationError::InvalidAddress {
                    field: "mtu",
                    value: mtu.to_string(),
                })
            }
        };

        Ok(Self {
            endpoint_host,
            endpoint_port,
            peer_public_key,
            allowed_ips,
            dns_servers,
            client_address,
            persistent_keepalive,
            mtu,
        })
    }

    /// Обратное преобразование в JSON документ
    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "endpointHost": self.endpoint_host.to_string(),
            "endpointPort": self.endpoint_port,
            "peerPublicKey": self.peer_public_key_base64(),
            "allowedIPs": self.allowed_ips.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "dnsServers": self.dns_servers.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "clientAddress": self.client_address.to_string(),
        });

        if let Some(map) = value.as_object_mut() {
            if let Some(keepalive) = self.persistent_keepalive {
                map.insert("persistentKeepalive".into(), json!(keepalive));
            }
            if let Some(mtu) = self.mtu {
                map.insert("mtu".into(), json!(mtu));
            }
        }

        value
    }

    /// Сериализовать в JSON строку; `parse(serialize(p)) == p`
    pub fn serialize(&self) -> String {
        self.to_value().to_string()
    }

    /// Хост endpoint
    pub fn endpoint_host(&self) -> &Host {
        &self.endpoint_host
    }

    /// Порт endpoint
    pub fn endpoint_port(&self) -> u16 {
        self.endpoint_port
    }

    /// Endpoint в виде `host:port` (IPv6 в скобках)
    pub fn endpoint(&self) -> String {
        match &self.endpoint_host {
            Host::Ip(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.endpoint_port),
            host => format!("{}:{}", host, self.endpoint_port),
        }
    }

    /// Публичный ключ пира
    pub fn peer_public_key(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.peer_public_key
    }

    /// Публичный ключ пира в base64
    pub fn peer_public_key_base64(&self) -> String {
        BASE64.encode(self.peer_public_key)
    }

    /// Отпечаток публичного ключа пира для логов
    pub fn peer_fingerprint(&self) -> String {
        public_key_fingerprint(&self.peer_public_key)
    }

    /// Маршрутизируемые через туннель диапазоны
    pub fn allowed_ips(&self) -> &[IpCidr] {
        &self.allowed_ips
    }

    /// DNS серверы туннеля
    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }

    /// Адрес клиента внутри туннеля
    pub fn client_address(&self) -> &IpCidr {
        &self.client_address
    }

    /// Интервал keepalive в секундах
    pub fn persistent_keepalive(&self) -> Option<u16> {
        self.persistent_keepalive
    }

    /// MTU туннеля
    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    /// Документ в формате wg-quick для платформенного движка
    ///
    /// Содержит приватный ключ, поэтому возвращается в зануляемой строке.
    pub fn to_wg_quick(&self, key_pair: &KeyPair) -> Zeroizing<String> {
        let mut out = Zeroizing::new(String::with_capacity(512));

        out.push_str("[Interface]\n");
        out.push_str("PrivateKey = ");
        out.push_str(&key_pair.private_base64());
        out.push('\n');
        out.push_str(&format!("Address = {}\n", self.client_address));
        if !self.dns_servers.is_empty() {
            out.push_str(&format!("DNS = {}\n", join(&self.dns_servers)));
        }
        if let Some(mtu) = self.mtu {
            out.push_str(&format!("MTU = {}\n", mtu));
        }

        out.push_str("\n[Peer]\n");
        out.push_str(&format!("PublicKey = {}\n", self.peer_public_key_base64()));
        out.push_str(&format!("AllowedIPs = {}\n", join(&self.allowed_ips)));
        out.push_str(&format!("Endpoint = {}\n", self.endpoint()));
        if let Some(keepalive) = self.persistent_keepalive {
            out.push_str(&format!("PersistentKeepalive = {}\n", keepalive));
        }

        out
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_endpoint(value: &str) -> Result<(Host, u16), ValidationError> {
    let invalid = |reason| ValidationError::InvalidEndpoint {
        value: value.to_string(),
        reason,
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid("пустой endpoint"));
    }
    if trimmed.contains("://") {
        return Err(invalid("URI схема недопустима"));
    }

    let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
        let (ip, port) = rest.split_once("]:").ok_or_else(|| invalid("отсутствует порт"))?;
        let ip: std::net::Ipv6Addr = ip.parse().map_err(|_| invalid("некорректный IPv6 адрес"))?;
        (Host::Ip(IpAddr::V6(ip)), port)
    } else {
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| invalid("отсутствует порт"))?;
        if host.contains(':') {
            return Err(invalid("IPv6 адрес должен быть в квадратных скобках"));
        }
        (parse_host(host).map_err(invalid)?, port)
    };

    let port = parse_port(port).map_err(invalid)?;
    Ok((host, port))
}

fn parse_host(host: &str) -> Result<Host, &'static str> {
    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(Host::Ip(ip));
    }

    if host.contains("://") || host.contains('/') {
        return Err("URI схема недопустима");
    }
    if host.is_empty() {
        return Err("пустой хост");
    }
    if host.len() > MAX_DOMAIN_LEN {
        return Err("слишком длинное имя хоста");
    }

    let labels: Vec<&str> = host.split('.').collect();
    for label in &labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err("некорректная метка DNS имени");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("метка DNS имени не может начинаться или заканчиваться дефисом");
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err("недопустимые символы в имени хоста");
        }
    }

    // "10.0.0.300" похож на IPv4, а не на DNS имя
    if labels
        .last()
        .is_some_and(|label| label.bytes().all(|b| b.is_ascii_digit()))
        && host.parse::<Ipv4Addr>().is_err()
    {
        return Err("некорректный IPv4 адрес");
    }

    Ok(Host::Domain(host.to_ascii_lowercase()))
}

fn parse_port(port: &str) -> Result<u16, &'static str> {
    if port.is_empty() || port.len() > 5 || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err("порт должен быть десятичным числом");
    }
    let port: u32 = port.parse().map_err(|_| "порт должен быть десятичным числом")?;
    if !(1..=65535).contains(&port) {
        return Err("порт вне диапазона 1..65535");
    }
    Ok(port as u16)
}

fn port_from_value(value: &Value) -> Result<u16, ValidationError> {
    let invalid = |reason| ValidationError::InvalidEndpoint {
        value: value.to_string(),
        reason,
    };

    match value {
        Value::Number(n) => match n.as_u64() {
            Some(port) if (1..=65535).contains(&port) => Ok(port as u16),
            _ => Err(invalid("порт вне диапазона 1..65535")),
        },
        Value::String(s) => parse_port(s.trim()).map_err(invalid),
        _ => Err(invalid("порт должен быть десятичным числом")),
    }
}

fn parse_public_key(encoded: &str) -> Result<[u8; X25519_KEY_SIZE], ValidationError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| ValidationError::InvalidKeyFormat("ключ не в base64".into()))?;

    let key: [u8; X25519_KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        ValidationError::InvalidKeyFormat(format!(
            "ожидается {} байта, получено {}",
            X25519_KEY_SIZE,
            bytes.len()
        ))
    })?;

    if key.iter().all(|&b| b == 0) {
        return Err(ValidationError::InvalidKeyFormat("нулевой ключ".into()));
    }

    Ok(key)
}

fn parse_client_address(value: &str) -> Result<IpCidr, ValidationError> {
    let invalid = || ValidationError::InvalidAddress {
        field: "clientAddress",
        value: value.to_string(),
    };

    let trimmed = value.trim();
    if trimmed.contains('/') {
        trimmed.parse::<IpCidr>().map_err(|_| invalid())
    } else {
        trimmed.parse::<IpAddr>().map(IpCidr::host).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_b64(byte: u8) -> String {
        BASE64.encode([byte; 32])
    }

    fn raw(endpoint: &str) -> String {
        json!({
            "endpoint": endpoint,
            "peerPublicKey": key_b64(7),
            "allowedIPs": ["0.0.0.0/0", "::/0"],
            "dnsServers": ["1.1.1.1", "2606:4700:4700::1111"],
            "clientAddress": "10.8.0.2",
        })
        .to_string()
    }

    fn endpoint_error(endpoint: &str) -> &'static str {
        match PeerConfig::parse(&raw(endpoint)) {
            Err(ValidationError::InvalidEndpoint { reason, .. }) => reason,
            other => panic!("ожидалась ошибка endpoint для {}: {:?}", endpoint, other),
        }
    }

    #[test]
    fn test_parse_valid() {
        let config = PeerConfig::parse(&raw("vpn.example.com:51820")).unwrap();

        assert_eq!(config.endpoint_host(), &Host::Domain("vpn.example.com".into()));
        assert_eq!(config.endpoint_port(), 51820);
        assert_eq!(config.peer_public_key(), &[7u8; 32]);
        assert_eq!(config.allowed_ips().len(), 2);
        assert_eq!(config.dns_servers().len(), 2);
        assert_eq!(config.client_address().to_string(), "10.8.0.2/32");
        assert_eq!(config.persistent_keepalive(), None);
    }

    #[test]
    fn test_endpoint_forms() {
        let v4 = PeerConfig::parse(&raw("203.0.113.5:443")).unwrap();
        assert_eq!(v4.endpoint(), "203.0.113.5:443");

        let v6 = PeerConfig::parse(&raw("[2001:db8::1]:51820")).unwrap();
        assert_eq!(v6.endpoint(), "[2001:db8::1]:51820");
        assert!(matches!(v6.endpoint_host(), Host::Ip(IpAddr::V6(_))));

        let upper = PeerConfig::parse(&raw("VPN.Example.COM:1")).unwrap();
        assert_eq!(upper.endpoint(), "vpn.example.com:1");
    }

    #[test]
    fn test_port_out_of_range() {
        endpoint_error("10.0.0.1:99999");
        endpoint_error("10.0.0.1:0");
        endpoint_error("10.0.0.1:65536");
        endpoint_error("10.0.0.1:-1");
        endpoint_error("10.0.0.1:80a");
        endpoint_error("10.0.0.1:");
        endpoint_error("10.0.0.1");
    }

    #[test]
    fn test_uri_scheme_rejected() {
        assert_eq!(endpoint_error("http://vpn.example.com:80"), "URI схема недопустима");
        assert_eq!(endpoint_error("wg://10.0.0.1:51820"), "URI схема недопустима");
    }

    #[test]
    fn test_bad_hosts_rejected() {
        endpoint_error("2001:db8::1:51820");
        endpoint_error("[2001:db8::zz]:51820");
        endpoint_error("-bad.example.com:1");
        endpoint_error("bad_host.example.com:1");
        endpoint_error("a..b:1");
        endpoint_error("10.0.0.300:1");
        endpoint_error(":51820");
    }

    #[test]
    fn test_split_endpoint_fields() {
        let doc = json!({
            "endpointHost": "198.51.100.7",
            "endpointPort": "51820",
            "peerPublicKey": key_b64(9),
            "allowedIPs": "10.0.0.0/8, 192.168.0.0/16",
            "clientAddress": "10.0.0.2/24",
            "persistentKeepalive": 25,
            "mtu": 1280,
        });
        let config = PeerConfig::from_value(doc).unwrap();

        assert_eq!(config.endpoint(), "198.51.100.7:51820");
        assert_eq!(config.allowed_ips().len(), 2);
        assert!(config.dns_servers().is_empty());
        assert_eq!(config.client_address().prefix(), 24);
        assert_eq!(config.persistent_keepalive(), Some(25));
        assert_eq!(config.mtu(), Some(1280));

        let no_port = json!({
            "endpointHost": "198.51.100.7",
            "peerPublicKey": key_b64(9),
            "allowedIPs": ["0.0.0.0/0"],
            "clientAddress": "10.0.0.2",
        });
        assert_eq!(
            PeerConfig::from_value(no_port).unwrap_err(),
            ValidationError::MissingField("endpointPort")
        );

        let bad_port = json!({
            "endpointHost": "198.51.100.7",
            "endpointPort": 70000,
            "peerPublicKey": key_b64(9),
            "allowedIPs": ["0.0.0.0/0"],
            "clientAddress": "10.0.0.2",
        });
        assert!(matches!(
            PeerConfig::from_value(bad_port),
            Err(ValidationError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_public_key_rules() {
        let with_key = |key: String| {
            let mut doc: Value = serde_json::from_str(&raw("10.0.0.1:51820")).unwrap();
            doc["peerPublicKey"] = Value::String(key);
            PeerConfig::from_value(doc)
        };

        assert!(matches!(
            with_key(BASE64.encode([1u8; 31])),
            Err(ValidationError::InvalidKeyFormat(_))
        ));
        assert!(matches!(
            with_key(BASE64.encode([1u8; 33])),
            Err(ValidationError::InvalidKeyFormat(_))
        ));
        assert!(matches!(
            with_key(key_b64(0)),
            Err(ValidationError::InvalidKeyFormat(_))
        ));
        assert!(matches!(
            with_key("not base64!".into()),
            Err(ValidationError::InvalidKeyFormat(_))
        ));
    }

    #[test]
    fn test_allowed_ips_rules() {
        let with_ips = |ips: Value| {
            let mut doc: Value = serde_json::from_str(&raw("10.0.0.1:51820")).unwrap();
            doc["allowedIPs"] = ips;
            PeerConfig::from_value(doc)
        };

        for bad in [
            json!([]),
            json!(["10.0.0.0"]),
            json!(["10.0.0.0/33"]),
            json!(["::/129"]),
            json!(["10.0.0.0/8", "garbage/8"]),
            json!(["10.0.0.0/"]),
            json!(["10.0.0.0/+8"]),
            json!(""),
        ] {
            assert!(
                matches!(with_ips(bad.clone()), Err(ValidationError::InvalidAllowedIps(_))),
                "{} должен быть отклонён",
                bad
            );
        }
    }

    #[test]
    fn test_missing_fields() {
        let full: Value = serde_json::from_str(&raw("10.0.0.1:51820")).unwrap();

        for (field, expected) in [
            ("endpoint", "endpoint"),
            ("peerPublicKey", "peerPublicKey"),
            ("allowedIPs", "allowedIPs"),
            ("clientAddress", "clientAddress"),
        ] {
            let mut doc = full.clone();
            doc.as_object_mut().unwrap().remove(field);
            assert_eq!(
                PeerConfig::from_value(doc).unwrap_err(),
                ValidationError::MissingField(expected)
            );
        }
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(PeerConfig::parse("not json"), Err(ValidationError::Malformed(_))));
        assert!(matches!(PeerConfig::parse("[1, 2]"), Err(ValidationError::Malformed(_))));
    }

    #[test]
    fn test_bad_addresses() {
        let mut doc: Value = serde_json::from_str(&raw("10.0.0.1:51820")).unwrap();
        doc["dnsServers"] = json!(["dns.google"]);
        assert!(matches!(
            PeerConfig::from_value(doc),
            Err(ValidationError::InvalidAddress { field: "dnsServers", .. })
        ));

        let mut doc: Value = serde_json::from_str(&raw("10.0.0.1:51820")).unwrap();
        doc["mtu"] = json!(100);
        assert!(matches!(
            PeerConfig::from_value(doc),
            Err(ValidationError::InvalidAddress { field: "mtu", .. })
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let configs = [
            raw("vpn.example.com:51820"),
            raw("[2001:db8::1]:65535"),
            json!({
                "endpointHost": "2001:db8::2",
                "endpointPort": 1,
                "peerPublicKey": key_b64(0xFF),
                "allowedIPs": ["10.0.0.0/8"],
                "clientAddress": "fd00::2/64",
                "persistentKeepalive": 25,
                "mtu": 1420,
            })
            .to_string(),
        ];

        for raw in configs {
            let parsed = PeerConfig::parse(&raw).unwrap();
            let reparsed = PeerConfig::parse(&parsed.serialize()).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn test_wg_quick_render() {
        let config = PeerConfig::parse(&raw("vpn.example.com:51820")).unwrap();
        let pair = KeyPair::generate().unwrap();
        let doc = config.to_wg_quick(&pair);

        assert!(doc.contains("[Interface]"));
        assert!(doc.contains(&format!("PrivateKey = {}", &*pair.private_base64())));
        assert!(doc.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
        assert!(doc.contains("Endpoint = vpn.example.com:51820"));
        assert!(!doc.contains("PersistentKeepalive"));
    }
}

use std::env;

/// Which registry back-end to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Memory,
    Consul,
}

impl RegistryKind {
    fn parse(s: &str) -> Option<RegistryKind> {
        match s {
            "memory" => Some(RegistryKind::Memory),
            "consul" => Some(RegistryKind::Consul),
            _ => None,
        }
    }
}

/// Runtime configuration, loaded environment-first.
///
/// `from_env` reads a `.env` file when present and then the process
/// environment; the builder-style setters apply programmatic overrides on
/// top, which always win.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Address RPC servers bind to (`MICRO_SERVER_ADDRESS`).
    pub server_address: String,
    /// Address advertised to the registry when it differs from the bind
    /// address (`MICRO_ADVERTISE_ADDRESS`).
    pub advertise_address: Option<String>,
    /// Registry back-end (`MICRO_REGISTRY`, `memory` or `consul`).
    pub registry: RegistryKind,
    /// Consul agent base URL (`CONSUL_ADDR`).
    pub consul_addr: String,
    /// Gateway bind host (`GATEWAY_HOST`).
    pub gateway_host: String,
    /// Gateway bind port (`GATEWAY_PORT`).
    pub gateway_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            server_address: "127.0.0.1:0".to_string(),
            advertise_address: None,
            registry: RegistryKind::Memory,
            consul_addr: "http://127.0.0.1:8500".to_string(),
            gateway_host: "0.0.0.0".to_string(),
            gateway_port: 8080,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = RuntimeConfig::default();
        if let Ok(addr) = env::var("MICRO_SERVER_ADDRESS") {
            config.server_address = addr;
        }
        if let Ok(addr) = env::var("MICRO_ADVERTISE_ADDRESS") {
            config.advertise_address = Some(addr);
        }
        if let Ok(kind) = env::var("MICRO_REGISTRY") {
            if let Some(kind) = RegistryKind::parse(&kind) {
                config.registry = kind;
            } else {
                tracing::warn!(value = %kind, "unknown MICRO_REGISTRY value, keeping default");
            }
        }
        if let Ok(addr) = env::var("CONSUL_ADDR") {
            config.consul_addr = addr;
        }
        if let Ok(host) = env::var("GATEWAY_HOST") {
            config.gateway_host = host;
        }
        if let Ok(port) = env::var("GATEWAY_PORT") {
            if let Ok(port) = port.parse() {
                config.gateway_port = port;
            }
        }
        config
    }

    pub fn with_server_address(mut self, addr: impl Into<String>) -> Self {
        self.server_address = addr.into();
        self
    }

    pub fn with_advertise_address(mut self, addr: impl Into<String>) -> Self {
        self.advertise_address = Some(addr.into());
        self
    }

    pub fn with_registry(mut self, kind: RegistryKind) -> Self {
        self.registry = kind;
        self
    }

    pub fn with_consul_addr(mut self, addr: impl Into<String>) -> Self {
        self.consul_addr = addr.into();
        self
    }

    pub fn with_gateway(mut self, host: impl Into<String>, port: u16) -> Self {
        self.gateway_host = host.into();
        self.gateway_port = port;
        self
    }

    /// The address peers should use to reach this server.
    pub fn advertised(&self) -> &str {
        self.advertise_address.as_deref().unwrap_or(&self.server_address)
    }
}

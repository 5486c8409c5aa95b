//! Runtime configuration for the primary supervised process
//!
//! The gateway reads one JSON file from inside the root filesystem. It also
//! gets a small script preloaded by the runtime (see
//! [crate::sandbox::SandboxBuilder]) that papers over an API the sandbox
//! breaks.

use crate::errors::ConfigError;
use serde_json::{json, Value};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Where the generated config lives, as seen inside the sandbox
pub const CONFIG_GUEST_PATH: &str = "/root/.gateway/config.json";
/// Where the compatibility shim lives, as seen inside the sandbox
pub const COMPAT_SHIM_GUEST_PATH: &str = "/root/.sandstrap/compat.js";
/// Agent workspace directory, as seen inside the sandbox
pub const WORKSPACE_GUEST_PATH: &str = "/root/workspace";

pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

const COMPAT_SHIM: &str = r#"'use strict';
// os.networkInterfaces() throws inside the sandbox because netlink is not
// available; answer with loopback only.
const os = require('os');
const original = os.networkInterfaces;
os.networkInterfaces = function networkInterfaces() {
  try {
    return original.call(os);
  } catch (err) {
    return {
      lo: [{
        address: '127.0.0.1',
        netmask: '255.0.0.0',
        family: 'IPv4',
        mac: '00:00:00:00:00:00',
        internal: true,
        cidr: '127.0.0.1/8',
      }],
    };
  }
};
"#;

/// Model providers the gateway can be configured for
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Provider {
    Anthropic,
    OpenAI,
    Google,
    OpenRouter,
    DeepSeek,
}

impl Provider {
    pub const ALL: &'static [Provider] = &[
        Provider::Anthropic,
        Provider::OpenAI,
        Provider::Google,
        Provider::OpenRouter,
        Provider::DeepSeek,
    ];

    /// Identifier used in model references, `<id>/<model>`
    pub fn id(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAI => "openai",
            Provider::Google => "google",
            Provider::OpenRouter => "openrouter",
            Provider::DeepSeek => "deepseek",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-sonnet-4-5",
            Provider::OpenAI => "gpt-4o",
            Provider::Google => "gemini-2.5-pro",
            Provider::OpenRouter => "anthropic/claude-sonnet-4.5",
            Provider::DeepSeek => "deepseek-chat",
        }
    }

    /// Credentials and, where the gateway has no built-in knowledge of the
    /// provider, an inline model catalog
    fn block(&self, credential: &str) -> Value {
        match self {
            Provider::DeepSeek => json!({
                "baseUrl": "https://api.deepseek.com/v1",
                "apiKey": credential,
                "api": "openai-completions",
                "models": [
                    {
                        "id": "deepseek-chat",
                        "name": "DeepSeek Chat",
                        "contextWindow": 65536,
                        "maxTokens": 8192
                    },
                    {
                        "id": "deepseek-reasoner",
                        "name": "DeepSeek Reasoner",
                        "reasoning": true,
                        "contextWindow": 65536,
                        "maxTokens": 32768
                    }
                ]
            }),
            _ => json!({ "apiKey": credential }),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Provider::ALL
            .iter()
            .find(|p| p.id() == lower)
            .copied()
            .ok_or_else(|| format!("unknown provider {:?}", s))
    }
}

/// Which addresses the gateway listens on
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindMode {
    Loopback,
    Lan,
}

impl BindMode {
    fn as_str(&self) -> &'static str {
        match self {
            BindMode::Loopback => "loopback",
            BindMode::Lan => "lan",
        }
    }
}

/// Settings for the primary process
#[derive(Clone, Eq, PartialEq)]
pub struct GatewayConfig {
    pub port: u16,
    /// Empty means "generate one" when the config is written
    pub auth_token: String,
    pub provider: Provider,
    pub credential: String,
    pub model: String,
    pub bind: BindMode,
}

impl GatewayConfig {
    pub fn new<S: Into<String>>(provider: Provider, credential: S) -> Self {
        GatewayConfig {
            port: DEFAULT_GATEWAY_PORT,
            auth_token: String::new(),
            provider,
            credential: credential.into(),
            model: provider.default_model().to_string(),
            bind: BindMode::Loopback,
        }
    }

    /// `<provider>/<model>`
    pub fn model_ref(&self) -> String {
        format!("{}/{}", self.provider.id(), self.model)
    }

    /// The document the gateway expects
    pub fn to_json(&self) -> Value {
        let mut providers = serde_json::Map::new();
        providers.insert(
            self.provider.id().to_string(),
            self.provider.block(&self.credential),
        );
        json!({
            "agents": {
                "defaults": {
                    "model": { "primary": self.model_ref() },
                    "workspace": WORKSPACE_GUEST_PATH
                }
            },
            "gateway": {
                "mode": "local",
                "bind": self.bind.as_str(),
                "port": self.port,
                "auth": { "mode": "token", "token": self.auth_token }
            },
            "models": {
                "mode": "merge",
                "providers": providers
            }
        })
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("port", &self.port)
            .field("auth_token", &redact(&self.auth_token))
            .field("provider", &self.provider)
            .field("credential", &redact(&self.credential))
            .field("model", &self.model)
            .field("bind", &self.bind)
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}

/// Random token for the gateway's auth, 32 hex digits
pub fn generate_token() -> String {
    rand::random::<[u8; 16]>()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Host path of a guest path inside `rootfs`
pub fn guest_to_host(rootfs: &Path, guest: &str) -> PathBuf {
    rootfs.join(guest.trim_start_matches('/'))
}

/// Write the gateway config and compatibility shim into `rootfs`
///
/// Returns the config as written, which differs from the input only when a
/// token had to be generated.
pub fn write_config(rootfs: &Path, config: &GatewayConfig) -> Result<GatewayConfig, ConfigError> {
    let mut effective = config.clone();
    if effective.auth_token.is_empty() {
        effective.auth_token = generate_token();
    }

    let config_path = guest_to_host(rootfs, CONFIG_GUEST_PATH);
    write_file(&config_path, &serde_json::to_vec_pretty(&effective.to_json())?)?;
    write_file(&guest_to_host(rootfs, COMPAT_SHIM_GUEST_PATH), COMPAT_SHIM.as_bytes())?;
    std::fs::create_dir_all(guest_to_host(rootfs, WORKSPACE_GUEST_PATH))?;

    log::debug!("wrote {:?} for {:?}", config_path, effective);
    Ok(effective)
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}

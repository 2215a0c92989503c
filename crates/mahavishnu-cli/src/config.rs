//! Configuration file management for the `mahavishnu` CLI.
//!
//! A TOML config file at `~/.config/mahavishnu/config.toml` holds the
//! control-plane settings (`[dlq]`, `[ordering]`, `[subscription]`) plus a
//! gateway signing secret, resolved the same way the gateway itself
//! resolves its config: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use mahavishnu_core::Config;
use serde::{Deserialize, Serialize};

/// On-disk shape of the config file: the control-plane `Config` plus a
/// CLI-only `[gateway]` table for the signing secret.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(flatten)]
    pub control_plane: Config,
    pub gateway: GatewaySection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Hex-encoded HMAC signing secret (64 hex chars = 32 bytes).
    pub signing_secret: String,
    pub bind_addr: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            bind_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

/// The mahavishnu config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mahavishnu` or
/// `~/.config/mahavishnu`. We deliberately don't special-case macOS's
/// `~/Library/Application Support`, so this works identically everywhere
/// the CLI runs.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mahavishnu");
    }
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".config")
        .join("mahavishnu")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Generate a random signing secret: 32 random bytes, hex-encoded.
pub fn generate_signing_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Resolve the gateway signing secret using the chain:
/// env var > config file > error.
pub fn resolve_signing_secret() -> Result<Vec<u8>> {
    if let Ok(hex_secret) = std::env::var("MAHAVISHNU_SIGNING_SECRET") {
        return hex::decode(&hex_secret).context("MAHAVISHNU_SIGNING_SECRET is not valid hex");
    }
    let file = load_config().context(
        "no signing secret found; set MAHAVISHNU_SIGNING_SECRET or run `mahavishnu init`",
    )?;
    if file.gateway.signing_secret.is_empty() {
        bail!("config file has no gateway.signing_secret; re-run `mahavishnu init`");
    }
    hex::decode(&file.gateway.signing_secret).context("invalid hex in config file signing_secret")
}

/// Resolve the control-plane `Config`, falling back to defaults if no
/// config file is present.
pub fn resolve_control_plane() -> Config {
    load_config().map(|f| f.control_plane).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_signing_secret_is_64_hex_chars() {
        let secret = generate_signing_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generate_signing_secret_is_random() {
        assert_ne!(generate_signing_secret(), generate_signing_secret());
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("mahavishnu");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            control_plane: Config::default(),
            gateway: GatewaySection {
                signing_secret: "aa".repeat(32),
                bind_addr: "127.0.0.1:9999".to_string(),
            },
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded: ConfigFile = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.gateway.signing_secret, original.gateway.signing_secret);
        assert_eq!(loaded.control_plane, original.control_plane);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("mahavishnu/config.toml"));
    }
}

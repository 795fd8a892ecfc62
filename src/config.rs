use chrono_tz::Tz;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::oracle::AnalysisMode;

/// Default config file looked up when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "kupa.json";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// A known sender.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    pub phone: String,
    pub name: String,
    #[serde(default = "default_emoji")]
    pub emoji: String,
}

fn default_emoji() -> String {
    "👤".to_string()
}

impl UserProfile {
    /// Profile used for senders that are not configured.
    pub fn anonymous() -> Self {
        Self { phone: String::new(), name: "משתמש".to_string(), emoji: default_emoji() }
    }
}

/// Raw file contents. Everything is optional here; required keys are
/// checked after environment overrides are applied.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    meta_access_token: Option<String>,
    meta_phone_number_id: Option<String>,
    meta_verify_token: Option<String>,
    /// Display number of the business account, informational only.
    meta_phone_number: Option<String>,
    budget_spreadsheet_id: Option<String>,
    tracker_spreadsheet_id: Option<String>,
    openai_api_key: Option<String>,
    openai_model: Option<String>,
    openai_base_url: Option<String>,
    /// Static OAuth token for the Sheets API. Without it tokens are fetched
    /// from the GCE metadata server.
    sheets_access_token: Option<String>,
    #[serde(default)]
    users: Vec<UserProfile>,
    listen_addr: Option<String>,
    data_dir: Option<String>,
    /// SQLite file for cache and dedup entries. In-memory when unset.
    state_db: Option<String>,
    timezone: Option<String>,
    dedup_ttl_secs: Option<u64>,
    dedup_bucket_secs: Option<u64>,
    cache_ttl_secs: Option<u64>,
    refresh_cooldown_secs: Option<u64>,
    analysis_mode: Option<String>,
    /// Phone number that receives WARN/ERROR log lines.
    alert_recipient: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// File the config was read from, if any.
    pub config_path: Option<PathBuf>,
    pub meta_access_token: String,
    pub meta_phone_number_id: String,
    pub meta_verify_token: String,
    pub meta_phone_number: Option<String>,
    pub budget_spreadsheet_id: String,
    pub tracker_spreadsheet_id: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub sheets_access_token: Option<String>,
    /// The two household members. Order matters only for display.
    pub users: Vec<UserProfile>,
    pub listen_addr: SocketAddr,
    /// Directory for logs.
    pub data_dir: PathBuf,
    pub state_db: Option<PathBuf>,
    pub timezone: Tz,
    pub dedup_ttl_secs: u64,
    pub dedup_bucket_secs: u64,
    pub cache_ttl_secs: u64,
    pub refresh_cooldown_secs: u64,
    pub analysis_mode: AnalysisMode,
    pub alert_recipient: Option<String>,
}

impl Config {
    /// Load from an optional JSON file, then apply environment overrides.
    ///
    /// An explicit path must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// read if present and otherwise everything comes from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
        };

        let file = match &path {
            Some(p) => read_file(p)?,
            None => ConfigFile::default(),
        };

        Self::resolve(file, path, |key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    /// Merge file values with environment lookups (environment wins) and validate.
    pub fn resolve<E>(file: ConfigFile, config_path: Option<PathBuf>, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let pick = |env_key: &str, file_value: Option<String>| -> Option<String> {
            env(env_key).or(file_value).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        };
        let required = |env_key: &str, name: &str, file_value: Option<String>| -> Result<String, ConfigError> {
            pick(env_key, file_value)
                .ok_or_else(|| ConfigError::Validation(format!("{name} is required (env {env_key})")))
        };
        let number = |env_key: &str, file_value: Option<u64>, default: u64| -> Result<u64, ConfigError> {
            match env(env_key) {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    ConfigError::Validation(format!("{env_key} must be a whole number, got '{raw}'"))
                }),
                None => Ok(file_value.unwrap_or(default)),
            }
        };

        let meta_access_token = required("META_ACCESS_TOKEN", "meta_access_token", file.meta_access_token)?;
        let meta_phone_number_id =
            required("META_PHONE_NUMBER_ID", "meta_phone_number_id", file.meta_phone_number_id)?;
        let meta_verify_token = required("META_WEBHOOK_VERIFY_TOKEN", "meta_verify_token", file.meta_verify_token)?;
        let budget_spreadsheet_id = required("BUDGET_SHEET_ID", "budget_spreadsheet_id", file.budget_spreadsheet_id)?;
        let tracker_spreadsheet_id =
            required("TRACKER_SHEET_ID", "tracker_spreadsheet_id", file.tracker_spreadsheet_id)?;
        let openai_api_key = required("OPENAI_API_KEY", "openai_api_key", file.openai_api_key)?;

        if budget_spreadsheet_id == tracker_spreadsheet_id {
            return Err(ConfigError::Validation(
                "budget_spreadsheet_id and tracker_spreadsheet_id must differ".into(),
            ));
        }

        let users = resolve_users(file.users, &env)?;

        let listen_addr = match env("PORT") {
            Some(port) => {
                let port: u16 = port
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Validation(format!("PORT must be a port number, got '{port}'")))?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
            None => {
                let raw = file.listen_addr.unwrap_or_else(|| "0.0.0.0:5000".to_string());
                raw.parse()
                    .map_err(|_| ConfigError::Validation(format!("listen_addr '{raw}' is not host:port")))?
            }
        };

        let timezone_name = pick("TIMEZONE", file.timezone).unwrap_or_else(|| "Asia/Jerusalem".to_string());
        let timezone: Tz = timezone_name
            .parse()
            .map_err(|_| ConfigError::Validation(format!("unknown timezone '{timezone_name}'")))?;

        let analysis_mode = match pick("ANALYSIS_MODE", file.analysis_mode).as_deref() {
            None | Some("combined") => AnalysisMode::Combined,
            Some("separate") => AnalysisMode::Separate,
            Some(other) => {
                return Err(ConfigError::Validation(format!(
                    "analysis_mode must be 'combined' or 'separate', got '{other}'"
                )));
            }
        };

        let dedup_bucket_secs = number("DEDUP_BUCKET_SECS", file.dedup_bucket_secs, 10)?;
        if dedup_bucket_secs == 0 {
            return Err(ConfigError::Validation("dedup_bucket_secs must be positive".into()));
        }

        Ok(Self {
            config_path,
            meta_access_token,
            meta_phone_number_id,
            meta_verify_token,
            meta_phone_number: pick("META_PHONE_NUMBER", file.meta_phone_number),
            budget_spreadsheet_id,
            tracker_spreadsheet_id,
            openai_api_key,
            openai_model: pick("OPENAI_MODEL", file.openai_model).unwrap_or_else(|| "gpt-4.1-mini".to_string()),
            openai_base_url: pick("OPENAI_BASE_URL", file.openai_base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            sheets_access_token: pick("SHEETS_ACCESS_TOKEN", file.sheets_access_token),
            users,
            listen_addr,
            data_dir: pick("DATA_DIR", file.data_dir).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            state_db: pick("STATE_DB", file.state_db).map(PathBuf::from),
            timezone,
            dedup_ttl_secs: number("DEDUP_TTL_SECS", file.dedup_ttl_secs, 60)?,
            dedup_bucket_secs,
            cache_ttl_secs: number("CACHE_TTL_SECS", file.cache_ttl_secs, 300)?,
            refresh_cooldown_secs: number("REFRESH_COOLDOWN_SECS", file.refresh_cooldown_secs, 30)?,
            analysis_mode,
            alert_recipient: pick("ALERT_RECIPIENT", file.alert_recipient),
        })
    }

    /// Profile for a sender, or the anonymous profile.
    pub fn user(&self, phone: &str) -> UserProfile {
        find_user(&self.users, phone)
    }
}

/// Profile whose phone matches `phone` after normalization, or the
/// anonymous profile.
pub fn find_user(users: &[UserProfile], phone: &str) -> UserProfile {
    let phone = normalize_phone(phone);
    users
        .iter()
        .find(|u| !u.phone.is_empty() && normalize_phone(&u.phone) == phone)
        .cloned()
        .unwrap_or_else(UserProfile::anonymous)
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadFile { path: path.to_path_buf(), source: e })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::ParseJson { path: path.to_path_buf(), source: e })
}

/// `USER1_*` / `USER2_*` replace the matching slot from the file.
fn resolve_users<E>(mut users: Vec<UserProfile>, env: &E) -> Result<Vec<UserProfile>, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let defaults = [("משתמש 1", "👨‍💼"), ("משתמש 2", "👩‍💼")];
    for (slot, (default_name, _)) in defaults.iter().enumerate() {
        let n = slot + 1;
        let phone = env(&format!("USER{n}_PHONE"));
        let name = env(&format!("USER{n}_NAME"));
        if phone.is_none() && name.is_none() {
            continue;
        }
        while users.len() <= slot {
            users.push(UserProfile {
                phone: String::new(),
                name: default_name.to_string(),
                emoji: default_emoji(),
            });
        }
        if let Some(phone) = phone {
            users[slot].phone = phone;
        }
        if let Some(name) = name {
            users[slot].name = name;
        }
    }

    if users.len() > 2 {
        return Err(ConfigError::Validation(format!("at most two users are supported, got {}", users.len())));
    }
    for (user, (_, emoji)) in users.iter_mut().zip(defaults.iter()) {
        if user.emoji == default_emoji() {
            user.emoji = emoji.to_string();
        }
    }
    Ok(users)
}

/// Strip the `whatsapp:` prefix, `+` and separators.
pub fn normalize_phone(phone: &str) -> String {
    let phone = phone.trim();
    let phone = phone.strip_prefix("whatsapp:").unwrap_or(phone);
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn assert_err<T>(result: Result<T, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    const MINIMAL: &str = r#"{
        "meta_access_token": "EAAG-token",
        "meta_phone_number_id": "1098765",
        "meta_verify_token": "verify-me",
        "budget_spreadsheet_id": "budget-sheet",
        "tracker_spreadsheet_id": "tracker-sheet",
        "openai_api_key": "sk-test"
    }"#;

    fn resolve_with(json: &str, env: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json).unwrap();
        let env: HashMap<String, String> = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::resolve(file, None, |k| env.get(k).cloned())
    }

    #[test]
    fn test_valid_config_with_defaults() {
        let file = write_config(MINIMAL);
        let config = Config::load(Some(file.path())).expect("should load valid config");
        assert_eq!(config.meta_verify_token, "verify-me");
        assert_eq!(config.openai_model, "gpt-4.1-mini");
        assert_eq!(config.dedup_ttl_secs, 60);
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.refresh_cooldown_secs, 30);
        assert_eq!(config.analysis_mode, AnalysisMode::Combined);
        assert_eq!(config.timezone, chrono_tz::Asia::Jerusalem);
        assert_eq!(config.listen_addr.port(), 5000);
        assert!(config.state_db.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let config = resolve_with(
            MINIMAL,
            &[("OPENAI_MODEL", "gpt-4o-mini"), ("PORT", "8080"), ("REFRESH_COOLDOWN_SECS", "5")],
        )
        .unwrap();
        assert_eq!(config.openai_model, "gpt-4o-mini");
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.refresh_cooldown_secs, 5);
    }

    #[test]
    fn test_env_only_config() {
        let config = resolve_with(
            "{}",
            &[
                ("META_ACCESS_TOKEN", "t"),
                ("META_PHONE_NUMBER_ID", "1"),
                ("META_WEBHOOK_VERIFY_TOKEN", "v"),
                ("BUDGET_SHEET_ID", "b"),
                ("TRACKER_SHEET_ID", "t2"),
                ("OPENAI_API_KEY", "k"),
            ],
        )
        .unwrap();
        assert_eq!(config.budget_spreadsheet_id, "b");
    }

    #[test]
    fn test_missing_required_key() {
        let err = assert_err(resolve_with(r#"{"meta_access_token": "x"}"#, &[]));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("meta_phone_number_id"));
    }

    #[test]
    fn test_blank_required_key_rejected() {
        let json = MINIMAL.replace("sk-test", "   ");
        let err = assert_err(resolve_with(&json, &[]));
        assert!(err.to_string().contains("openai_api_key"));
    }

    #[test]
    fn test_same_spreadsheet_rejected() {
        let json = MINIMAL.replace("tracker-sheet", "budget-sheet");
        let err = assert_err(resolve_with(&json, &[]));
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_bad_number_in_env() {
        let err = assert_err(resolve_with(MINIMAL, &[("CACHE_TTL_SECS", "five")]));
        assert!(err.to_string().contains("CACHE_TTL_SECS"));
    }

    #[test]
    fn test_unknown_analysis_mode() {
        let err = assert_err(resolve_with(MINIMAL, &[("ANALYSIS_MODE", "turbo")]));
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_users_from_env() {
        let config = resolve_with(
            MINIMAL,
            &[("USER1_PHONE", "972501234567"), ("USER1_NAME", "דני"), ("USER2_PHONE", "972509876543")],
        )
        .unwrap();
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.user("+972-50-123-4567").name, "דני");
        assert_eq!(config.user("972501234567").emoji, "👨‍💼");
        assert_eq!(config.user("972509876543").name, "משתמש 2");
        assert_eq!(config.user("972509876543").emoji, "👩‍💼");
        assert_eq!(config.user("111").name, "משתמש");
    }

    #[test]
    fn test_too_many_users() {
        let json = MINIMAL.replace(
            "\"openai_api_key\": \"sk-test\"",
            r#""openai_api_key": "sk-test", "users": [
                {"phone": "1", "name": "a"}, {"phone": "2", "name": "b"}, {"phone": "3", "name": "c"}
            ]"#,
        );
        let err = assert_err(resolve_with(&json, &[]));
        assert!(err.to_string().contains("two users"));
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load(Some(Path::new("/nonexistent/path/kupa.json"))));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load(Some(file.path())));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("whatsapp:+972 50-123"), "97250123");
        assert_eq!(normalize_phone("972501234567"), "972501234567");
    }
}

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    accounts::{Credential, DEFAULT_ROTATION_THRESHOLD},
    domain::GroupId,
    errors::Error,
    logging::DEFAULT_LOG_CAPACITY,
    Result,
};

pub const DEFAULT_DELAY_SECS: f64 = 2.0;
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 6.0;

/// Process-level configuration, loaded from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Provider bridge
    pub bridge_url: String,
    pub bridge_token: Option<String>,

    // What to watch and how to greet
    pub group_ids: Vec<GroupId>,
    pub accounts: Vec<Credential>,
    pub welcome_messages: Vec<String>,
    pub delay: Duration,
    pub poll_interval: Duration,

    // Commands
    pub admins: Vec<String>,
    pub enable_commands: bool,
    pub enable_auto_reply: bool,

    // Account rotation
    pub rotation_threshold: u32,

    // Pacing
    pub send_min_interval: Duration,

    // State on disk
    pub state_dir: PathBuf,
    pub log_capacity: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv(Path::new(".env"))?;

        let bridge_url = env_str("GWB_BRIDGE_URL").ok_or_else(|| {
            Error::Config("GWB_BRIDGE_URL environment variable is required".to_string())
        })?;
        let bridge_token = env_str("GWB_BRIDGE_TOKEN");

        let group_ids = parse_csv(env_str("GWB_GROUP_IDS"))
            .into_iter()
            .map(GroupId)
            .collect::<Vec<_>>();
        let accounts = parse_accounts(env_str("GWB_ACCOUNTS"))?;

        let mut welcome_messages = parse_messages(env_str("GWB_WELCOME_MESSAGES"));
        if let Some(path) = env_path("GWB_WELCOME_FILE") {
            let from_file = load_welcome_file(&path)?;
            if !from_file.is_empty() {
                welcome_messages = from_file;
            }
        }

        let delay = secs_f64(env_parse::<f64>("GWB_DELAY_SECS").unwrap_or(DEFAULT_DELAY_SECS));
        let poll_interval =
            secs_f64(env_parse::<f64>("GWB_POLL_INTERVAL_SECS").unwrap_or(DEFAULT_POLL_INTERVAL_SECS));

        let admins = parse_csv(env_str("GWB_ADMINS"));
        let enable_commands = env_flag("GWB_ENABLE_COMMANDS", false);
        let enable_auto_reply = env_flag("GWB_ENABLE_AUTO_REPLY", true);

        let rotation_threshold = env_parse::<u32>("GWB_ROTATION_THRESHOLD")
            .unwrap_or(DEFAULT_ROTATION_THRESHOLD)
            .max(1);
        let send_min_interval =
            Duration::from_millis(env_parse::<u64>("GWB_SEND_MIN_INTERVAL_MS").unwrap_or(1000));

        let state_dir = env_path("GWB_STATE_DIR").unwrap_or_else(|| PathBuf::from("uploads"));
        fs::create_dir_all(&state_dir)?;
        let log_capacity = env_parse::<usize>("GWB_LOG_CAPACITY")
            .unwrap_or(DEFAULT_LOG_CAPACITY)
            .max(1);

        Ok(Self {
            bridge_url,
            bridge_token,
            group_ids,
            accounts,
            welcome_messages,
            delay,
            poll_interval,
            admins,
            enable_commands,
            enable_auto_reply,
            rotation_threshold,
            send_min_interval,
            state_dir,
            log_capacity,
        })
    }

    pub fn welcomed_cache_path(&self) -> PathBuf {
        self.state_dir.join("welcomed_cache.jsonl")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.state_dir.join("bot_logs.txt")
    }

    /// Worker settings for a run driven purely by this config.
    pub fn settings(&self) -> Settings {
        Settings {
            groups: self.group_ids.clone(),
            templates: self.welcome_messages.clone(),
            delay: self.delay,
            poll_interval: self.poll_interval,
            admins: self.admins.clone(),
            enable_commands: self.enable_commands,
            enable_auto_reply: self.enable_auto_reply,
            rotation_threshold: self.rotation_threshold,
        }
    }
}

/// Per-run worker settings.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub groups: Vec<GroupId>,
    pub templates: Vec<String>,
    pub delay: Duration,
    pub poll_interval: Duration,
    pub admins: Vec<String>,
    pub enable_commands: bool,
    pub enable_auto_reply: bool,
    pub rotation_threshold: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            templates: Vec::new(),
            delay: secs_f64(DEFAULT_DELAY_SECS),
            poll_interval: secs_f64(DEFAULT_POLL_INTERVAL_SECS),
            admins: Vec::new(),
            enable_commands: false,
            enable_auto_reply: true,
            rotation_threshold: DEFAULT_ROTATION_THRESHOLD,
        }
    }
}

/// One welcome message per non-empty line.
pub fn load_welcome_file(path: &Path) -> Result<Vec<String>> {
    let txt = fs::read_to_string(path)?;
    Ok(parse_lines(&txt))
}

pub fn parse_lines(txt: &str) -> Vec<String> {
    txt.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_messages(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `identifier:secret` pairs, comma separated. The secret may itself contain `:`.
fn parse_accounts(v: Option<String>) -> Result<Vec<Credential>> {
    let mut out = Vec::new();
    for pair in parse_csv(v) {
        let Some((id, secret)) = pair.split_once(':') else {
            return Err(Error::Config(format!(
                "GWB_ACCOUNTS entry is not identifier:secret: {}",
                pair.split(':').next().unwrap_or("")
            )));
        };
        let (id, secret) = (id.trim(), secret.trim());
        if id.is_empty() || secret.is_empty() {
            return Err(Error::Config(
                "GWB_ACCOUNTS entries need a non-empty identifier and secret".to_string(),
            ));
        }
        out.push(Credential::new(id, secret));
    }
    Ok(out)
}

fn secs_f64(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::from_secs_f64(v)
    } else {
        Duration::ZERO
    }
}

/// Set, non-blank variable.
fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Variables already set in the process win over `.env`.
fn load_dotenv(path: &Path) -> Result<()> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(Error::Config(format!("{}: {e}", path.display()))),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_str(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

/// Unrecognised values fall back to `default` instead of silently meaning `false`.
fn env_flag(key: &str, default: bool) -> bool {
    env_str(key).map_or(default, |raw| parse_flag(&raw).unwrap_or(default))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_str(key).map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_parse_with_colons_in_secret() {
        let accts = parse_accounts(Some("alice:pw1, bob:p:w:2".to_string())).unwrap();
        assert_eq!(accts.len(), 2);
        assert_eq!(accts[1].identifier, "bob");
        assert_eq!(accts[1].secret, "p:w:2");
    }

    #[test]
    fn malformed_account_is_a_config_error_without_leaking() {
        let err = parse_accounts(Some("justaname".to_string())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = parse_accounts(Some("alice:".to_string())).unwrap_err();
        assert!(!format!("{err}").contains("alice:"));
    }

    #[test]
    fn messages_split_on_pipe() {
        assert_eq!(
            parse_messages(Some(" Hi {username} | | Read the rules ".to_string())),
            vec!["Hi {username}".to_string(), "Read the rules".to_string()]
        );
    }

    #[test]
    fn welcome_file_yields_one_message_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("welcome.txt");
        std::fs::write(&path, "Hello {username}\n\n  second  \n").unwrap();
        assert_eq!(
            load_welcome_file(&path).unwrap(),
            vec!["Hello {username}".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn flags_accept_both_polarities() {
        assert_eq!(parse_flag(" Yes "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn missing_dotenv_is_fine_and_broken_one_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_dotenv(&dir.path().join("absent.env")).is_ok());

        let bad = dir.path().join("bad.env");
        std::fs::write(&bad, "this is not a pair\n").unwrap();
        assert!(matches!(load_dotenv(&bad), Err(Error::Config(_))));
    }

    #[test]
    fn non_positive_durations_clamp_to_zero() {
        assert_eq!(secs_f64(-1.0), Duration::ZERO);
        assert_eq!(secs_f64(f64::NAN), Duration::ZERO);
        assert_eq!(secs_f64(0.5), Duration::from_millis(500));
    }
}

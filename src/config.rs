//! Configuration file and path resolution.
//!
//! JSON via serde. Looked up at `$TRAPDOOR_CONFIG`, then
//! `$XDG_CONFIG_HOME/trapdoor/config.json`, then
//! `$HOME/.config/trapdoor/config.json`.

use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::debug;

use crate::arch::{self, nr};
use crate::error::{Error, Result};
use crate::policy::{DenyPaths, Observe, PermitAll, Policy, PolicyChain, Redirect};
use crate::seccomp::{
    Disposition, FilterRule, MismatchAction, Ruleset, DEFAULT_SENTINEL, OPENAT_SENTINEL_SLOT,
};

/// Larger files are refused unread.
pub const MAX_CONFIG_BYTES: usize = 64 * 1024;

/// Resolved config file location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_file: PathBuf,
    /// Named by `$TRAPDOOR_CONFIG`; must exist.
    pub explicit: bool,
}

impl Paths {
    pub fn init() -> Option<Self> {
        Self::from_lookup(|key| std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from))
    }

    fn from_lookup(var: impl Fn(&str) -> Option<PathBuf>) -> Option<Self> {
        if let Some(file) = var("TRAPDOOR_CONFIG") {
            return Some(Self {
                config_file: file,
                explicit: true,
            });
        }
        let config_dir = var("XDG_CONFIG_HOME").or_else(|| var("HOME").map(|h| h.join(".config")))?;
        Some(Self {
            config_file: config_dir.join("trapdoor").join("config.json"),
            explicit: false,
        })
    }
}

/// Fate of unruled syscalls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultMode {
    #[default]
    Allow,
    Deny,
}

/// `"trap"`, `"kill"` or `{"errno": N}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchConfig {
    #[default]
    Trap,
    Kill,
    Errno(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub syscall: String,
    /// Required except for `openat`, which defaults to its spare slot.
    #[serde(default)]
    pub slot: Option<u8>,
    #[serde(default)]
    pub sentinel: Option<u64>,
    #[serde(default)]
    pub mismatch: MismatchConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObserveConfig {
    #[serde(default = "stderr_fd")]
    pub fd: i32,
    #[serde(default)]
    pub resolve: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenyPathConfig {
    pub path: String,
    #[serde(default = "eacces")]
    pub errno: i32,
}

/// Everything an engine can be built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub default: DefaultMode,
    #[serde(default = "eperm")]
    pub deny_errno: i32,
    #[serde(default = "openat_preset")]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub observe: Option<ObserveConfig>,
    #[serde(default)]
    pub redirects: Vec<RedirectConfig>,
    #[serde(default)]
    pub deny_paths: Vec<DenyPathConfig>,
}

fn stderr_fd() -> i32 {
    libc::STDERR_FILENO
}

fn eperm() -> i32 {
    libc::EPERM
}

fn eacces() -> i32 {
    libc::EACCES
}

fn openat_preset() -> Vec<RuleConfig> {
    vec![RuleConfig {
        syscall: "openat".to_string(),
        slot: Some(OPENAT_SENTINEL_SLOT),
        sentinel: Some(DEFAULT_SENTINEL),
        mismatch: MismatchConfig::Trap,
    }]
}

/// No file at all: trap openat and log every open to stderr.
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default: DefaultMode::Allow,
            deny_errno: libc::EPERM,
            rules: openat_preset(),
            allow: Vec::new(),
            observe: Some(ObserveConfig {
                fd: libc::STDERR_FILENO,
                resolve: false,
            }),
            redirects: Vec::new(),
            deny_paths: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from the resolved location, or the built-in default when no
    /// file is configured there.
    pub fn discover() -> Result<Self> {
        match Paths::init() {
            Some(paths) if paths.explicit || paths.config_file.exists() => {
                Self::load(&paths.config_file)
            }
            _ => {
                debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load from JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        if content.len() > MAX_CONFIG_BYTES {
            return Err(Error::ConfigTooLarge {
                path: path.to_path_buf(),
                max: MAX_CONFIG_BYTES,
            });
        }
        let config = Self::from_json(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), rules = config.rules.len(), "loaded config");
        Ok(config)
    }

    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Filter rules, allow list and default disposition.
    pub fn ruleset(&self) -> Result<Ruleset> {
        let rules = self
            .rules
            .iter()
            .map(RuleConfig::to_rule)
            .collect::<Result<Vec<_>>>()?;
        let allow = self
            .allow
            .iter()
            .map(|name| lookup(name))
            .collect::<Result<Vec<_>>>()?;
        let default = match self.default {
            DefaultMode::Allow => Disposition::Allow,
            DefaultMode::Deny => Disposition::Deny(errno(self.deny_errno)?),
        };
        Ok(Ruleset {
            rules,
            allow,
            default,
        })
    }

    /// Observe, then deny, then redirect, so the log shows what the caller
    /// asked for and denials match the caller's own path.
    pub fn policy(&self) -> Result<Box<dyn Policy>> {
        let mut chain = PolicyChain::new();

        if let Some(observe) = self.observe {
            chain = chain.then(Observe::new(observe.fd).resolve_paths(observe.resolve));
        }

        if !self.deny_paths.is_empty() {
            let mut deny = DenyPaths::new();
            for entry in &self.deny_paths {
                deny = deny.path(c_path(&entry.path)?, errno(entry.errno)?);
            }
            chain = chain.then(deny);
        }

        if !self.redirects.is_empty() {
            let mut redirect = Redirect::new();
            for entry in &self.redirects {
                redirect = redirect.path(c_path(&entry.from)?, c_path(&entry.to)?);
            }
            chain = chain.then(redirect);
        }

        if chain.is_empty() {
            return Ok(Box::new(PermitAll));
        }
        Ok(Box::new(chain))
    }
}

impl RuleConfig {
    fn to_rule(&self) -> Result<FilterRule> {
        let nr = lookup(&self.syscall)?;
        let slot = match (self.slot, nr) {
            (Some(slot), _) => slot,
            (None, nr::OPENAT) => OPENAT_SENTINEL_SLOT,
            (None, _) => {
                return Err(Error::Config(format!(
                    "rule for {} needs a sentinel slot",
                    self.syscall
                )))
            }
        };
        let on_mismatch = match self.mismatch {
            MismatchConfig::Trap => MismatchAction::Trap,
            MismatchConfig::Kill => MismatchAction::KillProcess,
            MismatchConfig::Errno(e) => MismatchAction::Errno(errno(e)?),
        };
        Ok(FilterRule::new(nr, slot)
            .sentinel(self.sentinel.unwrap_or(DEFAULT_SENTINEL))
            .on_mismatch(on_mismatch))
    }
}

fn lookup(name: &str) -> Result<u32> {
    arch::syscall_number(name).ok_or_else(|| Error::UnknownSyscall(name.to_string()))
}

/// Errno values fit the 16-bit SECCOMP_RET_DATA and must be known.
fn errno(raw: i32) -> Result<Errno> {
    let e = Errno::from_raw(raw);
    if !(1..=4095).contains(&raw) || e == Errno::UnknownErrno {
        return Err(Error::Config(format!("invalid errno {raw}")));
    }
    Ok(e)
}

fn c_path(path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| Error::Config(format!("path contains NUL: {path:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup_from<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<PathBuf> + 'a {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| PathBuf::from(v))
        }
    }

    #[test]
    fn explicit_path_wins() {
        let paths = Paths::from_lookup(lookup_from(&[
            ("TRAPDOOR_CONFIG", "/tmp/t.json"),
            ("XDG_CONFIG_HOME", "/xdg"),
            ("HOME", "/home/u"),
        ]))
        .unwrap();
        assert_eq!(paths.config_file, PathBuf::from("/tmp/t.json"));
        assert!(paths.explicit);
    }

    #[test]
    fn xdg_then_home() {
        let vars = [("XDG_CONFIG_HOME", "/xdg"), ("HOME", "/home/u")];
        let xdg = Paths::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(xdg.config_file, PathBuf::from("/xdg/trapdoor/config.json"));
        assert!(!xdg.explicit);

        let home = Paths::from_lookup(lookup_from(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(
            home.config_file,
            PathBuf::from("/home/u/.config/trapdoor/config.json")
        );

        assert!(Paths::from_lookup(lookup_from(&[])).is_none());
    }

    #[test]
    fn empty_object_is_the_openat_preset_without_observe() {
        let config = EngineConfig::from_json("{}").unwrap();
        let ruleset = config.ruleset().unwrap();
        assert_eq!(ruleset.rules, vec![FilterRule::openat()]);
        assert!(ruleset.allow.is_empty());
        assert_eq!(ruleset.default, Disposition::Allow);
        assert!(config.observe.is_none());
    }

    #[test]
    fn full_document_parses() {
        let config = EngineConfig::from_json(
            r#"{
                "default": "deny",
                "deny_errno": 38,
                "rules": [
                    {"syscall": "openat", "slot": 5, "sentinel": 99, "mismatch": "kill"},
                    {"syscall": "unlinkat", "slot": 3, "mismatch": {"errno": 13}}
                ],
                "allow": ["read", "write"],
                "observe": {"fd": 1, "resolve": true},
                "redirects": [{"from": "/etc/hosts", "to": "/etc/hostname"}],
                "deny_paths": [{"path": "/etc/shadow"}]
            }"#,
        )
        .unwrap();

        let ruleset = config.ruleset().unwrap();
        assert_eq!(
            ruleset.rules,
            vec![
                FilterRule::new(nr::OPENAT, 5)
                    .sentinel(99)
                    .on_mismatch(MismatchAction::KillProcess),
                FilterRule::new(nr::UNLINKAT, 3).on_mismatch(MismatchAction::Errno(Errno::EACCES)),
            ]
        );
        assert_eq!(ruleset.allow, vec![nr::READ, nr::WRITE]);
        assert_eq!(ruleset.default, Disposition::Deny(Errno::ENOSYS));
        assert_eq!(config.observe, Some(ObserveConfig { fd: 1, resolve: true }));
        assert_eq!(config.deny_paths[0].errno, libc::EACCES);
        assert!(config.policy().is_ok());
    }

    #[test]
    fn unknown_syscall_is_rejected() {
        let config = EngineConfig::from_json(r#"{"allow": ["frobnicate"]}"#).unwrap();
        assert!(matches!(
            config.ruleset(),
            Err(Error::UnknownSyscall(name)) if name == "frobnicate"
        ));
    }

    #[test]
    fn non_openat_rule_needs_a_slot() {
        let config = EngineConfig::from_json(r#"{"rules": [{"syscall": "execve"}]}"#).unwrap();
        assert!(matches!(config.ruleset(), Err(Error::Config(_))));
    }

    #[test]
    fn out_of_range_errno_is_rejected() {
        let config =
            EngineConfig::from_json(r#"{"default": "deny", "deny_errno": 70000}"#).unwrap();
        assert!(matches!(config.ruleset(), Err(Error::Config(_))));
        let config = EngineConfig::from_json(r#"{"default": "deny", "deny_errno": 0}"#).unwrap();
        assert!(matches!(config.ruleset(), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(EngineConfig::from_json(r#"{"rulez": []}"#).is_err());
    }

    #[test]
    fn load_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { ref path, .. } if path == file.path()));
    }

    #[test]
    fn load_refuses_oversized_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let padding = "\"read\",".repeat(MAX_CONFIG_BYTES / 7);
        write!(file, "{{\"allow\": [{padding}\"read\"]}}").unwrap();
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(Error::ConfigTooLarge { .. })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::ConfigIo { .. }));
    }

    #[test]
    fn default_config_observes_openat() {
        let config = EngineConfig::default();
        assert_eq!(config.ruleset().unwrap().rules, vec![FilterRule::openat()]);
        assert!(config.observe.is_some());
    }
}

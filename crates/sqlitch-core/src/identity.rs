//! Planner/committer identity resolution.
//!
//! Name and email resolve independently, each from the first source that
//! provides a value: CLI flags, the `SQLITCH_FULLNAME`/`SQITCH_FULLNAME` and
//! `SQLITCH_EMAIL`/`SQITCH_EMAIL` environment pairs, the `[user]` config
//! section, and finally operating-system user info. Missing identity is a
//! hard error on any registry write.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::config::ConfigProfile;
use crate::context::env_pair;
use crate::error::SqlitchError;

/// A resolved `Name <email>` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    /// Render as `Name <email>`, the planner format used in plan files.
    pub fn to_planner_string(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

/// Optional identity overrides supplied via CLI flags.
#[derive(Debug, Clone, Default)]
pub struct IdentityOverrides {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Resolve the invoking user's identity, erroring when either half is
/// missing from every source.
pub fn resolve_identity(
    env: &BTreeMap<String, String>,
    profile: Option<&ConfigProfile>,
    overrides: &IdentityOverrides,
) -> Result<Identity> {
    let name = overrides
        .name
        .clone()
        .or_else(|| env_pair(env, "FULLNAME").map(str::to_string))
        .or_else(|| config_user_value(profile, "name"))
        .or_else(|| os_username(env));

    let Some(name) = name else {
        return Err(SqlitchError::Config(
            "Cannot find your name; set SQLITCH_FULLNAME or run \
             `sqlitch config --user user.name \"Your Name\"`"
                .to_string(),
        )
        .into());
    };

    let email = overrides
        .email
        .clone()
        .or_else(|| env_pair(env, "EMAIL").map(str::to_string))
        .or_else(|| config_user_value(profile, "email"))
        .or_else(|| fallback_email(env));

    let Some(email) = email else {
        return Err(SqlitchError::Config(
            "Cannot infer your email address; set SQLITCH_EMAIL or run \
             `sqlitch config --user user.email you@example.com`"
                .to_string(),
        )
        .into());
    };

    Ok(Identity { name, email })
}

fn config_user_value(profile: Option<&ConfigProfile>, key: &str) -> Option<String> {
    profile
        .and_then(|p| p.get("user", key))
        .map(str::to_string)
}

fn os_username(env: &BTreeMap<String, String>) -> Option<String> {
    for var in ["USER", "LOGNAME", "USERNAME"] {
        if let Some(value) = env.get(var)
            && !value.is_empty()
        {
            return Some(value.clone());
        }
    }
    None
}

fn fallback_email(env: &BTreeMap<String, String>) -> Option<String> {
    let user = os_username(env)?;
    let host = gethostname::gethostname();
    Some(format!("{}@{}", user, host.to_string_lossy()))
}

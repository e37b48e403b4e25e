//! Bearer-token roles for the peer API.

use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use warp::Filter;

/// Ordered from least to most trusted; a role passes every check a lower one
/// passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Role {
    #[default]
    Reader,
    Transactor,
    Miller,
    Admin,
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reader" => Ok(Role::Reader),
            "transactor" => Ok(Role::Transactor),
            "miller" => Ok(Role::Miller),
            "admin" => Ok(Role::Admin),
            other => Err(anyhow!("unknown role {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    tokens: HashMap<String, Role>,
}

impl RoleTable {
    pub fn from_config(api_tokens: &HashMap<String, String>) -> Result<Self> {
        let mut tokens = HashMap::new();
        for (token, role) in api_tokens {
            let role = role
                .parse::<Role>()
                .map_err(|e| anyhow!("api token entry: {}", e))?;
            tokens.insert(token.clone(), role);
        }
        Ok(RoleTable { tokens })
    }

    /// Role for an `Authorization` header value. Anything that is not a
    /// known bearer token reads as `Reader`.
    pub fn role_for(&self, authorization: Option<&str>) -> Role {
        authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .and_then(|token| self.tokens.get(token.trim()))
            .copied()
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Forbidden {
    pub required: Role,
    pub actual: Role,
}

impl warp::reject::Reject for Forbidden {}

/// Passes only requests whose token maps to `required` or better.
pub fn require(
    roles: Arc<RoleTable>,
    required: Role,
) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |auth: Option<String>| {
            let actual = roles.role_for(auth.as_deref());
            async move {
                if actual >= required {
                    Ok(())
                } else {
                    log::debug!("Refused {:?} request needing {:?}", actual, required);
                    Err(warp::reject::custom(Forbidden { required, actual }))
                }
            }
        })
        .untuple_one()
}

//! User reference resolution. Users are never created; absent ones are
//! substituted by the current user or fail, depending on the policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::entity::{NaturalKey, SourceId, TargetId, TcmsClass, User};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{Filter, TcmsGateway};
use crate::idmap::IdMap;
use crate::trace::{Action, Decision, Trace};

/// How user references are treated on import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum UserPolicy {
    /// Replace every user except the current one by the current user.
    Always,
    /// Replace users absent from TCMS by the current user.
    #[default]
    Missing,
    /// Fail on users absent from TCMS.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOutcome {
    ExactMatch(TargetId),
    Remapped(TargetId),
    Substituted(TargetId),
}

impl UserOutcome {
    pub fn target(self) -> TargetId {
        match self {
            UserOutcome::ExactMatch(t) | UserOutcome::Remapped(t) | UserOutcome::Substituted(t) => t,
        }
    }
}

pub struct UserResolver<'a> {
    gateway: &'a dyn TcmsGateway,
    policy: UserPolicy,
    current: Option<(TargetId, String)>,
}

impl<'a> UserResolver<'a> {
    pub fn new(gateway: &'a dyn TcmsGateway, policy: UserPolicy) -> Self {
        Self {
            gateway,
            policy,
            current: None,
        }
    }

    /// The gateway's current user, fetched once per pass.
    pub fn current_user(&mut self) -> SyncResult<(TargetId, String)> {
        if let Some(current) = &self.current {
            return Ok(current.clone());
        }
        let me = self.gateway.current_user()?;
        let current = (
            TargetId(me.id),
            me.str_field("username").unwrap_or_default().to_string(),
        );
        self.current = Some(current.clone());
        Ok(current)
    }

    pub fn resolve_user(&mut self, username: &str, source: Option<SourceId>) -> SyncResult<UserOutcome> {
        let (current_id, current_name) = self.current_user()?;
        if self.policy == UserPolicy::Always && username != current_name {
            return Ok(UserOutcome::Substituted(current_id));
        }

        let found = self
            .gateway
            .find(TcmsClass::User, &Filter::new().eq("username", username))?;
        match found.as_slice() {
            [] => match self.policy {
                UserPolicy::Never => Err(SyncError::UserNotFound {
                    username: username.to_string(),
                }),
                _ => Ok(UserOutcome::Substituted(current_id)),
            },
            [one] if source.is_none_or(|s| s.0 == one.id) => {
                Ok(UserOutcome::ExactMatch(TargetId(one.id)))
            }
            [one] => Ok(UserOutcome::Remapped(TargetId(one.id))),
            many => Err(SyncError::AmbiguousMatch {
                class: TcmsClass::User,
                key: username.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Resolve every user of a container, recording decisions and mappings.
    ///
    /// Only an unavailable current user aborts; every other failure is
    /// recorded against the user it concerns.
    pub fn resolve_all(&mut self, users: &[User], ids: &mut IdMap, trace: &mut Trace) -> SyncResult<()> {
        self.current_user()?;
        for user in users {
            let key = NaturalKey::new([user.username.as_str()]);
            match self.resolve_user(&user.username, Some(user.id)) {
                Ok(outcome) => {
                    let action = match outcome {
                        UserOutcome::ExactMatch(_) => Action::Matched,
                        UserOutcome::Remapped(_) => Action::Remapped,
                        UserOutcome::Substituted(_) => Action::Substituted,
                    };
                    ids.insert(TcmsClass::User, user.id, outcome.target());
                    trace.push(Decision::new(
                        TcmsClass::User,
                        key,
                        Some(user.id),
                        Some(outcome.target()),
                        action,
                    ));
                }
                Err(err) => {
                    tracing::warn!(username = %user.username, error = %err, "user unresolved");
                    trace.push(Decision::failed(TcmsClass::User, key, Some(user.id), err));
                }
            }
        }
        Ok(())
    }

    /// Resolve a bare username (e.g. a tester recorded by the runner).
    pub fn resolve_name(&mut self, username: &str) -> SyncResult<TargetId> {
        Ok(self.resolve_user(username, None)?.target())
    }
}

/// Users referenced by name during one pass, cached per name.
#[derive(Debug, Default)]
pub struct UserCache(HashMap<String, TargetId>);

impl UserCache {
    pub fn get_or_resolve(&mut self, resolver: &mut UserResolver<'_>, username: &str) -> SyncResult<TargetId> {
        if let Some(id) = self.0.get(username) {
            return Ok(*id);
        }
        let id = resolver.resolve_name(username)?;
        self.0.insert(username.to_string(), id);
        Ok(id)
    }
}

//! Init/cleanup hooks run around the entity, each plan and each case.

use std::fmt;
use std::path::Path;

use super::executable::{self, CallContext, Executable, Registry, ScriptSettings};
use crate::error::{SyncError, SyncResult};
use crate::runner::result::ResultStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Entity,
    Plan,
    Case,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Entity => "entity",
            Scope::Plan => "plan",
            Scope::Case => "case",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Cleanup,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Cleanup => "cleanup",
        }
    }
}

/// Configured assistants, one optional hook per scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assistants {
    pub entity: Option<Executable>,
    pub plan: Option<Executable>,
    pub case: Option<Executable>,
}

impl Assistants {
    /// Parse the configured identifiers. Unit-test collections cannot act
    /// as assistants.
    pub fn parse(
        entity: Option<&str>,
        plan: Option<&str>,
        case: Option<&str>,
    ) -> SyncResult<Self> {
        fn one(scope: Scope, id: Option<&str>) -> SyncResult<Option<Executable>> {
            let Some(id) = id.filter(|s| !s.trim().is_empty()) else {
                return Ok(None);
            };
            match Executable::parse(id)? {
                Executable::UnitTest(_) => Err(SyncError::Configuration(format!(
                    "{} assistant '{}' must be a script or a function",
                    scope, id
                ))),
                exe => Ok(Some(exe)),
            }
        }
        Ok(Self {
            entity: one(Scope::Entity, entity)?,
            plan: one(Scope::Plan, plan)?,
            case: one(Scope::Case, case)?,
        })
    }

    fn get(&self, scope: Scope) -> Option<&Executable> {
        match scope {
            Scope::Entity => self.entity.as_ref(),
            Scope::Plan => self.plan.as_ref(),
            Scope::Case => self.case.as_ref(),
        }
    }

    /// Run the hook for `scope` in `phase`. Scripts receive the phase as
    /// their only argument; functions see it as `arguments`.
    pub fn invoke(
        &self,
        scope: Scope,
        phase: Phase,
        registry: &Registry,
        scripts: &ScriptSettings,
        ctx: &CallContext<'_>,
        log_path: &Path,
    ) -> SyncResult<()> {
        let Some(exe) = self.get(scope) else {
            return Ok(());
        };
        tracing::debug!(%scope, phase = phase.as_str(), "running assistant");
        let outcome = match exe {
            Executable::Script(script) => {
                executable::run_script(scripts, script, &[phase.as_str()], ctx.env, log_path)
            }
            Executable::Function(name) => {
                let phased = CallContext {
                    arguments: phase.as_str(),
                    ..*ctx
                };
                executable::run_function(registry, name, &phased)
            }
            Executable::UnitTest(_) => {
                return Err(SyncError::Configuration(format!(
                    "{} assistant must be a script or a function",
                    scope
                )));
            }
        };
        if outcome.status == ResultStatus::Passed {
            Ok(())
        } else {
            Err(SyncError::AssistantFailed {
                scope: scope.to_string(),
                action: phase.as_str().to_string(),
                message: outcome.detail,
            })
        }
    }
}

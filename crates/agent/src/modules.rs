use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use sner_core::errors::{SnerError, SnerResult};
use sner_core::models::Assignment;

/// Agent-side scanning module. Modules run inside the job directory and
/// leave their output files there; the agent archives the directory and
/// uploads it.
pub trait AgentModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, assignment: &Assignment, workdir: &Path) -> SnerResult<i32>;
}

/// Testing module; the assignment itself is the whole output.
pub struct DummyModule;

impl AgentModule for DummyModule {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn run(&self, _assignment: &Assignment, _workdir: &Path) -> SnerResult<i32> {
        Ok(0)
    }
}

static REGISTRY: OnceLock<HashMap<&'static str, Box<dyn AgentModule>>> = OnceLock::new();

pub fn registered_modules() -> &'static HashMap<&'static str, Box<dyn AgentModule>> {
    REGISTRY.get_or_init(|| {
        let modules: Vec<Box<dyn AgentModule>> = vec![Box::new(DummyModule)];
        modules
            .into_iter()
            .map(|module| (module.name(), module))
            .collect()
    })
}

pub fn get_module(name: &str) -> SnerResult<&'static dyn AgentModule> {
    registered_modules()
        .get(name)
        .map(|module| module.as_ref())
        .ok_or_else(|| SnerError::NotFound(format!("module {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_modules() {
        assert!(get_module("dummy").is_ok());
        assert!(get_module("nonexistent").is_err());
    }
}
